//! Trace sink
//!
//! Structured logging through `tracing`, with the level filter behind a
//! reload handle so the TraceUpdate RPC can change it at runtime. With a
//! configured log directory events go to a daily-rotating file set with a
//! bounded file count; otherwise they go to stdout.

use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::Registry;
use tracing_subscriber::{fmt, reload};
use vigil_error::AgentError;
use vigil_protocol::TraceLevel;

pub struct TraceHandle {
    reload: reload::Handle<EnvFilter, Registry>,
    current: Mutex<TraceLevel>,
}

/// Install the global subscriber and hand back the runtime control handle
pub fn init(cfg: &crate::config::Config) -> Result<TraceHandle, AgentError> {
    let filter = EnvFilter::try_new(cfg.log_level.as_str())
        .map_err(|e| AgentError::config(format!("bad trace level: {}", e)))?;
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    match &cfg.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("vigild")
                .filename_suffix("log")
                .max_log_files(cfg.log_max_files)
                .build(dir)
                .map_err(|e| {
                    AgentError::config(format!("cannot open log directory {:?}: {}", dir, e))
                })?;
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt::layer().with_ansi(false).with_writer(appender))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt::layer().with_target(false))
                .init();
        }
    }

    Ok(TraceHandle {
        reload: reload_handle,
        current: Mutex::new(cfg.log_level),
    })
}

impl TraceHandle {
    /// Swap the active level filter
    pub fn update(&self, level: TraceLevel) -> Result<(), AgentError> {
        self.reload
            .reload(EnvFilter::new(level.as_str()))
            .map_err(|e| AgentError::generic(format!("trace level reload failed: {}", e)))?;
        if let Ok(mut current) = self.current.lock() {
            *current = level;
        }
        info!("trace level set to {}", level.as_str());
        Ok(())
    }

    pub fn get(&self) -> TraceLevel {
        self.current.lock().map(|l| *l).unwrap_or(TraceLevel::Info)
    }

    /// The rolling appender writes through on every event; flushing only
    /// leaves a marker in the log
    pub fn flush(&self) {
        info!("trace flush requested");
    }
}

/// Control handle not attached to the global subscriber; the reload target
/// is leaked so the handle stays functional for the whole test process
#[cfg(test)]
pub(crate) fn detached_handle(level: TraceLevel) -> TraceHandle {
    let (layer, reload_handle): (reload::Layer<EnvFilter, Registry>, _) =
        reload::Layer::new(EnvFilter::new(level.as_str()));
    Box::leak(Box::new(layer));
    TraceHandle {
        reload: reload_handle,
        current: Mutex::new(level),
    }
}
