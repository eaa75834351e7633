//! Daemon configuration
//!
//! All knobs come from the environment, optionally overridden by CLI flags:
//!
//! - `VIGIL_SOCKET`           RPC listen socket path
//! - `VIGIL_LOG`              trace level (trace, debug, info, warn, error)
//! - `VIGIL_LOG_DIR`          log directory; unset logs to stdout
//! - `VIGIL_LOG_MAX_FILES`    rotated log files kept around
//! - `VIGIL_MOCK_GPUS`        mock backend population
//! - `VIGIL_EVENT_TICK_SECS`  event monitor poll cadence
//! - `VIGIL_WATCH_TICK_SECS`  watch monitor sample cadence

use std::path::{Path, PathBuf};
use std::time::Duration;

use vigil_core::SystemConfig;
use vigil_error::AgentError;
use vigil_protocol::TraceLevel;

/// Default rotated log files kept
const DEFAULT_LOG_MAX_FILES: usize = 7;

/// Default mock backend population
const DEFAULT_MOCK_GPUS: u32 = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: String,
    pub log_level: TraceLevel,
    pub log_dir: Option<PathBuf>,
    pub log_max_files: usize,
    pub num_mock_gpus: u32,
    pub event_tick: Option<Duration>,
    pub watch_tick: Option<Duration>,
}

/// Default socket path per filesystem layout
pub fn default_socket_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/vigil.sock"
    } else {
        "/var/run/vigil.sock"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().to_string(),
            log_level: TraceLevel::Info,
            log_dir: None,
            log_max_files: DEFAULT_LOG_MAX_FILES,
            num_mock_gpus: DEFAULT_MOCK_GPUS,
            event_tick: None,
            watch_tick: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AgentError> {
        let mut cfg = Config::default();
        if let Ok(path) = std::env::var("VIGIL_SOCKET") {
            cfg.socket_path = path;
        }
        if let Ok(level) = std::env::var("VIGIL_LOG") {
            cfg.log_level = level
                .parse()
                .map_err(|e: String| AgentError::config(e))?;
        }
        if let Ok(dir) = std::env::var("VIGIL_LOG_DIR") {
            if !dir.is_empty() {
                cfg.log_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(n) = std::env::var("VIGIL_LOG_MAX_FILES") {
            cfg.log_max_files = n
                .parse::<usize>()
                .map_err(|_| AgentError::config("VIGIL_LOG_MAX_FILES must be a number"))?
                .max(1);
        }
        if let Ok(n) = std::env::var("VIGIL_MOCK_GPUS") {
            cfg.num_mock_gpus = n
                .parse::<u32>()
                .map_err(|_| AgentError::config("VIGIL_MOCK_GPUS must be a number"))?;
        }
        cfg.event_tick = parse_tick_secs("VIGIL_EVENT_TICK_SECS")?;
        cfg.watch_tick = parse_tick_secs("VIGIL_WATCH_TICK_SECS")?;
        Ok(cfg)
    }

    /// Control-plane configuration with any tick overrides applied
    pub fn system_config(&self) -> SystemConfig {
        let mut sys = SystemConfig::default();
        if let Some(tick) = self.event_tick {
            sys.event_tick = tick;
            // a shortened tick also shortens the warm-up
            sys.event_start_delay = sys.event_start_delay.min(tick * 3);
        }
        if let Some(tick) = self.watch_tick {
            sys.watch_tick = tick;
        }
        sys
    }
}

fn parse_tick_secs(var: &str) -> Result<Option<Duration>, AgentError> {
    match std::env::var(var) {
        Ok(v) => {
            let secs = v
                .parse::<u64>()
                .map_err(|_| AgentError::config(format!("{} must be a number of seconds", var)))?;
            if secs == 0 {
                return Err(AgentError::config(format!("{} must be non-zero", var)));
            }
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

/// Validate the listen socket path before binding
pub fn validate_socket_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err("Socket path must be absolute".into());
    }
    if path.contains("..") {
        return Err("Socket path contains path traversal".into());
    }
    if path.contains('\0') {
        return Err("Socket path contains null byte".into());
    }
    let safe_dirs = ["/run/", "/var/run/", "/tmp/"];
    if !safe_dirs.iter().any(|d| path.starts_with(d)) {
        return Err(format!("Socket path must be under {:?}", safe_dirs));
    }
    if let Some(parent) = p.parent() {
        if !parent.exists() {
            return Err(format!("Parent directory does not exist: {:?}", parent));
        }
    }
    // refuse to reuse a symlink
    if p.exists()
        && p.symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    {
        return Err("Socket path is a symlink - refusing for security".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            "VIGIL_SOCKET",
            "VIGIL_LOG",
            "VIGIL_LOG_DIR",
            "VIGIL_LOG_MAX_FILES",
            "VIGIL_MOCK_GPUS",
            "VIGIL_EVENT_TICK_SECS",
            "VIGIL_WATCH_TICK_SECS",
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear_env();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.log_level, TraceLevel::Info);
        assert!(cfg.log_dir.is_none());
        assert_eq!(cfg.num_mock_gpus, DEFAULT_MOCK_GPUS);
        assert!(cfg.event_tick.is_none());
    }

    #[test]
    #[serial]
    fn environment_overrides_apply() {
        clear_env();
        let log_dir = tempfile::tempdir().unwrap();
        std::env::set_var("VIGIL_SOCKET", "/tmp/vigil-test.sock");
        std::env::set_var("VIGIL_LOG", "debug");
        std::env::set_var("VIGIL_LOG_DIR", log_dir.path());
        std::env::set_var("VIGIL_LOG_MAX_FILES", "3");
        std::env::set_var("VIGIL_EVENT_TICK_SECS", "1");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.socket_path, "/tmp/vigil-test.sock");
        assert_eq!(cfg.log_level, TraceLevel::Debug);
        assert_eq!(cfg.log_dir.as_deref(), Some(log_dir.path()));
        assert_eq!(cfg.log_max_files, 3);
        assert_eq!(cfg.event_tick, Some(Duration::from_secs(1)));
        assert_eq!(cfg.system_config().event_tick, Duration::from_secs(1));
        clear_env();
    }

    #[test]
    #[serial]
    fn bad_environment_is_rejected() {
        clear_env();
        std::env::set_var("VIGIL_LOG", "loud");
        assert!(Config::from_env().is_err());
        clear_env();

        std::env::set_var("VIGIL_EVENT_TICK_SECS", "0");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn socket_path_validation() {
        assert!(validate_socket_path("/tmp/vigil.sock").is_ok());
        assert!(validate_socket_path("relative.sock").is_err());
        assert!(validate_socket_path("/tmp/../etc/vigil.sock").is_err());
        assert!(validate_socket_path("/home/user/vigil.sock").is_err());
    }
}
