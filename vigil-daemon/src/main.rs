//! Vigil daemon (vigild)
//!
//! Host-resident GPU telemetry and control agent. Enumerates the GPUs on
//! this node, serves inventory and live counters over a Unix-socket RPC
//! surface, streams hardware events and periodic metric samples to
//! subscribed clients, and applies configuration and reset operations back
//! to the devices.
//!
//! The control plane lives in `vigil-core`; hardware access goes through
//! the `SmiBackend` trait. This binary wires configuration, the trace sink,
//! the backend and the socket server together.

mod config;
mod server;
mod trace;

use std::sync::Arc;

use tracing::{error, info};
use vigil_core::System;
use vigil_smi::MockSmi;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    eprintln!("vigild {} - Vigil GPU telemetry and control daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    vigild [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -f, --foreground    Run in foreground (always on, no daemonization)");
    eprintln!("    -s, --socket PATH   Socket path (default per OS layout)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    VIGIL_LOG              Log level (trace, debug, info, warn, error)");
    eprintln!("    VIGIL_LOG_DIR          Log directory (unset: stdout)");
    eprintln!("    VIGIL_LOG_MAX_FILES    Rotated log files kept (default 7)");
    eprintln!("    VIGIL_SOCKET           RPC listen socket path");
    eprintln!("    VIGIL_MOCK_GPUS        Mock backend device count (default 4)");
    eprintln!("    VIGIL_EVENT_TICK_SECS  Event monitor poll cadence");
    eprintln!("    VIGIL_WATCH_TICK_SECS  Watch monitor sample cadence");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // panics must end up in the log, not vanish with a worker thread
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        eprintln!("PANIC at {}: {}", location, message);
    }));

    let mut cfg = config::Config::from_env().map_err(|e| anyhow::anyhow!("{}", e))?;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("vigild {}", VERSION);
                return Ok(());
            }
            "-f" | "--foreground" => {
                // foreground is the only mode
            }
            "-s" | "--socket" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --socket requires a path argument");
                    std::process::exit(1);
                }
                cfg.socket_path = args[i].clone();
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let trace_handle = Arc::new(trace::init(&cfg).map_err(|e| anyhow::anyhow!("{}", e))?);

    info!("STARTUP: vigild {} starting", VERSION);
    info!("STARTUP: socket path: {}", cfg.socket_path);
    info!("STARTUP: log level: {}", cfg.log_level.as_str());
    info!("STARTUP: PID: {}", std::process::id());

    if let Err(e) = config::validate_socket_path(&cfg.socket_path) {
        error!("invalid socket path: {}", e);
        std::process::exit(1);
    }

    // the vendor backend plugs in behind the same trait; the mock carries
    // the full capability surface
    let smi = Arc::new(MockSmi::new(cfg.num_mock_gpus));
    info!("STARTUP: backend reports {} GPUs", smi.num_gpus());

    let sys = match System::start(smi, cfg.system_config()) {
        Ok(sys) => sys,
        Err(e) => {
            error!("control plane startup failed: {}", e);
            std::process::exit(1);
        }
    };
    info!("STARTUP: control plane up, {} GPUs enumerated", sys.gpu_count());

    let result = server::run_server(&cfg.socket_path, sys.clone(), trace_handle).await;

    sys.shutdown();
    if let Err(e) = result {
        error!("server error: {}", e);
        std::process::exit(1);
    }
    info!("SHUTDOWN: vigild terminated gracefully");
    Ok(())
}
