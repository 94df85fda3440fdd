//! Passim daemon entry point
//!
//! Usage:
//!   passimd [OPTIONS]
//!
//! Options:
//!   --config <PATH>     Config key-file (default: /etc/passim.conf)
//!   --log-level <LEVEL> trace, debug, info, warn, error (default: info)
//!   --timed-exit        Exit after a delay, for test harnesses
//!   --version           Show project version

use std::path::PathBuf;
use std::sync::Arc;

use passim_daemon::avahi::DisconnectedBus;
use passim_daemon::config::DaemonConfig;
use passim_daemon::service;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Args {
    config: Option<PathBuf>,
    log_level: String,
    timed_exit: bool,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        log_level: "info".to_string(),
        timed_exit: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i < args.len() {
                    parsed.config = Some(PathBuf::from(&args[i]));
                }
            }
            "--log-level" => {
                i += 1;
                if i < args.len() {
                    parsed.log_level = args[i].clone();
                }
            }
            "--timed-exit" => parsed.timed_exit = true,
            "--version" => {
                println!("{}", passim_daemon::daemon_version());
                std::process::exit(0);
            }
            "--help" | "-h" => {
                eprintln!("Passim Daemon");
                eprintln!();
                eprintln!("Usage: passimd [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config <PATH>      Config key-file (default: /etc/passim.conf)");
                eprintln!("  --log-level <LEVEL>  Log level (default: info)");
                eprintln!("  --timed-exit         Exit after a delay");
                eprintln!("  --version            Show project version");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
        i += 1;
    }
    parsed
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DaemonConfig::load(args.config.as_deref())?;
    info!("passim daemon {} starting", passim_daemon::daemon_version());
    info!("data directory: {}", config.path.display());
    info!("listening on {}", config.uri());

    service::run_daemon(config, Arc::new(DisconnectedBus::new()), args.timed_exit)
        .await
        .map_err(Into::into)
}
