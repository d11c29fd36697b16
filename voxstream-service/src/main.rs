//! voxstream service entry point — loads configuration, starts the
//! Supervisor, and runs until interrupted.

mod config;
mod hub;
mod persistence;
mod supervisor;

use std::process::ExitCode;

use config::{default_config_path, load_config};
use supervisor::Supervisor;
use tracing::{error, info};

fn print_usage() {
    println!("voxstream — streaming transcription/translation service");
    println!();
    println!("USAGE:");
    println!("    voxstream [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>   Path to config.json (default: {:?})", default_config_path());
    println!("    -h, --help            Print this message");
}

/// Hand-rolled flag parsing: the one flag this binary accepts does not
/// justify pulling in an argument-parsing crate no example in this
/// codebase's stack reaches for.
fn parse_config_path(args: impl Iterator<Item = String>) -> Result<Option<std::path::PathBuf>, ()> {
    let mut args = args.peekable();
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Err(());
            }
            "-c" | "--config" => {
                let Some(path) = args.next() else {
                    eprintln!("--config requires a path argument");
                    return Err(());
                };
                config_path = Some(std::path::PathBuf::from(path));
            }
            other => {
                eprintln!("unrecognized argument: {other}");
                print_usage();
                return Err(());
            }
        }
    }
    Ok(config_path)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "voxstream=info".parse().unwrap()),
        )
        .init();

    let config_path = match parse_config_path(std::env::args().skip(1)) {
        Ok(path) => path.unwrap_or_else(default_config_path),
        Err(()) => return ExitCode::SUCCESS,
    };

    info!(config_path = ?config_path, "voxstream starting");
    let config = load_config(&config_path);
    if let Err(e) = config.validate() {
        eprintln!("configuration error: {e}");
        return ExitCode::FAILURE;
    }

    let supervisor = match Supervisor::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to initialize supervisor");
            return ExitCode::FAILURE;
        }
    };

    info!(session_id = %supervisor.session().session_id, "session initialized");
    if let Err(e) = supervisor.start(tokio::runtime::Handle::current()) {
        error!(error = %e, "failed to start pipeline");
        return ExitCode::FAILURE;
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received, shutting down"),
        Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down anyway"),
    }

    if let Err(e) = supervisor.stop().await {
        error!(error = %e, "error during shutdown");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
