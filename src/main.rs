// src/main.rs

use std::env;
use std::io;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod dispatcher;
mod error;
mod modes;
mod sys;

use crate::cli::Parsed;
use crate::config::PilotConfig;
use crate::dispatcher::Dispatcher;
use crate::modes::{ModeRegistry, Services};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // ==============================================================================
    // 1. Operator intent
    // ==============================================================================

    let mode = match cli::parse_from(env::args_os()) {
        Ok(Parsed::Mode(mode)) => mode,
        Ok(Parsed::Usage(complaint)) => {
            // Selecting no mode is not an error.
            if let Some(complaint) = complaint {
                eprintln!("{}", complaint.trim_end());
            }
            println!("{}", cli::usage());
            return ExitCode::SUCCESS;
        }
        Err(err) => err.exit(),
    };

    // ==============================================================================
    // 2. Configuration & Environment
    // ==============================================================================

    init_tracing();

    // Tunnel settings are validated only by modes that open a tunnel.
    let config = PilotConfig::load();

    // ==============================================================================
    // 3. Dependency Injection & Run
    // ==============================================================================

    // Nothing heavy happens here: loaders only run once the mode is resolved.
    let registry = ModeRegistry::standard(&config, Services::system(&config));
    let dispatcher = Dispatcher::new(registry);

    tracing::info!(mode = mode.name(), "⚙️ craft starting");
    dispatcher.run(&mode, &mut io::stderr()).await
}

/// Logs go to stderr; stdout belongs to the delegated process.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);

    if env::var("CRAFT_LOG_FORMAT").is_ok_and(|format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}
