pub mod cli;
pub mod core;
pub mod engine;
pub mod providers;
pub mod server;

use crate::core::config::AppConfig;
use crate::engine::RatesEngine;
use anyhow::Result;
use tracing::{debug, info};

pub enum AppCommand {
    Rates { base: Option<String> },
    Convert { from: String, to: String, amount: f64 },
    Providers,
    Serve,
}

pub async fn run_command(command: AppCommand, config: &AppConfig) -> Result<()> {
    info!("fxagg starting...");
    debug!("Loaded config: {config:#?}");

    let engine = RatesEngine::from_config(config)?;
    let timeout = config.request_timeout();

    match command {
        AppCommand::Rates { base } => {
            let base = base.unwrap_or_else(|| config.default_base.clone());
            cli::rates::show_rates(&engine, &base, timeout).await
        }
        AppCommand::Convert { from, to, amount } => {
            cli::rates::show_conversion(&engine, &from, &to, amount, timeout).await
        }
        AppCommand::Providers => {
            cli::rates::show_providers(&engine);
            Ok(())
        }
        AppCommand::Serve => server::serve(config, engine).await,
    }
}
