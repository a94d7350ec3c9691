use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use fxagg::core::config::AppConfig;
use fxagg::core::log::init_logging;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

impl From<Commands> for fxagg::AppCommand {
    fn from(cmd: Commands) -> fxagg::AppCommand {
        match cmd {
            Commands::Rates { base } => fxagg::AppCommand::Rates { base },
            Commands::Convert { from, to, amount } => {
                fxagg::AppCommand::Convert { from, to, amount }
            }
            Commands::Providers => fxagg::AppCommand::Providers,
            Commands::Serve => fxagg::AppCommand::Serve,
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Show latest rates for a base currency
    Rates {
        /// Base currency, defaults to the configured one
        base: Option<String>,
    },
    /// Convert an amount between two currencies
    Convert {
        from: String,
        to: String,
        #[arg(default_value_t = 1.0)]
        amount: f64,
    },
    /// List enabled providers
    Providers,
    /// Run the HTTP API
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Setup) => {
            init_logging(cli.verbose, None);
            fxagg::cli::setup::setup()
        }
        Some(cmd) => match AppConfig::load(cli.config_path.as_deref()) {
            Ok(config) => {
                init_logging(cli.verbose, config.log_level.as_deref());
                fxagg::run_command(cmd.into(), &config).await
            }
            Err(e) => {
                init_logging(cli.verbose, None);
                Err(e)
            }
        },
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
