//! wsinspect - Inspect WebSocket clients of a local test server
//!
//! Usage:
//!   wsinspect serve             Start the listener and the control API
//!   wsinspect check <ADDRESS>   Validate a listen address
//!   wsinspect config            Show or change the saved configuration

mod commands;
mod config;
mod inspector;

use anyhow::Result;
use clap::{Parser, Subcommand};
use inspector::MessageFormat;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "wsinspect")]
#[command(author = "WebSocket Inspector Team")]
#[command(version)]
#[command(about = "Inspect WebSocket clients of a local test server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the listener and the control API
    Serve {
        /// Address the listener binds
        #[arg(short, long)]
        address: Option<String>,

        /// Port of the local control API
        #[arg(short = 'p', long)]
        control_port: Option<u16>,

        /// Only start the control API; start the listener through it
        #[arg(long)]
        no_start: bool,

        /// Message format (plain, json, base64, hexadecimal)
        #[arg(short, long)]
        format: Option<MessageFormat>,

        /// Do not print captured events
        #[arg(short, long)]
        quiet: bool,
    },

    /// Validate a listen address
    Check {
        /// Socket address, e.g. 127.0.0.1:3030
        address: String,
    },

    /// Show the configuration, saving any value given
    Config {
        /// Default listener address
        #[arg(long)]
        address: Option<String>,

        /// Default control API port
        #[arg(long)]
        control_port: Option<u16>,

        /// Default message format
        #[arg(long)]
        format: Option<MessageFormat>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},wsinspect_cli=info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();

    match cli.command {
        Commands::Serve {
            address,
            control_port,
            no_start,
            format,
            quiet,
        } => {
            let opts = commands::serve::ServeOptions {
                address,
                control_port,
                no_start,
                format,
                quiet,
            };
            commands::serve::run(opts).await?;
        }

        Commands::Check { address } => {
            commands::check::run(&address)?;
        }

        Commands::Config {
            address,
            control_port,
            format,
        } => {
            commands::config::run(address, control_port, format)?;
        }
    }

    Ok(())
}
