//! guarddog - chat abuse detection from the command line
//!
//! Validates configuration, inspects the trust file, compares messages and
//! replays recorded chat sessions through the engine.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// guarddog - chat abuse detection
#[derive(Parser, Debug)]
#[command(name = "guarddog")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "GUARDDOG_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate the configuration, then print it with defaults filled
    /// in
    CheckConfig,

    /// Compare two messages the way the content filters do
    Similarity {
        /// First message
        a: String,

        /// Second message
        b: String,
    },

    /// Inspect or wipe the trust file
    #[command(subcommand)]
    Trust(TrustCommands),

    /// Replay newline-delimited JSON events through the engine
    Replay {
        /// Event file. Reads stdin when omitted.
        file: Option<PathBuf>,

        /// Seed for challenge generation
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum TrustCommands {
    /// List trusted addresses and when their trust expires
    #[command(alias = "ls")]
    List,

    /// Remove every trust record
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::CheckConfig => commands::check_config::run(&config),
        Commands::Similarity { a, b } => {
            commands::similarity::run(&a, &b);
            Ok(())
        },
        Commands::Trust(cmd) => match cmd {
            TrustCommands::List => commands::trust::list(&config),
            TrustCommands::Clear => commands::trust::clear(&config),
        },
        Commands::Replay { file, seed } => commands::replay::run(config, file.as_deref(), seed),
    }
}
