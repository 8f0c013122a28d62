//! respool CLI - dining philosophers on a named resource pool

mod config;
mod dinner;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "respool")]
#[command(author, version, about = "Named resource pool with set locking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dining philosophers workload against a lock pool
    Dine(DineArgs),

    /// Manage configuration (prints the effective configuration by default)
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

/// Overrides for the configured dinner
#[derive(Args, Default)]
struct DineArgs {
    /// Config file to use instead of the default one
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of philosophers (1-100)
    #[arg(short, long)]
    philosophers: Option<usize>,

    /// Forks each philosopher needs to eat
    #[arg(short, long)]
    forks_per_philosopher: Option<usize>,

    /// How long the table is open
    #[arg(long)]
    dining_ms: Option<u64>,

    /// Minimum eat time
    #[arg(long)]
    eat_ms: Option<u64>,

    /// Random extra eat time
    #[arg(long)]
    eat_random_ms: Option<u64>,

    /// Think time between meals
    #[arg(long)]
    think_ms: Option<u64>,

    /// How long to wait for forks per attempt
    #[arg(long, conflicts_with = "no_timeout")]
    max_wait_ms: Option<u64>,

    /// Wait for forks without a time limit
    #[arg(long)]
    no_timeout: bool,

    /// Let all philosophers reach for their first forks at once
    #[arg(long)]
    unordered_start: bool,

    /// Seed for eat times
    #[arg(long)]
    seed: Option<u64>,
}

impl DineArgs {
    /// Load the configuration and apply the command line overrides
    fn resolve(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };

        let d = &mut config.dinner;
        if let Some(v) = self.philosophers {
            d.philosophers = v;
        }
        if let Some(v) = self.forks_per_philosopher {
            d.forks_per_philosopher = v;
        }
        if let Some(v) = self.dining_ms {
            d.dining_ms = v;
        }
        if let Some(v) = self.eat_ms {
            d.eat_ms = v;
        }
        if let Some(v) = self.eat_random_ms {
            d.eat_random_ms = v;
        }
        if let Some(v) = self.think_ms {
            d.think_ms = v;
        }
        if let Some(v) = self.max_wait_ms {
            d.max_wait_ms = v;
        }
        if self.no_timeout {
            d.max_wait_ms = 0;
        }
        if self.unordered_start {
            d.ordered_start = false;
        }
        if self.seed.is_some() {
            d.seed = self.seed;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so reports on stdout stay machine readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("respool=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dine(args) => cmd_dine(&args, cli.format, cli.quiet).await,
        Commands::Config { action } => cmd_config(action.unwrap_or(ConfigAction::Show), cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_dine(args: &DineArgs, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let config = args.resolve()?;
    info!(
        philosophers = config.dinner.philosophers,
        forks_per_philosopher = config.dinner.forks_per_philosopher,
        dining_ms = config.dinner.dining_ms,
        "Opening the table"
    );

    let report = dinner::run(&config.dinner, config.pool.clone())
        .await
        .context("Diner was a mess")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", report.render_text(quiet)),
    }

    if !report.pool.is_empty() {
        anyhow::bail!("Pool is not empty after dinner");
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = Config::load()?;
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
