//! multiwan CLI - download through several local source addresses at once
//!
//! Each URL is pinned to one source address; every address carries at most
//! one active download and the rest wait in FIFO order.

mod commands;
mod output;
mod progress;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use multiwan_types::{EngineConfig, InterfaceBinding};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// multiwan - multi-interface download manager
#[derive(Parser)]
#[command(name = "multiwan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// JSON engine configuration file
    #[arg(long, env = "MULTIWAN_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Download URLs, spread round-robin over the given source addresses
    Fetch {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Source address to bind, as `ip` or `name=ip` (repeatable)
        #[arg(short, long = "source-ip", required = true)]
        source_ips: Vec<InterfaceBinding>,

        /// Destination directory
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Speed limit per download in MB/s
        #[arg(short, long)]
        limit: Option<f64>,
    },

    /// Probe URLs for size, filename and resume support
    Probe {
        /// URLs to probe
        #[arg(required = true)]
        urls: Vec<String>,

        /// Source address to probe through
        #[arg(short, long = "source-ip", default_value = "0.0.0.0")]
        source_ip: String,
    },

    /// Check that each source address is the one remote servers see
    Verify {
        /// Source address to check, as `ip` or `name=ip` (repeatable)
        #[arg(short, long = "source-ip", required = true)]
        source_ips: Vec<InterfaceBinding>,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => multiwan_core::load_config(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Fetch {
            urls,
            source_ips,
            dir,
            limit,
        } => commands::fetch(config, urls, source_ips, dir, limit, cli.output).await?,

        Commands::Probe { urls, source_ip } => {
            commands::probe_urls(&config, urls, &source_ip, cli.output).await?
        }

        Commands::Verify { source_ips } => {
            commands::verify_sources(&config, source_ips, cli.output).await?
        }

        Commands::Config { action } => commands::config_action(&config, action, cli.output)?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "multiwan", &mut std::io::stdout());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn fetch_accepts_repeated_source_ips() {
        let cli = Cli::try_parse_from([
            "multiwan",
            "fetch",
            "http://example.com/a",
            "http://example.com/b",
            "-s",
            "wan1=10.0.0.1",
            "-s",
            "10.0.0.2",
            "--limit",
            "1.5",
        ])
        .unwrap();

        match cli.command {
            Commands::Fetch {
                urls,
                source_ips,
                limit,
                ..
            } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(source_ips[0].name, "wan1");
                assert_eq!(source_ips[1].ip, "10.0.0.2");
                assert_eq!(limit, Some(1.5));
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn verify_takes_named_bindings() {
        let cli = Cli::try_parse_from(["multiwan", "verify", "-s", "wan2=10.0.0.2"]).unwrap();
        match cli.command {
            Commands::Verify { source_ips } => {
                assert_eq!(source_ips.len(), 1);
                assert_eq!(source_ips[0].name, "wan2");
            }
            _ => panic!("expected verify"),
        }
        assert!(Cli::try_parse_from(["multiwan", "verify"]).is_err());
    }

    #[test]
    fn fetch_requires_a_source_ip() {
        assert!(Cli::try_parse_from(["multiwan", "fetch", "http://example.com/a"]).is_err());
    }
}
