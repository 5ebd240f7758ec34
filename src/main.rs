//! Betamax CLI

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use betamax::config::ServerConfig;
use betamax::network::NetworkHandler;

/// Betamax - HTTP record/replay proxy
///
/// Cassettes are inserted at runtime through /__betamax__/config.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; the flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port for the proxy to listen on [default: 8080]
    #[arg(long)]
    port: Option<u16>,

    /// Upstream to proxy requests to (http[s]://host[:port][/base])
    #[arg(long)]
    target_url: Option<String>,

    /// Directory where cassettes are written [default: ./cassettes]
    #[arg(long = "cassette-directory", alias = "cassete-directory")]
    cassette_dir: Option<PathBuf>,
}

fn load_config(args: Args) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::new(String::new()),
    };

    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(target_url) = args.target_url {
        config.target_url = target_url;
    }
    if let Some(cassette_dir) = args.cassette_dir {
        config.cassette_dir = cassette_dir;
    }

    if config.target_url.is_empty() {
        bail!("no target url given");
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let handler = NetworkHandler::new(config.clone())?;

    info!(
        "Betamax proxy to {} listening on 0.0.0.0:{}",
        config.target_url, config.listen_port
    );
    info!("Note: there is no cassette in the tray");

    handler.run().await?;

    info!("Thank you for using Betamax!");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
