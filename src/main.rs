use anyhow::Result;
use clap::Parser;
use llm_gateway::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "llm-gateway", about = "Local OpenAI-compatible LLM gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Override the configured listen host (must be loopback).
    #[arg(long)]
    host: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the default crypto provider for rustls TLS before any client
    // is built; otherwise reqwest cannot pick between ring and aws-lc-rs.
    if let Err(error) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("warning: failed to install default crypto provider: {error:?}");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    llm_gateway::gateway::serve(config).await
}
