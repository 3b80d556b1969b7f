//! fedn-client - federated learning client
//!
//! Thin binary over the library: parses CLI arguments, loads the flat TOML
//! client configuration, applies command-line overrides and runs the
//! client with the default pass-through callbacks.
//!
//! # Usage
//!
//! ```bash
//! # Run against a deployment described by client.toml
//! fedn-client --config client.toml
//!
//! # Pre-pin a combiner on a local insecure deployment
//! fedn-client --config client.toml --combiner localhost:12080 --insecure
//! ```
//!
//! # Environment Variables
//!
//! - `FEDN_CLIENT_CONFIG`: default config file path
//! - `FEDN_AUTH_TOKEN`: auth token override
//! - `FEDN_AUTH_SCHEME`: Authorization scheme for the assignment request
//! - `RUST_LOG`: logging level (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use fedn_client::{DefaultTaskHandler, FednClient};

#[derive(Parser, Debug)]
#[command(name = "fedn-client")]
#[command(about = "FEDn federated learning client")]
#[command(version)]
struct CliArgs {
    /// Path to the client configuration file (flat TOML)
    #[arg(short, long, default_value = "client.toml", env = "FEDN_CLIENT_CONFIG")]
    config: PathBuf,

    /// Override the client name
    #[arg(long)]
    name: Option<String>,

    /// Override the stable client id
    #[arg(long)]
    client_id: Option<String>,

    /// Override the auth token
    #[arg(long, env = "FEDN_AUTH_TOKEN")]
    token: Option<String>,

    /// Pre-pin a combiner host, bypassing assignment
    #[arg(long)]
    combiner: Option<String>,

    /// Proxy host fronting the combiner
    #[arg(long)]
    proxy_server: Option<String>,

    /// Use plaintext channels without credentials
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let mut map = fedn_client::config::load_config_map(&args.config)?;
    if let Some(name) = args.name {
        map.insert("name".to_string(), name);
    }
    if let Some(client_id) = args.client_id {
        map.insert("client_id".to_string(), client_id);
    }
    if let Some(token) = args.token {
        map.insert("token".to_string(), token);
    }
    if let Some(combiner) = args.combiner {
        map.insert("combiner".to_string(), combiner);
    }
    if let Some(proxy_server) = args.proxy_server {
        map.insert("proxy_server".to_string(), proxy_server);
    }
    if args.insecure {
        map.insert("insecure".to_string(), "true".to_string());
    }

    let mut client = FednClient::from_config_map(&map)?;
    info!(
        config = %args.config.display(),
        name = %client.controller_config().name,
        "Starting FEDn client"
    );

    client.run(Arc::new(DefaultTaskHandler)).await?;
    info!("Client run finished");
    Ok(())
}
