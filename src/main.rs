//! # Stream Gateway
//!
//! Worker node for the resilient streaming gateway. It serves requests
//! through the orchestrator and drains the shared failover queue until
//! interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Run a node with default configuration
//! stream-gateway
//!
//! # Load a config file and override one value
//! GATEWAY_CONFIG=/etc/gateway.yaml GATEWAY_POOL_GLOBAL_CAPACITY=50 stream-gateway
//!
//! # Run a single request and print its events as JSON lines
//! stream-gateway --once "what is a circuit breaker" --model synthetic-1
//! ```

use anyhow::{bail, Context};
use futures::StreamExt;
use gateway_config::{load_config, GatewayConfig};
use gateway_core::StreamRequest;
use gateway_orchestrator::{Gateway, GatewayBuilder};
use gateway_telemetry::{init_logging, LogFormat, LoggingConfig};
use tracing::{error, info};

#[derive(Debug, Default)]
struct Args {
    once: Option<String>,
    model: Option<String>,
    identity: Option<String>,
}

fn parse_args(args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args;
    while let Some(arg) = args.next() {
        let slot = match arg.as_str() {
            "--once" => &mut parsed.once,
            "--model" => &mut parsed.model,
            "--identity" => &mut parsed.identity,
            other => bail!("unknown argument '{other}'"),
        };
        let value = args.next().with_context(|| format!("{arg} needs a value"))?;
        *slot = Some(value);
    }
    Ok(parsed)
}

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Gateway failed");
        eprintln!("stream-gateway: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let config = load_config().await.context("failed to load configuration")?;

    let format: LogFormat = config.logging.format.parse()?;
    init_logging(
        &LoggingConfig::new()
            .with_level(config.logging.level.clone())
            .with_format(format),
    )?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        providers = config.providers.len(),
        "Starting stream gateway"
    );

    let mut gateway = GatewayBuilder::from_config(config.clone())
        .build()
        .context("failed to build gateway")?;
    gateway.start();

    let result = match args.once {
        Some(query) => run_once(&gateway, &config, query, args.model, args.identity).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("Interrupt received, shutting down");
            Ok(())
        }
    };

    gateway.shutdown().await;
    result
}

async fn run_once(
    gateway: &Gateway,
    config: &GatewayConfig,
    query: String,
    model: Option<String>,
    identity: Option<String>,
) -> anyhow::Result<()> {
    let model = model
        .or_else(|| {
            config
                .enabled_providers()
                .find_map(|p| p.models.first().cloned())
        })
        .unwrap_or_else(|| "default".to_string());

    let request = StreamRequest::builder()
        .identity(identity.unwrap_or_else(|| "cli".to_string()))
        .query(query)
        .model(model)
        .build()?;

    let mut events = gateway.handle(request);
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
