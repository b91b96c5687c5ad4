//! heimdall - sharded gateway client
//!
//! Connects every shard reported by the bootstrap endpoint and writes each
//! dispatch as one JSON line to the configured sink.

use std::path::PathBuf;

use clap::Parser;
use heimdall_shard::{ConfigOverrides, EventSink, HeimdallConfig, ShardPool};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "heimdall")]
#[command(about = "Sharded gateway client")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bot token
    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Gateway URL override
    #[arg(long, env = "HEIMDALL_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Sink address: `-` for stdout, otherwise a file path
    #[arg(long, env = "HEIMDALL_SINK")]
    sink: Option<String>,

    /// REST API base for the bootstrap fetch
    #[arg(long, env = "HEIMDALL_API_BASE")]
    api_base: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("heimdall=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = HeimdallConfig::load(
        cli.config.as_deref(),
        ConfigOverrides {
            token: cli.token,
            gateway_url: cli.gateway_url,
            sink: cli.sink,
            api_base: cli.api_base,
        },
    )?;

    info!(api_base = %config.api_base, sink = %config.sink.address, "starting heimdall");

    let sink = EventSink::open(&config.sink.address, config.sink.buffer).await?;
    let pool = ShardPool::build(&config).await?;
    let pump = sink.attach(pool.subscribe_all());

    let mut status = tokio::time::interval(config.status_interval());
    loop {
        tokio::select! {
            _ = status.tick() => {
                let states: Vec<String> = pool
                    .status()
                    .iter()
                    .map(|(shard, state)| format!("{shard}={state}"))
                    .collect();
                info!(status = %states.join(" "), dropped = sink.dropped(), "shard status");
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutting down");
                break;
            }
        }
    }

    pool.shutdown().await;
    pump.await?;
    sink.close().await?;
    Ok(())
}
