use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use svcpool::cli::commands::{self, SimulateOptions};
use svcpool::cli::OutputFormat;
use svcpool::config;
use svcpool::ServiceType;

#[derive(Parser)]
#[command(name = "svcpool")]
#[command(version, about = "Endpoint pools for the services of a clustered database", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (falls back to SVCPOOL_* environment variables)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved pool configuration
    Config,

    /// Drive a pool with synthetic requests over the in-memory transport
    Simulate {
        /// Service to send requests to (kv, view, query, search, analytics)
        #[arg(long, default_value = "view")]
        service: ServiceType,

        /// Number of requests
        #[arg(long, default_value = "1000")]
        requests: usize,

        /// Requests in flight at once
        #[arg(long, default_value = "32")]
        concurrency: usize,

        /// Simulated service latency in milliseconds
        #[arg(long, default_value = "1")]
        latency_ms: u64,

        /// Bucket named in the requests
        #[arg(long, default_value = "default")]
        bucket: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            commands::cmd_config(&config, cli.format)?;
        }
        Commands::Simulate {
            service,
            requests,
            concurrency,
            latency_ms,
            bucket,
        } => {
            let options = SimulateOptions {
                service,
                requests,
                concurrency,
                latency: Duration::from_millis(latency_ms),
                bucket,
            };
            commands::cmd_simulate(config, options, cli.format).await?;
        }
    }

    Ok(())
}
