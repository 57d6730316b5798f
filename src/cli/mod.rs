//! Command-line interface
//!
//! ```bash
//! # Show the resolved pool settings
//! svcpool --config svcpool.yaml config
//!
//! # Drive a pool with synthetic requests over the in-memory transport
//! svcpool simulate --service view --requests 1000 --concurrency 64 --latency-ms 2
//! ```

pub mod commands;

/// Output format (text, json)
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
