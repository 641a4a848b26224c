//! CLI definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Keeps the Upbound agent Deployment in sync with its control plane token.
#[derive(Parser, Debug)]
#[command(name = "agent-sync")]
#[command(version)]
#[command(
    about = "Runs the Upbound agent while a control plane token is present and removes it once the token is gone"
)]
pub struct Cli {
    /// Controller configuration file (YAML, or JSON with a .json extension)
    #[arg(short, long, env = "AGENT_SYNC_CONFIG")]
    pub config: PathBuf,

    /// Name of the token Secret, overriding the configuration file
    #[arg(long)]
    pub token_secret: Option<String>,

    /// Only watch this namespace. Watches every namespace when omitted
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Bound on a single reconcile in seconds, overriding the configuration file
    #[arg(long)]
    pub reconcile_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}
