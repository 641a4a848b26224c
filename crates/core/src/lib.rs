//! Core types for agent-sync: startup configuration and its errors.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;

pub use config::{AgentConfig, DEFAULT_RECONCILE_TIMEOUT_SECONDS};
pub use error::{Error, Result};
