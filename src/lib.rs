#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # agent-sync
//!
//! Controller that runs the Upbound agent in a Universal Crossplane
//! installation while a control plane token is present.
//!
//! This library re-exports the workspace crates for convenience.

pub use agent_sync_core;
pub use agent_sync_reconciler;

pub mod cli;
