//! Logging setup
//!
//! `RUST_LOG` controls levels; without it everything at `info` and above is
//! printed.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::error::{KeelError, Result};

/// Install the global `tracing` subscriber
pub fn init() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| KeelError::Internal {
            message: format!("logging already initialised: {}", e),
        })
}
