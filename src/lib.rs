//! Goblin - MCP aggregation gateway
//!
//! Aggregates multiple backend MCP servers (stdio child processes, HTTP,
//! streamable HTTP) and re-exposes their combined tools, prompts, and
//! resources to frontend clients as a single server. Identifiers are
//! namespaced by backend, list-changed and resource-updated notifications
//! are bridged through, and per-backend circuit breakers keep one flapping
//! backend from taking the rest down.
//!
//! # Frontend channels
//!
//! - stdio: newline-delimited JSON-RPC on stdin/stdout
//! - HTTP: `POST /mcp` plus a session-keyed SSE notification stream

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod failsafe;
pub mod lock;
pub mod meta;
pub mod naming;
pub mod normalize;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod subscriptions;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging.
///
/// Logs always go to stderr: in stdio frontend mode, stdout belongs to the
/// protocol.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
