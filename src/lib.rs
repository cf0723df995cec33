//! Toolgate Library
//!
//! Security-and-dispatch gateway that fronts heterogeneous tool adapters
//! behind a single authenticated call pipeline.
//!
//! # Features
//!
//! - **Bearer Tokens**: HMAC-signed tokens with server-side revocation
//! - **RBAC**: Role-to-permission table with trailing-glob patterns
//! - **Response Cache**: TTL cache keyed by fingerprinted call parameters
//! - **Adapters**: REST and SQL backends behind one connect/execute/close trait
//! - **Fixed Pipeline**: authenticate, authorize, cache, invoke, audit, respond
//! - **Audit Trail**: exactly one event per dispatched call, aborts included
//!
//! # Pipeline
//!
//! Every call enters through [`dispatch::Dispatcher::dispatch`]; stage order is
//! fixed and not configurable per call.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adapter;
pub mod audit;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
