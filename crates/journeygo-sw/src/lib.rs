//! # JourneyGo Offline Cache Manager
//!
//! Keeps the JourneyGo web app usable when the network is slow or gone by
//! sitting between the page and the network.
//!
//! ## Features
//!
//! - **Install**: fetch the app shell into a versioned store, all or nothing
//! - **Activate**: purge every store that is not the current version
//! - **Fetch interception**: per-request routing between network-first and
//!   cache-first policies, with fallback document and placeholder image
//! - **Clients**: claim open pages as soon as a version is active
//!
//! ## Routing
//!
//! ```text
//! request ─┬─ not GET ─────────────────▶ passthrough (store untouched)
//!          ├─ mode = navigate ─────────▶ network-first, fallback document
//!          ├─ style/script/font/image ─▶ cache-first, placeholder for images
//!          └─ anything else ───────────▶ network-first, exact cached match
//! ```

use thiserror::Error;

use journeygo_cache::CacheError;
use journeygo_net::NetError;

pub mod clients;
pub mod config;
pub mod lifecycle;
mod pending;
pub mod strategy;
mod worker;

pub use clients::{Client, Clients};
pub use config::SwConfig;
pub use lifecycle::{LifecycleState, SwEvent};
pub use strategy::Route;
pub use worker::ServiceWorker;

/// Errors that can occur in cache manager operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Install failed fetching {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwError {
    /// The request failed because the network did, not because of policy.
    pub fn is_network(&self) -> bool {
        matches!(self, SwError::Network(_))
    }
}
