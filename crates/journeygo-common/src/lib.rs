//! # JourneyGo Common
//!
//! Utilities shared by the JourneyGo offline cache crates.
//!
//! ## Features
//!
//! - Logging configuration and setup on top of `tracing-subscriber`
//! - URL normalization used for cache keys and origin checks

pub mod logging;
pub mod urls;

pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
pub use urls::{is_same_origin, strip_fragment, strip_search};
