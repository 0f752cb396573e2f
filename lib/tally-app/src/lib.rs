//! High-level application primitives.
//!
//! This crate provides the primitives needed to bootstrap a Tally-based application before it starts tracking metrics,
//! such as initializing logging from configuration.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "logging")]
pub mod logging;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
}
