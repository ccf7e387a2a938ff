//! kra core - foundational types shared by the pusher and the CLI.
//!
//! This crate holds the error type, the push configuration object that is
//! threaded through every pipeline stage, and content-id helpers.

pub mod config;
pub mod digest;
pub mod error;

// Re-export commonly used types
pub use config::{LogLevel, PushConfig};
pub use digest::ContentId;
pub use error::{KraError, Result};

/// kra version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
