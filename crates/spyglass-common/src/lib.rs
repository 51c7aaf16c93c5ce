//! Spyglass Common Types
//!
//! Shared types, error definitions and wire-format helpers used by the core
//! engine and the agent transport.

pub mod error;
pub mod logging;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use logging::{init_agent_logging, init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
