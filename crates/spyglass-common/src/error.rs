//! Error types for Spyglass

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: usize, message: String },

    #[error("Invalid address: {0:#x}")]
    InvalidAddress(usize),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Decode error at {address:#x}: {message}")]
    Decode { address: usize, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
