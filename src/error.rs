//! Error types for the gateway.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store rejected or failed an upload
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A background sweeper panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),

    /// I/O errors (binding the listener, serving)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
