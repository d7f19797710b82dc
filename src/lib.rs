// Allow complex types where needed for driver callbacks and shared state
#![allow(clippy::type_complexity)]

pub mod client;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod executor;
pub mod listeners;
pub mod payload;

// Re-export the main client surface for convenience
pub use client::{LiveQuery, ResilientClient};
pub use config::ClientConfig;
pub use connection::{ConnectionState, RecoveryTrigger};
pub use driver::{Document, DocumentDriver, DriverError, QueryConstraint};
pub use error::{ClassifiedError, ErrorClass};
pub use payload::{sanitize, Payload};

use thiserror::Error;

/// Errors surfaced to callers of the resilient client
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Operation failed: {0}")]
    Operation(ClassifiedError),

    #[error("Reconnection attempt {attempt}/{max_attempts} failed: {reason}")]
    ReconnectionFailed {
        attempt: u32,
        max_attempts: u32,
        reason: String,
    },

    #[error("Reconnection budget exhausted after {attempts} failed attempts")]
    ReconnectionExhausted { attempts: u32 },

    #[error("Connection failed")]
    ConnectionFailed,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Client is shut down")]
    Closed,
}

impl StoreError {
    /// Error class this failure belongs to
    ///
    /// Reconnection failures are connection-fatal by nature; local failures
    /// such as an invalid path or payload have no driver class.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Operation(e) => e.class,
            StoreError::ReconnectionFailed { .. }
            | StoreError::ReconnectionExhausted { .. }
            | StoreError::ConnectionFailed => ErrorClass::ConnectionFatal,
            StoreError::Timeout(_) => ErrorClass::Transient,
            StoreError::InvalidPath(_) | StoreError::InvalidPayload(_) | StoreError::Closed => {
                ErrorClass::Unknown
            }
        }
    }

    /// Message that can be shown to an end user
    pub fn user_message(&self) -> String {
        match self {
            StoreError::Operation(e) => e.user_message(),
            StoreError::InvalidPath(_) | StoreError::InvalidPayload(_) | StoreError::Closed => {
                self.to_string()
            }
            other => other
                .class()
                .user_message()
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        }
    }

    /// The classified driver error behind this failure, if there is one
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            StoreError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ClassifiedError> for StoreError {
    fn from(err: ClassifiedError) -> Self {
        StoreError::Operation(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
