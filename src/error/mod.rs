/// Error handling for the resilient document store client
///
/// This module provides:
/// - Error classification of raw driver errors
/// - Exponential backoff for retried operations
///
/// # Architecture
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │   Operation Executor / Health Monitor     │
/// └────────────────┬─────────────────────────┘
///                  │ DriverError
///                  ↓
/// ┌──────────────────────────────────────────┐
/// │   ErrorClassifier  →  ClassifiedError     │
/// └────────────────┬─────────────────────────┘
///                  │ ErrorClass
///      ┌───────────┴────────────┐
///      ↓                        ↓
/// ┌─────────────┐      ┌──────────────────────┐
/// │ Exponential │      │ Reconnection         │
/// │ Backoff     │      │ Coordinator          │
/// └─────────────┘      └──────────────────────┘
/// ```
pub mod classification;
pub mod retry;

// Re-export main types for convenience
pub use classification::{ClassifiedError, ErrorClass, ErrorClassifier, ErrorContext};
pub use retry::ExponentialBackoff;
