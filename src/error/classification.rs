/// Error classification system for recovery strategy selection
///
/// This module maps raw driver errors onto a small taxonomy. The executor and
/// the health monitor both decide what to do next (reconnect, back off, or
/// give up) from the class alone, so classification is a pure function of
/// the driver error: code first, then known message signatures.
use crate::driver::DriverError;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Classification of driver errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// The driver is wedged; only a full network cycle clears it
    /// Examples: internal assertion failures, duplicate target ids, `unavailable`
    ConnectionFatal,

    /// Temporary failure - retry with backoff, no reconnection needed
    /// Examples: deadline exceeded, client offline, aborted transaction
    Transient,

    PermissionDenied,

    NotFound,

    /// The write conflicts with the current state of the data
    PreconditionFailed,

    Unauthenticated,

    /// Anything we could not recognise
    Unknown,
}

impl ErrorClass {
    /// Get human-readable description of error class
    pub fn description(&self) -> &'static str {
        match self {
            ErrorClass::ConnectionFatal => "Driver connection is broken and needs a network cycle",
            ErrorClass::Transient => "Temporary error that may resolve on retry",
            ErrorClass::PermissionDenied => "Caller lacks permission for this operation",
            ErrorClass::NotFound => "Target document or collection does not exist",
            ErrorClass::PreconditionFailed => "Operation conflicts with current data",
            ErrorClass::Unauthenticated => "Caller is not signed in",
            ErrorClass::Unknown => "Unrecognised driver error",
        }
    }

    /// Check if this error class allows retries
    pub fn allows_retry(&self) -> bool {
        matches!(self, ErrorClass::ConnectionFatal | ErrorClass::Transient)
    }

    /// Stable message suitable for showing to end users
    ///
    /// `None` for [`ErrorClass::Unknown`], where the driver message is the
    /// only thing worth showing.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            ErrorClass::ConnectionFatal => {
                Some("Connection to the server was lost. Please try again in a moment.")
            }
            ErrorClass::Transient => {
                Some("The service is temporarily unavailable. Please try again.")
            }
            ErrorClass::PermissionDenied => {
                Some("You do not have permission to perform this action.")
            }
            ErrorClass::NotFound => Some("The requested item could not be found."),
            ErrorClass::PreconditionFailed => Some(
                "The data changed while your request was being processed. Please refresh and try again.",
            ),
            ErrorClass::Unauthenticated => Some("Please sign in to continue."),
            ErrorClass::Unknown => None,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::ConnectionFatal => write!(f, "ConnectionFatal"),
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::PermissionDenied => write!(f, "PermissionDenied"),
            ErrorClass::NotFound => write!(f, "NotFound"),
            ErrorClass::PreconditionFailed => write!(f, "PreconditionFailed"),
            ErrorClass::Unauthenticated => write!(f, "Unauthenticated"),
            ErrorClass::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Context information about where and when an error occurred
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Operation name (e.g., "update_document", "health_probe", "subscribe")
    pub operation: String,

    /// Store path the operation targeted, empty for connection-level calls
    pub path: String,

    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,

    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            path: path.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Context for a connection-level call that has no path
    pub fn connection(operation: impl Into<String>) -> Self {
        Self::new(operation, "")
    }

    /// Add metadata to the context
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Classified error with retry bookkeeping
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    /// Original error from the driver
    pub original: DriverError,

    pub class: ErrorClass,

    pub context: ErrorContext,

    /// Attempt (1-based) on which the error was raised
    pub attempt: u32,

    /// Maximum attempts allowed for the operation
    pub max_attempts: u32,
}

impl ClassifiedError {
    /// Check if this error can be retried
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts && self.class.allows_retry()
    }

    /// Get remaining retry attempts
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    /// Record the attempt counters of the operation that raised this error
    pub fn at_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = attempt;
        self.max_attempts = max_attempts;
        self
    }

    /// Message to present to users, falling back to the driver's message
    pub fn user_message(&self) -> String {
        self.class
            .user_message()
            .map(str::to_string)
            .unwrap_or_else(|| self.original.message.clone())
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.path.is_empty() {
            write!(
                f,
                "{} error in {}: {} (attempt {}/{})",
                self.class, self.context.operation, self.original, self.attempt, self.max_attempts
            )
        } else {
            write!(
                f,
                "{} error in {} on {}: {} (attempt {}/{})",
                self.class,
                self.context.operation,
                self.context.path,
                self.original,
                self.attempt,
                self.max_attempts
            )
        }
    }
}

lazy_static! {
    /// Internal failure signatures that leave the driver wedged
    static ref FATAL_SIGNATURES: RegexSet = RegexSet::new([
        r"(?i)internal assertion failed",
        r"(?i)target id already exists",
        r"(?i)unexpected state",
        r"(?i)\bid:\s*ca9\b",
        r"(?i)\bid:\s*b815\b",
    ])
    .expect("fatal signature patterns are valid");

    static ref TRANSIENT_SIGNATURES: RegexSet = RegexSet::new([
        r"(?i)client is offline",
        r"(?i)timed out",
        r"(?i)deadline",
        r"(?i)network error",
    ])
    .expect("transient signature patterns are valid");
}

/// Error classifier - determines the class of a driver error
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify a driver error raised by the operation described in `context`
    pub fn classify(&self, error: DriverError, context: ErrorContext) -> ClassifiedError {
        let class = self.class_of(&error);

        ClassifiedError {
            original: error,
            class,
            context,
            attempt: 1,
            max_attempts: 1,
        }
    }

    /// Determine the error class: code first, message signatures second
    pub fn class_of(&self, error: &DriverError) -> ErrorClass {
        error
            .code
            .as_deref()
            .and_then(Self::classify_code)
            .unwrap_or_else(|| Self::classify_message(&error.message))
    }

    /// Map a driver code, ignoring any vendor prefix (`firestore/unavailable`)
    fn classify_code(code: &str) -> Option<ErrorClass> {
        let code = code.rsplit('/').next().unwrap_or(code).trim().to_ascii_lowercase();

        match code.as_str() {
            "unavailable" | "internal" | "data-loss" => Some(ErrorClass::ConnectionFatal),
            "deadline-exceeded" | "resource-exhausted" | "aborted" | "cancelled" => {
                Some(ErrorClass::Transient)
            }
            "permission-denied" => Some(ErrorClass::PermissionDenied),
            "not-found" => Some(ErrorClass::NotFound),
            "failed-precondition" | "already-exists" | "out-of-range" => {
                Some(ErrorClass::PreconditionFailed)
            }
            "unauthenticated" => Some(ErrorClass::Unauthenticated),
            // "unknown", "invalid-argument" and vendor-specific codes fall back to the message
            _ => None,
        }
    }

    fn classify_message(message: &str) -> ErrorClass {
        if FATAL_SIGNATURES.is_match(message) {
            ErrorClass::ConnectionFatal
        } else if TRANSIENT_SIGNATURES.is_match(message) {
            ErrorClass::Transient
        } else {
            ErrorClass::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("unavailable", ErrorClass::ConnectionFatal ; "unavailable")]
    #[test_case("internal", ErrorClass::ConnectionFatal ; "internal")]
    #[test_case("firestore/unavailable", ErrorClass::ConnectionFatal ; "vendor prefix")]
    #[test_case("DEADLINE-EXCEEDED", ErrorClass::Transient ; "case insensitive")]
    #[test_case("aborted", ErrorClass::Transient ; "aborted")]
    #[test_case("permission-denied", ErrorClass::PermissionDenied ; "permission")]
    #[test_case("not-found", ErrorClass::NotFound ; "not found")]
    #[test_case("failed-precondition", ErrorClass::PreconditionFailed ; "precondition")]
    #[test_case("already-exists", ErrorClass::PreconditionFailed ; "already exists")]
    #[test_case("unauthenticated", ErrorClass::Unauthenticated ; "unauthenticated")]
    #[test_case("invalid-argument", ErrorClass::Unknown ; "unrecognised code")]
    fn test_classify_by_code(code: &str, expected: ErrorClass) {
        let classifier = ErrorClassifier::new();
        let error = DriverError::new(code, "something went wrong");
        assert_eq!(classifier.class_of(&error), expected);
    }

    #[test_case("FIRESTORE INTERNAL ASSERTION FAILED: Unexpected state", ErrorClass::ConnectionFatal ; "assertion")]
    #[test_case("Target ID already exists: 4", ErrorClass::ConnectionFatal ; "duplicate target")]
    #[test_case("INTERNAL ASSERTION FAILED (ID: ca9)", ErrorClass::ConnectionFatal ; "ca9")]
    #[test_case("Failed to get document because the client is offline.", ErrorClass::Transient ; "offline")]
    #[test_case("request timed out", ErrorClass::Transient ; "timeout")]
    #[test_case("quota exceeded for project", ErrorClass::Unknown ; "unknown")]
    fn test_classify_by_message(message: &str, expected: ErrorClass) {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.class_of(&DriverError::message(message)), expected);
    }

    #[test]
    fn test_unknown_code_falls_back_to_message() {
        let classifier = ErrorClassifier::new();
        let error = DriverError::new("unknown", "INTERNAL ASSERTION FAILED: Unexpected state");
        assert_eq!(classifier.class_of(&error), ErrorClass::ConnectionFatal);
    }

    #[test]
    fn test_code_takes_precedence_over_message() {
        let classifier = ErrorClassifier::new();
        let error = DriverError::new("permission-denied", "client is offline");
        assert_eq!(classifier.class_of(&error), ErrorClass::PermissionDenied);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = ErrorClassifier::new();
        let error = DriverError::message("Target ID already exists: 12");
        let first = classifier.class_of(&error);
        for _ in 0..10 {
            assert_eq!(classifier.class_of(&error), first);
        }
    }

    #[test]
    fn test_error_class_allows_retry() {
        assert!(ErrorClass::ConnectionFatal.allows_retry());
        assert!(ErrorClass::Transient.allows_retry());
        assert!(!ErrorClass::PermissionDenied.allows_retry());
        assert!(!ErrorClass::NotFound.allows_retry());
        assert!(!ErrorClass::PreconditionFailed.allows_retry());
        assert!(!ErrorClass::Unauthenticated.allows_retry());
        assert!(!ErrorClass::Unknown.allows_retry());
    }

    #[test]
    fn test_user_message_falls_back_for_unknown() {
        let classifier = ErrorClassifier::new();
        let context = ErrorContext::new("update_document", "tours/a");

        let classified = classifier.classify(DriverError::message("quota exceeded"), context.clone());
        assert_eq!(classified.user_message(), "quota exceeded");

        let classified = classifier.classify(
            DriverError::new("permission-denied", "Missing or insufficient permissions."),
            context,
        );
        assert_eq!(
            classified.user_message(),
            "You do not have permission to perform this action."
        );
    }

    #[test]
    fn test_classified_error_attempt_bookkeeping() {
        let classifier = ErrorClassifier::new();
        let context = ErrorContext::new("update_document", "tours/a");
        let classified = classifier
            .classify(DriverError::new("aborted", "contention"), context)
            .at_attempt(2, 5);

        assert!(classified.can_retry());
        assert_eq!(classified.remaining_attempts(), 3);
        assert!(classified.to_string().contains("attempt 2/5"));
        assert!(classified.to_string().contains("tours/a"));
    }

    #[test]
    fn test_error_context_builder() {
        let ctx = ErrorContext::connection("health_probe").with_metadata("trigger", "timer");
        assert_eq!(ctx.operation, "health_probe");
        assert!(ctx.path.is_empty());
        assert_eq!(ctx.metadata.get("trigger"), Some(&"timer".to_string()));
    }
}
