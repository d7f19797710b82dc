/// Backing store driver contract
///
/// The resilience layer never talks to a vendor SDK directly. Everything it
/// needs from the remote document store is expressed by [`DocumentDriver`]:
/// primitive reads and writes, live subscriptions, and the network toggles
/// used by the reconnection sequence.
///
/// A reference in-memory implementation lives in [`memory`].
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::{DriverOp, MemoryDriver};

/// Raw error reported by a driver
///
/// Vendor SDKs usually attach a machine-readable code (`"unavailable"`,
/// `"permission-denied"`, ...) and a free-form message. Either may be all we
/// get, so the code is optional.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    /// Machine-readable error code, if the driver supplied one
    pub code: Option<String>,

    /// Human-readable message from the driver
    pub message: String,
}

impl DriverError {
    /// Create an error carrying both a code and a message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Create an error that only carries a message
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, data: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Look up a top-level field
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.data.get(field)
    }
}

/// Comparison operators for `where` constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    ArrayContains,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Query constraint passed through to the driver untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryConstraint {
    Where {
        field: String,
        op: FilterOp,
        value: serde_json::Value,
    },
    OrderBy {
        field: String,
        direction: SortDirection,
    },
    Limit {
        count: usize,
    },
}

impl QueryConstraint {
    pub fn where_eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        QueryConstraint::Where {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn order_by(field: impl Into<String>, direction: SortDirection) -> Self {
        QueryConstraint::OrderBy {
            field: field.into(),
            direction,
        }
    }

    pub fn limit(n: usize) -> Self {
        QueryConstraint::Limit { count: n }
    }
}

/// Callback receiving every snapshot of a live query
pub type SnapshotCallback = Arc<dyn Fn(Vec<Document>) + Send + Sync>;

/// Callback receiving errors raised by a live query
pub type ErrorCallback = Arc<dyn Fn(DriverError) + Send + Sync>;

/// Cancellation function returned by [`DocumentDriver::subscribe`]
pub type Unsubscribe = Box<dyn FnOnce() -> Result<(), DriverError> + Send>;

/// Primitive operations of the remote document store
///
/// All operations are asynchronous and may fail with a [`DriverError`].
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait DocumentDriver: Send + Sync {
    /// Fetch a single document, `None` if it does not exist
    async fn get_document(&self, path: &str) -> Result<Option<Document>, DriverError>;

    /// Fetch one snapshot of a collection
    async fn query_collection(
        &self,
        path: &str,
        constraints: &[QueryConstraint],
    ) -> Result<Vec<Document>, DriverError>;

    /// Add a document with a generated id, returning the id
    async fn add_document(
        &self,
        path: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, DriverError>;

    /// Merge fields into an existing document
    async fn update_document(
        &self,
        path: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), DriverError>;

    async fn delete_document(&self, path: &str) -> Result<(), DriverError>;

    async fn enable_network(&self) -> Result<(), DriverError>;

    async fn disable_network(&self) -> Result<(), DriverError>;

    /// Resolve once every locally pending write has been acknowledged
    async fn wait_for_pending_writes(&self) -> Result<(), DriverError>;

    /// Open a live subscription on a collection
    async fn subscribe(
        &self,
        path: &str,
        constraints: &[QueryConstraint],
        on_data: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe, DriverError>;
}

/// Kind of store path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Collection,
    Document,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Collection => write!(f, "collection"),
            PathKind::Document => write!(f, "document"),
        }
    }
}

/// Check that `path` names a collection or a document
///
/// Collection paths have an odd number of segments (`tours`,
/// `tours/abc/reviews`), document paths an even number (`tours/abc`).
/// Empty segments are rejected.
pub fn validate_path(path: &str, kind: PathKind) -> Result<(), String> {
    if path.is_empty() {
        return Err(format!("empty {} path", kind));
    }

    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(format!("{} path '{}' contains an empty segment", kind, path));
    }

    let expected_odd = kind == PathKind::Collection;
    if (segments.len() % 2 == 1) != expected_odd {
        return Err(format!(
            "'{}' is not a {} path ({} segments)",
            path,
            kind,
            segments.len()
        ));
    }

    Ok(())
}

/// Split a document path into its collection path and document id
pub fn split_document_path(path: &str) -> Option<(&str, &str)> {
    let (collection, id) = path.rsplit_once('/')?;
    if collection.is_empty() || id.is_empty() {
        return None;
    }
    Some((collection, id))
}
