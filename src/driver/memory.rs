/// In-memory document driver
///
/// Backs the simulator binary and the test suites. Collections are kept in
/// id order, live subscribers receive a snapshot when they subscribe and
/// after every write to their collection, and any primitive operation can be
/// scripted to fail so reconnection and retry paths can be exercised without
/// a real backend. Calls can also be given response latency, which makes
/// them real suspension points for the caller.
///
/// While the network is disabled, document reads and writes fail the way an
/// offline client does.
use super::{
    split_document_path, validate_path, Document, DocumentDriver, DriverError, ErrorCallback,
    FilterOp, PathKind, QueryConstraint, SnapshotCallback, SortDirection, Unsubscribe,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Primitive driver operations, used for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOp {
    GetDocument,
    QueryCollection,
    AddDocument,
    UpdateDocument,
    DeleteDocument,
    Subscribe,
    Unsubscribe,
    EnableNetwork,
    DisableNetwork,
    WaitForPendingWrites,
}

impl DriverOp {
    /// Document reads and writes need the network; listeners and control calls do not
    pub fn requires_network(&self) -> bool {
        matches!(
            self,
            DriverOp::GetDocument
                | DriverOp::QueryCollection
                | DriverOp::AddDocument
                | DriverOp::UpdateDocument
                | DriverOp::DeleteDocument
        )
    }
}

fn offline_error(op: DriverOp) -> DriverError {
    DriverError::message(format!(
        "Failed to complete {:?} because the client is offline.",
        op
    ))
}

struct Subscriber {
    collection: String,
    constraints: Vec<QueryConstraint>,
    on_data: SnapshotCallback,
    on_error: ErrorCallback,
}

struct MemoryState {
    collections: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,
    subscribers: HashMap<Uuid, Subscriber>,
    network_enabled: bool,
    calls: HashMap<DriverOp, usize>,
    call_log: Vec<DriverOp>,
    latency: HashMap<DriverOp, Duration>,
    scripted_failures: HashMap<DriverOp, VecDeque<DriverError>>,
    persistent_failures: HashMap<DriverOp, DriverError>,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            collections: BTreeMap::new(),
            subscribers: HashMap::new(),
            network_enabled: true,
            calls: HashMap::new(),
            call_log: Vec::new(),
            latency: HashMap::new(),
            scripted_failures: HashMap::new(),
            persistent_failures: HashMap::new(),
        }
    }

    /// Count and log the call, then return the failure owed to it, if any
    ///
    /// Injected failures take precedence over the offline check.
    fn record_call(&mut self, op: DriverOp) -> Result<(), DriverError> {
        *self.calls.entry(op).or_insert(0) += 1;
        self.call_log.push(op);

        if let Some(err) = self
            .scripted_failures
            .get_mut(&op)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }

        if let Some(err) = self.persistent_failures.get(&op) {
            return Err(err.clone());
        }

        if op.requires_network() && !self.network_enabled {
            return Err(offline_error(op));
        }
        Ok(())
    }

    fn snapshot(&self, collection: &str, constraints: &[QueryConstraint]) -> Vec<Document> {
        let docs = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| Document::new(id.clone(), data.clone()))
                    .collect()
            })
            .unwrap_or_default();

        apply_constraints(docs, constraints)
    }

    /// Snapshots owed to subscribers of `collection` after a write
    fn pending_notifications(&self, collection: &str) -> Vec<(SnapshotCallback, Vec<Document>)> {
        self.subscribers
            .values()
            .filter(|sub| sub.collection == collection)
            .map(|sub| {
                (
                    Arc::clone(&sub.on_data),
                    self.snapshot(collection, &sub.constraints),
                )
            })
            .collect()
    }
}

/// Shared, cloneable in-memory driver
#[derive(Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a document without counting a call or notifying subscribers
    ///
    /// Only JSON objects are documents; other values are ignored.
    pub fn insert(&self, path: &str, data: Value) {
        let Some((collection, id)) = split_document_path(path) else {
            return;
        };
        let Value::Object(data) = data else {
            return;
        };

        self.lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), data);
    }

    /// Current contents of a document, bypassing fault injection
    pub fn document(&self, path: &str) -> Option<Map<String, Value>> {
        let (collection, id) = split_document_path(path)?;
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Fail the next call to `op` with `error`; queued failures are consumed in order
    pub fn fail_next(&self, op: DriverOp, error: DriverError) {
        self.lock()
            .scripted_failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Fail every call to `op` until [`clear_faults`](Self::clear_faults)
    pub fn fail_always(&self, op: DriverOp, error: DriverError) {
        self.lock().persistent_failures.insert(op, error);
    }

    /// Drop every scripted and persistent failure for `op`
    pub fn clear_faults(&self, op: DriverOp) {
        let mut state = self.lock();
        state.scripted_failures.remove(&op);
        state.persistent_failures.remove(&op);
    }

    /// Number of calls made to `op`, including failed ones
    pub fn calls(&self, op: DriverOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Every call made so far, in the order the driver executed them
    pub fn call_log(&self) -> Vec<DriverOp> {
        self.lock().call_log.clone()
    }

    /// Hold every response to `op` for `delay` after the call has taken effect
    pub fn set_latency(&self, op: DriverOp, delay: Duration) {
        self.lock().latency.insert(op, delay);
    }

    async fn respond<T>(&self, op: DriverOp, result: Result<T, DriverError>) -> Result<T, DriverError> {
        let delay = self.lock().latency.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    pub fn is_network_enabled(&self) -> bool {
        self.lock().network_enabled
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Deliver `error` to every live subscriber of `collection`
    pub fn emit_error(&self, collection: &str, error: DriverError) {
        let callbacks: Vec<ErrorCallback> = self
            .lock()
            .subscribers
            .values()
            .filter(|sub| sub.collection == collection)
            .map(|sub| Arc::clone(&sub.on_error))
            .collect();

        for callback in callbacks {
            callback(error.clone());
        }
    }

    fn notify(notifications: Vec<(SnapshotCallback, Vec<Document>)>) {
        for (callback, snapshot) in notifications {
            callback(snapshot);
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_path(reason: String) -> DriverError {
    DriverError::new("invalid-argument", reason)
}

fn document_parts(path: &str) -> Result<(String, String), DriverError> {
    validate_path(path, PathKind::Document).map_err(invalid_path)?;
    split_document_path(path)
        .map(|(collection, id)| (collection.to_string(), id.to_string()))
        .ok_or_else(|| invalid_path(format!("'{}' is not a document path", path)))
}

// Synchronous bodies of the driver calls; latency is applied on top by `respond`
impl MemoryDriver {
    fn get_now(&self, path: &str) -> Result<Option<Document>, DriverError> {
        let (collection, id) = document_parts(path)?;
        let mut state = self.lock();
        state.record_call(DriverOp::GetDocument)?;

        Ok(state
            .collections
            .get(&collection)
            .and_then(|docs| docs.get(&id))
            .map(|data| Document::new(id.clone(), data.clone())))
    }

    fn query_now(
        &self,
        path: &str,
        constraints: &[QueryConstraint],
    ) -> Result<Vec<Document>, DriverError> {
        validate_path(path, PathKind::Collection).map_err(invalid_path)?;
        let mut state = self.lock();
        state.record_call(DriverOp::QueryCollection)?;
        Ok(state.snapshot(path, constraints))
    }

    fn add_now(&self, path: &str, data: Map<String, Value>) -> Result<String, DriverError> {
        validate_path(path, PathKind::Collection).map_err(invalid_path)?;
        let id = Uuid::new_v4().simple().to_string();

        let notifications = {
            let mut state = self.lock();
            state.record_call(DriverOp::AddDocument)?;
            state
                .collections
                .entry(path.to_string())
                .or_default()
                .insert(id.clone(), data);
            state.pending_notifications(path)
        };

        Self::notify(notifications);
        Ok(id)
    }

    fn update_now(&self, path: &str, data: Map<String, Value>) -> Result<(), DriverError> {
        let (collection, id) = document_parts(path)?;

        let notifications = {
            let mut state = self.lock();
            state.record_call(DriverOp::UpdateDocument)?;
            let existing = state
                .collections
                .get_mut(&collection)
                .and_then(|docs| docs.get_mut(&id))
                .ok_or_else(|| {
                    DriverError::new("not-found", format!("No document to update: {}", path))
                })?;

            for (key, value) in data {
                existing.insert(key, value);
            }
            state.pending_notifications(&collection)
        };

        Self::notify(notifications);
        Ok(())
    }

    fn delete_now(&self, path: &str) -> Result<(), DriverError> {
        let (collection, id) = document_parts(path)?;

        let notifications = {
            let mut state = self.lock();
            state.record_call(DriverOp::DeleteDocument)?;
            let removed = state
                .collections
                .get_mut(&collection)
                .and_then(|docs| docs.remove(&id))
                .is_some();

            if removed {
                state.pending_notifications(&collection)
            } else {
                Vec::new()
            }
        };

        Self::notify(notifications);
        Ok(())
    }

    fn set_network_now(&self, op: DriverOp, enabled: bool) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.record_call(op)?;
        state.network_enabled = enabled;
        Ok(())
    }

    fn subscribe_now(
        &self,
        path: &str,
        constraints: &[QueryConstraint],
        on_data: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe, DriverError> {
        validate_path(path, PathKind::Collection).map_err(invalid_path)?;
        let id = Uuid::new_v4();

        let initial = {
            let mut state = self.lock();
            state.record_call(DriverOp::Subscribe)?;
            state.subscribers.insert(
                id,
                Subscriber {
                    collection: path.to_string(),
                    constraints: constraints.to_vec(),
                    on_data: Arc::clone(&on_data),
                    on_error,
                },
            );
            state.snapshot(path, constraints)
        };

        on_data(initial);

        let state = Arc::clone(&self.state);
        Ok(Box::new(move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.record_call(DriverOp::Unsubscribe)?;
            state.subscribers.remove(&id);
            Ok(())
        }))
    }
}

#[async_trait]
impl DocumentDriver for MemoryDriver {
    async fn get_document(&self, path: &str) -> Result<Option<Document>, DriverError> {
        self.respond(DriverOp::GetDocument, self.get_now(path)).await
    }

    async fn query_collection(
        &self,
        path: &str,
        constraints: &[QueryConstraint],
    ) -> Result<Vec<Document>, DriverError> {
        self.respond(DriverOp::QueryCollection, self.query_now(path, constraints))
            .await
    }

    async fn add_document(&self, path: &str, data: Map<String, Value>) -> Result<String, DriverError> {
        self.respond(DriverOp::AddDocument, self.add_now(path, data)).await
    }

    async fn update_document(&self, path: &str, data: Map<String, Value>) -> Result<(), DriverError> {
        self.respond(DriverOp::UpdateDocument, self.update_now(path, data))
            .await
    }

    async fn delete_document(&self, path: &str) -> Result<(), DriverError> {
        self.respond(DriverOp::DeleteDocument, self.delete_now(path)).await
    }

    async fn enable_network(&self) -> Result<(), DriverError> {
        let result = self.set_network_now(DriverOp::EnableNetwork, true);
        self.respond(DriverOp::EnableNetwork, result).await
    }

    async fn disable_network(&self) -> Result<(), DriverError> {
        let result = self.set_network_now(DriverOp::DisableNetwork, false);
        self.respond(DriverOp::DisableNetwork, result).await
    }

    async fn wait_for_pending_writes(&self) -> Result<(), DriverError> {
        let result = self.lock().record_call(DriverOp::WaitForPendingWrites);
        self.respond(DriverOp::WaitForPendingWrites, result).await
    }

    async fn subscribe(
        &self,
        path: &str,
        constraints: &[QueryConstraint],
        on_data: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> Result<Unsubscribe, DriverError> {
        let result = self.subscribe_now(path, constraints, on_data, on_error);
        self.respond(DriverOp::Subscribe, result).await
    }
}

/// Apply where filters, then ordering, then the limit
fn apply_constraints(mut docs: Vec<Document>, constraints: &[QueryConstraint]) -> Vec<Document> {
    for constraint in constraints {
        if let QueryConstraint::Where { field, op, value } = constraint {
            docs.retain(|doc| {
                lookup(doc, field)
                    .map(|actual| matches_filter(actual, *op, value))
                    .unwrap_or(false)
            });
        }
    }

    let orderings: Vec<(&str, SortDirection)> = constraints
        .iter()
        .filter_map(|c| match c {
            QueryConstraint::OrderBy { field, direction } => Some((field.as_str(), *direction)),
            _ => None,
        })
        .collect();

    if !orderings.is_empty() {
        docs.sort_by(|a, b| {
            for (field, direction) in &orderings {
                let ordering = match (lookup(a, field), lookup(b, field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                let ordering = match direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    let limit = constraints.iter().rev().find_map(|c| match c {
        QueryConstraint::Limit { count } => Some(*count),
        _ => None,
    });
    if let Some(limit) = limit {
        docs.truncate(limit);
    }

    docs
}

/// Resolve a possibly dotted field path (`address.city`)
fn lookup<'a>(doc: &'a Document, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = doc.data.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn matches_filter(actual: &Value, op: FilterOp, expected: &Value) -> bool {
    match op {
        FilterOp::Eq => values_equal(actual, expected),
        FilterOp::NotEq => !values_equal(actual, expected),
        FilterOp::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        FilterOp::Lte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::ArrayContains => actual
            .as_array()
            .map(|items| items.iter().any(|item| values_equal(item, expected)))
            .unwrap_or(false),
        FilterOp::In => expected
            .as_array()
            .map(|options| options.iter().any(|option| values_equal(actual, option)))
            .unwrap_or(false),
    }
}

/// Equality that treats `1` and `1.0` as the same number
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}
