/// Resilient document store client
///
/// The public facade. It owns the connection state, the listener registry,
/// the reconnection coordinator, the health monitor and the operation
/// executor, and routes every caller request through them.
///
/// ```no_run
/// # use resilient_docstore::{ClientConfig, ResilientClient, Payload};
/// # use resilient_docstore::driver::MemoryDriver;
/// # use std::sync::Arc;
/// # async fn demo() -> resilient_docstore::StoreResult<()> {
/// let client = ResilientClient::new(Arc::new(MemoryDriver::new()), ClientConfig::default());
/// client.initialize().await?;
/// client.spawn_health_monitor();
///
/// let id = client
///     .create_document("tours", Payload::mapping([("city", Payload::from("Lisbon"))]))
///     .await?;
/// # Ok(())
/// # }
/// ```
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionState, HealthMonitor, MonitorHandle, ProbeOutcome, ReconnectionCoordinator,
    RecoveryTrigger, StateTracker,
};
use crate::driver::{
    validate_path, Document, DocumentDriver, DriverError, ErrorCallback, PathKind,
    QueryConstraint, SnapshotCallback,
};
use crate::error::{ErrorClass, ErrorClassifier, ErrorContext};
use crate::executor::{OperationExecutor, OperationKind, RetryableOperation};
use crate::listeners::ListenerRegistry;
use crate::payload::Payload;
use crate::{StoreError, StoreResult};
use futures::Stream;
use serde_json::{Map, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct ClientInner {
    driver: Arc<dyn DocumentDriver>,
    config: ClientConfig,
    state: StateTracker,
    listeners: Arc<ListenerRegistry>,
    coordinator: Arc<ReconnectionCoordinator>,
    monitor: Arc<HealthMonitor>,
    executor: OperationExecutor,
    monitor_handle: Mutex<Option<MonitorHandle>>,
    /// Bumped by every caller-requested listener cleanup
    clear_generation: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Cloneable handle to a resilient client; clones share all state
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<ClientInner>,
}

impl ResilientClient {
    pub fn new(driver: Arc<dyn DocumentDriver>, config: ClientConfig) -> Self {
        let state = StateTracker::new();
        let listeners = Arc::new(ListenerRegistry::new());
        let coordinator = Arc::new(ReconnectionCoordinator::new(
            Arc::clone(&driver),
            state.clone(),
            Arc::clone(&listeners),
            config.reconnect(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&driver),
            state.clone(),
            Arc::clone(&coordinator),
            config.probe_timeout(),
        ));
        let executor =
            OperationExecutor::new(state.clone(), Arc::clone(&coordinator), config.backoff());
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(ClientInner {
                driver,
                config,
                state,
                listeners,
                coordinator,
                monitor,
                executor,
                monitor_handle: Mutex::new(None),
                clear_generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Verify the connection once and settle the initial state
    pub async fn initialize(&self) -> StoreResult<ConnectionState> {
        self.ensure_open()?;
        tracing::info!("Initializing resilient client");

        match self.inner.monitor.probe().await {
            ProbeOutcome::Healthy | ProbeOutcome::Skipped => Ok(self.current_state()),
            ProbeOutcome::Fatal {
                recovered: true, ..
            } => Ok(self.current_state()),
            ProbeOutcome::Degraded(error) | ProbeOutcome::Fatal { error, .. } => {
                Err(StoreError::Operation(error))
            }
        }
    }

    /// Start periodic health probes; returns false if they are already running
    pub fn spawn_health_monitor(&self) -> bool {
        let mut slot = self
            .inner
            .monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if slot.as_ref().map(MonitorHandle::is_running).unwrap_or(false) {
            return false;
        }

        let handle = Arc::clone(&self.inner.monitor).spawn(self.inner.config.health_check_interval());
        *slot = Some(handle);
        true
    }

    pub async fn read_document(&self, path: &str) -> StoreResult<Option<Document>> {
        self.ensure_open()?;
        validate_path(path, PathKind::Document).map_err(StoreError::InvalidPath)?;

        let driver = &self.inner.driver;
        let mut op = self.operation(OperationKind::Read, path);
        self.inner
            .executor
            .execute(&mut op, || driver.get_document(path))
            .await
    }

    /// One-shot read of a collection
    pub async fn query_collection(
        &self,
        path: &str,
        constraints: &[QueryConstraint],
    ) -> StoreResult<Vec<Document>> {
        self.ensure_open()?;
        validate_path(path, PathKind::Collection).map_err(StoreError::InvalidPath)?;

        let driver = &self.inner.driver;
        let mut op = self.operation(OperationKind::Query, path);
        self.inner
            .executor
            .execute(&mut op, || driver.query_collection(path, constraints))
            .await
    }

    /// Live query that keeps streaming snapshots across reconnections
    pub fn read_collection(
        &self,
        path: &str,
        constraints: Vec<QueryConstraint>,
    ) -> StoreResult<LiveQuery> {
        self.ensure_open()?;
        validate_path(path, PathKind::Collection).map_err(StoreError::InvalidPath)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_live_query(
            Arc::clone(&self.inner),
            path.to_string(),
            constraints,
            tx,
        ));

        Ok(LiveQuery {
            receiver: rx,
            task,
        })
    }

    /// Add a document with a generated id
    pub async fn create_document(&self, path: &str, payload: Payload) -> StoreResult<String> {
        self.ensure_open()?;
        validate_path(path, PathKind::Collection).map_err(StoreError::InvalidPath)?;

        let mut op = self
            .operation(OperationKind::Create, path)
            .with_payload(&payload);
        let data = document_data(&op)?;

        let driver = &self.inner.driver;
        self.inner
            .executor
            .execute(&mut op, || driver.add_document(path, data.clone()))
            .await
    }

    /// Merge fields into an existing document
    pub async fn update_document(&self, path: &str, payload: Payload) -> StoreResult<()> {
        self.ensure_open()?;
        validate_path(path, PathKind::Document).map_err(StoreError::InvalidPath)?;

        let mut op = self
            .operation(OperationKind::Update, path)
            .with_payload(&payload);
        let data = document_data(&op)?;

        let driver = &self.inner.driver;
        self.inner
            .executor
            .execute(&mut op, || driver.update_document(path, data.clone()))
            .await
    }

    pub async fn delete_document(&self, path: &str) -> StoreResult<()> {
        self.ensure_open()?;
        validate_path(path, PathKind::Document).map_err(StoreError::InvalidPath)?;

        let driver = &self.inner.driver;
        let mut op = self.operation(OperationKind::Delete, path);
        self.inner
            .executor
            .execute(&mut op, || driver.delete_document(path))
            .await
    }

    fn operation(&self, kind: OperationKind, path: &str) -> RetryableOperation {
        RetryableOperation::new(kind, path, self.inner.config.max_operation_attempts)
    }

    /// Observe connection state transitions
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Manually run a reconnection episode, resetting an exhausted budget
    pub async fn force_reconnect(&self) -> StoreResult<ConnectionState> {
        self.ensure_open()?;
        tracing::info!("Manual reconnect requested");
        self.inner.coordinator.force_reconnect().await
    }

    /// Wait until the connection is established
    ///
    /// Fails with `ConnectionFailed` as soon as the state is `Error`, and with
    /// `Timeout` if neither state shows up in time.
    pub async fn wait_for_connection(&self, timeout: Duration) -> StoreResult<()> {
        let mut rx = self.connection_state();
        let settled = async {
            rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Error))
                .await
                .map(|state| *state)
        };

        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(_)) => Err(StoreError::ConnectionFailed),
            Ok(Err(_)) => Err(StoreError::Closed),
            Err(_) => Err(StoreError::Timeout(format!(
                "connection not established within {}",
                humantime::format_duration(timeout)
            ))),
        }
    }

    /// Cancel every live subscription; their live queries end
    pub fn clear_all_listeners(&self) -> usize {
        self.inner.clear_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.listeners.cancel_all()
    }

    pub fn active_listeners(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Stop the health monitor, end every live query and refuse further calls
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down resilient client");

        let _ = self.inner.shutdown.send(true);
        let handle = self
            .inner
            .monitor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        self.clear_all_listeners();
    }
}

/// Document fields for a write; only mappings are valid documents
fn document_data(op: &RetryableOperation) -> StoreResult<Map<String, Value>> {
    let payload = op.payload.clone().unwrap_or(Payload::Null);
    let kind = payload.kind();
    payload.into_document_data().ok_or_else(|| {
        StoreError::InvalidPayload(format!(
            "{} on '{}' expects a mapping, got {}",
            op.kind, op.path, kind
        ))
    })
}

/// Stream of snapshots for a live collection query
///
/// Survives reconnections: when the coordinator tears the subscription down,
/// it is re-established once the connection is back. Errors that cannot be
/// recovered are yielded once and end the stream. Dropping the query
/// unsubscribes.
pub struct LiveQuery {
    receiver: mpsc::UnboundedReceiver<StoreResult<Vec<Document>>>,
    task: JoinHandle<()>,
}

impl LiveQuery {
    /// Whether the background subscription task is still running
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Stream for LiveQuery {
    type Item = StoreResult<Vec<Document>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

enum LiveEvent {
    Closed,
    TornDown,
    Failed(DriverError),
}

/// Subscription pump behind a [`LiveQuery`]
async fn run_live_query(
    inner: Arc<ClientInner>,
    path: String,
    constraints: Vec<QueryConstraint>,
    tx: mpsc::UnboundedSender<StoreResult<Vec<Document>>>,
) {
    let classifier = ErrorClassifier::new();
    let max_attempts = inner.config.max_operation_attempts;
    let mut state_rx = inner.state.subscribe();
    let mut shutdown_rx = inner.shutdown.subscribe();
    let mut resubscribing = false;
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        // First subscription waits out a running episode; later ones need a live connection
        let ready = async {
            let wanted = |s: &ConnectionState| {
                if resubscribing {
                    *s == ConnectionState::Connected
                } else {
                    s.is_settled()
                }
            };
            state_rx.wait_for(wanted).await.map(|_| ())
        };
        let proceed = tokio::select! {
            _ = tx.closed() => false,
            _ = shutdown_rx.changed() => false,
            ready = ready => ready.is_ok(),
        };
        if !proceed {
            return;
        }

        let generation = inner.clear_generation.load(Ordering::SeqCst);
        let episodes = inner.coordinator.episodes_started();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<DriverError>();
        let data_tx = tx.clone();
        let on_data: SnapshotCallback = Arc::new(move |docs| {
            let _ = data_tx.send(Ok(docs));
        });
        let on_error: ErrorCallback = Arc::new(move |err| {
            let _ = err_tx.send(err);
        });

        let error = match inner
            .driver
            .subscribe(&path, &constraints, on_data, on_error)
            .await
        {
            Ok(unsubscribe) => {
                let mut handle = inner.listeners.register(unsubscribe);

                // An episode that started while subscribe was pending has
                // already run its teardown without this listener
                if inner.coordinator.is_recovering()
                    || inner.coordinator.episodes_started() != episodes
                {
                    tracing::debug!(path = %path, "Subscription overlapped a reconnection, resubscribing");
                    if let Err(e) = handle.cancel() {
                        tracing::debug!(path = %path, error = %e, "Unsubscribe of stale listener failed");
                    }
                    resubscribing = true;
                    continue;
                }

                attempt = 0;
                tracing::debug!(path = %path, listener = %handle.id(), "Live query subscribed");

                let event = tokio::select! {
                    _ = tx.closed() => LiveEvent::Closed,
                    _ = shutdown_rx.changed() => LiveEvent::Closed,
                    _ = handle.torn_down() => LiveEvent::TornDown,
                    Some(err) = err_rx.recv() => LiveEvent::Failed(err),
                };

                match event {
                    LiveEvent::Closed => {
                        if let Err(e) = handle.cancel() {
                            tracing::debug!(path = %path, error = %e, "Unsubscribe on close failed");
                        }
                        return;
                    }
                    LiveEvent::TornDown => {
                        if inner.clear_generation.load(Ordering::SeqCst) != generation {
                            tracing::debug!(path = %path, "Live query ended by listener cleanup");
                            return;
                        }
                        tracing::debug!(path = %path, "Live query torn down, resubscribing after reconnect");
                        resubscribing = true;
                        continue;
                    }
                    LiveEvent::Failed(err) => {
                        if let Err(e) = handle.cancel() {
                            tracing::debug!(path = %path, error = %e, "Unsubscribe after listener error failed");
                        }
                        err
                    }
                }
            }
            Err(err) => err,
        };

        attempt += 1;
        let classified = classifier
            .classify(error, ErrorContext::new("subscribe", path.clone()))
            .at_attempt(attempt, max_attempts);
        tracing::warn!(
            path = %path,
            class = ?classified.class,
            attempt,
            error = %classified.original,
            "Live query failed"
        );

        match classified.class {
            ErrorClass::ConnectionFatal if classified.can_retry() => {
                if let Err(e) = inner
                    .coordinator
                    .recover(RecoveryTrigger::Error(classified.clone()))
                    .await
                {
                    tracing::warn!(path = %path, error = %e, "Recovery for live query failed");
                }
                resubscribing = true;
            }
            ErrorClass::Transient if classified.can_retry() => {
                let delay = inner.executor.backoff().next_delay(attempt);
                tokio::time::sleep(delay).await;
            }
            _ => {
                let _ = tx.send(Err(StoreError::Operation(classified)));
                return;
            }
        }
    }
}
