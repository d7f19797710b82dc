/// Operation executor
///
/// Wraps every read and write in a bounded retry loop:
///
/// - connection-fatal errors run a reconnection episode and, once it
///   succeeds, retry immediately
/// - transient errors (and fatal ones whose recovery did not succeed) wait
///   out an exponential backoff before the next attempt
/// - every other class is returned to the caller straight away
///
/// No attempt reaches the driver while an episode is in flight: attempts
/// wait for the connection state to settle first, and a fatal error raised
/// during someone else's episode waits for that episode instead of starting
/// its own. An attempt that starts in the `Error` state first asks the
/// coordinator for a recovery.
use crate::connection::{
    ConnectionState, ReconnectionCoordinator, RecoveryOutcome, RecoveryTrigger, StateTracker,
};
use crate::driver::DriverError;
use crate::error::{ClassifiedError, ErrorClass, ErrorClassifier, ErrorContext, ExponentialBackoff};
use crate::payload::{sanitize, Payload};
use crate::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Read,
    Query,
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// Name used in error contexts and logs
    pub fn operation_name(&self) -> &'static str {
        match self {
            OperationKind::Read => "read_document",
            OperationKind::Query => "query_collection",
            OperationKind::Create => "create_document",
            OperationKind::Update => "update_document",
            OperationKind::Delete => "delete_document",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation_name())
    }
}

/// One read or write call, tracked across its attempts
#[derive(Debug, Clone)]
pub struct RetryableOperation {
    pub kind: OperationKind,
    pub path: String,

    /// Outbound data, already sanitized
    pub payload: Option<Payload>,

    /// Attempts made so far
    pub attempt: u32,

    pub max_attempts: u32,
}

impl RetryableOperation {
    pub fn new(kind: OperationKind, path: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            kind,
            path: path.into(),
            payload: None,
            attempt: 0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attach a payload, stripping every unset value from it
    pub fn with_payload(mut self, payload: &Payload) -> Self {
        self.payload = Some(sanitize(payload));
        self
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    fn context(&self) -> ErrorContext {
        ErrorContext::new(self.kind.operation_name(), self.path.clone())
    }
}

/// Runs store operations with classification, recovery and backoff
pub struct OperationExecutor {
    state: StateTracker,
    coordinator: Arc<ReconnectionCoordinator>,
    classifier: ErrorClassifier,
    backoff: ExponentialBackoff,
}

impl OperationExecutor {
    pub fn new(
        state: StateTracker,
        coordinator: Arc<ReconnectionCoordinator>,
        backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            state,
            coordinator,
            classifier: ErrorClassifier::new(),
            backoff,
        }
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Run `attempt_fn` until it succeeds, fails for good, or runs out of attempts
    ///
    /// `attempt_fn` is called once per attempt and must build a fresh driver
    /// call each time.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &mut RetryableOperation,
        mut attempt_fn: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        loop {
            operation.attempt += 1;
            if self.state.current() == ConnectionState::Reconnecting {
                tracing::debug!(
                    operation = %operation.kind,
                    path = %operation.path,
                    "Waiting for reconnection before attempt"
                );
                self.wait_for_settled().await;
            }
            self.recover_from_error_state().await;

            tracing::debug!(
                operation = %operation.kind,
                path = %operation.path,
                attempt = operation.attempt,
                max_attempts = operation.max_attempts,
                "Attempting operation"
            );

            let error = match attempt_fn().await {
                Ok(value) => {
                    if operation.attempt > 1 {
                        tracing::info!(
                            operation = %operation.kind,
                            path = %operation.path,
                            attempt = operation.attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => self
                    .classifier
                    .classify(e, operation.context())
                    .at_attempt(operation.attempt, operation.max_attempts),
            };

            tracing::warn!(
                operation = %operation.kind,
                path = %operation.path,
                class = ?error.class,
                attempt = operation.attempt,
                error = %error.original,
                "Operation failed"
            );

            match error.class {
                ErrorClass::ConnectionFatal => {
                    let recovered = self.recover_for(&error).await;
                    if !error.can_retry() {
                        return Err(StoreError::Operation(error));
                    }
                    if !recovered {
                        self.wait_before_retry(operation).await;
                    }
                }
                ErrorClass::Transient => {
                    if !error.can_retry() {
                        return Err(StoreError::Operation(error));
                    }
                    self.wait_before_retry(operation).await;
                }
                _ => return Err(StoreError::Operation(error)),
            }
        }
    }

    /// Get a fatal error recovered, returning whether the connection is back
    ///
    /// Joins an episode that is already running rather than starting another.
    async fn recover_for(&self, error: &ClassifiedError) -> bool {
        if self.state.current() != ConnectionState::Reconnecting {
            match self
                .coordinator
                .recover(RecoveryTrigger::Error(error.clone()))
                .await
            {
                Ok(RecoveryOutcome::Recovered) => return true,
                Ok(RecoveryOutcome::AlreadyInProgress) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Recovery after fatal operation error failed");
                    return false;
                }
            }
        }

        tracing::debug!("Recovery already under way, waiting for it to settle");
        self.wait_for_settled().await == ConnectionState::Connected
    }

    /// Block until no episode is publishing `Reconnecting`
    async fn wait_for_settled(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        let settled = rx.wait_for(ConnectionState::is_settled).await.map(|s| *s);
        settled.unwrap_or_else(|_| self.state.current())
    }

    async fn recover_from_error_state(&self) {
        if self.state.current() != ConnectionState::Error || self.coordinator.is_recovering() {
            return;
        }

        tracing::info!("Connection is in error state, attempting recovery before operation");
        if let Err(e) = self.coordinator.recover(RecoveryTrigger::ErrorState).await {
            tracing::debug!(error = %e, "Proactive recovery did not succeed");
        }
    }

    async fn wait_before_retry(&self, operation: &RetryableOperation) {
        let delay = self.backoff.next_delay(operation.attempt);
        tracing::debug!(
            operation = %operation.kind,
            delay = %humantime::format_duration(delay),
            "Backing off before retry"
        );
        tokio::time::sleep(delay).await;
    }
}
