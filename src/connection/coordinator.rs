/// Reconnection coordinator
///
/// Runs the recovery sequence for a wedged driver:
///
/// ```text
/// cancel listeners → settle → disable network → pause → enable network → pause → verify
/// ```
///
/// At most one episode runs at a time. The phase check-and-set happens under
/// the same lock that publishes `Reconnecting`, so two concurrent triggers
/// can never both start an episode. Failed episodes are counted against a
/// reconnection budget; once it is spent, automatic triggers are refused
/// until a health probe succeeds or [`ReconnectionCoordinator::force_reconnect`]
/// is called.
use super::state::{ConnectionState, StateTracker};
use crate::driver::{DocumentDriver, DriverError};
use crate::error::ClassifiedError;
use crate::listeners::ListenerRegistry;
use crate::{StoreError, StoreResult};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Timing and budget for reconnection episodes
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Failed episodes allowed before the state becomes terminal
    pub max_attempts: u32,

    /// Pause after listener teardown
    pub settle_delay: Duration,

    /// Pause after each network toggle
    pub cycle_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_delay: Duration::from_secs(1),
            cycle_delay: Duration::from_secs(1),
        }
    }
}

/// What caused a recovery request
#[derive(Debug, Clone)]
pub enum RecoveryTrigger {
    /// A store operation failed with a connection-fatal error
    Error(ClassifiedError),

    /// The health monitor saw a connection-fatal error
    HealthProbe(ClassifiedError),

    /// An operation started while the state was `Error`
    ErrorState,

    /// Explicit retry requested by a caller
    Manual,
}

impl fmt::Display for RecoveryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryTrigger::Error(e) => write!(f, "operation error: {}", e),
            RecoveryTrigger::HealthProbe(e) => write!(f, "health probe: {}", e),
            RecoveryTrigger::ErrorState => write!(f, "operation started in error state"),
            RecoveryTrigger::Manual => write!(f, "manual reconnect"),
        }
    }
}

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Idle,
    Recovering,
}

/// Result of a `recover()` call that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// This call ran an episode and the connection was verified
    Recovered,

    /// Another episode was already running; nothing was done
    AlreadyInProgress,
}

/// Failed-episode counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionBudget {
    attempts: u32,
    max_attempts: u32,
}

impl ReconnectionBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

struct CoordinatorState {
    phase: RecoveryPhase,
    budget: ReconnectionBudget,
    episodes: u64,
}

/// Clears the recovering phase when an episode ends, however it ends
struct EpisodeGuard<'a> {
    coordinator: &'a ReconnectionCoordinator,
}

impl Drop for EpisodeGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.lock().phase = RecoveryPhase::Idle;
    }
}

/// Serializes recovery episodes for one driver
pub struct ReconnectionCoordinator {
    driver: Arc<dyn DocumentDriver>,
    state: StateTracker,
    listeners: Arc<ListenerRegistry>,
    config: ReconnectConfig,
    inner: Mutex<CoordinatorState>,
}

impl ReconnectionCoordinator {
    pub fn new(
        driver: Arc<dyn DocumentDriver>,
        state: StateTracker,
        listeners: Arc<ListenerRegistry>,
        config: ReconnectConfig,
    ) -> Self {
        let budget = ReconnectionBudget::new(config.max_attempts);
        Self {
            driver,
            state,
            listeners,
            config,
            inner: Mutex::new(CoordinatorState {
                phase: RecoveryPhase::Idle,
                budget,
                episodes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.lock().phase
    }

    pub fn is_recovering(&self) -> bool {
        self.phase() == RecoveryPhase::Recovering
    }

    pub fn budget(&self) -> ReconnectionBudget {
        self.lock().budget
    }

    /// Number of episodes started so far
    ///
    /// Lets a caller tell whether an episode began while it was suspended.
    pub fn episodes_started(&self) -> u64 {
        self.lock().episodes
    }

    /// Record a verified healthy connection from outside an episode
    ///
    /// Used by the health monitor. Ignored while an episode is running so a
    /// probe cannot claim success for a network cycle still in progress.
    pub fn mark_connected(&self) {
        let mut inner = self.lock();
        if inner.phase == RecoveryPhase::Recovering {
            return;
        }
        inner.budget.reset();
        self.state.publish(ConnectionState::Connected);
    }

    /// Run one recovery episode unless one is already in flight
    pub async fn recover(&self, trigger: RecoveryTrigger) -> StoreResult<RecoveryOutcome> {
        {
            let mut inner = self.lock();
            if inner.phase == RecoveryPhase::Recovering {
                tracing::debug!(trigger = %trigger, "Recovery already in progress");
                return Ok(RecoveryOutcome::AlreadyInProgress);
            }
            if inner.budget.is_exhausted() {
                tracing::warn!(
                    trigger = %trigger,
                    attempts = inner.budget.attempts(),
                    "Reconnection budget exhausted, not starting recovery"
                );
                self.state.publish(ConnectionState::Error);
                return Err(StoreError::ReconnectionExhausted {
                    attempts: inner.budget.attempts(),
                });
            }
            inner.phase = RecoveryPhase::Recovering;
            inner.episodes += 1;
            self.state.publish(ConnectionState::Reconnecting);
        }

        let _guard = EpisodeGuard { coordinator: self };
        self.run_episode(trigger).await
    }

    /// Manual reconnect
    ///
    /// Resets an exhausted budget and runs an episode. If one is already
    /// running, waits for it instead. Either way the state the episode
    /// settled on is returned; a failed episode yields `Error`, not `Err`.
    pub async fn force_reconnect(&self) -> StoreResult<ConnectionState> {
        let mut waiter = {
            let mut inner = self.lock();
            if inner.phase == RecoveryPhase::Recovering {
                Some(self.state.subscribe())
            } else {
                if inner.budget.is_exhausted() {
                    tracing::info!("Resetting exhausted reconnection budget for manual reconnect");
                    inner.budget.reset();
                }
                None
            }
        };

        if let Some(rx) = waiter.as_mut() {
            let settled = rx
                .wait_for(ConnectionState::is_settled)
                .await
                .map_err(|_| StoreError::Closed)?;
            return Ok(*settled);
        }

        match self.recover(RecoveryTrigger::Manual).await {
            Ok(RecoveryOutcome::Recovered) => Ok(ConnectionState::Connected),
            Err(e) => {
                tracing::warn!(error = %e, "Manual reconnect failed");
                Ok(self.state.current())
            }
            Ok(RecoveryOutcome::AlreadyInProgress) => {
                let mut rx = self.state.subscribe();
                let settled = rx
                    .wait_for(ConnectionState::is_settled)
                    .await
                    .map_err(|_| StoreError::Closed)?;
                Ok(*settled)
            }
        }
    }

    async fn run_episode(&self, trigger: RecoveryTrigger) -> StoreResult<RecoveryOutcome> {
        let attempt = self.budget().attempts() + 1;
        tracing::warn!(
            trigger = %trigger,
            attempt,
            max_attempts = self.config.max_attempts,
            "Starting reconnection episode"
        );

        let cancelled = self.listeners.cancel_all();
        tracing::debug!(cancelled, "Listeners torn down before network cycle");

        tokio::time::sleep(self.config.settle_delay).await;

        match self.cycle_network().await {
            Ok(()) => {
                {
                    let mut inner = self.lock();
                    inner.budget.reset();
                    self.state.publish(ConnectionState::Connected);
                }
                tracing::info!(attempt, "Reconnection succeeded");
                Ok(RecoveryOutcome::Recovered)
            }
            Err(e) => {
                let budget = {
                    let mut inner = self.lock();
                    inner.budget.record_failure();
                    self.state.publish(ConnectionState::Error);
                    inner.budget
                };

                if budget.is_exhausted() {
                    tracing::error!(
                        attempts = budget.attempts(),
                        error = %e,
                        "Reconnection budget exhausted"
                    );
                    Err(StoreError::ReconnectionExhausted {
                        attempts: budget.attempts(),
                    })
                } else {
                    tracing::warn!(
                        attempt = budget.attempts(),
                        remaining = budget.remaining(),
                        error = %e,
                        "Reconnection attempt failed"
                    );
                    Err(StoreError::ReconnectionFailed {
                        attempt: budget.attempts(),
                        max_attempts: budget.max_attempts(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// Disable, re-enable and verify the network
    ///
    /// If the sequence fails after the network was disabled, the network is
    /// re-enabled on a best-effort basis so the driver is not left offline.
    async fn cycle_network(&self) -> Result<(), DriverError> {
        tracing::debug!("Disabling network");
        self.driver.disable_network().await?;
        tokio::time::sleep(self.config.cycle_delay).await;

        let result = async {
            tracing::debug!("Enabling network");
            self.driver.enable_network().await?;
            tokio::time::sleep(self.config.cycle_delay).await;

            tracing::debug!("Verifying connection");
            self.driver.wait_for_pending_writes().await
        }
        .await;

        if result.is_err() {
            if let Err(e) = self.driver.enable_network().await {
                tracing::warn!(error = %e, "Best-effort network re-enable failed");
            }
        }

        result
    }
}
