/// Connection health monitor
///
/// A probe flushes the driver's pending writes under a timeout. Success
/// settles the state on `Connected`; a connection-fatal failure hands over
/// to the [`ReconnectionCoordinator`]. Everything else is logged and
/// swallowed so a flaky probe never takes the process down.
use super::coordinator::{ReconnectionCoordinator, RecoveryTrigger};
use super::state::{ConnectionState, StateTracker};
use crate::driver::{DocumentDriver, DriverError};
use crate::error::{ClassifiedError, ErrorClass, ErrorClassifier, ErrorContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const PROBE_OPERATION: &str = "health_probe";

/// What a single probe observed
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The flush succeeded
    Healthy,

    /// A recovery episode was running, so nothing was probed
    Skipped,

    /// The probe failed with a non-fatal error
    Degraded(ClassifiedError),

    /// The probe failed with a fatal error and a recovery was requested
    Fatal {
        error: ClassifiedError,
        recovered: bool,
    },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

pub struct HealthMonitor {
    driver: Arc<dyn DocumentDriver>,
    state: StateTracker,
    coordinator: Arc<ReconnectionCoordinator>,
    classifier: ErrorClassifier,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        driver: Arc<dyn DocumentDriver>,
        state: StateTracker,
        coordinator: Arc<ReconnectionCoordinator>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            driver,
            state,
            coordinator,
            classifier: ErrorClassifier::new(),
            probe_timeout,
        }
    }

    /// Run one health probe
    pub async fn probe(&self) -> ProbeOutcome {
        if self.coordinator.is_recovering() {
            tracing::debug!("Recovery in progress, skipping health probe");
            return ProbeOutcome::Skipped;
        }

        let flushed =
            tokio::time::timeout(self.probe_timeout, self.driver.wait_for_pending_writes()).await;

        let error = match flushed {
            Ok(Ok(())) => {
                if self.state.current() != ConnectionState::Connected {
                    tracing::info!(previous = %self.state.current(), "Health probe succeeded");
                }
                self.coordinator.mark_connected();
                return ProbeOutcome::Healthy;
            }
            Ok(Err(e)) => self
                .classifier
                .classify(e, ErrorContext::connection(PROBE_OPERATION)),
            // A stuck flush counts as transient, never as fatal
            Err(_) => {
                let message = format!(
                    "Health probe timed out after {}",
                    humantime::format_duration(self.probe_timeout)
                );
                self.classifier.classify(
                    DriverError::new("deadline-exceeded", message),
                    ErrorContext::connection(PROBE_OPERATION),
                )
            }
        };

        if error.class != ErrorClass::ConnectionFatal {
            tracing::warn!(class = ?error.class, error = %error.original, "Health probe failed");
            return ProbeOutcome::Degraded(error);
        }

        tracing::warn!(error = %error.original, "Health probe hit a connection-fatal error");
        let recovered = match self
            .coordinator
            .recover(RecoveryTrigger::HealthProbe(error.clone()))
            .await
        {
            Ok(outcome) => {
                tracing::debug!(?outcome, "Recovery requested by health probe");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Recovery after failed health probe did not succeed");
                false
            }
        };

        ProbeOutcome::Fatal { error, recovered }
    }

    /// Probe on a fixed cadence until the returned handle is stopped or dropped
    ///
    /// The first probe runs one full `period` after spawning.
    pub fn spawn(self: Arc<Self>, period: Duration) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(period = %humantime::format_duration(period), "Health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Health monitor stopped");
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Owner of a running health monitor task
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signal the monitor to stop and wait for it to exit
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
