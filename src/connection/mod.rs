/// Connection health and recovery
///
/// - [`state`]: the current [`ConnectionState`] on a watch channel
/// - [`coordinator`]: serialized reconnection episodes with a failure budget
/// - [`monitor`]: periodic health probes that feed the coordinator
pub mod coordinator;
pub mod monitor;
pub mod state;

pub use coordinator::{
    ReconnectConfig, ReconnectionBudget, ReconnectionCoordinator, RecoveryOutcome, RecoveryPhase,
    RecoveryTrigger,
};
pub use monitor::{HealthMonitor, MonitorHandle, ProbeOutcome};
pub use state::{ConnectionState, StateTracker, StateTransition};
