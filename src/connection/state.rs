/// Connection state tracking
///
/// The current [`ConnectionState`] is held in a `tokio::sync::watch` channel:
/// every observer sees the latest value and is woken on each transition.
/// Only the monitor and the coordinator publish; callers only subscribe.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Health of the driver connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// Whether this state ends a reconnection episode
    pub fn is_settled(&self) -> bool {
        !matches!(self, ConnectionState::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
}

/// Owner of the connection state channel
///
/// Cheap to clone; all clones publish to the same channel.
#[derive(Clone)]
pub struct StateTracker {
    sender: Arc<watch::Sender<ConnectionState>>,
    last_transition: Arc<Mutex<Option<StateTransition>>>,
}

impl StateTracker {
    /// Create a tracker starting in [`ConnectionState::Disconnected`]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            sender: Arc::new(sender),
            last_transition: Arc::new(Mutex::new(None)),
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.sender.borrow()
    }

    /// New observer of the state stream
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.sender.subscribe()
    }

    /// Publish `next`, returning whether it changed the state
    ///
    /// Observers are only woken on an actual change.
    pub fn publish(&self, next: ConnectionState) -> bool {
        let mut previous = next;
        let changed = self.sender.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            previous = *state;
            *state = next;
            true
        });

        if changed {
            tracing::info!(from = %previous, to = %next, "Connection state changed");
            *self
                .last_transition
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(StateTransition {
                from: previous,
                to: next,
                at: Utc::now(),
            });
        }

        changed
    }

    pub fn last_transition(&self) -> Option<StateTransition> {
        self.last_transition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}
