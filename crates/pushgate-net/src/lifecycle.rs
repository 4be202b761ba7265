//! Forward-only server lifecycle guarded by atomic compare-and-set.
//!
//! `Created -> Initialized -> Starting -> Started -> Shutdown`. Every
//! transition names the state it expects to leave; if another caller got there
//! first the transition fails with a [`LifecycleError`] describing the state it
//! actually found, and nothing is mutated.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    /// Constructed, not yet initialized.
    Created = 0,
    /// Initialized, ready to start.
    Initialized = 1,
    /// Contexts launched, listener not yet bound (or bind failed).
    Starting = 2,
    /// Listener bound and accepting.
    Started = 3,
    /// Stopped. Terminal.
    Shutdown = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Initialized,
            2 => Self::Starting,
            3 => Self::Started,
            _ => Self::Shutdown,
        }
    }

    /// The allowed-transition table.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Initialized)
                | (Self::Initialized, Self::Starting)
                | (Self::Starting, Self::Started)
                | (Self::Started, Self::Shutdown)
        )
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Illegal lifecycle transition. The state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// `init` called on a server that is past `Created`.
    #[error("server already initialized (state: {0})")]
    AlreadyInitialized(ServerState),
    /// `start` called before `init`.
    #[error("server has not been initialized")]
    NotInitialized,
    /// `start` called on a server that is starting or running.
    #[error("server already started (state: {0})")]
    AlreadyStarted(ServerState),
    /// `stop` called on a server that never finished starting.
    #[error("server is not started (state: {0})")]
    NotStarted(ServerState),
    /// Any call on a server that has been shut down.
    #[error("server already shutdown")]
    AlreadyShutdown,
    /// A transition outside the allowed table.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// State the caller expected to leave.
        from: ServerState,
        /// State the caller asked for.
        to: ServerState,
    },
}

/// Atomic holder of the [`ServerState`].
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    /// A lifecycle in [`ServerState::Created`].
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ServerState::Created as u8),
        }
    }

    /// Current state.
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the server is accepting connections.
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Started
    }

    /// `Created -> Initialized`.
    pub fn init(&self) -> Result<(), LifecycleError> {
        self.transition(ServerState::Created, ServerState::Initialized)
    }

    /// `Initialized -> Starting`.
    pub fn begin_start(&self) -> Result<(), LifecycleError> {
        self.transition(ServerState::Initialized, ServerState::Starting)
    }

    /// `Starting -> Started`, once the listener is bound.
    pub fn finish_start(&self) -> Result<(), LifecycleError> {
        self.transition(ServerState::Starting, ServerState::Started)
    }

    /// `Started -> Shutdown`.
    pub fn shutdown(&self) -> Result<(), LifecycleError> {
        self.transition(ServerState::Started, ServerState::Shutdown)
    }

    /// Move from `from` to `to` with a single compare-and-set.
    pub fn transition(&self, from: ServerState, to: ServerState) -> Result<(), LifecycleError> {
        if !from.can_transition_to(to) {
            return Err(LifecycleError::IllegalTransition { from, to });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| describe_failure(to, ServerState::from_u8(actual)))
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_failure(target: ServerState, actual: ServerState) -> LifecycleError {
    if actual == ServerState::Shutdown {
        return LifecycleError::AlreadyShutdown;
    }
    match target {
        ServerState::Initialized => LifecycleError::AlreadyInitialized(actual),
        ServerState::Starting | ServerState::Started => match actual {
            ServerState::Created => LifecycleError::NotInitialized,
            other => LifecycleError::AlreadyStarted(other),
        },
        ServerState::Shutdown => LifecycleError::NotStarted(actual),
        ServerState::Created => LifecycleError::IllegalTransition {
            from: actual,
            to: target,
        },
    }
}
