//! Connection lifecycle state machine.
//!
//! [`ConnectionTracker`] owns the current [`ConnectionState`] together with the
//! time the rehandshake window was opened. Every time-dependent query has an
//! `_at` variant taking the instant explicitly so transitions can be checked
//! without sleeping.

use std::time::{Duration, Instant};

/// Length of the window in which a lost session may be re-established.
pub const REHANDSHAKE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Lifecycle of the connection to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The user asked to disconnect
    ManualDisconnect,
    Disconnected,
    ConnectionStarted,
    ConnectionFailed,
    ConnectionCompleted,
    /// A lost session is being re-established
    Rehandshaking,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::ConnectionCompleted)
    }

    pub fn is_connect_in_progress(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectionStarted | ConnectionState::Rehandshaking
        )
    }

    /// Whether moving from `self` to `next` opens a new rehandshake window.
    pub fn opens_rehandshake_window(&self, next: ConnectionState) -> bool {
        next == ConnectionState::Rehandshaking && *self != ConnectionState::Rehandshaking
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::ManualDisconnect => "manual-disconnect",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ConnectionStarted => "connection-started",
            ConnectionState::ConnectionFailed => "connection-failed",
            ConnectionState::ConnectionCompleted => "connection-completed",
            ConnectionState::Rehandshaking => "rehandshaking",
        };
        write!(f, "{}", name)
    }
}

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    LoginFailed,
    InvalidUrl,
    StartClientError,
    ConnectionError,
}

/// Tracks the connection state and the rehandshake time-box.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: ConnectionState,
    rehandshake_started: Option<Instant>,
    failure: Option<FailureKind>,
    window: Duration,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::with_window(REHANDSHAKE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            rehandshake_started: None,
            failure: None,
            window,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The failure recorded by the last [`set_error`](Self::set_error), if any.
    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    /// Move to `next`. Returns `true` if the state actually changed.
    pub fn set_state(&mut self, next: ConnectionState) -> bool {
        self.set_state_at(next, Instant::now())
    }

    pub fn set_state_at(&mut self, next: ConnectionState, now: Instant) -> bool {
        if self.state.opens_rehandshake_window(next) {
            self.rehandshake_started = Some(now);
        }
        if next == ConnectionState::ConnectionCompleted {
            self.failure = None;
        }

        let changed = self.state != next;
        if changed {
            tracing::debug!(from = %self.state, to = %next, "connection state changed");
        }
        self.state = next;
        changed
    }

    /// Record a failure and force [`ConnectionState::ConnectionFailed`].
    pub fn set_error(&mut self, kind: FailureKind) -> bool {
        self.failure = Some(kind);
        self.set_state(ConnectionState::ConnectionFailed)
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_connect_in_progress(&self) -> bool {
        self.state.is_connect_in_progress()
    }

    pub fn is_rehandshaking(&self) -> bool {
        self.state == ConnectionState::Rehandshaking
    }

    pub fn can_rehandshake(&self) -> bool {
        self.can_rehandshake_at(Instant::now())
    }

    /// True while rehandshaking and the window opened less than `window` ago.
    pub fn can_rehandshake_at(&self, now: Instant) -> bool {
        match (self.state, self.rehandshake_started) {
            (ConnectionState::Rehandshaking, Some(started)) => {
                now.saturating_duration_since(started) < self.window
            }
            _ => false,
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
