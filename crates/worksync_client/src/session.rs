//! Session state machine.
//!
//! ```text
//! Initializing → WaitingForTransport → AuthenticatingIdentity
//!     AuthenticatingIdentity → NeedsRegistration → AuthenticatingIdentity
//!     AuthenticatingIdentity → RestoringSubscriptions → Ready
//! Ready ⇄ Reconnecting
//! any handshake state, Reconnecting → Error → Initializing
//! ```
//!
//! The transition table is closed: any pair not listed is refused with
//! [`SyncError::InvalidStateTransition`] and logged at error level.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::{error, info};

/// Fine-grained session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing started yet, or restarting after an error.
    Initializing,
    /// Opening the transport.
    WaitingForTransport,
    /// Presenting credentials.
    AuthenticatingIdentity,
    /// The server does not know this identity yet.
    NeedsRegistration,
    /// Replaying the subscription set.
    RestoringSubscriptions,
    /// Fully connected; mutations allowed.
    Ready,
    /// Rebuilding after an unexpected close.
    Reconnecting,
    /// Gave up; requires an explicit reconnect.
    Error,
}

impl SessionState {
    /// Returns true if `self → next` is in the transition table.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Initializing, WaitingForTransport)
                | (Initializing, Error)
                | (WaitingForTransport, AuthenticatingIdentity)
                | (WaitingForTransport, Error)
                | (AuthenticatingIdentity, NeedsRegistration)
                | (AuthenticatingIdentity, RestoringSubscriptions)
                | (AuthenticatingIdentity, Error)
                | (NeedsRegistration, AuthenticatingIdentity)
                | (NeedsRegistration, Error)
                | (RestoringSubscriptions, Ready)
                | (RestoringSubscriptions, Error)
                | (Ready, Reconnecting)
                | (Reconnecting, Ready)
                | (Reconnecting, Error)
                | (Error, Initializing)
        )
    }

    /// Coarse connection state observed by stores.
    pub fn connection_state(self) -> ConnectionState {
        match self {
            SessionState::Initializing | SessionState::Error => ConnectionState::Disconnected,
            SessionState::WaitingForTransport
            | SessionState::AuthenticatingIdentity
            | SessionState::NeedsRegistration
            | SessionState::RestoringSubscriptions => ConnectionState::Connecting,
            SessionState::Ready => ConnectionState::Connected,
            SessionState::Reconnecting => ConnectionState::Reconnecting,
        }
    }
}

/// Coarse connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Initial handshake in progress.
    Connecting,
    /// Ready for requests.
    Connected,
    /// Recovering from a lost transport.
    Reconnecting,
    /// Closed by the owner; terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        })
    }
}

/// Owner of the session state and its watch channels.
#[derive(Debug)]
pub struct SessionMachine {
    current: Mutex<SessionState>,
    closed: AtomicBool,
    session: watch::Sender<SessionState>,
    connection: watch::Sender<ConnectionState>,
}

impl SessionMachine {
    /// Creates a machine in `Initializing`.
    pub fn new() -> Self {
        let initial = SessionState::Initializing;
        Self {
            current: Mutex::new(initial),
            closed: AtomicBool::new(false),
            session: watch::Sender::new(initial),
            connection: watch::Sender::new(initial.connection_state()),
        }
    }

    /// Returns the current session state.
    pub fn state(&self) -> SessionState {
        *self.current.lock()
    }

    /// Returns the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else {
            self.state().connection_state()
        }
    }

    /// Moves to `to` if the transition table allows it.
    pub fn transition(&self, to: SessionState) -> SyncResult<()> {
        let mut current = self.current.lock();
        let from = *current;
        if !from.can_transition_to(to) {
            error!(?from, ?to, "illegal session transition");
            return Err(SyncError::InvalidStateTransition { from, to });
        }
        *current = to;
        info!(?from, ?to, "session state changed");

        self.session.send_replace(to);
        if !self.is_closed() {
            let next = to.connection_state();
            self.connection.send_if_modified(|state| {
                let changed = *state != next;
                *state = next;
                changed
            });
        }
        Ok(())
    }

    /// Marks the session closed. Further transitions still update the
    /// session state but the connection state stays `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connection.send_replace(ConnectionState::Closed);
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Subscribes to connection state changes.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    /// Subscribes to session state changes.
    pub fn watch_session(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe()
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}
