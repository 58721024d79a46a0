//! Session state machine.
//!
//! A Session is the authenticated, encrypted channel to one peer for one
//! folder. This module tracks its lifecycle and traffic counters; the I/O
//! itself lives in [`crate::node::session`].

use crate::error::SessionError;
use std::time::{Duration, Instant};

/// Session configuration parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum open sessions per node
    pub max_sessions: usize,
    /// Time allowed for hello exchange and authentication
    pub handshake_timeout: Duration,
    /// Send a ping after this much outbound silence
    pub ping_interval: Duration,
    /// Close the session after this much inbound silence
    pub idle_timeout: Duration,
    /// Outbound message queue depth per session
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            outbound_queue: 256,
        }
    }
}

impl SessionConfig {
    /// Check the limits are usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistent field.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_sessions == 0 {
            return Err("max_sessions must be at least 1");
        }
        if self.outbound_queue == 0 {
            return Err("outbound_queue must be at least 1");
        }
        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be non-zero");
        }
        if self.ping_interval >= self.idle_timeout {
            return Err("ping_interval must be shorter than idle_timeout");
        }
        Ok(())
    }
}

/// Session state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Stream being opened
    Connecting,
    /// Hellos being exchanged
    Handshaking,
    /// Keys agreed and identity proven
    Authenticated,
    /// Exchanging protocol messages
    Active,
    /// Close sent or received, draining
    Closing,
    /// Terminal
    Closed,
}

/// Lifecycle and counters of one session
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    config: SessionConfig,
    created_at: Instant,
    established_at: Option<Instant>,
    last_received: Instant,
    last_sent: Instant,
    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
}

impl Session {
    /// Create a session in [`SessionState::Connecting`]
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let now = Instant::now();
        Self {
            state: SessionState::Connecting,
            config,
            created_at: now,
            established_at: None,
            last_received: now,
            last_sent: now,
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Get current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::{Active, Authenticated, Closed, Closing, Connecting, Handshaking};
        match (self.state, to) {
            (Connecting, Handshaking) => true,
            (Handshaking, Authenticated) => true,
            (Authenticated, Active) => true,
            // Any live state may start closing or fail outright
            (Connecting | Handshaking | Authenticated | Active, Closing | Closed) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }

    /// Transition to a new state
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` if the transition is not allowed
    /// from the current state.
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<(), SessionError> {
        if !self.can_transition(new_state) {
            return Err(SessionError::InvalidState {
                from: self.state,
                to: new_state,
            });
        }

        let old_state = self.state;
        self.state = new_state;
        if new_state == SessionState::Active && self.established_at.is_none() {
            self.established_at = Some(Instant::now());
        }

        tracing::trace!("session state {:?} -> {:?}", old_state, new_state);
        Ok(())
    }

    /// Whether messages may be exchanged
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Whether the session has ended
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Nothing received for the idle timeout
    #[must_use]
    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_received) >= self.config.idle_timeout
    }

    /// Nothing sent for the ping interval
    #[must_use]
    pub fn needs_ping(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_sent) >= self.config.ping_interval
    }

    /// Record a sealed outbound frame
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.messages_sent += 1;
        self.last_sent = Instant::now();
    }

    /// Record an opened inbound frame
    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.messages_received += 1;
        self.last_received = Instant::now();
    }

    /// Get session statistics
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            created_at: self.created_at,
            established_at: self.established_at,
        }
    }
}

/// Session statistics snapshot
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Current state
    pub state: SessionState,
    /// Ciphertext bytes sent
    pub bytes_sent: u64,
    /// Ciphertext bytes received
    pub bytes_received: u64,
    /// Frames sent
    pub messages_sent: u64,
    /// Frames received
    pub messages_received: u64,
    /// When the stream was opened
    pub created_at: Instant,
    /// When the session became active
    pub established_at: Option<Instant>,
}
