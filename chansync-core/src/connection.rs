//! Connection state machine for the push transport.
//!
//! Pure and side-effect free: the state machine takes events and returns a
//! new state plus a list of actions. Sockets, timers and heartbeats are owned
//! by chansync-client, which interprets the actions.

use std::time::Duration;

/// Observable connection status.
///
/// `Unavailable` and `Disconnected` both surface as `Disconnected`; the
/// distinction is reported through [`ConnectionEvent::Unavailable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No session and no attempt in progress.
    Disconnected,
    /// Connecting or waiting to reconnect.
    Connecting,
    /// Session established.
    Connected,
}

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, nothing scheduled.
    Disconnected,
    /// Connection attempt in progress. Attempt 0 is the initial connect.
    Connecting {
        /// Which attempt this is.
        attempt: u32,
    },
    /// Session established.
    Connected,
    /// Connection lost or failed, waiting for the reconnect timer.
    Reconnecting {
        /// The attempt the timer will start.
        attempt: u32,
    },
    /// Reconnect attempts exhausted. Only an explicit connect leaves this state.
    Unavailable {
        /// How many reconnect attempts were made.
        attempts: u32,
    },
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: Event, policy: &ReconnectPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // An explicit connect is the only way out of Disconnected/Unavailable
            (Self::Disconnected | Self::Unavailable { .. }, Event::ConnectRequested) => {
                (Self::Connecting { attempt: 0 }, vec![Action::Connect])
            }
            // Already connecting or connected: connect() is idempotent
            (
                state @ (Self::Connecting { .. } | Self::Connected | Self::Reconnecting { .. }),
                Event::ConnectRequested,
            ) => (state, vec![]),

            // From Connecting
            (Self::Connecting { .. }, Event::ConnectSucceeded) => (
                Self::Connected,
                vec![
                    Action::RejoinChannels,
                    Action::StartHeartbeat,
                    Action::EmitEvent(ConnectionEvent::Connected),
                ],
            ),
            (Self::Connecting { attempt }, Event::ConnectFailed { error }) => {
                let event = if attempt == 0 {
                    ConnectionEvent::ConnectionFailed { error }
                } else {
                    ConnectionEvent::ReconnectFailed { attempt, error }
                };
                schedule_retry(attempt.saturating_add(1), vec![Action::EmitEvent(event)], policy)
            }
            (Self::Connecting { .. }, Event::DisconnectRequested) => {
                (Self::Disconnected, vec![Action::Disconnect])
            }

            // From Connected
            (Self::Connected, Event::ConnectionLost { reason }) => schedule_retry(
                1,
                vec![
                    Action::StopHeartbeat,
                    Action::EmitEvent(ConnectionEvent::Disconnected { reason }),
                ],
                policy,
            ),
            (Self::Connected, Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::StopHeartbeat,
                    Action::Disconnect,
                    Action::EmitEvent(ConnectionEvent::Disconnected {
                        reason: "user requested".into(),
                    }),
                ],
            ),

            // From Reconnecting
            (Self::Reconnecting { attempt }, Event::ReconnectTimer) => {
                (Self::Connecting { attempt }, vec![Action::Connect])
            }
            (Self::Reconnecting { .. }, Event::DisconnectRequested) => {
                (Self::Disconnected, vec![Action::CancelReconnect])
            }

            (Self::Unavailable { .. }, Event::DisconnectRequested) => (Self::Disconnected, vec![]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// The status exposed to observers.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected | Self::Unavailable { .. } => ConnectionStatus::Disconnected,
            Self::Connecting { .. } | Self::Reconnecting { .. } => ConnectionStatus::Connecting,
            Self::Connected => ConnectionStatus::Connected,
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Reconnecting { .. })
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Either wait for `attempt` or give up if the policy is exhausted.
fn schedule_retry(
    attempt: u32,
    mut actions: Vec<Action>,
    policy: &ReconnectPolicy,
) -> (ConnectionState, Vec<Action>) {
    if attempt > policy.max_attempts {
        let attempts = attempt - 1;
        actions.push(Action::EmitEvent(ConnectionEvent::Unavailable { attempts }));
        return (ConnectionState::Unavailable { attempts }, actions);
    }
    actions.push(Action::StartReconnectTimer {
        delay: policy.delay_for(attempt),
    });
    (ConnectionState::Reconnecting { attempt }, actions)
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller asked to connect.
    ConnectRequested,
    /// Transport connection succeeded.
    ConnectSucceeded,
    /// Transport connection failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An established session dropped.
    ConnectionLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Caller asked to disconnect.
    DisconnectRequested,
    /// Reconnect timer fired.
    ReconnectTimer,
}

/// Actions to be executed by chansync-client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the transport.
    Connect,
    /// Close the transport.
    Disconnect,
    /// Re-send joins for every subscribed channel.
    RejoinChannels,
    /// Start sending heartbeats.
    StartHeartbeat,
    /// Stop sending heartbeats.
    StopHeartbeat,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Emit an event to the application.
    EmitEvent(ConnectionEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Session established.
    Connected,
    /// The initial connect failed.
    ConnectionFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The session ended.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnection attempt failed.
    ReconnectFailed {
        /// Which reconnection attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// Reconnect attempts exhausted.
    Unavailable {
        /// How many reconnect attempts were made.
        attempts: u32,
    },
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound on the random jitter added to each delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect `attempt` (1-based).
    ///
    /// Formula: min(max_delay, base_delay * 2^(attempt-1)) + random(0..=jitter)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        base + Duration::from_millis(random_jitter_ms(self.jitter.as_millis() as u64))
    }

    /// Same policy without jitter, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = Duration::ZERO;
        self
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

/// Random jitter in `0..=max_ms`. No jitter if the OS RNG is unavailable.
fn random_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % (max_ms + 1),
        Err(_) => 0,
    }
}
