//! Local typing indicator.
//!
//! Emits one `typing` when input starts and one `stopTyping` when input goes
//! idle, a message is sent, or the user switches channel.

use std::time::{Duration, Instant};

use chansync_types::ChannelId;

/// Default idle period before `stopTyping` is sent.
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(3);

/// Commands the indicator asks the caller to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingAction {
    /// Send `typing` for the channel.
    Start(ChannelId),
    /// Send `stopTyping` for the channel.
    Stop(ChannelId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TypingState {
    Idle,
    Typing {
        channel_id: ChannelId,
        last_input: Instant,
    },
}

/// Typing indicator state machine. Time is supplied by the caller.
#[derive(Debug, Clone)]
pub struct TypingIndicator {
    idle_timeout: Duration,
    state: TypingState,
}

impl TypingIndicator {
    /// Create an idle indicator.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            state: TypingState::Idle,
        }
    }

    /// The user produced input in `channel_id`.
    pub fn on_input(&mut self, channel_id: ChannelId, now: Instant) -> Vec<TypingAction> {
        let mut actions = Vec::new();
        match &mut self.state {
            TypingState::Typing {
                channel_id: current,
                last_input,
            } if *current == channel_id => {
                *last_input = now;
                return actions;
            }
            TypingState::Typing {
                channel_id: current,
                ..
            } => actions.push(TypingAction::Stop(current.clone())),
            TypingState::Idle => {}
        }
        actions.push(TypingAction::Start(channel_id.clone()));
        self.state = TypingState::Typing {
            channel_id,
            last_input: now,
        };
        actions
    }

    /// Periodic check for the idle timeout.
    pub fn on_tick(&mut self, now: Instant) -> Vec<TypingAction> {
        let expired = match &self.state {
            TypingState::Typing { last_input, .. } => {
                now.saturating_duration_since(*last_input) >= self.idle_timeout
            }
            TypingState::Idle => false,
        };
        if expired {
            self.stop()
        } else {
            Vec::new()
        }
    }

    /// Stop typing (message sent, channel switched, disconnect).
    pub fn stop(&mut self) -> Vec<TypingAction> {
        match std::mem::replace(&mut self.state, TypingState::Idle) {
            TypingState::Typing { channel_id, .. } => vec![TypingAction::Stop(channel_id)],
            TypingState::Idle => Vec::new(),
        }
    }

    /// When the next `on_tick` could emit a stop.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            TypingState::Typing { last_input, .. } => Some(*last_input + self.idle_timeout),
            TypingState::Idle => None,
        }
    }

    /// Check if the local user is currently typing.
    pub fn is_typing(&self) -> bool {
        matches!(self.state, TypingState::Typing { .. })
    }
}

impl Default for TypingIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_IDLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_input_starts_typing_once() {
        let mut typing = TypingIndicator::default();
        let now = Instant::now();
        let c = ChannelId::from("c1");

        assert_eq!(typing.on_input(c.clone(), now), vec![TypingAction::Start(c.clone())]);
        assert!(typing.on_input(c, now + Duration::from_millis(500)).is_empty());
    }

    #[test]
    fn idle_timeout_stops_typing() {
        let mut typing = TypingIndicator::new(Duration::from_secs(3));
        let now = Instant::now();
        let c = ChannelId::from("c1");
        typing.on_input(c.clone(), now);
        typing.on_input(c.clone(), now + Duration::from_secs(2));

        assert!(typing.on_tick(now + Duration::from_secs(4)).is_empty());
        assert_eq!(
            typing.on_tick(now + Duration::from_secs(5)),
            vec![TypingAction::Stop(c)]
        );
        assert!(!typing.is_typing());
        assert!(typing.deadline().is_none());
    }

    #[test]
    fn switching_channel_stops_previous() {
        let mut typing = TypingIndicator::default();
        let now = Instant::now();

        typing.on_input("a".into(), now);
        let actions = typing.on_input("b".into(), now);

        assert_eq!(
            actions,
            vec![TypingAction::Stop("a".into()), TypingAction::Start("b".into())]
        );
    }

    #[test]
    fn stop_when_idle_is_silent() {
        let mut typing = TypingIndicator::default();
        assert!(typing.stop().is_empty());
    }
}
