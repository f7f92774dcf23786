//! ConnectionManager - drives the push transport.
//!
//! The manager owns one logical session. A background driver task interprets
//! the actions of the pure [`ConnectionState`] machine from chansync-core:
//!
//! ```text
//! connect() → driver task → PushTransport
//!                 ↓
//!       chansync-core ConnectionState (pure)
//! ```
//!
//! While connected the driver forwards decoded [`ServerEvent`]s to the
//! consumer and sends heartbeats. When the session drops it waits out the
//! backoff, reconnects and re-joins every subscribed channel before events
//! flow again. Only [`ConnectionManager::disconnect`] stops that loop.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chansync_core::{
    Action, ConnectionEvent, ConnectionState, ConnectionStatus, Event, ReconnectPolicy,
    SubscriptionSet,
};
use chansync_types::{ChannelId, ClientCommand, ServerEvent};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::transport::{Credential, PushTransport};

/// Buffered connection events per subscriber.
const EVENT_CAPACITY: usize = 64;

struct Shared<T> {
    transport: T,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    state: watch::Sender<ConnectionState>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ConnectionEvent>,
    subscriptions: Mutex<SubscriptionSet>,
    inbound: mpsc::UnboundedSender<ServerEvent>,
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the push session, its reconnect loop and the joined-channel set.
pub struct ConnectionManager<T: PushTransport + 'static> {
    shared: Arc<Shared<T>>,
    driver: StdMutex<Option<Driver>>,
}

impl<T: PushTransport + 'static> ConnectionManager<T> {
    /// Create a manager. Decoded server events are sent to `inbound`.
    pub fn new(
        transport: T,
        policy: ReconnectPolicy,
        heartbeat_interval: Duration,
        inbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::new());
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                policy,
                heartbeat_interval,
                state,
                status,
                events,
                subscriptions: Mutex::new(SubscriptionSet::new()),
                inbound,
            }),
            driver: StdMutex::new(None),
        }
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<Driver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start connecting. Idempotent while connecting or connected.
    ///
    /// Returns immediately; use [`wait_connected`](Self::wait_connected) or
    /// [`subscribe_status`](Self::subscribe_status) to observe the outcome.
    pub fn connect(&self, credential: Credential) {
        let actions = self.shared.transition(Event::ConnectRequested);
        self.shared.publish_status();
        if !actions.contains(&Action::Connect) {
            tracing::debug!("connect() ignored in state {:?}", self.state());
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&self.shared), credential, cancel.clone()));
        if let Some(previous) = self.lock_driver().replace(Driver { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    /// Tear down the session and stop reconnecting until the next `connect`.
    pub async fn disconnect(&self) {
        let actions = self.shared.transition(Event::DisconnectRequested);

        let driver = self.lock_driver().take();
        if let Some(driver) = driver {
            driver.cancel.cancel();
            if let Err(e) = driver.handle.await {
                tracing::warn!("Connection driver ended abnormally: {}", e);
            }
        }

        if actions.contains(&Action::Disconnect) || self.shared.transport.is_connected() {
            if let Err(e) = self.shared.transport.close().await {
                tracing::debug!("Transport close failed: {}", e);
            }
        }
        self.shared.emit(&actions);
        self.shared.publish_status();
        tracing::info!("Push transport disconnected");
    }

    /// Wait until the session is established and channels are re-joined.
    ///
    /// # Errors
    ///
    /// [`ClientError::Unavailable`] once reconnect attempts are exhausted,
    /// [`ClientError::NotConnected`] if no connection is in progress.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut status = self.shared.status.subscribe();
        loop {
            let current = *status.borrow_and_update();
            if current == ConnectionStatus::Connected {
                return Ok(());
            }
            match self.state() {
                ConnectionState::Unavailable { attempts } => {
                    return Err(ClientError::Unavailable { attempts })
                }
                ConnectionState::Disconnected => return Err(ClientError::NotConnected),
                _ => {}
            }
            if status.changed().await.is_err() {
                return Err(ClientError::NotConnected);
            }
        }
    }

    /// Current observable status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Current state of the connection state machine.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch the observable status.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Receive connection lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribe to a channel.
    ///
    /// Sent immediately if connected, otherwise on the next (re)connect.
    /// Joining an already joined channel sends nothing.
    pub async fn join(&self, channel_id: ChannelId) {
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if !subscriptions.join(channel_id.clone()) {
            return;
        }
        if self.shared.is_connected() {
            if let Err(e) = self
                .shared
                .send_command(&ClientCommand::join(channel_id.clone()))
                .await
            {
                tracing::warn!("Join of {} not sent, will replay on reconnect: {}", channel_id, e);
            }
        }
    }

    /// Unsubscribe from a channel.
    pub async fn leave(&self, channel_id: &ChannelId) {
        let mut subscriptions = self.shared.subscriptions.lock().await;
        if !subscriptions.leave(channel_id) {
            return;
        }
        if self.shared.is_connected() {
            if let Err(e) = self
                .shared
                .send_command(&ClientCommand::leave(channel_id.clone()))
                .await
            {
                tracing::warn!("Leave of {} not sent: {}", channel_id, e);
            }
        }
    }

    /// Record the channel in view so it is re-joined after a reconnect.
    pub async fn set_active(&self, channel_id: Option<ChannelId>) {
        self.shared.subscriptions.lock().await.set_active(channel_id);
    }

    /// Channels currently joined, in id order.
    pub async fn joined_channels(&self) -> Vec<ChannelId> {
        self.shared
            .subscriptions
            .lock()
            .await
            .joined()
            .cloned()
            .collect()
    }

    /// Send a command over the live session.
    ///
    /// # Errors
    ///
    /// Fails without queueing if there is no live session.
    pub async fn send(&self, command: &ClientCommand) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Connected => self.shared.send_command(command).await,
            ConnectionState::Unavailable { attempts } => Err(ClientError::Unavailable { attempts }),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Get a reference to the underlying transport (for testing).
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }
}

impl<T: PushTransport + 'static> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        let driver = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.cancel.cancel();
        }
    }
}

impl<T: PushTransport> Shared<T> {
    fn transition(&self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        self.state.send_modify(|state| {
            let (next, produced) = std::mem::take(state).on_event(event, &self.policy);
            *state = next;
            actions = produced;
        });
        actions
    }

    fn publish_status(&self) {
        let status = self.state.borrow().status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn emit(&self, actions: &[Action]) {
        for action in actions {
            if let Action::EmitEvent(event) = action {
                // No subscribers is fine.
                let _ = self.events.send(event.clone());
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    async fn send_command(&self, command: &ClientCommand) -> Result<(), ClientError> {
        let frame = command.to_bytes()?;
        self.transport.send(&frame).await?;
        tracing::debug!("Sent {}", command.name());
        Ok(())
    }

    async fn rejoin(&self, plan: &[ChannelId]) {
        for channel_id in plan {
            if let Err(e) = self
                .send_command(&ClientCommand::join(channel_id.clone()))
                .await
            {
                tracing::warn!("Rejoin of {} failed: {}", channel_id, e);
            }
        }
        tracing::info!("Rejoined {} channel(s)", plan.len());
    }

    /// Pump one session until it ends. `None` means cancelled.
    async fn session(&self, cancel: &CancellationToken) -> Option<String> {
        let period = self.heartbeat_interval.max(Duration::from_secs(1));
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                frame = self.transport.recv() => match frame {
                    Ok(frame) => self.deliver(&frame),
                    Err(e) => return Some(e.to_string()),
                },
                _ = heartbeat.tick() => {
                    // A missing ack is not a disconnect; recv() errors are.
                    if let Err(e) = self.send_command(&ClientCommand::Heartbeat).await {
                        tracing::debug!("Heartbeat not sent: {}", e);
                    }
                }
            }
        }
    }

    fn deliver(&self, frame: &[u8]) {
        match ServerEvent::from_bytes(frame) {
            Ok(ServerEvent::HeartbeatAck) => {}
            Ok(event) => {
                if self.inbound.send(event).is_err() {
                    tracing::debug!("Event consumer gone, dropping event");
                }
            }
            Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
        }
    }
}

/// Driver task: connect, run the session, back off, repeat.
async fn run<T: PushTransport + 'static>(
    shared: Arc<Shared<T>>,
    credential: Credential,
    cancel: CancellationToken,
) {
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.transport.connect(&credential) => result,
        };

        let actions = match attempt {
            Ok(()) => {
                // Hold the subscription set so a concurrent join() is either
                // part of the rejoin plan or sent after it, never both.
                let subscriptions = shared.subscriptions.lock().await;
                let actions = shared.transition(Event::ConnectSucceeded);
                if !shared.is_connected() {
                    drop(subscriptions);
                    let _ = shared.transport.close().await;
                    return;
                }
                tracing::info!("Push transport connected");
                if actions.contains(&Action::RejoinChannels) {
                    shared.rejoin(&subscriptions.rejoin_plan()).await;
                }
                drop(subscriptions);
                shared.emit(&actions);
                shared.publish_status();

                let Some(reason) = shared.session(&cancel).await else {
                    return;
                };
                tracing::warn!("Push transport lost: {}", reason);
                shared.transition(Event::ConnectionLost { reason })
            }
            Err(e) => {
                tracing::warn!("Push transport connect failed: {}", e);
                shared.transition(Event::ConnectFailed {
                    error: e.to_string(),
                })
            }
        };
        shared.emit(&actions);
        shared.publish_status();

        let delay = actions.iter().find_map(|action| match action {
            Action::StartReconnectTimer { delay } => Some(*delay),
            _ => None,
        });
        let Some(delay) = delay else {
            tracing::warn!("Push transport unavailable until the next connect()");
            return;
        };

        tracing::info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let actions = shared.transition(Event::ReconnectTimer);
        shared.publish_status();
        if !actions.contains(&Action::Connect) {
            return;
        }
    }
}
