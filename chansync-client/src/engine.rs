//! ChatEngine - the main interface for chansync.
//!
//! [`ChatEngine`] wires the pure components from chansync-core to the three
//! write paths of a chat client:
//!
//! ```text
//! local sends ──┐
//! push events ──┼──→ reconcile → ChannelMessageStore → readers
//! history pages ┘
//! ```
//!
//! All mutation goes through a single lock around the core state, which is
//! never held across a network call. Push events are applied in the order the
//! transport delivered them.
//!
//! # Example
//!
//! ```ignore
//! use chansync_client::{ChatEngine, Credential, EngineConfig, MockHistory, MockTransport};
//!
//! let config = EngineConfig::default();
//! let persistence = chansync_client::persistence::adapter_for(&config.persistence);
//! let engine = ChatEngine::new(me, config, MockTransport::new(), MockHistory::new(), persistence);
//!
//! engine.connect(Credential::new("token"));
//! engine.wait_connected().await?;
//! engine.activate_channel(&"general".into()).await?;
//! engine.send_message(&"general".into(), "hello", None).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chansync_core::{
    ChannelMessageStore, ConnectionEvent, ConnectionState, ConnectionStatus, MembershipChange,
    MembershipTracker, MessageReconciler, PageOutcome, PageRequest, ReactionAggregator,
    ReactionDelta, ReactionOp, ReactionOutcome, Reconciliation, TypingAction, TypingIndicator,
};
use chansync_types::{
    AttachmentDescriptor, AttachmentUpload, Channel, ChannelId, ChannelRef, ClientCommand,
    CorrelationId, DeleteMessage, MembershipEvent, Message, MessageDeleted, MessageId,
    ReactionCommand, ReactionEvent, ReplyRef, SendMessage, ServerEvent, SystemNotice, UserRef,
};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::history::HistoryApi;
use crate::persistence::{LocalState, PersistenceAdapter};
use crate::transport::{Credential, PushTransport};

/// Buffered notifications per subscriber.
const NOTIFY_CAPACITY: usize = 256;

/// Something readers of the engine should re-render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A channel's message list changed.
    MessagesChanged(ChannelId),
    /// A channel's member list changed.
    MembersChanged(ChannelId),
}

struct EngineState {
    store: ChannelMessageStore,
    reactions: ReactionAggregator,
    membership: MembershipTracker,
    typing: TypingIndicator,
}

struct EngineInner<T: PushTransport + 'static, H> {
    user: UserRef,
    page_size: u32,
    connection: ConnectionManager<T>,
    history: H,
    local: LocalState,
    state: Mutex<EngineState>,
    uploads: Mutex<HashMap<CorrelationId, AttachmentUpload>>,
    inbound: StdMutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    notices: broadcast::Sender<SystemNotice>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl<T: PushTransport + 'static, H> Drop for EngineInner<T, H> {
    fn drop(&mut self) {
        let pump = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }
}

/// Chat timeline sync engine.
///
/// Cheap to clone; clones share one engine.
pub struct ChatEngine<T: PushTransport + 'static, H: HistoryApi + 'static> {
    inner: Arc<EngineInner<T, H>>,
}

impl<T: PushTransport + 'static, H: HistoryApi + 'static> Clone for ChatEngine<T, H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PushTransport + 'static, H: HistoryApi + 'static> ChatEngine<T, H> {
    /// Create an engine for the local `user`.
    pub fn new(
        user: UserRef,
        config: EngineConfig,
        transport: T,
        history: H,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(
            transport,
            config.connection.reconnect_policy(),
            config.connection.heartbeat_interval(),
            inbound_tx,
        );
        let state = EngineState {
            store: ChannelMessageStore::new(MessageReconciler::new(Duration::from_millis(
                config.reconcile.dedup_window_ms,
            ))),
            reactions: ReactionAggregator::new(Duration::from_secs(
                config.reactions.delta_retention_secs,
            )),
            membership: MembershipTracker::new(Duration::from_millis(
                config.membership.notice_window_ms,
            )),
            typing: TypingIndicator::new(Duration::from_millis(config.typing.idle_timeout_ms)),
        };
        let (notices, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (changes, _) = broadcast::channel(NOTIFY_CAPACITY);

        Self {
            inner: Arc::new(EngineInner {
                user,
                page_size: config.history.page_size.max(1),
                connection,
                history,
                local: LocalState::new(persistence),
                state: Mutex::new(state),
                uploads: Mutex::new(HashMap::new()),
                inbound: StdMutex::new(Some(inbound_rx)),
                pump: StdMutex::new(None),
                notices,
                changes,
            }),
        }
    }

    /// The local user.
    pub fn user(&self) -> &UserRef {
        &self.inner.user
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect the push transport. Idempotent while connecting or connected.
    pub fn connect(&self, credential: Credential) {
        self.start_pump();
        self.inner.connection.connect(credential);
    }

    /// Wait for the session to be established.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::wait_connected`].
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        self.inner.connection.wait_connected().await
    }

    /// Disconnect and stop reconnecting until the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let typing = self.inner.state.lock().await.typing.stop();
        self.send_typing(typing).await;
        self.inner.connection.disconnect().await;
    }

    /// Current observable connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    /// Current connection state, including attempt counters.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Watch the connection status.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.connection.subscribe_status()
    }

    /// Receive connection lifecycle events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.connection.subscribe_events()
    }

    /// Receive join/leave notices as they are recorded.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<SystemNotice> {
        self.inner.notices.subscribe()
    }

    /// Receive change notifications for message and member lists.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes.subscribe()
    }

    fn start_pump(&self) {
        let Some(mut inbound) = self.inner.lock_inbound().take() else {
            return;
        };
        let engine: Weak<EngineInner<T, H>> = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let Some(inner) = engine.upgrade() else {
                    break;
                };
                ChatEngine { inner }.handle_event(event).await;
            }
            tracing::debug!("Event pump stopped");
        });
        *self.inner.lock_pump() = Some(pump);
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Register or replace channel metadata.
    pub async fn upsert_channel(&self, channel: Channel) {
        let channel_id = channel.id.clone();
        self.inner.state.lock().await.membership.upsert_channel(channel);
        self.notify(ChangeEvent::MembersChanged(channel_id));
    }

    /// Look up a channel.
    pub async fn channel(&self, channel_id: &ChannelId) -> Option<Channel> {
        self.inner.state.lock().await.membership.channel(channel_id).cloned()
    }

    /// All known channels, sorted by name.
    pub async fn channels(&self) -> Vec<Channel> {
        self.inner
            .state
            .lock()
            .await
            .membership
            .channels()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Subscribe to a channel's push events.
    pub async fn join_channel(&self, channel_id: &ChannelId) {
        self.inner.connection.join(channel_id.clone()).await;
    }

    /// Unsubscribe from a channel's push events.
    pub async fn leave_channel(&self, channel_id: &ChannelId) {
        self.inner.connection.leave(channel_id).await;
    }

    /// Switch the view to `channel_id` and load its first page.
    ///
    /// The channel's previous history is dropped (provisional messages are
    /// kept), its persisted notices are loaded, and it becomes the last
    /// active channel. A page that completes after another channel was
    /// activated comes back as [`PageOutcome::Stale`] and is not merged.
    ///
    /// # Errors
    ///
    /// [`ClientError::PageFetch`] if the first page cannot be fetched. The
    /// channel stays active and can be reloaded.
    pub async fn activate_channel(&self, channel_id: &ChannelId) -> Result<PageOutcome, ClientError> {
        self.load_persisted_notices(channel_id).await;

        let (request, typing) = {
            let mut state = self.inner.state.lock().await;
            if let Some(previous) = state.store.switch_channel(channel_id.clone()) {
                tracing::debug!("Switching from {} to {}", previous, channel_id);
            }
            let typing = state.typing.stop();
            let request = state.store.begin_page(channel_id, 1, self.inner.page_size)?;
            (request, typing)
        };
        self.notify(ChangeEvent::MessagesChanged(channel_id.clone()));
        self.send_typing(typing).await;

        self.inner.connection.join(channel_id.clone()).await;
        self.inner
            .connection
            .set_active(Some(channel_id.clone()))
            .await;
        if let Err(e) = self.inner.local.save_last_active_channel(channel_id).await {
            tracing::warn!("Failed to persist last active channel: {}", e);
        }

        self.fetch(request).await
    }

    /// Fetch the next older page of a channel.
    ///
    /// Returns `None` without fetching when the server total is reached.
    ///
    /// # Errors
    ///
    /// [`ClientError::PageFetch`] if the page cannot be fetched. The cursor is
    /// not advanced, so calling again retries the same page.
    pub async fn load_more(&self, channel_id: &ChannelId) -> Result<Option<PageOutcome>, ClientError> {
        let request = {
            let mut state = self.inner.state.lock().await;
            if !state.store.has_more(channel_id) {
                return Ok(None);
            }
            state.store.next_page(channel_id, self.inner.page_size)
        };
        self.fetch(request).await.map(Some)
    }

    async fn fetch(&self, request: PageRequest) -> Result<PageOutcome, ClientError> {
        let page = self
            .inner
            .history
            .fetch_messages(&request.channel_id, request.page, request.limit)
            .await
            .map_err(|source| {
                tracing::warn!(
                    "Page {} of {} failed: {}",
                    request.page,
                    request.channel_id,
                    source
                );
                ClientError::PageFetch {
                    channel: request.channel_id.clone(),
                    page: request.page,
                    source,
                }
            })?;

        let outcome = {
            let mut state = self.inner.state.lock().await;
            let EngineState {
                store, reactions, ..
            } = &mut *state;
            let now = Utc::now();
            let mut messages = page.messages;
            for message in &mut messages {
                reactions.rebase(message, now);
            }
            store.append_page(&request, messages, page.total)
        };

        match outcome {
            PageOutcome::Applied(summary) => {
                tracing::debug!(
                    "Page {} of {}: {} new, {} merged, {} duplicate",
                    request.page,
                    request.channel_id,
                    summary.inserted,
                    summary.updated,
                    summary.discarded
                );
                self.notify(ChangeEvent::MessagesChanged(request.channel_id.clone()));
            }
            PageOutcome::Stale => {
                tracing::debug!(
                    "Discarded stale page {} of {}",
                    request.page,
                    request.channel_id
                );
            }
        }
        Ok(outcome)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send a text message.
    ///
    /// The provisional message is shown immediately and returned. It is
    /// upgraded in place when the server echoes its correlation id.
    ///
    /// # Errors
    ///
    /// If the command cannot be sent, the provisional message is marked failed
    /// and stays in the timeline for [`retry_send`](Self::retry_send).
    pub async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: impl Into<String>,
        reply_to: Option<ReplyRef>,
    ) -> Result<Message, ClientError> {
        let correlation_id = CorrelationId::generate();
        let mut message =
            Message::provisional(channel_id.clone(), self.inner.user.clone(), content, Utc::now());
        message.correlation_id = Some(correlation_id.clone());
        message.reply_to = reply_to;

        let typing = {
            let mut state = self.inner.state.lock().await;
            state.store.upsert(message.clone());
            state.typing.stop()
        };
        self.notify(ChangeEvent::MessagesChanged(channel_id.clone()));
        self.send_typing(typing).await;

        if let Err(e) = self.submit(&message, &correlation_id).await {
            tracing::warn!("Send of {} failed: {}", correlation_id, e);
            self.mark_failed(channel_id, &correlation_id).await;
            return Err(e);
        }
        Ok(message)
    }

    /// Re-send a provisional text message.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoProvisionalMessage`] if no unconfirmed message carries
    /// the correlation id; otherwise as [`send_message`](Self::send_message).
    pub async fn retry_send(
        &self,
        channel_id: &ChannelId,
        correlation_id: &CorrelationId,
    ) -> Result<(), ClientError> {
        let message = {
            let mut state = self.inner.state.lock().await;
            let message = state
                .store
                .by_correlation(channel_id, correlation_id)
                .filter(|m| m.is_provisional())
                .cloned()
                .ok_or_else(|| ClientError::NoProvisionalMessage(correlation_id.clone()))?;
            state.store.clear_failed(channel_id, correlation_id);
            message
        };
        self.notify(ChangeEvent::MessagesChanged(channel_id.clone()));

        if let Err(e) = self.submit(&message, correlation_id).await {
            self.mark_failed(channel_id, correlation_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn submit(
        &self,
        message: &Message,
        correlation_id: &CorrelationId,
    ) -> Result<(), ClientError> {
        let command = ClientCommand::SendMessage(SendMessage {
            channel_id: message.channel_id.clone(),
            content: message.content.clone(),
            attachment: message.attachment.clone(),
            client_correlation_id: correlation_id.clone(),
            reply_to: message.reply_to.clone(),
        });
        self.inner.connection.send(&command).await
    }

    /// Send a message with an attachment through the pull transport.
    ///
    /// A provisional message with a pending attachment is shown first. On
    /// success it is upgraded in place to the confirmed message.
    ///
    /// # Errors
    ///
    /// [`ClientError::Upload`] if the upload fails. The message stays pending
    /// until [`retry_upload`](Self::retry_upload) or
    /// [`mark_failed`](Self::mark_failed).
    pub async fn send_attachment(
        &self,
        channel_id: &ChannelId,
        content: impl Into<String>,
        mut attachment: AttachmentDescriptor,
        data: Vec<u8>,
        reply_to: Option<ReplyRef>,
    ) -> Result<Message, ClientError> {
        attachment.pending = true;
        let content = content.into();
        let correlation_id = CorrelationId::generate();

        let mut message = Message::provisional(
            channel_id.clone(),
            self.inner.user.clone(),
            content.clone(),
            Utc::now(),
        )
        .with_attachment(attachment.clone());
        message.correlation_id = Some(correlation_id.clone());
        message.reply_to = reply_to.clone();

        let upload = AttachmentUpload {
            channel_id: channel_id.clone(),
            correlation_id: correlation_id.clone(),
            content,
            attachment,
            data,
            reply_to,
        };

        let typing = {
            let mut state = self.inner.state.lock().await;
            state.store.upsert(message);
            state.typing.stop()
        };
        self.inner
            .uploads
            .lock()
            .await
            .insert(correlation_id, upload.clone());
        self.notify(ChangeEvent::MessagesChanged(channel_id.clone()));
        self.send_typing(typing).await;

        self.upload(upload).await
    }

    /// Re-submit a pending attachment upload.
    ///
    /// # Errors
    ///
    /// [`ClientError::NoPendingUpload`] if the upload already succeeded or was
    /// never started; otherwise as [`send_attachment`](Self::send_attachment).
    pub async fn retry_upload(&self, correlation_id: &CorrelationId) -> Result<Message, ClientError> {
        let upload = self
            .inner
            .uploads
            .lock()
            .await
            .get(correlation_id)
            .cloned()
            .ok_or_else(|| ClientError::NoPendingUpload(correlation_id.clone()))?;

        self.inner
            .state
            .lock()
            .await
            .store
            .clear_failed(&upload.channel_id, correlation_id);
        self.notify(ChangeEvent::MessagesChanged(upload.channel_id.clone()));

        self.upload(upload).await
    }

    /// Give up on a pending upload.
    ///
    /// Drops the buffered bytes and leaves the provisional message marked
    /// failed. Returns false if no upload is pending for the correlation id.
    pub async fn abandon_upload(&self, correlation_id: &CorrelationId) -> bool {
        let Some(upload) = self.inner.uploads.lock().await.remove(correlation_id) else {
            return false;
        };
        tracing::debug!("Abandoned upload {}", correlation_id);
        self.mark_failed(&upload.channel_id, correlation_id).await;
        true
    }

    /// Number of uploads still holding their bytes for a retry.
    pub async fn pending_uploads(&self) -> usize {
        self.inner.uploads.lock().await.len()
    }

    async fn upload(&self, upload: AttachmentUpload) -> Result<Message, ClientError> {
        let correlation_id = upload.correlation_id.clone();
        tracing::debug!("Uploading {:?}", upload);

        match self.inner.history.upload_attachment(upload).await {
            Ok(confirmed) => {
                self.inner.uploads.lock().await.remove(&correlation_id);
                self.apply_confirmation(confirmed.clone()).await;
                Ok(confirmed)
            }
            Err(source) => {
                tracing::warn!("Upload for {} failed: {}", correlation_id, source);
                Err(ClientError::Upload {
                    correlation_id,
                    source,
                })
            }
        }
    }

    /// Flag a provisional message as failed. Returns false if it is unknown or
    /// already confirmed.
    pub async fn mark_failed(&self, channel_id: &ChannelId, correlation_id: &CorrelationId) -> bool {
        let marked = self
            .inner
            .state
            .lock()
            .await
            .store
            .mark_failed(channel_id, correlation_id);
        if marked {
            self.notify(ChangeEvent::MessagesChanged(channel_id.clone()));
        }
        marked
    }

    /// Reconcile a message confirmed by the pull transport.
    pub async fn apply_confirmation(&self, mut message: Message) -> Reconciliation {
        let channel_id = message.channel_id.clone();
        let outcome = {
            let mut state = self.inner.state.lock().await;
            let EngineState {
                store, reactions, ..
            } = &mut *state;
            reactions.rebase(&mut message, Utc::now());
            store.upsert(message)
        };
        tracing::debug!("Confirmation in {}: {:?}", channel_id, outcome);
        if outcome != Reconciliation::Discarded {
            self.notify(ChangeEvent::MessagesChanged(channel_id));
        }
        outcome
    }

    // =========================================================================
    // Reactions and deletion
    // =========================================================================

    /// React to a message as the local user.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownMessage`] if the message is not loaded, or a
    /// transport error. The reaction is shown locally either way.
    pub async fn add_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<(), ClientError> {
        self.react(message_id, emoji, ReactionOp::Add).await
    }

    /// Retract the local user's reaction.
    ///
    /// # Errors
    ///
    /// As [`add_reaction`](Self::add_reaction).
    pub async fn remove_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), ClientError> {
        self.react(message_id, emoji, ReactionOp::Remove).await
    }

    async fn react(
        &self,
        message_id: &MessageId,
        emoji: &str,
        op: ReactionOp,
    ) -> Result<(), ClientError> {
        let channel_id = {
            let mut state = self.inner.state.lock().await;
            let channel_id = state
                .store
                .locate(message_id)
                .cloned()
                .ok_or_else(|| ClientError::UnknownMessage(message_id.clone()))?;
            let EngineState {
                store, reactions, ..
            } = &mut *state;
            let delta = ReactionDelta {
                message_id: message_id.clone(),
                emoji: emoji.to_string(),
                user_id: self.inner.user.id.clone(),
                op,
            };
            reactions.apply_delta(store, delta, Utc::now());
            channel_id
        };
        self.notify(ChangeEvent::MessagesChanged(channel_id.clone()));

        let payload = ReactionCommand {
            message_id: message_id.clone(),
            channel_id,
            emoji: emoji.to_string(),
        };
        let command = match op {
            ReactionOp::Add => ClientCommand::AddReaction(payload),
            ReactionOp::Remove => ClientCommand::RemoveReaction(payload),
        };
        self.inner.connection.send(&command).await
    }

    /// Ask the server to delete a message.
    ///
    /// The entry is removed when the server's `messageDeleted` arrives.
    ///
    /// # Errors
    ///
    /// [`ClientError::UnknownMessage`] if the message is not loaded, or a
    /// transport error.
    pub async fn delete_message(&self, message_id: &MessageId) -> Result<(), ClientError> {
        let channel_id = self
            .inner
            .state
            .lock()
            .await
            .store
            .locate(message_id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownMessage(message_id.clone()))?;

        self.inner
            .connection
            .send(&ClientCommand::DeleteMessage(DeleteMessage {
                message_id: message_id.clone(),
                channel_id,
            }))
            .await
    }

    // =========================================================================
    // Typing
    // =========================================================================

    /// The local user typed in `channel_id`.
    pub async fn typing_input(&self, channel_id: &ChannelId) {
        let actions = self
            .inner
            .state
            .lock()
            .await
            .typing
            .on_input(channel_id.clone(), now());
        self.send_typing(actions).await;
    }

    /// Send `stopTyping` if input has been idle long enough.
    ///
    /// Call periodically, for example from a UI timer.
    pub async fn typing_tick(&self) {
        let actions = self.inner.state.lock().await.typing.on_tick(now());
        self.send_typing(actions).await;
    }

    async fn send_typing(&self, actions: Vec<TypingAction>) {
        for action in actions {
            let command = match action {
                TypingAction::Start(channel_id) => ClientCommand::Typing(ChannelRef { channel_id }),
                TypingAction::Stop(channel_id) => {
                    ClientCommand::StopTyping(ChannelRef { channel_id })
                }
            };
            if let Err(e) = self.inner.connection.send(&command).await {
                tracing::debug!("Typing indicator not sent: {}", e);
            }
        }
    }

    // =========================================================================
    // Push events
    // =========================================================================

    /// Apply one push event.
    ///
    /// Called by the event pump for every decoded frame; exposed so other
    /// delivery paths can feed the same logic.
    pub async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(message) => self.apply_message(message, false).await,
            ServerEvent::MessageUpdate(message) => self.apply_message(message, true).await,
            ServerEvent::MessageDeleted(MessageDeleted { message_id }) => {
                let removed = {
                    let mut state = self.inner.state.lock().await;
                    state.reactions.forget(&message_id);
                    match state.store.locate(&message_id).cloned() {
                        Some(channel_id) => state.store.remove(&channel_id, &message_id),
                        None => None,
                    }
                };
                match removed {
                    Some(message) => {
                        self.notify(ChangeEvent::MessagesChanged(message.channel_id))
                    }
                    None => tracing::debug!("messageDeleted for unloaded {}", message_id),
                }
            }
            ServerEvent::ReactionAdded(event) => self.apply_reaction(event, ReactionOp::Add).await,
            ServerEvent::ReactionRemoved(event) => {
                self.apply_reaction(event, ReactionOp::Remove).await
            }
            ServerEvent::UserJoinedChannel(MembershipEvent { channel_id, user }) => {
                self.record_join(&channel_id, user).await;
            }
            ServerEvent::UserLeftChannel(MembershipEvent { channel_id, user }) => {
                self.record_leave(&channel_id, user).await;
            }
            ServerEvent::HeartbeatAck => {}
        }
    }

    async fn apply_message(&self, mut message: Message, update: bool) {
        let channel_id = message.channel_id.clone();
        let outcome = {
            let mut state = self.inner.state.lock().await;
            let EngineState {
                store, reactions, ..
            } = &mut *state;
            reactions.rebase(&mut message, Utc::now());
            if update {
                store.apply_update(message)
            } else {
                store.upsert(message)
            }
        };
        tracing::debug!("Push message in {}: {:?}", channel_id, outcome);
        if outcome != Reconciliation::Discarded {
            self.notify(ChangeEvent::MessagesChanged(channel_id));
        }
    }

    async fn apply_reaction(&self, event: ReactionEvent, op: ReactionOp) {
        let outcome = {
            let mut state = self.inner.state.lock().await;
            let EngineState {
                store, reactions, ..
            } = &mut *state;
            let delta = ReactionDelta {
                message_id: event.message_id,
                emoji: event.emoji,
                user_id: event.user_id,
                op,
            };
            reactions.apply_delta(store, delta, Utc::now())
        };
        match outcome {
            ReactionOutcome::Applied { channel_id } => {
                self.notify(ChangeEvent::MessagesChanged(channel_id))
            }
            ReactionOutcome::Unchanged { .. } => {}
            ReactionOutcome::UnknownMessage => {
                tracing::debug!("Reaction for unloaded message kept for later snapshots")
            }
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Record that `user` joined `channel_id`, from a push event or a
    /// confirmed local action. Returns the new notice unless it duplicated a
    /// recent one.
    pub async fn record_join(&self, channel_id: &ChannelId, user: UserRef) -> Option<SystemNotice> {
        let change = self
            .inner
            .state
            .lock()
            .await
            .membership
            .apply_join(channel_id, user, Utc::now());
        self.publish_membership(channel_id, change).await
    }

    /// Record that `user` left `channel_id`.
    pub async fn record_leave(&self, channel_id: &ChannelId, user: UserRef) -> Option<SystemNotice> {
        let change = self
            .inner
            .state
            .lock()
            .await
            .membership
            .apply_leave(channel_id, user, Utc::now());
        self.publish_membership(channel_id, change).await
    }

    async fn publish_membership(
        &self,
        channel_id: &ChannelId,
        change: MembershipChange,
    ) -> Option<SystemNotice> {
        if change.members_changed {
            self.notify(ChangeEvent::MembersChanged(channel_id.clone()));
        }
        let notice = change.notice?;
        if let Err(e) = self.inner.local.append_notice(&notice).await {
            tracing::warn!("Failed to persist notice for {}: {}", channel_id, e);
        }
        // No subscribers is fine.
        let _ = self.inner.notices.send(notice.clone());
        Some(notice)
    }

    async fn load_persisted_notices(&self, channel_id: &ChannelId) {
        match self.inner.local.load_notices(channel_id).await {
            Ok(notices) => self
                .inner
                .state
                .lock()
                .await
                .membership
                .load_notices(channel_id, notices),
            Err(e) => tracing::warn!("Failed to load notices for {}: {}", channel_id, e),
        }
    }

    /// Notices recorded for a channel, oldest first.
    pub async fn notices(&self, channel_id: &ChannelId) -> Vec<SystemNotice> {
        self.inner
            .state
            .lock()
            .await
            .membership
            .notices(channel_id)
            .to_vec()
    }

    /// Delete a channel's notices, locally and in persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub async fn clear_notices(&self, channel_id: &ChannelId) -> Result<(), ClientError> {
        self.inner
            .state
            .lock()
            .await
            .membership
            .clear_notices(channel_id);
        self.inner.local.save_notices(channel_id, &[]).await?;
        Ok(())
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// The last active channel from a previous session.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub async fn restore(&self) -> Result<Option<ChannelId>, ClientError> {
        Ok(self.inner.local.load_last_active_channel().await?)
    }

    /// The channel currently in view.
    pub async fn active_channel(&self) -> Option<ChannelId> {
        self.inner.state.lock().await.store.active_channel().cloned()
    }

    /// Messages of a channel, most recently inserted first.
    pub async fn messages(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .await
            .store
            .get_messages(channel_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Messages of a channel, oldest first.
    pub async fn chronological(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .await
            .store
            .chronological(channel_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Whether older history may still be fetched.
    pub async fn has_more(&self, channel_id: &ChannelId) -> bool {
        self.inner.state.lock().await.store.has_more(channel_id)
    }

    /// Get the connection manager (for testing).
    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.inner.connection
    }

    fn notify(&self, change: ChangeEvent) {
        // No subscribers is fine.
        let _ = self.inner.changes.send(change);
    }
}

impl<T: PushTransport + 'static, H> EngineInner<T, H> {
    fn lock_inbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedReceiver<ServerEvent>>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pump(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Monotonic clock for the typing indicator; follows tokio's test clock.
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{HistoryError, MockHistory};
    use crate::persistence::MemoryPersistence;
    use crate::transport::MockTransport;
    use chansync_types::{NoticeKind, ReactionMap, UserId};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn alice() -> UserRef {
        UserRef::new("u1", "alice")
    }

    fn bob() -> UserRef {
        UserRef::new("u2", "bob")
    }

    struct Harness {
        engine: ChatEngine<MockTransport, MockHistory>,
        transport: MockTransport,
        history: MockHistory,
        persistence: Arc<MemoryPersistence>,
    }

    fn harness() -> Harness {
        init_tracing();
        let transport = MockTransport::new();
        let history = MockHistory::new();
        history.set_uploader(alice());
        let persistence = Arc::new(MemoryPersistence::new());
        let mut config = EngineConfig::default();
        config.connection.jitter_ms = 0;
        let engine = ChatEngine::new(
            alice(),
            config,
            transport.clone(),
            history.clone(),
            persistence.clone(),
        );
        Harness {
            engine,
            transport,
            history,
            persistence,
        }
    }

    async fn connected() -> Harness {
        let h = harness();
        h.engine.connect(Credential::new("token"));
        h.engine.wait_connected().await.unwrap();
        h
    }

    fn server_message(id: &str, channel: &str, sender: UserRef, content: &str) -> Message {
        Message {
            id: Some(MessageId::from(id)),
            correlation_id: None,
            channel_id: ChannelId::from(channel),
            sender,
            content: content.to_string(),
            attachment: None,
            reactions: ReactionMap::new(),
            created_at: Utc::now(),
            reply_to: None,
            failed: false,
        }
    }

    fn channel(id: &str) -> Channel {
        Channel {
            id: ChannelId::from(id),
            name: id.to_string(),
            topic: None,
            archived: false,
            members: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn sent(transport: &MockTransport) -> Vec<&'static str> {
        transport
            .sent_commands()
            .iter()
            .map(ClientCommand::name)
            .filter(|name| *name != "heartbeat")
            .collect()
    }

    // ===========================================
    // Send / Reconcile
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn send_echo_and_confirmation_leave_one_message() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.engine.activate_channel(&ch).await.unwrap();

        let provisional = h.engine.send_message(&ch, "hello", None).await.unwrap();
        let correlation_id = provisional.correlation_id.clone().unwrap();
        assert_eq!(h.engine.messages(&ch).await.len(), 1);

        let command = h
            .transport
            .sent_commands()
            .into_iter()
            .find_map(|c| match c {
                ClientCommand::SendMessage(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(command.client_correlation_id, correlation_id);

        let mut echo = server_message("m1", "general", alice(), "hello");
        echo.correlation_id = Some(correlation_id);
        h.engine.handle_event(ServerEvent::NewMessage(echo)).await;

        let confirmation = server_message("m1", "general", alice(), "hello");
        assert_eq!(
            h.engine.apply_confirmation(confirmation).await,
            Reconciliation::Discarded
        );

        let messages = h.engine.messages(&ch).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, Some(MessageId::from("m1")));
        assert_eq!(messages[0].content, "hello");
        assert!(!messages[0].is_provisional());
    }

    #[tokio::test(start_paused = true)]
    async fn push_events_flow_through_the_transport() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        let mut changes = h.engine.subscribe_changes();

        h.transport.queue_event(&ServerEvent::NewMessage(server_message(
            "m1",
            "general",
            bob(),
            "hi",
        )));

        assert_eq!(
            changes.recv().await.unwrap(),
            ChangeEvent::MessagesChanged(ch.clone())
        );
        assert_eq!(h.engine.messages(&ch).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_is_marked_and_retryable() {
        let h = harness();
        let ch = ChannelId::from("general");

        let result = h.engine.send_message(&ch, "offline", None).await;
        assert!(matches!(result, Err(ClientError::NotConnected)));

        let messages = h.engine.messages(&ch).await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].failed);
        let correlation_id = messages[0].correlation_id.clone().unwrap();

        h.engine.connect(Credential::new("token"));
        h.engine.wait_connected().await.unwrap();
        h.engine.retry_send(&ch, &correlation_id).await.unwrap();

        assert!(!h.engine.messages(&ch).await[0].failed);
        assert!(sent(&h.transport).contains(&"sendMessage"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_text_sends_stay_separate() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.engine.activate_channel(&ch).await.unwrap();

        let first = h.engine.send_message(&ch, "ok", None).await.unwrap();
        let second = h.engine.send_message(&ch, "ok", None).await.unwrap();
        assert_ne!(first.correlation_id, second.correlation_id);
        assert_eq!(h.engine.messages(&ch).await.len(), 2);

        for (id, provisional) in [("m1", &first), ("m2", &second)] {
            let mut echo = server_message(id, "general", alice(), "ok");
            echo.correlation_id = provisional.correlation_id.clone();
            h.engine.handle_event(ServerEvent::NewMessage(echo)).await;
        }

        let messages = h.engine.messages(&ch).await;
        assert_eq!(messages.len(), 2);
        for (id, provisional) in [("m1", &first), ("m2", &second)] {
            let entry = messages
                .iter()
                .find(|m| m.correlation_id == provisional.correlation_id)
                .unwrap();
            assert_eq!(entry.id, Some(MessageId::from(id)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_send_requires_provisional_message() {
        let h = connected().await;
        let result = h
            .engine
            .retry_send(&"general".into(), &CorrelationId::from("nope"))
            .await;
        assert!(matches!(result, Err(ClientError::NoProvisionalMessage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_stays_pending_until_retry() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.history.fail_next_upload(HistoryError::Timeout);

        let result = h
            .engine
            .send_attachment(
                &ch,
                "",
                AttachmentDescriptor::awaiting_upload("cat.png", "image/png", 3),
                vec![1, 2, 3],
                None,
            )
            .await;
        let correlation_id = match result {
            Err(ClientError::Upload { correlation_id, .. }) => correlation_id,
            other => panic!("expected upload error, got {:?}", other),
        };

        let messages = h.engine.messages(&ch).await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].has_pending_attachment());
        assert!(h.engine.mark_failed(&ch, &correlation_id).await);

        let confirmed = h.engine.retry_upload(&correlation_id).await.unwrap();
        assert_eq!(confirmed.correlation_id, Some(correlation_id.clone()));

        let messages = h.engine.messages(&ch).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, Some(MessageId::from("upload-1")));
        assert!(!messages[0].has_pending_attachment());
        assert!(!messages[0].failed);
        assert_eq!(h.history.uploads().len(), 2);

        let again = h.engine.retry_upload(&correlation_id).await;
        assert!(matches!(again, Err(ClientError::NoPendingUpload(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_upload_releases_its_bytes() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.history.fail_next_upload(HistoryError::Timeout);

        let result = h
            .engine
            .send_attachment(
                &ch,
                "",
                AttachmentDescriptor::awaiting_upload("cat.png", "image/png", 3),
                vec![1, 2, 3],
                None,
            )
            .await;
        let correlation_id = match result {
            Err(ClientError::Upload { correlation_id, .. }) => correlation_id,
            other => panic!("expected upload error, got {:?}", other),
        };
        assert_eq!(h.engine.pending_uploads().await, 1);

        assert!(h.engine.abandon_upload(&correlation_id).await);
        assert_eq!(h.engine.pending_uploads().await, 0);
        assert!(!h.engine.abandon_upload(&correlation_id).await);

        let retry = h.engine.retry_upload(&correlation_id).await;
        assert!(matches!(retry, Err(ClientError::NoPendingUpload(_))));
        let messages = h.engine.messages(&ch).await;
        assert_eq!(messages.len(), 1);
        assert!(messages[0].failed);
    }

    #[tokio::test(start_paused = true)]
    async fn message_update_merges_and_delete_removes() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.engine
            .handle_event(ServerEvent::NewMessage(server_message(
                "m1", "general", bob(), "draft",
            )))
            .await;
        h.engine
            .handle_event(ServerEvent::MessageUpdate(server_message(
                "m1", "general", bob(), "edited",
            )))
            .await;

        let messages = h.engine.messages(&ch).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "edited");

        h.engine.delete_message(&"m1".into()).await.unwrap();
        assert_eq!(h.engine.messages(&ch).await.len(), 1);
        assert!(sent(&h.transport).contains(&"deleteMessage"));

        h.engine
            .handle_event(ServerEvent::MessageDeleted(MessageDeleted {
                message_id: "m1".into(),
            }))
            .await;
        assert!(h.engine.messages(&ch).await.is_empty());
    }

    // ===========================================
    // Paging
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn late_page_for_inactive_channel_is_discarded() {
        let h = connected().await;
        let a = ChannelId::from("A");
        let b = ChannelId::from("B");
        h.history
            .set_page(&a, 1, vec![server_message("a1", "A", bob(), "a1")], 1);
        h.history
            .set_page(&b, 1, vec![server_message("b1", "B", bob(), "b1")], 1);
        h.history.delay_channel(&a, Duration::from_secs(5));

        let engine = h.engine.clone();
        let slow = tokio::spawn(async move { engine.activate_channel(&"A".into()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fast = h.engine.activate_channel(&b).await.unwrap();
        assert!(matches!(fast, PageOutcome::Applied(_)));

        let late = slow.await.unwrap().unwrap();
        assert_eq!(late, PageOutcome::Stale);
        assert!(h.engine.messages(&a).await.is_empty());
        assert_eq!(h.engine.messages(&b).await.len(), 1);
        assert_eq!(h.engine.active_channel().await, Some(b));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_channels_leaves_other_timelines_alone() {
        let h = connected().await;
        let a = ChannelId::from("A");
        let b = ChannelId::from("B");
        for page in 1..=3 {
            let id = format!("a{}", page);
            h.history
                .set_page(&a, page, vec![server_message(&id, "A", bob(), &id)], 3);
        }

        h.engine.activate_channel(&a).await.unwrap();
        assert!(h.engine.load_more(&a).await.unwrap().is_some());
        assert!(h.engine.load_more(&a).await.unwrap().is_some());
        assert!(!h.engine.has_more(&a).await);
        assert_eq!(h.engine.load_more(&a).await.unwrap(), None);

        h.engine.activate_channel(&b).await.unwrap();

        assert_eq!(h.engine.messages(&a).await.len(), 3);
        assert!(h.engine.messages(&b).await.is_empty());
        let oldest_first: Vec<String> = h
            .engine
            .chronological(&a)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(oldest_first.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_can_be_retried() {
        let h = connected().await;
        let a = ChannelId::from("A");
        h.history
            .set_page(&a, 1, vec![server_message("a1", "A", bob(), "one")], 2);
        h.history
            .set_page(&a, 2, vec![server_message("a2", "A", bob(), "two")], 2);
        h.engine.activate_channel(&a).await.unwrap();

        h.history.fail_next_fetch(HistoryError::Timeout);
        let result = h.engine.load_more(&a).await;
        assert!(matches!(
            result,
            Err(ClientError::PageFetch { page: 2, .. })
        ));

        let retried = h.engine.load_more(&a).await.unwrap();
        assert!(matches!(retried, Some(PageOutcome::Applied(_))));
        assert_eq!(h.engine.messages(&a).await.len(), 2);
        assert_eq!(
            h.history.fetches().last(),
            Some(&(a.clone(), 2, 50))
        );
    }

    // ===========================================
    // Reactions
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn push_delta_survives_older_snapshot() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.engine
            .handle_event(ServerEvent::NewMessage(server_message(
                "m1", "general", bob(), "hi",
            )))
            .await;
        h.engine
            .handle_event(ServerEvent::ReactionAdded(ReactionEvent {
                message_id: "m1".into(),
                emoji: "👍".into(),
                user_id: "u2".into(),
            }))
            .await;

        let mut snapshot = server_message("m1", "general", bob(), "hi");
        snapshot.reactions.add("🎉", UserId::from("u3"));
        h.engine
            .handle_event(ServerEvent::MessageUpdate(snapshot))
            .await;

        let reactions = &h.engine.messages(&ch).await[0].reactions;
        assert!(reactions.contains("👍", &UserId::from("u2")));
        assert!(reactions.contains("🎉", &UserId::from("u3")));
    }

    #[tokio::test(start_paused = true)]
    async fn update_snapshot_clears_withdrawn_reactions() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        let mut reacted = server_message("m1", "general", bob(), "hi");
        reacted.reactions.add("👍", UserId::from("u3"));
        h.engine
            .handle_event(ServerEvent::NewMessage(reacted))
            .await;

        h.engine
            .handle_event(ServerEvent::MessageUpdate(server_message(
                "m1", "general", bob(), "hi",
            )))
            .await;

        assert!(h.engine.messages(&ch).await[0].reactions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_only_touches_the_holding_channel() {
        let h = connected().await;
        for (id, ch) in [("m1", "a"), ("m2", "b")] {
            h.engine
                .handle_event(ServerEvent::NewMessage(server_message(id, ch, bob(), "hi")))
                .await;
        }
        let mut changes = h.engine.subscribe_changes();

        h.engine
            .handle_event(ServerEvent::MessageDeleted(MessageDeleted {
                message_id: "m2".into(),
            }))
            .await;

        assert_eq!(h.engine.messages(&"a".into()).await.len(), 1);
        assert!(h.engine.messages(&"b".into()).await.is_empty());
        assert_eq!(
            changes.try_recv().unwrap(),
            ChangeEvent::MessagesChanged("b".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn local_reactions_are_optimistic() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.engine
            .handle_event(ServerEvent::NewMessage(server_message(
                "m1", "general", bob(), "hi",
            )))
            .await;

        h.engine.add_reaction(&"m1".into(), "👍").await.unwrap();
        h.engine.add_reaction(&"m1".into(), "👍").await.unwrap();
        assert_eq!(h.engine.messages(&ch).await[0].reactions.count("👍"), 1);

        h.engine.remove_reaction(&"m1".into(), "👍").await.unwrap();
        assert!(h.engine.messages(&ch).await[0].reactions.is_empty());

        let names = sent(&h.transport);
        assert_eq!(
            names,
            vec!["addReaction", "addReaction", "removeReaction"]
        );

        let unknown = h.engine.add_reaction(&"missing".into(), "👍").await;
        assert!(matches!(unknown, Err(ClientError::UnknownMessage(_))));
    }

    // ===========================================
    // Membership
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn duplicate_join_yields_one_member_and_one_notice() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        h.engine.upsert_channel(channel("general")).await;
        let mut notices = h.engine.subscribe_notices();

        let event = ServerEvent::UserJoinedChannel(MembershipEvent {
            channel_id: ch.clone(),
            user: bob(),
        });
        h.engine.handle_event(event.clone()).await;
        h.engine.handle_event(event).await;

        let members = h.engine.channel(&ch).await.unwrap().members;
        assert_eq!(members.len(), 1);
        assert_eq!(h.engine.notices(&ch).await.len(), 1);

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.kind, NoticeKind::Join);
        assert_eq!(notice.username, "bob");
        assert!(notices.try_recv().is_err());

        let persisted = LocalState::new(h.persistence.clone())
            .load_notices(&ch)
            .await
            .unwrap();
        assert_eq!(persisted, vec![notice]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joins_persist_every_notice() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(crate::persistence::FilePersistence::in_directory(dir.path()));
        let engine = ChatEngine::new(
            alice(),
            EngineConfig::default(),
            MockTransport::new(),
            MockHistory::new(),
            persistence.clone(),
        );
        let ch = ChannelId::from("general");

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                let ch = ch.clone();
                tokio::spawn(async move {
                    engine
                        .record_join(&ch, UserRef::new(format!("u{i}"), format!("user{i}")))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }

        assert_eq!(engine.notices(&ch).await.len(), 8);
        let persisted = LocalState::new(persistence).load_notices(&ch).await.unwrap();
        assert_eq!(persisted.len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_removes_member() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        let mut record = channel("general");
        record.members.push(bob().into());
        h.engine.upsert_channel(record).await;

        let notice = h.engine.record_leave(&ch, bob()).await.unwrap();

        assert_eq!(notice.kind, NoticeKind::Leave);
        assert!(h.engine.channel(&ch).await.unwrap().members.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_notices_load_on_activation() {
        let h = connected().await;
        let ch = ChannelId::from("general");
        let earlier = SystemNotice::new(NoticeKind::Leave, "carol", ch.clone(), Utc::now());
        LocalState::new(h.persistence.clone())
            .append_notice(&earlier)
            .await
            .unwrap();

        h.engine.activate_channel(&ch).await.unwrap();
        assert_eq!(h.engine.notices(&ch).await, vec![earlier]);

        h.engine.clear_notices(&ch).await.unwrap();
        assert!(h.engine.notices(&ch).await.is_empty());
        assert!(LocalState::new(h.persistence.clone())
            .load_notices(&ch)
            .await
            .unwrap()
            .is_empty());
    }

    // ===========================================
    // Session
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn restore_returns_last_active_channel() {
        let h = connected().await;
        h.engine.activate_channel(&"A".into()).await.unwrap();
        h.engine.activate_channel(&"B".into()).await.unwrap();

        let next = ChatEngine::new(
            alice(),
            EngineConfig::default(),
            MockTransport::new(),
            MockHistory::new(),
            h.persistence.clone(),
        );
        assert_eq!(next.restore().await.unwrap(), Some(ChannelId::from("B")));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_rejoins_active_and_joined_channels() {
        let h = connected().await;
        h.engine.activate_channel(&"A".into()).await.unwrap();
        h.engine.join_channel(&"B".into()).await;

        h.transport.clear_sent();
        let mut status = h.engine.subscribe_status();
        h.transport.drop_connection();
        status
            .wait_for(|s| *s == ConnectionStatus::Connecting)
            .await
            .unwrap();
        status
            .wait_for(|s| *s == ConnectionStatus::Connected)
            .await
            .unwrap();

        assert_eq!(sent(&h.transport), vec!["joinChannel", "joinChannel"]);
    }

    // ===========================================
    // Typing
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn typing_stops_before_send() {
        let h = connected().await;
        let ch = ChannelId::from("general");

        h.engine.typing_input(&ch).await;
        h.engine.typing_input(&ch).await;
        h.engine.send_message(&ch, "done", None).await.unwrap();

        assert_eq!(
            sent(&h.transport),
            vec!["typing", "stopTyping", "sendMessage"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn typing_stops_after_idle_timeout() {
        let h = connected().await;
        let ch = ChannelId::from("general");

        h.engine.typing_input(&ch).await;
        h.engine.typing_tick().await;
        assert_eq!(sent(&h.transport), vec!["typing"]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        h.engine.typing_tick().await;
        assert_eq!(sent(&h.transport), vec!["typing", "stopTyping"]);
    }
}
