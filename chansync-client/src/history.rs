//! Pull transport: paginated history and attachment uploads.
//!
//! In production this is a REST client. The engine only needs the two calls
//! below, and the backend must echo the upload's correlation id in the
//! returned message.

use async_trait::async_trait;
use chansync_types::{AttachmentUpload, ChannelId, Message, MessageId, MessagePage, UserRef};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Pull transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// The request could not be sent.
    #[error("request failed: {0}")]
    Request(String),

    /// The backend answered with an error status.
    #[error("backend returned {status}: {message}")]
    Status {
        /// HTTP-style status code.
        status: u16,
        /// Error body.
        message: String,
    },

    /// The request timed out.
    #[error("request timeout")]
    Timeout,

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),
}

/// Request/response transport for history and uploads.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Fetch one page of a channel's history. Pages are 1-based, newest first.
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage, HistoryError>;

    /// Upload an attachment and post it as a message.
    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<Message, HistoryError>;
}

/// In-memory history backend for tests.
#[derive(Debug, Default, Clone)]
pub struct MockHistory {
    inner: Arc<Mutex<MockHistoryInner>>,
}

#[derive(Debug, Default)]
struct MockHistoryInner {
    pages: HashMap<(ChannelId, u32), MessagePage>,
    delays: HashMap<ChannelId, Duration>,
    fetches: Vec<(ChannelId, u32, u32)>,
    uploads: Vec<AttachmentUpload>,
    fail_next_fetch: Option<HistoryError>,
    fail_next_upload: Option<HistoryError>,
    uploader: Option<UserRef>,
    next_id: u64,
}

impl MockHistory {
    /// Create an empty backend. Unknown pages come back empty.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockHistoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve `messages` as `page` of `channel_id`.
    pub fn set_page(&self, channel_id: &ChannelId, page: u32, messages: Vec<Message>, total: u64) {
        self.lock()
            .pages
            .insert((channel_id.clone(), page), MessagePage { messages, total });
    }

    /// Delay every fetch for `channel_id`.
    pub fn delay_channel(&self, channel_id: &ChannelId, delay: Duration) {
        self.lock().delays.insert(channel_id.clone(), delay);
    }

    /// Cause the next fetch to fail.
    pub fn fail_next_fetch(&self, error: HistoryError) {
        self.lock().fail_next_fetch = Some(error);
    }

    /// Cause the next upload to fail.
    pub fn fail_next_upload(&self, error: HistoryError) {
        self.lock().fail_next_upload = Some(error);
    }

    /// Author stamped on messages created by uploads.
    pub fn set_uploader(&self, user: UserRef) {
        self.lock().uploader = Some(user);
    }

    /// Every fetch made, as `(channel, page, limit)`.
    pub fn fetches(&self) -> Vec<(ChannelId, u32, u32)> {
        self.lock().fetches.clone()
    }

    /// Every upload received.
    pub fn uploads(&self) -> Vec<AttachmentUpload> {
        self.lock().uploads.clone()
    }
}

#[async_trait]
impl HistoryApi for MockHistory {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        page: u32,
        limit: u32,
    ) -> Result<MessagePage, HistoryError> {
        let delay = {
            let mut inner = self.lock();
            inner.fetches.push((channel_id.clone(), page, limit));
            if let Some(error) = inner.fail_next_fetch.take() {
                return Err(error);
            }
            inner.delays.get(channel_id).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let inner = self.lock();
        Ok(inner
            .pages
            .get(&(channel_id.clone(), page))
            .cloned()
            .unwrap_or(MessagePage {
                messages: Vec::new(),
                total: 0,
            }))
    }

    async fn upload_attachment(&self, upload: AttachmentUpload) -> Result<Message, HistoryError> {
        let mut inner = self.lock();
        inner.uploads.push(upload.clone());
        if let Some(error) = inner.fail_next_upload.take() {
            return Err(error);
        }

        inner.next_id += 1;
        let mut attachment = upload.attachment;
        attachment.filename = format!("{}-{}", inner.next_id, attachment.original_name);
        attachment.path = format!("/uploads/{}", attachment.filename);
        attachment.pending = false;

        Ok(Message {
            id: Some(MessageId::new(format!("upload-{}", inner.next_id))),
            correlation_id: Some(upload.correlation_id),
            channel_id: upload.channel_id,
            sender: inner
                .uploader
                .clone()
                .unwrap_or_else(|| UserRef::new("uploader", "uploader")),
            content: upload.content,
            attachment: Some(attachment),
            reactions: Default::default(),
            created_at: Utc::now(),
            reply_to: upload.reply_to,
            failed: false,
        })
    }
}
