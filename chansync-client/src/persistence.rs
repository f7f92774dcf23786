//! Durable local-only state.
//!
//! Two records survive reloads: the last active channel id, and each
//! channel's list of locally synthesized system notices. Neither exists on
//! the server. Any key-value store can back them through
//! [`PersistenceAdapter`].

use async_trait::async_trait;
use chansync_types::{ChannelId, SystemNotice};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::PersistenceConfig;

/// Key of the last active channel record.
pub const LAST_ACTIVE_CHANNEL_KEY: &str = "lastActiveChannelId";

/// File name used by [`FilePersistence`] inside its directory.
pub const STATE_FILE_NAME: &str = "chansync-state.json";

/// Key of a channel's notice list.
pub fn notices_key(channel_id: &ChannelId) -> String {
    format!("systemNotices:{}", channel_id)
}

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Reading or writing the backing file failed.
    #[error("state file {path}: {source}")]
    Io {
        /// Path of the state file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A stored value could not be (de)serialized.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Narrow key-value store for local state.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn save(&self, key: &str, value: Value) -> Result<(), PersistenceError>;

    /// Load the value stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<Value>, PersistenceError>;
}

/// Volatile in-memory store.
#[derive(Debug, Default, Clone)]
pub struct MemoryPersistence {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn save(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        Ok(self.values.lock().await.get(key).cloned())
    }
}

/// Store backed by one JSON object in a file.
///
/// Every save rewrites the file through a temporary sibling and a rename.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FilePersistence {
    /// Use [`STATE_FILE_NAME`] inside `directory`.
    pub fn in_directory(directory: &Path) -> Self {
        Self::new(directory.join(STATE_FILE_NAME))
    }

    /// Use the given file path.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, Value>, PersistenceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn save(&self, key: &str, value: Value) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock().await;
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let bytes = serde_json::to_vec_pretty(&values)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    async fn load(&self, key: &str) -> Result<Option<Value>, PersistenceError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }
}

/// Build the adapter selected by configuration.
///
/// A configured directory gets a [`FilePersistence`]; otherwise state lives in
/// memory for the lifetime of the process.
pub fn adapter_for(config: &PersistenceConfig) -> Arc<dyn PersistenceAdapter> {
    match &config.directory {
        Some(directory) => Arc::new(FilePersistence::in_directory(directory)),
        None => Arc::new(MemoryPersistence::new()),
    }
}

/// Typed access to the two local records.
///
/// Clones share one notice lock, so read-modify-write of a notice list is
/// serialized across every handle built from the same state.
#[derive(Clone)]
pub struct LocalState {
    adapter: Arc<dyn PersistenceAdapter>,
    notices_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for LocalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalState").finish_non_exhaustive()
    }
}

impl LocalState {
    /// Wrap an adapter.
    pub fn new(adapter: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            adapter,
            notices_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Overwrite the last active channel.
    pub async fn save_last_active_channel(
        &self,
        channel_id: &ChannelId,
    ) -> Result<(), PersistenceError> {
        self.adapter
            .save(LAST_ACTIVE_CHANNEL_KEY, serde_json::to_value(channel_id)?)
            .await
    }

    /// The last active channel, if one was saved.
    pub async fn load_last_active_channel(&self) -> Result<Option<ChannelId>, PersistenceError> {
        match self.adapter.load(LAST_ACTIVE_CHANNEL_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// A channel's persisted notices, oldest first.
    pub async fn load_notices(
        &self,
        channel_id: &ChannelId,
    ) -> Result<Vec<SystemNotice>, PersistenceError> {
        match self.adapter.load(&notices_key(channel_id)).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Replace a channel's persisted notices.
    pub async fn save_notices(
        &self,
        channel_id: &ChannelId,
        notices: &[SystemNotice],
    ) -> Result<(), PersistenceError> {
        let _guard = self.notices_lock.lock().await;
        self.write_notices(channel_id, notices).await
    }

    /// Append one notice to its channel's list.
    ///
    /// The load and the save happen under the notice lock; concurrent appends
    /// never overwrite each other.
    pub async fn append_notice(&self, notice: &SystemNotice) -> Result<(), PersistenceError> {
        let _guard = self.notices_lock.lock().await;
        let mut notices = self.load_notices(&notice.channel_id).await?;
        if notices.iter().any(|n| n.id == notice.id) {
            return Ok(());
        }
        notices.push(notice.clone());
        self.write_notices(&notice.channel_id, &notices).await
    }

    async fn write_notices(
        &self,
        channel_id: &ChannelId,
        notices: &[SystemNotice],
    ) -> Result<(), PersistenceError> {
        self.adapter
            .save(&notices_key(channel_id), serde_json::to_value(notices)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chansync_types::NoticeKind;
    use chrono::{TimeZone, Utc};

    fn notice(username: &str) -> SystemNotice {
        SystemNotice::new(
            NoticeKind::Join,
            username,
            ChannelId::from("c1"),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn notice_keys_are_per_channel() {
        assert_eq!(notices_key(&"general".into()), "systemNotices:general");
    }

    #[tokio::test]
    async fn memory_round_trip() {
        let state = LocalState::new(Arc::new(MemoryPersistence::new()));
        assert_eq!(state.load_last_active_channel().await.unwrap(), None);

        state.save_last_active_channel(&"a".into()).await.unwrap();
        state.save_last_active_channel(&"b".into()).await.unwrap();

        assert_eq!(
            state.load_last_active_channel().await.unwrap(),
            Some(ChannelId::from("b"))
        );
    }

    #[tokio::test]
    async fn append_notice_skips_known_ids() {
        let state = LocalState::new(Arc::new(MemoryPersistence::new()));
        let first = notice("bob");

        state.append_notice(&first).await.unwrap();
        state.append_notice(&first).await.unwrap();
        state.append_notice(&notice("carol")).await.unwrap();

        let loaded = state.load_notices(&"c1".into()).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], first);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let state = LocalState::new(Arc::new(FilePersistence::in_directory(dir.path())));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    state.append_notice(&notice(&format!("user{i}"))).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let persisted = state.load_notices(&"c1".into()).await.unwrap();
        assert_eq!(persisted.len(), 8);
        let reopened = LocalState::new(Arc::new(FilePersistence::in_directory(dir.path())));
        assert_eq!(reopened.load_notices(&"c1".into()).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn file_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let state = LocalState::new(Arc::new(FilePersistence::in_directory(dir.path())));
            state.save_last_active_channel(&"general".into()).await.unwrap();
            state.append_notice(&notice("bob")).await.unwrap();
        }

        let reopened = LocalState::new(Arc::new(FilePersistence::in_directory(dir.path())));
        assert_eq!(
            reopened.load_last_active_channel().await.unwrap(),
            Some(ChannelId::from("general"))
        );
        assert_eq!(reopened.load_notices(&"c1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_uses_wire_key_names() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FilePersistence::in_directory(dir.path());
        let state = LocalState::new(Arc::new(FilePersistence::in_directory(dir.path())));
        state.save_last_active_channel(&"general".into()).await.unwrap();

        let raw: HashMap<String, Value> =
            serde_json::from_slice(&std::fs::read(adapter.path()).unwrap()).unwrap();
        assert_eq!(raw[LAST_ACTIVE_CHANNEL_KEY], Value::from("general"));
    }

    #[tokio::test]
    async fn configured_directory_selects_file_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            directory: Some(dir.path().to_path_buf()),
        };
        let state = LocalState::new(adapter_for(&config));
        state.save_last_active_channel(&"general".into()).await.unwrap();

        assert!(dir.path().join(STATE_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FilePersistence::in_directory(dir.path());
        std::fs::write(adapter.path(), b"{not json").unwrap();

        let result = adapter.load(LAST_ACTIVE_CHANNEL_KEY).await;
        assert!(matches!(result, Err(PersistenceError::Serialization(_))));
    }
}
