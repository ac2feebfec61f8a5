//! Policy persistence
//!
//! [`KeyValueStore`] is the raw backend (last write wins per key).
//! [`PolicyStore`] layers the policy document on top of it: every write runs
//! as a read-merge-write under one lock and bumps a revision observers can
//! watch.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::sync::watch;
use tg_core::PolicyState;

use crate::clock::Clock;

/// Key the policy document lives under.
pub const POLICY_KEY: &str = "policy";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

// =============================================================================
// Backends
// =============================================================================

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

/// All keys in one JSON object on disk. Values must themselves be JSON.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a `.tmp` sibling and rename.
    async fn write_all(&self, entries: &BTreeMap<String, serde_json::Value>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        let entries = self.read_all().await?;
        entries
            .get(key)
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::from)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let value: serde_json::Value = serde_json::from_str(&value)?;
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value);
        self.write_all(&entries).await
    }
}

// =============================================================================
// Policy Store
// =============================================================================

/// Serialized access to the persisted [`PolicyState`].
pub struct PolicyStore {
    backend: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    write_lock: tokio::sync::Mutex<()>,
    revision: watch::Sender<u64>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("clock", &self.clock)
            .field("revision", &*self.revision.borrow())
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            backend,
            clock,
            write_lock: tokio::sync::Mutex::new(()),
            revision,
        }
    }

    pub fn now(&self) -> tg_core::Timestamp {
        self.clock.now()
    }

    /// Latest persisted state. A missing document reads as the default policy.
    pub async fn load(&self) -> Result<PolicyState, StoreError> {
        match self.backend.get(POLICY_KEY).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(PolicyState::default()),
        }
    }

    /// Apply `merge` to the latest state and persist it.
    ///
    /// Updates are serialized, so concurrent callers each see the previous
    /// caller's result. Expired pauses are evicted on the way out. Returns
    /// the new state and its revision.
    pub async fn update<F>(&self, merge: F) -> Result<(PolicyState, u64), StoreError>
    where
        F: FnOnce(&mut PolicyState),
    {
        let _guard = self.write_lock.lock().await;

        let mut state = self.load().await?;
        merge(&mut state);
        state.evict_expired(self.clock.now());

        let json = serde_json::to_string(&state)?;
        self.backend.set(POLICY_KEY, json).await?;

        self.revision.send_modify(|revision| *revision += 1);
        let revision = *self.revision.borrow();
        debug!("Policy state persisted at revision {}", revision);

        Ok((state, revision))
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tg_core::PauseExpiry;

    fn memory_store(now: u64) -> PolicyStore {
        PolicyStore::new(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(now)))
    }

    #[tokio::test]
    async fn missing_document_is_default_policy() {
        let store = memory_store(0);
        assert_eq!(store.load().await.unwrap(), PolicyState::default());
        assert_eq!(store.revision(), 0);
    }

    #[tokio::test]
    async fn update_persists_and_bumps_revision() {
        let store = memory_store(0);
        let mut rx = store.subscribe();

        let (state, revision) = store
            .update(|s| s.pause("example.com", PauseExpiry::Forever))
            .await
            .unwrap();
        assert_eq!(revision, 1);
        assert!(state.is_paused("example.com", 0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn update_evicts_expired_pauses() {
        let clock = Arc::new(ManualClock::new(0));
        let store = PolicyStore::new(Arc::new(MemoryStore::new()), clock.clone());
        store
            .update(|s| s.pause("a.com", PauseExpiry::Until(100)))
            .await
            .unwrap();

        clock.set(100);
        let (state, _) = store.update(|s| s.pause("b.com", PauseExpiry::Forever)).await.unwrap();
        assert_eq!(state.paused.keys().collect::<Vec<_>>(), vec!["b.com"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_all_kept() {
        let store = Arc::new(memory_store(0));
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(move |s| {
                        s.disable_redirect_protection_for(&format!("host{i}.example"));
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let state = store.load().await.unwrap();
        assert_eq!(state.redirect_protection.disabled.len(), 16);
        assert_eq!(store.revision(), 16);
    }

    #[tokio::test]
    async fn json_file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trackguard.json");

        let store = PolicyStore::new(Arc::new(JsonFileStore::new(&path)), Arc::new(ManualClock::new(0)));
        store
            .update(|s| {
                s.disable_redirect_protection_for("t.co");
            })
            .await
            .unwrap();

        let reopened = PolicyStore::new(Arc::new(JsonFileStore::new(&path)), Arc::new(ManualClock::new(0)));
        let state = reopened.load().await.unwrap();
        assert!(state.is_redirect_protection_disabled_for("t.co"));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"policy\""));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn json_file_store_rejects_non_json_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("kv.json"));
        assert!(matches!(store.set("k", "not json".into()).await, Err(StoreError::Json(_))));
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
