//! TTL-bearing document storage for workflow sessions.
//!
//! Documents are opaque JSON bodies stamped with a version. `put_if_version` only succeeds when
//! the stored version still matches what the caller read, which is how the session manager
//! keeps concurrent read-modify-write cycles from losing updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Clone, Debug, PartialEq)]
pub struct VersionedDocument {
    pub body: Value,
    pub version: u64,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("concurrent write to `{key}`: expected version {expected}, found {actual}")]
    VersionConflict { key: String, expected: u64, actual: u64 },
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("stored document could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Unconditional upsert. Returns the new version.
    async fn put(&self, key: &str, body: &Value, ttl: Duration) -> Result<u64, StoreError>;

    /// Upsert only if the live document's version equals `expected_version`; an absent or
    /// expired document has version 0. Returns the new version.
    async fn put_if_version(
        &self,
        key: &str,
        body: &Value,
        expected_version: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<VersionedDocument>, StoreError>;

    /// Returns whether a live document was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Adds or refreshes a member of an owner's index set.
    async fn add_to_index(&self, owner_key: &str, member: &str, ttl: Duration)
        -> Result<(), StoreError>;

    async fn remove_from_index(&self, owner_key: &str, member: &str) -> Result<(), StoreError>;

    async fn list_index(&self, owner_key: &str) -> Result<Vec<String>, StoreError>;

    async fn delete_index(&self, owner_key: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Deletes expired documents and index members. Returns the number removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

struct StoredEntry {
    body: Value,
    version: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, StoredEntry>,
    indexes: HashMap<String, HashMap<String, Instant>>,
}

impl MemoryState {
    fn live_version(&mut self, key: &str, now: Instant) -> u64 {
        match self.documents.get(key) {
            Some(entry) if entry.expires_at > now => entry.version,
            Some(_) => {
                self.documents.remove(key);
                0
            }
            None => 0,
        }
    }

    fn prune(&mut self, now: Instant) -> u64 {
        let before = self.documents.len();
        self.documents.retain(|_, entry| entry.expires_at > now);
        let mut removed = before - self.documents.len();

        for members in self.indexes.values_mut() {
            let before = members.len();
            members.retain(|_, expires_at| *expires_at > now);
            removed += before - members.len();
        }
        self.indexes.retain(|_, members| !members.is_empty());

        removed as u64
    }

    fn write(&mut self, key: &str, body: &Value, version: u64, expires_at: Instant) {
        self.documents
            .insert(key.to_string(), StoredEntry { body: body.clone(), version, expires_at });
    }
}

/// Process-local store. Reads hide expired entries; every write and `purge_expired` drop them.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live documents, for diagnostics and tests.
    pub async fn document_count(&self) -> usize {
        let now = Instant::now();
        let state = self.state.read().await;
        state.documents.values().filter(|entry| entry.expires_at > now).count()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put(&self, key: &str, body: &Value, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.prune(now);
        let version = state.live_version(key, now) + 1;
        state.write(key, body, version, now + ttl);
        Ok(version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        body: &Value,
        expected_version: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.prune(now);
        let actual = state.live_version(key, now);
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = actual + 1;
        state.write(key, body, version, now + ttl);
        Ok(version)
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedDocument>, StoreError> {
        let now = Instant::now();
        let state = self.state.read().await;
        Ok(state
            .documents
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| VersionedDocument { body: entry.body.clone(), version: entry.version }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        Ok(state.documents.remove(key).is_some_and(|entry| entry.expires_at > now))
    }

    async fn add_to_index(
        &self,
        owner_key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        let mut state = self.state.write().await;
        state.indexes.entry(owner_key.to_string()).or_default().insert(member.to_string(), expires_at);
        Ok(())
    }

    async fn remove_from_index(&self, owner_key: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(members) = state.indexes.get_mut(owner_key) {
            members.remove(member);
            if members.is_empty() {
                state.indexes.remove(owner_key);
            }
        }
        Ok(())
    }

    async fn list_index(&self, owner_key: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let state = self.state.read().await;
        let mut members: Vec<String> = state
            .indexes
            .get(owner_key)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn delete_index(&self, owner_key: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.indexes.remove(owner_key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.prune(Instant::now()))
    }
}
