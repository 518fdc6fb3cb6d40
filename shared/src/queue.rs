use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::capabilities::http::HttpMethod;
use crate::capabilities::kv::{KvError, KvKey, KvStore, TypedKvStore};

const MAX_ERROR_LENGTH: usize = 512;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

/// Validated mutation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(String);

impl MutationId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, QueueError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(QueueError::InvalidId("MutationId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(QueueError::InvalidId(format!(
                "MutationId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(QueueError::InvalidId(
                "MutationId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MutationMethod {
    Post,
    Put,
    Delete,
    Patch,
}

impl From<MutationMethod> for HttpMethod {
    fn from(method: MutationMethod) -> Self {
        match method {
            MutationMethod::Post => HttpMethod::Post,
            MutationMethod::Put => HttpMethod::Put,
            MutationMethod::Delete => HttpMethod::Delete,
            MutationMethod::Patch => HttpMethod::Patch,
        }
    }
}

impl TryFrom<HttpMethod> for MutationMethod {
    type Error = QueueError;

    fn try_from(method: HttpMethod) -> Result<Self, Self::Error> {
        match method {
            HttpMethod::Post => Ok(MutationMethod::Post),
            HttpMethod::Put => Ok(MutationMethod::Put),
            HttpMethod::Delete => Ok(MutationMethod::Delete),
            HttpMethod::Patch => Ok(MutationMethod::Patch),
            HttpMethod::Get => Err(QueueError::Validation(
                "GET requests are reads and cannot be queued".into(),
            )),
        }
    }
}

/// Marks a queued create whose entity currently carries a local id.
///
/// After a successful replay the server id is read from the response at
/// `id_pointer` (a JSON pointer) and replaces `local_id` everywhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRef {
    pub collection: String,
    pub local_id: String,
    #[serde(default = "default_id_pointer")]
    pub id_pointer: String,
}

fn default_id_pointer() -> String {
    "/id".to_string()
}

impl LocalRef {
    pub fn new(collection: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            local_id: local_id.into(),
            id_pointer: default_id_pointer(),
        }
    }

    pub fn with_id_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.id_pointer = pointer.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: MutationId,
    pub endpoint: String,
    pub method: MutationMethod,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub enqueued_at: UnixTimeMs,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_requires_auth")]
    pub requires_auth: bool,
    #[serde(default)]
    pub local_ref: Option<LocalRef>,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_requires_auth() -> bool {
    true
}

impl QueuedMutation {
    pub fn new(endpoint: impl Into<String>, method: MutationMethod, body: Option<Value>) -> Self {
        Self {
            id: MutationId::generate(),
            endpoint: endpoint.into(),
            method,
            body,
            headers: BTreeMap::new(),
            enqueued_at: UnixTimeMs::now(),
            attempts: 0,
            requires_auth: true,
            local_ref: None,
            last_error: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_local_ref(mut self, local_ref: LocalRef) -> Self {
        self.local_ref = Some(local_ref);
        self
    }

    pub fn with_requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    /// Replaces a locally generated id with the server-issued one in the
    /// endpoint path and in any JSON string of the body. Returns whether
    /// anything changed.
    pub fn rewrite_id(&mut self, from: &str, to: &str) -> bool {
        if from.is_empty() || from == to {
            return false;
        }

        let (path, query) = match self.endpoint.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.endpoint.as_str(), None),
        };

        let mut changed = false;
        let rewritten: Vec<&str> = path
            .split('/')
            .map(|segment| {
                if segment == from {
                    changed = true;
                    to
                } else {
                    segment
                }
            })
            .collect();

        if changed {
            let mut endpoint = rewritten.join("/");
            if let Some(query) = query {
                endpoint.push('?');
                endpoint.push_str(query);
            }
            self.endpoint = endpoint;
        }

        if let Some(body) = self.body.as_mut() {
            changed |= replace_strings(body, from, to);
        }

        changed
    }
}

fn replace_strings(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) if s == from => {
            *s = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |acc, item| replace_strings(item, from, to) | acc),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |acc, item| replace_strings(item, from, to) | acc),
        _ => false,
    }
}

/// A mutation that exhausted its replay attempts, kept for manual intervention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedMutation {
    pub mutation: QueuedMutation,
    pub failed_at: UnixTimeMs,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// Still at the head, to be retried by a later drain.
    Retained { attempts: u32 },
    /// Moved out of the pending queue into the failed-sync list.
    Exhausted(FailedMutation),
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("mutation queue is full ({0} entries)")]
    Full(usize),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("mutation not found: {0}")]
    NotFound(MutationId),

    #[error("mutation {expected} is not at the head of the queue")]
    NotHead { expected: MutationId },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_entries: usize,
    /// Replay attempts before a mutation is surfaced as failed.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_attempts: 3,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_entries == 0 {
            return Err(QueueError::Validation("max_entries must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::Validation("max_attempts must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU64,
    pub replayed: AtomicU64,
    pub requeued: AtomicU64,
    pub exhausted: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub replayed: u64,
    pub requeued: u64,
    pub exhausted: u64,
    pub storage_errors: u64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedMutation>,
    failed: Vec<FailedMutation>,
}

/// Durable FIFO of writes the server has not seen yet.
///
/// The in-memory deque is authoritative. Every change is written through to
/// the [`KvStore`] before the call returns, and rolled back in memory if the
/// write fails.
pub struct MutationQueue {
    store: Arc<dyn KvStore>,
    config: QueueConfig,
    pending_snapshot: TypedKvStore<VecDeque<QueuedMutation>>,
    failed_snapshot: TypedKvStore<Vec<FailedMutation>>,
    state: Mutex<QueueState>,
    metrics: QueueMetrics,
}

impl MutationQueue {
    /// Rehydrates the queue and the failed-sync list from durable storage.
    #[instrument(skip(store, config))]
    pub async fn open(store: Arc<dyn KvStore>, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let pending_snapshot = TypedKvStore::new(KvKey::mutation_queue());
        let failed_snapshot = TypedKvStore::new(KvKey::sync_failures());

        let pending: VecDeque<QueuedMutation> = pending_snapshot
            .load(store.as_ref())
            .await?
            .unwrap_or_default();
        let failed: Vec<FailedMutation> = failed_snapshot
            .load(store.as_ref())
            .await?
            .unwrap_or_default();

        info!(
            pending = pending.len(),
            failed = failed.len(),
            "Mutation queue rehydrated"
        );

        Ok(Self {
            store,
            config,
            pending_snapshot,
            failed_snapshot,
            state: Mutex::new(QueueState { pending, failed }),
            metrics: QueueMetrics::default(),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn persist_pending(&self, pending: &VecDeque<QueuedMutation>) -> Result<(), QueueError> {
        self.pending_snapshot
            .save(self.store.as_ref(), pending)
            .await
            .map_err(|e| {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!("Failed to persist mutation queue: {}", e);
                QueueError::Storage(e)
            })
    }

    async fn persist_failed(&self, failed: &Vec<FailedMutation>) -> Result<(), QueueError> {
        self.failed_snapshot
            .save(self.store.as_ref(), failed)
            .await
            .map_err(|e| {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!("Failed to persist sync failures: {}", e);
                QueueError::Storage(e)
            })
    }

    /// Appends to the tail. Identical mutations are kept; replay order decides.
    #[instrument(skip(self, mutation), fields(mutation_id = %mutation.id, endpoint = %mutation.endpoint))]
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if state.pending.len() >= self.config.max_entries {
            return Err(QueueError::Full(self.config.max_entries));
        }

        // Memory first
        state.pending.push_back(mutation);

        // Then persist - rollback on failure
        if let Err(e) = self.persist_pending(&state.pending).await {
            state.pending.pop_back();
            return Err(e);
        }

        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        info!(depth = state.pending.len(), "Mutation queued");
        Ok(())
    }

    pub async fn peek_head(&self) -> Option<QueuedMutation> {
        self.state.lock().await.pending.front().cloned()
    }

    #[instrument(skip(self))]
    pub async fn dequeue_head(&self) -> Result<Option<QueuedMutation>, QueueError> {
        let mut state = self.state.lock().await;

        let Some(head) = state.pending.pop_front() else {
            return Ok(None);
        };

        if let Err(e) = self.persist_pending(&state.pending).await {
            state.pending.push_front(head);
            return Err(e);
        }

        Ok(Some(head))
    }

    /// Removes the replayed head. When the replay resolved a local id, every
    /// later entry referencing it is rewritten in the same persisted write.
    #[instrument(skip(self), fields(mutation_id = %id))]
    pub async fn complete_head(
        &self,
        id: &MutationId,
        rename: Option<(&str, &str)>,
    ) -> Result<QueuedMutation, QueueError> {
        let mut state = self.state.lock().await;

        if state.pending.front().map(|m| &m.id) != Some(id) {
            return Err(QueueError::NotHead {
                expected: id.clone(),
            });
        }

        let mut next = state.pending.clone();
        let Some(completed) = next.pop_front() else {
            return Err(QueueError::NotFound(id.clone()));
        };

        if let Some((from, to)) = rename {
            let rewritten = next
                .iter_mut()
                .map(|m| m.rewrite_id(from, to))
                .filter(|changed| *changed)
                .count();
            if rewritten > 0 {
                info!(from, to, rewritten, "Rewrote local id in queued mutations");
            }
        }

        self.persist_pending(&next).await?;
        state.pending = next;

        self.metrics.replayed.fetch_add(1, Ordering::Relaxed);
        Ok(completed)
    }

    /// Records a failed replay of the head entry.
    #[instrument(skip(self, error), fields(mutation_id = %id))]
    pub async fn requeue_at_head(
        &self,
        id: &MutationId,
        error: impl Into<String>,
    ) -> Result<RequeueOutcome, QueueError> {
        let mut reason = error.into();
        truncate_utf8_safe(&mut reason, MAX_ERROR_LENGTH);

        let mut state = self.state.lock().await;

        let Some(head) = state.pending.front() else {
            return Err(QueueError::NotFound(id.clone()));
        };
        if &head.id != id {
            return Err(QueueError::NotHead {
                expected: id.clone(),
            });
        }

        let mut updated = head.clone();
        updated.attempts = updated.attempts.saturating_add(1);
        updated.last_error = Some(reason.clone());

        if updated.attempts < self.config.max_attempts {
            let previous = std::mem::replace(&mut state.pending[0], updated);
            if let Err(e) = self.persist_pending(&state.pending).await {
                state.pending[0] = previous;
                return Err(e);
            }

            self.metrics.requeued.fetch_add(1, Ordering::Relaxed);
            let attempts = state.pending[0].attempts;
            warn!(attempts, max = self.config.max_attempts, "Replay failed, kept at head");
            return Ok(RequeueOutcome::Retained { attempts });
        }

        let failed = FailedMutation {
            mutation: updated,
            failed_at: UnixTimeMs::now(),
            reason,
        };

        // Failure list first: a crash in between duplicates the entry rather
        // than losing it.
        state.failed.push(failed.clone());
        if let Err(e) = self.persist_failed(&state.failed).await {
            state.failed.pop();
            return Err(e);
        }

        let removed = state.pending.pop_front();
        if let Err(e) = self.persist_pending(&state.pending).await {
            if let Some(removed) = removed {
                state.pending.push_front(removed);
            }
            state.failed.pop();
            if let Err(restore) = self.persist_failed(&state.failed).await {
                error!("Failed to restore sync failures after rollback: {}", restore);
            }
            return Err(e);
        }

        self.metrics.exhausted.fetch_add(1, Ordering::Relaxed);
        warn!(
            attempts = failed.mutation.attempts,
            endpoint = %failed.mutation.endpoint,
            "Replay attempts exhausted, surfaced as failed sync"
        );
        Ok(RequeueOutcome::Exhausted(failed))
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }

    /// Pending mutations in replay order.
    pub async fn snapshot(&self) -> Vec<QueuedMutation> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    pub async fn failed(&self) -> Vec<FailedMutation> {
        self.state.lock().await.failed.clone()
    }

    /// Moves a failed mutation back to the tail with a fresh attempt budget.
    #[instrument(skip(self), fields(mutation_id = %id))]
    pub async fn retry_failed(&self, id: &MutationId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if state.pending.len() >= self.config.max_entries {
            return Err(QueueError::Full(self.config.max_entries));
        }

        let index = state
            .failed
            .iter()
            .position(|f| &f.mutation.id == id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let mut mutation = state.failed[index].mutation.clone();
        mutation.attempts = 0;
        mutation.last_error = None;

        state.pending.push_back(mutation);
        if let Err(e) = self.persist_pending(&state.pending).await {
            state.pending.pop_back();
            return Err(e);
        }

        let restored = state.failed.remove(index);
        if let Err(e) = self.persist_failed(&state.failed).await {
            // The retry is already durable in the pending queue; the stale
            // failure entry is dropped again on the next successful write.
            warn!("Failed to persist sync failures after retry: {}", e);
        }

        info!(endpoint = %restored.mutation.endpoint, "Failed mutation re-queued");
        Ok(())
    }

    #[instrument(skip(self), fields(mutation_id = %id))]
    pub async fn discard_failed(&self, id: &MutationId) -> Result<FailedMutation, QueueError> {
        let mut state = self.state.lock().await;

        let index = state
            .failed
            .iter()
            .position(|f| &f.mutation.id == id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let removed = state.failed.remove(index);
        if let Err(e) = self.persist_failed(&state.failed).await {
            state.failed.insert(index, removed);
            return Err(e);
        }

        info!(endpoint = %removed.mutation.endpoint, "Failed mutation discarded");
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKvStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    // Failure-injectable storage wrapper
    pub(crate) struct FailableStore {
        inner: MemoryKvStore,
        fail_writes: AtomicBool,
    }

    impl FailableStore {
        pub(crate) fn new() -> Self {
            Self {
                inner: MemoryKvStore::new(),
                fail_writes: AtomicBool::new(false),
            }
        }

        pub(crate) fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl KvStore for FailableStore {
        async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(KvError::storage(
                    crate::capabilities::kv::StorageErrorCode::IoError,
                    "Injected failure",
                ));
            }
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
            self.inner.delete(key).await
        }
    }

    fn post(endpoint: &str, body: Value) -> QueuedMutation {
        QueuedMutation::new(endpoint, MutationMethod::Post, Some(body))
    }

    async fn open_queue(store: Arc<dyn KvStore>, max_attempts: u32) -> MutationQueue {
        MutationQueue::open(
            store,
            QueueConfig {
                max_entries: 16,
                max_attempts,
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_mutation_id_validation() {
        assert!(MutationId::new("valid-id_123").is_ok());
        assert!(MutationId::new("").is_err());
        assert!(MutationId::new("has space").is_err());
        assert!(MutationId::new("a".repeat(129)).is_err());
        assert_eq!(MutationId::new("  trimmed ").unwrap().as_str(), "trimmed");
    }

    #[test]
    fn test_method_conversion() {
        assert!(MutationMethod::try_from(HttpMethod::Get).is_err());
        assert_eq!(
            MutationMethod::try_from(HttpMethod::Patch).unwrap(),
            MutationMethod::Patch
        );
        assert_eq!(HttpMethod::from(MutationMethod::Delete), HttpMethod::Delete);
    }

    #[test]
    fn test_method_serializes_uppercase() {
        let text = serde_json::to_string(&MutationMethod::Delete).unwrap();
        assert_eq!(text, "\"DELETE\"");
    }

    #[test]
    fn test_rewrite_id_in_path_and_body() {
        let mut m = post(
            "/watchlist/local-1-1/items?source=local-1-1",
            json!({"symbol": "NVDA", "watchlist_id": "local-1-1", "tags": ["local-1-1x"]}),
        );

        assert!(m.rewrite_id("local-1-1", "L9"));
        assert_eq!(m.endpoint, "/watchlist/L9/items?source=local-1-1");
        assert_eq!(m.body.as_ref().unwrap()["watchlist_id"], "L9");
        assert_eq!(m.body.as_ref().unwrap()["tags"][0], "local-1-1x");
    }

    #[test]
    fn test_rewrite_id_ignores_partial_segments() {
        let mut m = post("/watchlist/local-1-10/items", json!({}));
        assert!(!m.rewrite_id("local-1-1", "L9"));
        assert_eq!(m.endpoint, "/watchlist/local-1-10/items");
    }

    #[test]
    fn test_truncate_utf8_safe() {
        let mut s = "héllo".to_string();
        truncate_utf8_safe(&mut s, 2);
        assert_eq!(s, "h");
    }

    #[test]
    fn test_config_validation() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(QueueConfig {
            max_attempts: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[tokio::test]
    async fn test_enqueue_persists_immediately() {
        let store = Arc::new(MemoryKvStore::new());
        let queue = open_queue(store.clone(), 3).await;

        queue.enqueue(post("/watchlist", json!({"name": "A"}))).await.unwrap();

        let raw = store.get(&KvKey::mutation_queue()).await.unwrap().unwrap();
        let persisted: Vec<QueuedMutation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].endpoint, "/watchlist");
    }

    #[tokio::test]
    async fn test_fifo_without_dedup() {
        let queue = open_queue(Arc::new(MemoryKvStore::new()), 3).await;

        let a = post("/watchlist/1/items", json!({"symbol": "NVDA"}));
        let b = post("/watchlist/1/items", json!({"symbol": "NVDA"}));
        let (a_id, b_id) = (a.id.clone(), b.id.clone());

        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.dequeue_head().await.unwrap().unwrap().id, a_id);
        assert_eq!(queue.peek_head().await.unwrap().id, b_id);
    }

    #[tokio::test]
    async fn test_enqueue_rolls_back_on_storage_failure() {
        let store = Arc::new(FailableStore::new());
        let queue = open_queue(store.clone(), 3).await;

        store.set_fail_writes(true);
        let result = queue.enqueue(post("/watchlist", json!({}))).await;

        assert!(matches!(result, Err(QueueError::Storage(_))));
        assert!(queue.is_empty().await);
        assert_eq!(queue.metrics().storage_errors, 1);
    }

    #[tokio::test]
    async fn test_dequeue_rolls_back_on_storage_failure() {
        let store = Arc::new(FailableStore::new());
        let queue = open_queue(store.clone(), 3).await;
        queue.enqueue(post("/watchlist", json!({}))).await.unwrap();

        store.set_fail_writes(true);
        assert!(queue.dequeue_head().await.is_err());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_enforced() {
        let queue = MutationQueue::open(
            Arc::new(MemoryKvStore::new()),
            QueueConfig {
                max_entries: 1,
                max_attempts: 3,
            },
        )
        .await
        .unwrap();

        queue.enqueue(post("/a", json!({}))).await.unwrap();
        let result = queue.enqueue(post("/b", json!({}))).await;
        assert!(matches!(result, Err(QueueError::Full(1))));
    }

    #[tokio::test]
    async fn test_requeue_increments_attempts() {
        let queue = open_queue(Arc::new(MemoryKvStore::new()), 3).await;
        let m = post("/watchlist", json!({}));
        let id = m.id.clone();
        queue.enqueue(m).await.unwrap();

        let outcome = queue.requeue_at_head(&id, "HTTP 500").await.unwrap();

        assert_eq!(outcome, RequeueOutcome::Retained { attempts: 1 });
        let head = queue.peek_head().await.unwrap();
        assert_eq!(head.attempts, 1);
        assert_eq!(head.last_error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn test_requeue_exhaustion_moves_to_failed() {
        let store = Arc::new(MemoryKvStore::new());
        let queue = open_queue(store.clone(), 2).await;
        let first = post("/watchlist/9", json!({}));
        let second = post("/watchlist/10", json!({}));
        let id = first.id.clone();
        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        queue.requeue_at_head(&id, "HTTP 500").await.unwrap();
        let outcome = queue.requeue_at_head(&id, "HTTP 500").await.unwrap();

        match outcome {
            RequeueOutcome::Exhausted(failed) => {
                assert_eq!(failed.mutation.id, id);
                assert_eq!(failed.mutation.attempts, 2);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.peek_head().await.unwrap().endpoint, "/watchlist/10");
        assert_eq!(queue.failed().await.len(), 1);
        assert!(store.get(&KvKey::sync_failures()).await.unwrap().is_some());
        assert_eq!(queue.metrics().exhausted, 1);
    }

    #[tokio::test]
    async fn test_requeue_rejects_non_head() {
        let queue = open_queue(Arc::new(MemoryKvStore::new()), 3).await;
        let first = post("/a", json!({}));
        let second = post("/b", json!({}));
        let second_id = second.id.clone();
        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        let result = queue.requeue_at_head(&second_id, "boom").await;
        assert!(matches!(result, Err(QueueError::NotHead { .. })));
    }

    #[tokio::test]
    async fn test_complete_head_rewrites_later_entries() {
        let store = Arc::new(MemoryKvStore::new());
        let queue = open_queue(store.clone(), 3).await;

        let create = post("/watchlist", json!({"name": "AI Longs"}))
            .with_local_ref(LocalRef::new("watchlists", "local-5-1"));
        let add = post("/watchlist/local-5-1/items", json!({"symbol": "NVDA"}));
        let create_id = create.id.clone();
        queue.enqueue(create).await.unwrap();
        queue.enqueue(add).await.unwrap();

        queue
            .complete_head(&create_id, Some(("local-5-1", "L9")))
            .await
            .unwrap();

        assert_eq!(queue.peek_head().await.unwrap().endpoint, "/watchlist/L9/items");

        let reopened = open_queue(store, 3).await;
        assert_eq!(
            reopened.peek_head().await.unwrap().endpoint,
            "/watchlist/L9/items"
        );
    }

    #[tokio::test]
    async fn test_complete_head_requires_head() {
        let queue = open_queue(Arc::new(MemoryKvStore::new()), 3).await;
        let result = queue.complete_head(&MutationId::generate(), None).await;
        assert!(matches!(result, Err(QueueError::NotHead { .. })));
    }

    #[tokio::test]
    async fn test_persistence_across_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let ids: Vec<MutationId> = {
            let queue = open_queue(store.clone(), 3).await;
            let mut ids = Vec::new();
            for i in 0..5 {
                let m = post(&format!("/watchlist/{i}/items"), json!({"symbol": "AMD"}));
                ids.push(m.id.clone());
                queue.enqueue(m).await.unwrap();
            }
            ids
        };

        let queue = open_queue(store, 3).await;
        let restored: Vec<MutationId> = queue.snapshot().await.into_iter().map(|m| m.id).collect();
        assert_eq!(restored, ids);
    }

    #[tokio::test]
    async fn test_retry_and_discard_failed() {
        let queue = open_queue(Arc::new(MemoryKvStore::new()), 1).await;
        let a = post("/a", json!({}));
        let b = post("/b", json!({}));
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        queue.enqueue(a).await.unwrap();
        queue.requeue_at_head(&a_id, "HTTP 400").await.unwrap();
        queue.enqueue(b).await.unwrap();
        queue.requeue_at_head(&b_id, "HTTP 400").await.unwrap();
        assert_eq!(queue.failed().await.len(), 2);

        queue.retry_failed(&a_id).await.unwrap();
        let head = queue.peek_head().await.unwrap();
        assert_eq!(head.id, a_id);
        assert_eq!(head.attempts, 0);
        assert!(head.last_error.is_none());

        let discarded = queue.discard_failed(&b_id).await.unwrap();
        assert_eq!(discarded.mutation.endpoint, "/b");
        assert!(queue.failed().await.is_empty());
        assert!(matches!(
            queue.discard_failed(&b_id).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
