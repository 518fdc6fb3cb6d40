use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 128;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

pub const MUTATION_QUEUE_KEY: &str = "mutation_queue";
pub const SYNC_FAILURES_KEY: &str = "sync_failures";
pub const AUTH_TOKEN_KEY: &str = "auth_token";
pub const AUTH_USER_KEY: &str = "auth_user";
pub const SHADOW_KEY_PREFIX: &str = "shadow_";

/// Fixed logical name of a persisted snapshot.
///
/// Keys double as file names in [`crate::offline_store::SnapshotDirStore`], so
/// they are restricted to ASCII alphanumerics, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KvKey(String);

impl KvKey {
    pub fn new(name: impl Into<String>) -> Result<Self, KvError> {
        let name = name.into();
        Self::validate_key(&name)?;
        Ok(Self(name))
    }

    pub fn mutation_queue() -> Self {
        Self(MUTATION_QUEUE_KEY.to_string())
    }

    pub fn sync_failures() -> Self {
        Self(SYNC_FAILURES_KEY.to_string())
    }

    pub fn auth_token() -> Self {
        Self(AUTH_TOKEN_KEY.to_string())
    }

    pub fn auth_user() -> Self {
        Self(AUTH_USER_KEY.to_string())
    }

    /// `shadow_<collection>`
    pub fn shadow(collection: &str) -> Result<Self, KvError> {
        Self::new(format!("{SHADOW_KEY_PREFIX}{collection}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.starts_with('-') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with '-'".to_string(),
            });
        }

        if let Some(c) = key
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: format!("invalid character '{}' in key", c.escape_default()),
            });
        }

        Ok(())
    }
}

impl std::fmt::Display for KvKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },

    #[error("corrupted snapshot '{key}': {reason}")]
    Corrupted { key: String, reason: String },

    #[error("snapshot '{key}' has schema version {found}, newer than supported {max}")]
    FutureSchema { key: String, found: u32, max: u32 },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            KvError::Corrupted { .. } | KvError::FutureSchema { .. }
        )
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => {
                StorageErrorCode::Busy
            }
            _ => StorageErrorCode::IoError,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Durable client-local key-value storage.
///
/// Values are JSON text. `set` must not return until the value is durable;
/// the queue and shadow store rely on that to never observe partial writes.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError>;

    /// Returns whether a value existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
}

/// Volatile store for tests and sessions that opt out of persistence.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    values: RwLock<HashMap<KvKey, String>>,
    writes: AtomicU64,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls since construction.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn keys(&self) -> Vec<KvKey> {
        let mut keys: Vec<KvKey> = self.values.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        self.values.write().await.insert(key.clone(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        Ok(self.values.write().await.remove(key).is_some())
    }
}

/// A single JSON snapshot bound to one key.
pub struct TypedKvStore<T> {
    key: KvKey,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> TypedKvStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(key: KvKey) -> Self {
        Self {
            key,
            _phantom: PhantomData,
        }
    }

    pub fn key(&self) -> &KvKey {
        &self.key
    }

    pub fn encode(&self, value: &T) -> Result<String, KvError> {
        let text = serde_json::to_string(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(self.key.to_string()),
        })?;
        if text.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: text.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        Ok(text)
    }

    pub fn decode(&self, text: &str) -> Result<T, KvError> {
        serde_json::from_str(text).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(self.key.to_string()),
        })
    }

    pub async fn load(&self, store: &dyn KvStore) -> Result<Option<T>, KvError> {
        match store.get(&self.key).await? {
            Some(text) => self.decode(&text).map(Some),
            None => Ok(None),
        }
    }

    pub async fn save(&self, store: &dyn KvStore, value: &T) -> Result<(), KvError> {
        let text = self.encode(value)?;
        store.set(&self.key, text).await
    }

    pub async fn clear(&self, store: &dyn KvStore) -> Result<bool, KvError> {
        store.delete(&self.key).await
    }
}
