use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::capabilities::kv::{KvError, KvKey, KvStore, StorageErrorCode, MAX_VALUE_SIZE};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_SNAPSHOT_BYTES: usize = MAX_VALUE_SIZE + 4096;
const SNAPSHOT_MAGIC: &[u8; 4] = b"SHKV";
const SNAPSHOT_EXTENSION: &str = "snap";

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: String,
}

/// Directory of durable snapshots, one file per [`KvKey`].
///
/// Each file holds a CBOR envelope around the JSON payload. Writes go to a
/// temporary file that is synced and renamed over the target, so a crash
/// leaves either the previous snapshot or the new one.
#[derive(Debug, Clone)]
pub struct SnapshotDirStore {
    root: PathBuf,
}

impl SnapshotDirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &KvKey) -> PathBuf {
        self.root
            .join(format!("{}.{}", key.as_str(), SNAPSHOT_EXTENSION))
    }

    pub fn encode(payload: &str) -> Result<Vec<u8>, KvError> {
        if payload.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: payload.len(),
                max: MAX_VALUE_SIZE,
            });
        }

        let checksum = blake3::hash(payload.as_bytes());
        let envelope = SnapshotEnvelope {
            magic: *SNAPSHOT_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *checksum.as_bytes(),
            payload: payload.to_string(),
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: None,
        })?;
        Ok(bytes)
    }

    pub fn decode(key: &KvKey, bytes: &[u8]) -> Result<String, KvError> {
        if bytes.is_empty() {
            return Err(corrupted(key, "empty file"));
        }

        if bytes.len() > MAX_SNAPSHOT_BYTES {
            return Err(KvError::ValueTooLarge {
                size: bytes.len(),
                max: MAX_SNAPSHOT_BYTES,
            });
        }

        let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)
            .map_err(|e| corrupted(key, &format!("unreadable envelope: {e}")))?;

        if envelope.magic != *SNAPSHOT_MAGIC {
            return Err(corrupted(key, "invalid magic bytes"));
        }

        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(KvError::FutureSchema {
                key: key.to_string(),
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual = blake3::hash(envelope.payload.as_bytes());
        if actual.as_bytes() != &envelope.checksum {
            return Err(corrupted(
                key,
                &format!(
                    "integrity check failed: expected {}, got {}",
                    hex::encode(envelope.checksum),
                    hex::encode(actual.as_bytes())
                ),
            ));
        }

        Ok(envelope.payload)
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), KvError> {
        let tmp_path = path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, path)?;

        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

fn corrupted(key: &KvKey, reason: &str) -> KvError {
    KvError::Corrupted {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl KvStore for SnapshotDirStore {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match Self::decode(key, &bytes) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) => {
                warn!(key = %key, error = %e, "Rejected snapshot on load");
                Err(e)
            }
        }
    }

    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        let bytes = Self::encode(&value)?;
        let path = self.path_for(key);
        Self::write_atomic(&path, &bytes).map_err(|e| {
            error!(key = %key, error = %e, "Snapshot write failed");
            match e {
                KvError::Storage { message, .. } if message.contains("No space") => {
                    KvError::storage(StorageErrorCode::DiskFull, message)
                }
                other => other,
            }
        })?;
        debug!(key = %key, bytes = bytes.len(), "Snapshot written");
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
