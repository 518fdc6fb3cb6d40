//! Client-local mirror of server collections.
//!
//! Each collection is an ordered list of JSON objects keyed by their `id`
//! field, persisted as one snapshot under `shadow_<collection>`. Reads are
//! served from memory; every change is written through before it becomes
//! visible.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};

use crate::capabilities::kv::{KvError, KvKey, KvStore, TypedKvStore};
use crate::model::EntityId;

#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("entity in {collection} has no usable id")]
    MissingId { collection: String },

    #[error("shadow entities must be JSON objects")]
    NotAnObject,

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

/// A change to shadow state, either the local intent of a queued mutation or
/// a refresh derived from a live response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ShadowOp {
    Upsert {
        collection: String,
        entity: Value,
    },
    /// Shallow-merges `fields` into an existing entity. Missing entities are left alone.
    Merge {
        collection: String,
        id: EntityId,
        fields: Map<String, Value>,
    },
    Remove {
        collection: String,
        id: EntityId,
    },
    ReplaceAll {
        collection: String,
        entities: Vec<Value>,
    },
    /// Pushes onto a list-valued field. With `unique_key`, an element whose
    /// key matches an existing one is skipped.
    AppendToField {
        collection: String,
        id: EntityId,
        field: String,
        element: Value,
        unique_key: Option<String>,
    },
    RemoveFromField {
        collection: String,
        id: EntityId,
        field: String,
        key: String,
        value: Value,
    },
    MergeInField {
        collection: String,
        id: EntityId,
        field: String,
        key: String,
        value: Value,
        fields: Map<String, Value>,
    },
}

impl ShadowOp {
    pub fn collection(&self) -> &str {
        match self {
            ShadowOp::Upsert { collection, .. }
            | ShadowOp::Merge { collection, .. }
            | ShadowOp::Remove { collection, .. }
            | ShadowOp::ReplaceAll { collection, .. }
            | ShadowOp::AppendToField { collection, .. }
            | ShadowOp::RemoveFromField { collection, .. }
            | ShadowOp::MergeInField { collection, .. } => collection,
        }
    }
}

fn entity_id(entity: &Value) -> Option<EntityId> {
    entity.get("id").and_then(EntityId::from_value)
}

fn find_index(entities: &[Value], id: &EntityId) -> Option<usize> {
    entities
        .iter()
        .position(|e| entity_id(e).as_ref() == Some(id))
}

fn same_key(a: Option<&Value>, b: &Value) -> bool {
    match (a.and_then(EntityId::from_value), EntityId::from_value(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Applies `op` to one collection. Returns whether anything changed.
fn apply_to(entities: &mut Vec<Value>, op: &ShadowOp) -> Result<bool, ShadowError> {
    match op {
        ShadowOp::Upsert { collection, entity } => {
            if !entity.is_object() {
                return Err(ShadowError::NotAnObject);
            }
            let id = entity_id(entity).ok_or_else(|| ShadowError::MissingId {
                collection: collection.clone(),
            })?;
            match find_index(entities, &id) {
                Some(i) if entities[i] == *entity => Ok(false),
                Some(i) => {
                    entities[i] = entity.clone();
                    Ok(true)
                }
                None => {
                    entities.push(entity.clone());
                    Ok(true)
                }
            }
        }
        ShadowOp::Merge { id, fields, .. } => {
            let Some(Value::Object(target)) = find_index(entities, id).map(|i| &mut entities[i])
            else {
                return Ok(false);
            };
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
            Ok(true)
        }
        ShadowOp::Remove { id, .. } => {
            let before = entities.len();
            entities.retain(|e| entity_id(e).as_ref() != Some(id));
            Ok(entities.len() != before)
        }
        ShadowOp::ReplaceAll {
            collection,
            entities: incoming,
        } => {
            if incoming.iter().any(|e| !e.is_object()) {
                return Err(ShadowError::NotAnObject);
            }
            if incoming.iter().any(|e| entity_id(e).is_none()) {
                return Err(ShadowError::MissingId {
                    collection: collection.clone(),
                });
            }
            // Entities created offline are unknown to the server until replayed.
            let pending_local: Vec<Value> = entities
                .iter()
                .filter(|e| entity_id(e).is_some_and(|id| id.is_local()))
                .filter(|e| {
                    let id = entity_id(e);
                    !incoming.iter().any(|n| entity_id(n) == id)
                })
                .cloned()
                .collect();
            let mut next = incoming.clone();
            next.extend(pending_local);
            let changed = *entities != next;
            *entities = next;
            Ok(changed)
        }
        ShadowOp::AppendToField {
            id,
            field,
            element,
            unique_key,
            ..
        } => {
            let Some(Value::Object(target)) = find_index(entities, id).map(|i| &mut entities[i])
            else {
                return Ok(false);
            };
            let slot = target
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !slot.is_array() {
                *slot = Value::Array(Vec::new());
            }
            let Value::Array(list) = slot else {
                return Ok(false);
            };
            if let Some(key) = unique_key {
                let candidate = element.get(key);
                if let Some(candidate) = candidate {
                    if list.iter().any(|e| same_key(e.get(key), candidate)) {
                        return Ok(false);
                    }
                }
            }
            list.push(element.clone());
            Ok(true)
        }
        ShadowOp::RemoveFromField {
            id,
            field,
            key,
            value,
            ..
        } => {
            let Some(Value::Array(list)) = find_index(entities, id)
                .and_then(|i| entities[i].get_mut(field.as_str()))
            else {
                return Ok(false);
            };
            let before = list.len();
            list.retain(|e| !same_key(e.get(key), value));
            Ok(list.len() != before)
        }
        ShadowOp::MergeInField {
            id,
            field,
            key,
            value,
            fields,
            ..
        } => {
            let Some(Value::Array(list)) = find_index(entities, id)
                .and_then(|i| entities[i].get_mut(field.as_str()))
            else {
                return Ok(false);
            };
            let mut changed = false;
            for element in list.iter_mut() {
                if !same_key(element.get(key), value) {
                    continue;
                }
                if let Value::Object(target) = element {
                    for (k, v) in fields {
                        target.insert(k.clone(), v.clone());
                    }
                    changed = true;
                }
            }
            Ok(changed)
        }
    }
}

pub struct ShadowStore {
    store: Arc<dyn KvStore>,
    collections: RwLock<HashMap<String, Vec<Value>>>,
    writes: AtomicU64,
}

impl ShadowStore {
    /// Rehydrates the named collections. Others load lazily on first use.
    #[instrument(skip(store))]
    pub async fn open(store: Arc<dyn KvStore>, collections: &[String]) -> Result<Self, ShadowError> {
        let mut loaded = HashMap::new();
        for name in collections {
            let entities = Self::load_collection(store.as_ref(), name).await?;
            info!(collection = %name, entities = entities.len(), "Shadow collection rehydrated");
            loaded.insert(name.clone(), entities);
        }

        Ok(Self {
            store,
            collections: RwLock::new(loaded),
            writes: AtomicU64::new(0),
        })
    }

    fn snapshot(collection: &str) -> Result<TypedKvStore<Vec<Value>>, ShadowError> {
        let key = KvKey::shadow(collection)
            .map_err(|_| ShadowError::InvalidCollection(collection.to_string()))?;
        Ok(TypedKvStore::new(key))
    }

    async fn load_collection(store: &dyn KvStore, collection: &str) -> Result<Vec<Value>, ShadowError> {
        Ok(Self::snapshot(collection)?
            .load(store)
            .await?
            .unwrap_or_default())
    }

    async fn ensure_loaded(&self, collection: &str) -> Result<(), ShadowError> {
        if self.collections.read().await.contains_key(collection) {
            return Ok(());
        }
        let entities = Self::load_collection(self.store.as_ref(), collection).await?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_insert(entities);
        Ok(())
    }

    /// Number of persisted writes since open.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub async fn read_all(&self, collection: &str) -> Vec<Value> {
        if let Err(e) = self.ensure_loaded(collection).await {
            debug!(collection, "Shadow collection unavailable: {}", e);
            return Vec::new();
        }
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn read_one(&self, collection: &str, id: &EntityId) -> Option<Value> {
        if self.ensure_loaded(collection).await.is_err() {
            return None;
        }
        let collections = self.collections.read().await;
        let entities = collections.get(collection)?;
        find_index(entities, id).map(|i| entities[i].clone())
    }

    /// Applies one change and persists the collection. On a failed write the
    /// in-memory collection is left untouched.
    #[instrument(skip(self, op), fields(collection = %op.collection()))]
    pub async fn apply(&self, op: &ShadowOp) -> Result<bool, ShadowError> {
        let collection = op.collection();
        let snapshot = Self::snapshot(collection)?;
        self.ensure_loaded(collection).await?;

        let mut collections = self.collections.write().await;
        let current = collections.get(collection).cloned().unwrap_or_default();

        let mut next = current;
        if !apply_to(&mut next, op)? {
            return Ok(false);
        }

        if let Err(e) = snapshot.save(self.store.as_ref(), &next).await {
            error!("Failed to persist shadow collection: {}", e);
            return Err(ShadowError::Storage(e));
        }

        collections.insert(collection.to_string(), next);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    pub async fn upsert(&self, collection: &str, entity: Value) -> Result<bool, ShadowError> {
        self.apply(&ShadowOp::Upsert {
            collection: collection.to_string(),
            entity,
        })
        .await
    }

    pub async fn remove(&self, collection: &str, id: &EntityId) -> Result<bool, ShadowError> {
        self.apply(&ShadowOp::Remove {
            collection: collection.to_string(),
            id: id.clone(),
        })
        .await
    }

    pub async fn replace_all(&self, collection: &str, entities: Vec<Value>) -> Result<bool, ShadowError> {
        self.apply(&ShadowOp::ReplaceAll {
            collection: collection.to_string(),
            entities,
        })
        .await
    }

    /// Gives a locally created entity its server id. If the server entity was
    /// already mirrored, the local copy is dropped instead.
    #[instrument(skip(self), fields(local = %local_id, server = %server_id))]
    pub async fn rekey(
        &self,
        collection: &str,
        local_id: &EntityId,
        server_id: &EntityId,
    ) -> Result<bool, ShadowError> {
        let snapshot = Self::snapshot(collection)?;
        self.ensure_loaded(collection).await?;

        let mut collections = self.collections.write().await;
        let mut next = collections.get(collection).cloned().unwrap_or_default();

        let Some(local_index) = find_index(&next, local_id) else {
            return Ok(false);
        };

        if find_index(&next, server_id).is_some() {
            next.remove(local_index);
        } else if let Value::Object(entity) = &mut next[local_index] {
            entity.insert("id".to_string(), Value::String(server_id.to_string()));
        }

        if let Err(e) = snapshot.save(self.store.as_ref(), &next).await {
            error!("Failed to persist re-keyed shadow collection: {}", e);
            return Err(ShadowError::Storage(e));
        }

        collections.insert(collection.to_string(), next);
        self.writes.fetch_add(1, Ordering::Relaxed);
        info!(collection, "Shadow entity re-keyed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKvStore;
    use crate::queue::tests::FailableStore;
    use serde_json::json;

    fn id(s: &str) -> EntityId {
        EntityId::new(s)
    }

    async fn open(store: Arc<dyn KvStore>) -> ShadowStore {
        ShadowStore::open(store, &["watchlists".to_string()]).await.unwrap()
    }

    #[tokio::test]
    async fn unknown_collection_reads_empty() {
        let shadow = open(Arc::new(MemoryKvStore::new())).await;
        assert!(shadow.read_all("nope").await.is_empty());
        assert!(shadow.read_one("nope", &id("1")).await.is_none());
    }

    #[tokio::test]
    async fn upsert_matches_numeric_and_string_ids() {
        let shadow = open(Arc::new(MemoryKvStore::new())).await;
        shadow
            .upsert("watchlists", json!({"id": 7, "name": "Tech"}))
            .await
            .unwrap();
        shadow
            .upsert("watchlists", json!({"id": "7", "name": "Tech 2"}))
            .await
            .unwrap();

        let all = shadow.read_all("watchlists").await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["name"], "Tech 2");
        assert!(shadow.read_one("watchlists", &id("7")).await.is_some());
    }

    #[tokio::test]
    async fn upsert_requires_object_with_id() {
        let shadow = open(Arc::new(MemoryKvStore::new())).await;
        assert!(matches!(
            shadow.upsert("watchlists", json!("x")).await,
            Err(ShadowError::NotAnObject)
        ));
        assert!(matches!(
            shadow.upsert("watchlists", json!({"name": "x"})).await,
            Err(ShadowError::MissingId { .. })
        ));
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let shadow = open(store.clone()).await;
            shadow
                .upsert("watchlists", json!({"id": "1", "name": "Core"}))
                .await
                .unwrap();
            shadow
                .upsert("alerts", json!({"id": "a1", "symbol": "NVDA"}))
                .await
                .unwrap();
        }

        let shadow = open(store).await;
        assert_eq!(shadow.read_all("watchlists").await.len(), 1);
        // Not configured at open, loaded on demand.
        assert_eq!(shadow.read_all("alerts").await.len(), 1);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_untouched() {
        let store = Arc::new(FailableStore::new());
        let shadow = open(store.clone()).await;
        shadow
            .upsert("watchlists", json!({"id": "1", "name": "Core"}))
            .await
            .unwrap();

        store.set_fail_writes(true);
        assert!(shadow.remove("watchlists", &id("1")).await.is_err());
        assert_eq!(shadow.read_all("watchlists").await.len(), 1);
    }

    #[tokio::test]
    async fn replace_all_keeps_unsynced_local_entities() {
        let shadow = open(Arc::new(MemoryKvStore::new())).await;
        shadow
            .upsert("watchlists", json!({"id": "local-1-1", "name": "Offline"}))
            .await
            .unwrap();
        shadow
            .upsert("watchlists", json!({"id": "3", "name": "Stale"}))
            .await
            .unwrap();

        shadow
            .replace_all("watchlists", vec![json!({"id": 4, "name": "Fresh"})])
            .await
            .unwrap();

        let names: Vec<_> = shadow
            .read_all("watchlists")
            .await
            .iter()
            .map(|e| e["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Fresh", "Offline"]);
    }

    #[tokio::test]
    async fn rekey_renames_in_place() {
        let shadow = open(Arc::new(MemoryKvStore::new())).await;
        shadow
            .upsert("watchlists", json!({"id": "local-1-1", "name": "AI Longs", "items": []}))
            .await
            .unwrap();

        assert!(shadow
            .rekey("watchlists", &id("local-1-1"), &id("L9"))
            .await
            .unwrap());

        let all = shadow.read_all("watchlists").await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["id"], "L9");
    }

    #[tokio::test]
    async fn rekey_drops_local_when_server_copy_exists() {
        let shadow = open(Arc::new(MemoryKvStore::new())).await;
        shadow
            .upsert("watchlists", json!({"id": "local-1-1", "name": "AI Longs"}))
            .await
            .unwrap();
        shadow
            .upsert("watchlists", json!({"id": 9, "name": "AI Longs"}))
            .await
            .unwrap();

        shadow
            .rekey("watchlists", &id("local-1-1"), &id("9"))
            .await
            .unwrap();

        let all = shadow.read_all("watchlists").await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["id"], 9);
    }

    #[tokio::test]
    async fn nested_item_operations() {
        let shadow = open(Arc::new(MemoryKvStore::new())).await;
        shadow
            .upsert("watchlists", json!({"id": "1", "name": "Core"}))
            .await
            .unwrap();

        let append = |symbol: &str| ShadowOp::AppendToField {
            collection: "watchlists".into(),
            id: id("1"),
            field: "items".into(),
            element: json!({"symbol": symbol}),
            unique_key: Some("symbol".into()),
        };

        assert!(shadow.apply(&append("NVDA")).await.unwrap());
        assert!(!shadow.apply(&append("NVDA")).await.unwrap());
        assert!(shadow.apply(&append("AMD")).await.unwrap());

        let mut fields = Map::new();
        fields.insert("alert_settings".into(), json!({"spike": 3}));
        assert!(shadow
            .apply(&ShadowOp::MergeInField {
                collection: "watchlists".into(),
                id: id("1"),
                field: "items".into(),
                key: "symbol".into(),
                value: json!("AMD"),
                fields,
            })
            .await
            .unwrap());

        assert!(shadow
            .apply(&ShadowOp::RemoveFromField {
                collection: "watchlists".into(),
                id: id("1"),
                field: "items".into(),
                key: "symbol".into(),
                value: json!("NVDA"),
            })
            .await
            .unwrap());

        let wl = shadow.read_one("watchlists", &id("1")).await.unwrap();
        assert_eq!(wl["items"], json!([{"symbol": "AMD", "alert_settings": {"spike": 3}}]));
    }

    #[tokio::test]
    async fn merge_on_missing_entity_is_noop() {
        let store = Arc::new(MemoryKvStore::new());
        let shadow = open(store.clone()).await;
        let mut fields = Map::new();
        fields.insert("name".into(), json!("x"));

        let changed = shadow
            .apply(&ShadowOp::Merge {
                collection: "watchlists".into(),
                id: id("404"),
                fields,
            })
            .await
            .unwrap();

        assert!(!changed);
        assert_eq!(store.write_count(), 0);
    }
}
