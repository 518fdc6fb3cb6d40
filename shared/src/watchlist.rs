//! Typed watchlist endpoints on top of the gateway.
//!
//! Items live inside their watchlist's `items` field in the shadow store, so
//! item changes are expressed as nested-field operations on the parent.

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::instrument;

use crate::capabilities::http::HttpError;
use crate::gateway::{DataGateway, GatewayError, GatewayRequest, GatewayResponse, LiveSync, ShadowQuery};
use crate::model::{EntityId, Watchlist, WatchlistItem, WatchlistItems, WatchlistPage, WATCHLISTS};
use crate::queue::{LocalRef, MutationId};
use crate::shadow::ShadowOp;

const ITEMS_FIELD: &str = "items";

/// A typed gateway result that keeps where the data came from.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified<T> {
    Live(T),
    /// Served from the shadow store while the server is unreachable.
    Fallback(T),
    /// Accepted for later replay. `local` is the optimistic local state, if any.
    Queued {
        mutation_id: MutationId,
        local: Option<T>,
    },
}

impl<T> Classified<T> {
    pub fn is_live(&self) -> bool {
        matches!(self, Classified::Live(_))
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Classified::Queued { .. })
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Classified::Live(v) | Classified::Fallback(v) => Some(v),
            Classified::Queued { local, .. } => local,
        }
    }
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, GatewayError> {
    serde_json::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))
}

/// Path segments come from user input (ticker symbols, ids).
pub(crate) fn path_segment(segment: &str) -> Result<&str, GatewayError> {
    if segment.is_empty() || segment.contains(['/', '?', '#', '%']) {
        return Err(GatewayError::Http(HttpError::InvalidRequest {
            reason: format!("invalid path segment '{segment}'"),
        }));
    }
    Ok(segment)
}

fn acknowledged(response: GatewayResponse) -> Classified<Value> {
    match response {
        GatewayResponse::Live(v) => Classified::Live(v),
        GatewayResponse::Fallback(v) => Classified::Fallback(v),
        GatewayResponse::Queued { mutation_id } => Classified::Queued {
            mutation_id,
            local: None,
        },
    }
}

pub struct WatchlistApi {
    gateway: Arc<DataGateway>,
}

impl WatchlistApi {
    pub fn new(gateway: Arc<DataGateway>) -> Self {
        Self { gateway }
    }

    pub async fn list(&self) -> Result<Classified<WatchlistPage>, GatewayError> {
        let request = GatewayRequest::get("/watchlist")
            .fallback(ShadowQuery::All(WATCHLISTS.into()))
            .on_live(LiveSync::ReplaceFromResponse {
                collection: WATCHLISTS.into(),
                pointer: "/watchlists".into(),
            });

        match self.gateway.execute(request).await? {
            GatewayResponse::Live(v) => Ok(Classified::Live(decode(v)?)),
            GatewayResponse::Fallback(v) => {
                let watchlists: Vec<Watchlist> = decode(v)?;
                Ok(Classified::Fallback(WatchlistPage {
                    count: watchlists.len(),
                    watchlists,
                }))
            }
            GatewayResponse::Queued { .. } => Err(GatewayError::Decode("read was queued".into())),
        }
    }

    pub async fn get(&self, id: &EntityId) -> Result<Classified<Watchlist>, GatewayError> {
        let request = GatewayRequest::get(format!("/watchlist/{}", path_segment(id.as_str())?))
            .fallback(ShadowQuery::One {
                collection: WATCHLISTS.into(),
                id: id.clone(),
            })
            .on_live(LiveSync::UpsertResponse {
                collection: WATCHLISTS.into(),
                pointer: String::new(),
            });

        match self.gateway.execute(request).await? {
            GatewayResponse::Live(v) => Ok(Classified::Live(decode(v)?)),
            GatewayResponse::Fallback(v) => Ok(Classified::Fallback(decode(v)?)),
            GatewayResponse::Queued { .. } => Err(GatewayError::Decode("read was queued".into())),
        }
    }

    /// Offline, the list gets a `local-` id that is swapped for the server id
    /// when the create replays.
    #[instrument(skip(self))]
    pub async fn create(&self, name: &str) -> Result<Classified<Watchlist>, GatewayError> {
        let local = Watchlist::new_local(name);
        let entity = serde_json::to_value(&local).map_err(|e| GatewayError::Decode(e.to_string()))?;

        let request = GatewayRequest::post("/watchlist", json!({ "name": name }))
            .defer(ShadowOp::Upsert {
                collection: WATCHLISTS.into(),
                entity,
            })
            .local_ref(LocalRef::new(WATCHLISTS, local.id.as_str()))
            .on_live(LiveSync::UpsertResponse {
                collection: WATCHLISTS.into(),
                pointer: String::new(),
            });

        match self.gateway.execute(request).await? {
            GatewayResponse::Live(v) => Ok(Classified::Live(decode(v)?)),
            GatewayResponse::Queued { mutation_id } => Ok(Classified::Queued {
                mutation_id,
                local: Some(local),
            }),
            GatewayResponse::Fallback(v) => Ok(Classified::Fallback(decode(v)?)),
        }
    }

    #[instrument(skip(self))]
    pub async fn rename(&self, id: &EntityId, name: &str) -> Result<Classified<Value>, GatewayError> {
        let mut fields = Map::new();
        fields.insert("name".into(), Value::String(name.to_string()));
        let merge = ShadowOp::Merge {
            collection: WATCHLISTS.into(),
            id: id.clone(),
            fields,
        };

        let request = GatewayRequest::put(
            format!("/watchlist/{}", path_segment(id.as_str())?),
            json!({ "name": name }),
        )
        .defer(merge.clone())
        .on_live(LiveSync::Apply(merge));

        Ok(acknowledged(self.gateway.execute(request).await?))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &EntityId) -> Result<Classified<Value>, GatewayError> {
        let remove = ShadowOp::Remove {
            collection: WATCHLISTS.into(),
            id: id.clone(),
        };
        let request = GatewayRequest::delete(format!("/watchlist/{}", path_segment(id.as_str())?))
            .defer(remove.clone())
            .on_live(LiveSync::Apply(remove));

        Ok(acknowledged(self.gateway.execute(request).await?))
    }

    pub async fn items(&self, id: &EntityId) -> Result<Classified<WatchlistItems>, GatewayError> {
        let request = GatewayRequest::get(format!("/watchlist/{}/items", path_segment(id.as_str())?))
            .fallback(ShadowQuery::Field {
                collection: WATCHLISTS.into(),
                id: id.clone(),
                field: ITEMS_FIELD.into(),
            })
            .on_live(LiveSync::SetFieldFromResponse {
                collection: WATCHLISTS.into(),
                id: id.clone(),
                field: ITEMS_FIELD.into(),
                pointer: "/tickers".into(),
            });

        match self.gateway.execute(request).await? {
            GatewayResponse::Live(v) => Ok(Classified::Live(decode(v)?)),
            GatewayResponse::Fallback(v) => Ok(Classified::Fallback(WatchlistItems {
                tickers: decode(v)?,
            })),
            GatewayResponse::Queued { .. } => Err(GatewayError::Decode("read was queued".into())),
        }
    }

    /// Adding a symbol already on the list leaves the shadow copy unchanged.
    #[instrument(skip(self))]
    pub async fn add_item(&self, id: &EntityId, symbol: &str) -> Result<Classified<Value>, GatewayError> {
        let element = serde_json::to_value(WatchlistItem::pending(symbol))
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        let append = ShadowOp::AppendToField {
            collection: WATCHLISTS.into(),
            id: id.clone(),
            field: ITEMS_FIELD.into(),
            element,
            unique_key: Some("symbol".into()),
        };

        let request = GatewayRequest::post(
            format!("/watchlist/{}/items", path_segment(id.as_str())?),
            json!({ "symbol": symbol }),
        )
        .defer(append.clone())
        .on_live(LiveSync::Apply(append));

        Ok(acknowledged(self.gateway.execute(request).await?))
    }

    #[instrument(skip(self))]
    pub async fn remove_item(&self, id: &EntityId, symbol: &str) -> Result<Classified<Value>, GatewayError> {
        let remove = ShadowOp::RemoveFromField {
            collection: WATCHLISTS.into(),
            id: id.clone(),
            field: ITEMS_FIELD.into(),
            key: "symbol".into(),
            value: Value::String(symbol.to_string()),
        };

        let request = GatewayRequest::delete(format!(
            "/watchlist/{}/items/{}",
            path_segment(id.as_str())?,
            path_segment(symbol)?
        ))
        .defer(remove.clone())
        .on_live(LiveSync::Apply(remove));

        Ok(acknowledged(self.gateway.execute(request).await?))
    }

    #[instrument(skip(self, settings))]
    pub async fn update_item_settings(
        &self,
        id: &EntityId,
        symbol: &str,
        settings: Value,
    ) -> Result<Classified<Value>, GatewayError> {
        let mut fields = Map::new();
        fields.insert("alert_settings".into(), settings.clone());
        let merge = ShadowOp::MergeInField {
            collection: WATCHLISTS.into(),
            id: id.clone(),
            field: ITEMS_FIELD.into(),
            key: "symbol".into(),
            value: Value::String(symbol.to_string()),
            fields,
        };

        let request = GatewayRequest::put(
            format!(
                "/watchlist/{}/items/{}",
                path_segment(id.as_str())?,
                path_segment(symbol)?
            ),
            json!({ "alert_settings": settings }),
        )
        .defer(merge.clone())
        .on_live(LiveSync::Apply(merge));

        Ok(acknowledged(self.gateway.execute(request).await?))
    }
}
