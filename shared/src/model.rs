use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::queue::UnixTimeMs;

/// Prefix of ids minted on the client. The server never issues ids with it.
pub const LOCAL_ID_PREFIX: &str = "local-";

pub const WATCHLISTS: &str = "watchlists";
pub const ALERTS: &str = "alerts";

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Text(String),
    Integer(i64),
    Unsigned(u64),
}

impl From<IdRepr> for String {
    fn from(repr: IdRepr) -> Self {
        match repr {
            IdRepr::Text(s) => s,
            IdRepr::Integer(n) => n.to_string(),
            IdRepr::Unsigned(n) => n.to_string(),
        }
    }
}

// Server ids arrive as numbers or strings; both normalize to the string form.
macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Reads an id out of a JSON value. Empty strings and non-integers are rejected.
            pub fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
                    Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self(n.to_string())),
                    _ => None,
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                IdRepr::deserialize(deserializer).map(|repr| Self(repr.into()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(EntityId);
typed_id!(UserId);

static LOCAL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl EntityId {
    /// Mints a timestamp-derived id for an entity created offline.
    pub fn local() -> Self {
        let seq = LOCAL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("{LOCAL_ID_PREFIX}{}-{seq}", UnixTimeMs::now().0))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WatchlistItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    pub symbol: String,
    #[serde(rename = "companyName", default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_settings: Option<Value>,
}

impl WatchlistItem {
    pub fn pending(symbol: impl Into<String>) -> Self {
        Self {
            id: None,
            symbol: symbol.into(),
            company_name: None,
            sector: None,
            alert_settings: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Watchlist {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub items: Vec<WatchlistItem>,
    /// Server fields this client does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Watchlist {
    pub fn new_local(name: impl Into<String>) -> Self {
        Self {
            id: EntityId::local(),
            name: name.into(),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            items: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WatchlistPage {
    pub count: usize,
    pub watchlists: Vec<Watchlist>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WatchlistItems {
    pub tickers: Vec<WatchlistItem>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Alert {
    pub id: EntityId,
    pub symbol: String,
    pub message: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub alert_type: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserProfile {
    pub id: UserId,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "firstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default)]
    pub last_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
