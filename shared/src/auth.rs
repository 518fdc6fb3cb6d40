//! Bearer credential storage and the account endpoints.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::capabilities::kv::{KvError, KvKey, KvStore, TypedKvStore};
use crate::events::{CoreEvent, EventBus};
use crate::gateway::{DataGateway, GatewayError, GatewayRequest, GatewayResponse};

/// Fields that must never be mirrored into the cached profile.
const SECRET_PROFILE_FIELDS: &[&str] = &["password", "currentPassword"];

/// The stored session. The token never appears in logs or `Debug` output.
pub struct SessionCredentials {
    store: Arc<dyn KvStore>,
    token_snapshot: TypedKvStore<String>,
    user_snapshot: TypedKvStore<Value>,
    token: RwLock<Option<SecretString>>,
    user: RwLock<Option<Value>>,
}

impl SessionCredentials {
    /// Loads whatever session survived the last run.
    pub async fn restore(store: Arc<dyn KvStore>) -> Result<Self, KvError> {
        let token_snapshot = TypedKvStore::new(KvKey::auth_token());
        let user_snapshot = TypedKvStore::new(KvKey::auth_user());

        let token = token_snapshot
            .load(store.as_ref())
            .await?
            .map(SecretString::new);
        let user = user_snapshot.load(store.as_ref()).await?;

        info!(signed_in = token.is_some(), "Session restored");
        Ok(Self {
            store,
            token_snapshot,
            user_snapshot,
            token: RwLock::new(token),
            user: RwLock::new(user),
        })
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.read().await.is_some()
    }

    pub async fn user(&self) -> Option<Value> {
        self.user.read().await.clone()
    }

    /// `Authorization` header value for the stored token.
    pub(crate) async fn bearer_header(&self) -> Option<String> {
        self.token
            .read()
            .await
            .as_ref()
            .map(|t| format!("Bearer {}", t.expose_secret()))
    }

    /// Persists first; memory changes only once both keys are durable.
    pub async fn store_session(&self, token: SecretString, user: Option<Value>) -> Result<(), KvError> {
        self.token_snapshot
            .save(self.store.as_ref(), token.expose_secret())
            .await?;
        match &user {
            Some(user) => self.user_snapshot.save(self.store.as_ref(), user).await?,
            None => {
                self.user_snapshot.clear(self.store.as_ref()).await?;
            }
        }

        *self.token.write().await = Some(token);
        *self.user.write().await = user;
        Ok(())
    }

    pub async fn update_user(&self, user: Value) -> Result<(), KvError> {
        self.user_snapshot.save(self.store.as_ref(), &user).await?;
        *self.user.write().await = Some(user);
        Ok(())
    }

    /// Memory is cleared even if storage fails, so a rejected token is never
    /// sent again in this process.
    pub async fn clear(&self) -> Result<(), KvError> {
        *self.token.write().await = None;
        *self.user.write().await = None;

        self.token_snapshot.clear(self.store.as_ref()).await?;
        self.user_snapshot.clear(self.store.as_ref()).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials").finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
    #[serde(default)]
    user: Option<Value>,
}

pub struct AuthSession {
    gateway: Arc<DataGateway>,
    events: EventBus,
}

impl AuthSession {
    pub fn new(gateway: Arc<DataGateway>, events: EventBus) -> Self {
        Self { gateway, events }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.gateway.credentials().is_authenticated().await
    }

    pub async fn current_user(&self) -> Option<Value> {
        self.gateway.credentials().user().await
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &SecretString) -> Result<Value, GatewayError> {
        let request = GatewayRequest::post(
            "/auth/login",
            json!({ "email": email, "password": password.expose_secret() }),
        )
        .unauthenticated()
        .non_deferrable();

        self.establish(request).await
    }

    #[instrument(skip(self, password))]
    pub async fn register(
        &self,
        email: &str,
        password: &SecretString,
        first_name: &str,
        last_name: &str,
    ) -> Result<Value, GatewayError> {
        let request = GatewayRequest::post(
            "/auth/register",
            json!({
                "email": email,
                "password": password.expose_secret(),
                "firstName": first_name,
                "lastName": last_name,
            }),
        )
        .unauthenticated()
        .non_deferrable();

        self.establish(request).await
    }

    async fn establish(&self, request: GatewayRequest) -> Result<Value, GatewayError> {
        let GatewayResponse::Live(body) = self.gateway.execute(request).await? else {
            return Err(GatewayError::Decode("sign-in was not answered live".into()));
        };

        let response: AuthResponse =
            serde_json::from_value(body).map_err(|e| GatewayError::Decode(e.to_string()))?;
        let user = response.user.unwrap_or(Value::Null);

        self.gateway
            .credentials()
            .store_session(SecretString::new(response.token), Some(user.clone()))
            .await?;

        let user_id = user.get("id").map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        info!(?user_id, "Signed in");
        self.events.emit(CoreEvent::SignedIn { user_id });
        Ok(user)
    }

    /// Profile changes are deferrable; offline they are mirrored into the
    /// cached profile and replayed later.
    #[instrument(skip(self, changes))]
    pub async fn update_profile(&self, changes: Map<String, Value>) -> Result<GatewayResponse, GatewayError> {
        let response = self
            .gateway
            .execute(GatewayRequest::put("/users/me", Value::Object(changes.clone())))
            .await?;

        let credentials = self.gateway.credentials();
        let refreshed = match &response {
            GatewayResponse::Live(body) if body.get("user").is_some_and(Value::is_object) => {
                body.get("user").cloned()
            }
            _ => credentials.user().await.map(|mut user| {
                if let Value::Object(fields) = &mut user {
                    for (k, v) in changes {
                        if !SECRET_PROFILE_FIELDS.contains(&k.as_str()) {
                            fields.insert(k, v);
                        }
                    }
                }
                user
            }),
        };

        if let Some(user) = refreshed {
            if let Err(e) = credentials.update_user(user).await {
                warn!("Failed to cache updated profile: {}", e);
            }
        }
        Ok(response)
    }

    /// Never queued: the request carries the password.
    #[instrument(skip(self, password))]
    pub async fn delete_account(&self, password: &SecretString) -> Result<(), GatewayError> {
        self.gateway
            .execute(
                GatewayRequest::delete("/users/me")
                    .with_body(json!({ "password": password.expose_secret() }))
                    .non_deferrable(),
            )
            .await?;
        self.logout().await
    }

    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<(), GatewayError> {
        self.gateway.credentials().clear().await?;
        info!("Signed out");
        self.events.emit(CoreEvent::SignedOut);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::kv::MemoryKvStore;

    #[tokio::test]
    async fn session_survives_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let credentials = SessionCredentials::restore(store.clone()).await.unwrap();
            credentials
                .store_session(SecretString::new("t1".into()), Some(json!({"id": "u1"})))
                .await
                .unwrap();
        }

        let credentials = SessionCredentials::restore(store).await.unwrap();
        assert!(credentials.is_authenticated().await);
        assert_eq!(credentials.bearer_header().await.as_deref(), Some("Bearer t1"));
        assert_eq!(credentials.user().await, Some(json!({"id": "u1"})));
    }

    #[tokio::test]
    async fn clear_removes_persisted_keys() {
        let store = Arc::new(MemoryKvStore::new());
        let credentials = SessionCredentials::restore(store.clone()).await.unwrap();
        credentials
            .store_session(SecretString::new("t1".into()), None)
            .await
            .unwrap();

        credentials.clear().await.unwrap();

        assert!(!credentials.is_authenticated().await);
        assert!(store.get(&KvKey::auth_token()).await.unwrap().is_none());
        assert!(store.get(&KvKey::auth_user()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn debug_hides_token() {
        let credentials = SessionCredentials::restore(Arc::new(MemoryKvStore::new()))
            .await
            .unwrap();
        credentials
            .store_session(SecretString::new("very-secret".into()), None)
            .await
            .unwrap();
        assert!(!format!("{credentials:?}").contains("very-secret"));
    }
}
