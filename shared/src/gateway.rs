//! Single entry point for every remote read and write.
//!
//! Each call resolves to one of three outcomes: a live response, a queued
//! mutation (deferred success), or a fallback read from the shadow store.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::SessionCredentials;
use crate::capabilities::http::{
    validate_endpoint, HttpError, HttpMethod, HttpRequest, HttpTransport, ValidatedUrl,
};
use crate::capabilities::kv::KvError;
use crate::config::CoreConfig;
use crate::connection::ConnectionMonitor;
use crate::events::{CoreEvent, EventBus};
use crate::model::EntityId;
use crate::queue::{LocalRef, MutationId, MutationMethod, MutationQueue, QueueError, QueuedMutation};
use crate::shadow::{ShadowError, ShadowOp, ShadowStore};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session expired, sign in again")]
    AuthExpired,

    #[error("request failed with status {status}")]
    RequestFailed { status: u16, body: String },

    #[error("server unreachable: {reason}")]
    TransportUnavailable { reason: String },

    #[error("mutation {mutation_id} failed after {attempts} attempts: {last_error}")]
    ReplayExhausted {
        mutation_id: MutationId,
        attempts: u32,
        last_error: String,
    },

    #[error("{collection}/{id} is not available offline")]
    NotInShadow { collection: String, id: EntityId },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Shadow(#[from] ShadowError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Stable identifier for the presentation layer.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthExpired => "auth_expired",
            GatewayError::RequestFailed { .. } => "request_failed",
            GatewayError::TransportUnavailable { .. } => "transport_unavailable",
            GatewayError::ReplayExhausted { .. } => "replay_exhausted",
            GatewayError::NotInShadow { .. } => "not_in_shadow",
            GatewayError::Queue(_) => "queue",
            GatewayError::Shadow(_) => "shadow",
            GatewayError::Storage(_) => "storage",
            GatewayError::Http(_) => "http",
            GatewayError::Decode(_) => "decode",
        }
    }
}

/// What the shadow store serves when the server cannot.
#[derive(Debug, Clone, PartialEq)]
pub enum ShadowQuery {
    All(String),
    One { collection: String, id: EntityId },
    /// A list-valued field of one entity; empty when the entity is unknown.
    Field {
        collection: String,
        id: EntityId,
        field: String,
    },
}

/// Shadow refresh driven by a live response. Pointers are JSON pointers
/// into the response body, `""` being the whole body.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveSync {
    Apply(ShadowOp),
    UpsertResponse {
        collection: String,
        pointer: String,
    },
    ReplaceFromResponse {
        collection: String,
        pointer: String,
    },
    SetFieldFromResponse {
        collection: String,
        id: EntityId,
        field: String,
        pointer: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowPlan {
    pub fallback: Option<ShadowQuery>,
    /// Local intent of a mutation, applied when it is queued.
    pub deferred: Vec<ShadowOp>,
    pub live: Vec<LiveSync>,
    pub local_ref: Option<LocalRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    pub endpoint: String,
    pub method: HttpMethod,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
    pub requires_auth: bool,
    /// Whether an unreachable server turns this mutation into a queued one.
    pub deferrable: bool,
    pub shadow: ShadowPlan,
}

impl GatewayRequest {
    pub fn new(method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method,
            body: None,
            headers: BTreeMap::new(),
            requires_auth: true,
            deferrable: method.is_mutating(),
            shadow: ShadowPlan::default(),
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, endpoint).with_body(body)
    }

    pub fn put(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Put, endpoint).with_body(body)
    }

    pub fn patch(endpoint: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Patch, endpoint).with_body(body)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, endpoint)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn non_deferrable(mut self) -> Self {
        self.deferrable = false;
        self
    }

    pub fn fallback(mut self, query: ShadowQuery) -> Self {
        self.shadow.fallback = Some(query);
        self
    }

    pub fn defer(mut self, op: ShadowOp) -> Self {
        self.shadow.deferred.push(op);
        self
    }

    pub fn on_live(mut self, sync: LiveSync) -> Self {
        self.shadow.live.push(sync);
        self
    }

    pub fn local_ref(mut self, local_ref: LocalRef) -> Self {
        self.shadow.local_ref = Some(local_ref);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayResponse {
    Live(Value),
    /// Deferred success: durable in the mutation queue.
    Queued { mutation_id: MutationId },
    Fallback(Value),
}

impl GatewayResponse {
    pub fn is_live(&self) -> bool {
        matches!(self, GatewayResponse::Live(_))
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, GatewayResponse::Queued { .. })
    }

    pub fn mutation_id(&self) -> Option<&MutationId> {
        match self {
            GatewayResponse::Queued { mutation_id } => Some(mutation_id),
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            GatewayResponse::Live(v) | GatewayResponse::Fallback(v) => Some(v),
            GatewayResponse::Queued { .. } => None,
        }
    }
}

/// Result of one network exchange that got past request construction.
#[derive(Debug)]
pub(crate) enum Delivery {
    Response(Value),
    Unreachable(HttpError),
}

struct Call<'a> {
    endpoint: &'a str,
    method: HttpMethod,
    body: Option<&'a Value>,
    headers: &'a BTreeMap<String, String>,
    requires_auth: bool,
}

impl<'a> Call<'a> {
    fn of_request(request: &'a GatewayRequest) -> Self {
        Self {
            endpoint: &request.endpoint,
            method: request.method,
            body: request.body.as_ref(),
            headers: &request.headers,
            requires_auth: request.requires_auth,
        }
    }

    fn of_mutation(mutation: &'a QueuedMutation) -> Self {
        Self {
            endpoint: &mutation.endpoint,
            method: mutation.method.into(),
            body: mutation.body.as_ref(),
            headers: &mutation.headers,
            requires_auth: mutation.requires_auth,
        }
    }
}

pub struct DataGateway {
    base_url: ValidatedUrl,
    timeout_ms: u64,
    transport: Arc<dyn HttpTransport>,
    monitor: Arc<ConnectionMonitor>,
    queue: Arc<MutationQueue>,
    shadow: Arc<ShadowStore>,
    credentials: Arc<SessionCredentials>,
    events: EventBus,
    drain_requests: Arc<Notify>,
}

impl DataGateway {
    pub fn new(
        config: &CoreConfig,
        transport: Arc<dyn HttpTransport>,
        monitor: Arc<ConnectionMonitor>,
        queue: Arc<MutationQueue>,
        shadow: Arc<ShadowStore>,
        credentials: Arc<SessionCredentials>,
        events: EventBus,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            base_url: ValidatedUrl::new(config.api_base_url.as_str())?,
            timeout_ms: config.request_timeout_ms,
            transport,
            monitor,
            queue,
            shadow,
            credentials,
            events,
            drain_requests: Arc::new(Notify::new()),
        })
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    pub fn shadow(&self) -> &Arc<ShadowStore> {
        &self.shadow
    }

    pub fn credentials(&self) -> &Arc<SessionCredentials> {
        &self.credentials
    }

    /// Woken whenever queued work should be replayed without waiting for the timer.
    pub fn drain_requests(&self) -> Arc<Notify> {
        self.drain_requests.clone()
    }

    pub fn request_drain(&self) {
        self.drain_requests.notify_one();
    }

    #[instrument(skip(self, request), fields(method = %request.method, endpoint = %request.endpoint))]
    pub async fn execute(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        validate_endpoint(&request.endpoint)?;

        if request.method.is_mutating() {
            self.mutate(request).await
        } else {
            self.read(request).await
        }
    }

    async fn read(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        if !self.monitor.is_online() {
            return self.fallback(&request).await;
        }

        match self.deliver(&Call::of_request(&request)).await? {
            Delivery::Response(value) => {
                self.apply_live(&request.shadow.live, &value).await;
                Ok(GatewayResponse::Live(value))
            }
            Delivery::Unreachable(e) => {
                warn!("Read failed in transit, serving shadow copy: {}", e);
                self.monitor.set_online(false).await;
                self.fallback(&request).await
            }
        }
    }

    async fn mutate(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let online = self.monitor.is_online();

        if !request.deferrable {
            if !online {
                return Err(GatewayError::TransportUnavailable {
                    reason: "offline".into(),
                });
            }
            return match self.deliver(&Call::of_request(&request)).await? {
                Delivery::Response(value) => {
                    self.apply_live(&request.shadow.live, &value).await;
                    Ok(GatewayResponse::Live(value))
                }
                Delivery::Unreachable(e) => {
                    self.monitor.set_online(false).await;
                    Err(GatewayError::TransportUnavailable {
                        reason: e.to_string(),
                    })
                }
            };
        }

        if !online {
            return self.defer(request).await;
        }

        // A live write must not overtake writes still waiting in the queue.
        if !self.queue.is_empty().await {
            let response = self.defer(request).await;
            self.request_drain();
            return response;
        }

        match self.deliver(&Call::of_request(&request)).await? {
            Delivery::Response(value) => {
                self.apply_live(&request.shadow.live, &value).await;
                Ok(GatewayResponse::Live(value))
            }
            Delivery::Unreachable(e) => {
                warn!("Mutation failed in transit, queueing: {}", e);
                self.monitor.set_online(false).await;
                self.defer(request).await
            }
        }
    }

    /// Replays a queued mutation against the server. Never falls back or queues.
    #[instrument(skip(self, mutation), fields(mutation_id = %mutation.id, endpoint = %mutation.endpoint))]
    pub(crate) async fn replay(&self, mutation: &QueuedMutation) -> Result<Delivery, GatewayError> {
        self.deliver(&Call::of_mutation(mutation)).await
    }

    async fn deliver(&self, call: &Call<'_>) -> Result<Delivery, GatewayError> {
        let request = self.build_request(call).await?;

        match self.transport.execute(request).await {
            Err(e) if e.is_transport_failure() => Ok(Delivery::Unreachable(e)),
            Err(e) => Err(GatewayError::Http(e)),
            Ok(response) if response.is_unauthorized() => {
                self.force_logout().await;
                Err(GatewayError::AuthExpired)
            }
            Ok(response) if !response.is_success() => Err(GatewayError::RequestFailed {
                status: response.status(),
                body: response.body_text(),
            }),
            Ok(response) => {
                debug!(status = response.status(), duration_ms = response.duration_ms(), "Live response");
                // The server accepted the call; a non-JSON body must not turn
                // that into a failure, or a replay would repeat the write.
                let body = response.json_value().unwrap_or_else(|e| {
                    warn!(status = response.status(), "2xx body is not JSON, keeping raw text: {}", e);
                    Value::String(response.body_text())
                });
                Ok(Delivery::Response(body))
            }
        }
    }

    async fn build_request(&self, call: &Call<'_>) -> Result<HttpRequest, GatewayError> {
        let token = self.credentials.bearer_header().await;
        if call.requires_auth && token.is_none() {
            return Err(GatewayError::AuthExpired);
        }

        let url = self.base_url.with_endpoint(call.endpoint)?;
        let mut request = HttpRequest::new(call.method, url)
            .with_timeout_ms(self.timeout_ms)?
            .with_header("Content-Type", "application/json")?;

        if let Some(bearer) = token {
            request = request.with_header("Authorization", bearer)?;
        }
        for (name, value) in call.headers {
            request = request.with_header(name.as_str(), value.as_str())?;
        }
        if let Some(body) = call.body {
            request = request.with_json(body)?;
        }
        Ok(request)
    }

    async fn defer(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let method = MutationMethod::try_from(request.method)?;
        let GatewayRequest {
            endpoint,
            body,
            headers,
            requires_auth,
            shadow,
            ..
        } = request;

        let mut mutation = QueuedMutation::new(endpoint, method, body)
            .with_headers(headers)
            .with_requires_auth(requires_auth);
        if let Some(local_ref) = shadow.local_ref {
            mutation = mutation.with_local_ref(local_ref);
        }
        let mutation_id = mutation.id.clone();
        let endpoint = mutation.endpoint.clone();

        self.queue.enqueue(mutation).await?;

        // The mutation is durable from here on; a stale shadow must not turn
        // it into a reported failure the caller might retry.
        for op in &shadow.deferred {
            if let Err(e) = self.shadow.apply(op).await {
                error!(collection = op.collection(), "Failed to apply queued intent to shadow: {}", e);
            }
        }

        info!(%mutation_id, "Mutation deferred");
        self.events.emit(CoreEvent::MutationQueued {
            mutation_id: mutation_id.clone(),
            endpoint,
        });
        Ok(GatewayResponse::Queued { mutation_id })
    }

    async fn fallback(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let Some(query) = &request.shadow.fallback else {
            return Err(GatewayError::TransportUnavailable {
                reason: "offline and no local copy".into(),
            });
        };

        let value = match query {
            ShadowQuery::All(collection) => Value::Array(self.shadow.read_all(collection).await),
            ShadowQuery::One { collection, id } => self
                .shadow
                .read_one(collection, id)
                .await
                .ok_or_else(|| GatewayError::NotInShadow {
                    collection: collection.clone(),
                    id: id.clone(),
                })?,
            ShadowQuery::Field {
                collection,
                id,
                field,
            } => self
                .shadow
                .read_one(collection, id)
                .await
                .and_then(|entity| entity.get(field.as_str()).cloned())
                .unwrap_or_else(|| Value::Array(Vec::new())),
        };

        debug!("Serving shadow fallback");
        Ok(GatewayResponse::Fallback(value))
    }

    /// The live call already succeeded, so shadow refresh failures are logged only.
    ///
    /// While mutations are still queued the shadow holds their intent, which
    /// the server has not seen yet. Server copies must not overwrite it until
    /// the queue drains.
    async fn apply_live(&self, syncs: &[LiveSync], response: &Value) {
        let backlog = self.queue.len().await;
        for sync in syncs {
            if backlog > 0 && !matches!(sync, LiveSync::Apply(_)) {
                debug!(backlog, "Queued mutations pending, keeping local shadow copy");
                continue;
            }
            let op = match sync {
                LiveSync::Apply(op) => Some(op.clone()),
                LiveSync::UpsertResponse { collection, pointer } => response
                    .pointer(pointer)
                    .filter(|v| v.is_object())
                    .map(|entity| ShadowOp::Upsert {
                        collection: collection.clone(),
                        entity: entity.clone(),
                    }),
                LiveSync::ReplaceFromResponse { collection, pointer } => response
                    .pointer(pointer)
                    .and_then(Value::as_array)
                    .map(|entities| ShadowOp::ReplaceAll {
                        collection: collection.clone(),
                        entities: entities.clone(),
                    }),
                LiveSync::SetFieldFromResponse {
                    collection,
                    id,
                    field,
                    pointer,
                } => response.pointer(pointer).map(|v| {
                    let mut fields = serde_json::Map::new();
                    fields.insert(field.clone(), v.clone());
                    ShadowOp::Merge {
                        collection: collection.clone(),
                        id: id.clone(),
                        fields,
                    }
                }),
            };

            let Some(op) = op else {
                debug!(?sync, "Response carried nothing to mirror");
                continue;
            };
            if let Err(e) = self.shadow.apply(&op).await {
                warn!(collection = op.collection(), "Failed to refresh shadow from live response: {}", e);
            }
        }
    }

    /// Clears the session after the server rejected it.
    async fn force_logout(&self) {
        warn!("Server rejected credential, forcing logout");
        if let Err(e) = self.credentials.clear().await {
            error!("Failed to clear stored credential: {}", e);
        }
        self.events.emit(CoreEvent::AuthInvalidated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::http::{HttpHeaders, HttpResponse, HttpResult};
    use crate::capabilities::kv::{KvStore, MemoryKvStore};
    use crate::queue::QueueConfig;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Scripted {
        Status(u16, Value),
        Text(u16, &'static str),
        Down,
    }

    #[derive(Default)]
    struct StubTransport {
        script: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl StubTransport {
        fn push(&self, reply: Scripted) {
            self.script.lock().unwrap().push_back(reply);
        }

        fn seen(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for StubTransport {
        async fn execute(&self, request: HttpRequest) -> HttpResult {
            self.seen.lock().unwrap().push(request.clone());
            match self.script.lock().unwrap().pop_front() {
                Some(Scripted::Status(status, body)) => Ok(HttpResponse::new(
                    status,
                    HttpHeaders::new(),
                    serde_json::to_vec(&body).unwrap(),
                    request.request_id().to_string(),
                    1,
                )),
                Some(Scripted::Text(status, body)) => Ok(HttpResponse::new(
                    status,
                    HttpHeaders::new(),
                    body.as_bytes().to_vec(),
                    request.request_id().to_string(),
                    1,
                )),
                Some(Scripted::Down) | None => Err(HttpError::ConnectionError {
                    host: "localhost".into(),
                    message: "refused".into(),
                }),
            }
        }
    }

    struct Harness {
        gateway: DataGateway,
        transport: Arc<StubTransport>,
        events: EventBus,
    }

    async fn harness(online: bool, signed_in: bool) -> Harness {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let events = EventBus::default();
        let monitor = Arc::new(ConnectionMonitor::new(online, events.clone()));
        let queue = Arc::new(
            MutationQueue::open(store.clone(), QueueConfig::default())
                .await
                .unwrap(),
        );
        let shadow = Arc::new(
            ShadowStore::open(store.clone(), &["watchlists".to_string()])
                .await
                .unwrap(),
        );
        let credentials = Arc::new(SessionCredentials::restore(store).await.unwrap());
        if signed_in {
            credentials
                .store_session(SecretString::new("tok".into()), None)
                .await
                .unwrap();
        }
        let transport = Arc::new(StubTransport::default());
        let gateway = DataGateway::new(
            &CoreConfig::default(),
            transport.clone(),
            monitor,
            queue,
            shadow,
            credentials,
            events.clone(),
        )
        .unwrap();
        Harness {
            gateway,
            transport,
            events,
        }
    }

    #[tokio::test]
    async fn live_request_carries_headers() {
        let h = harness(true, true).await;
        h.transport.push(Scripted::Status(200, json!({"count": 0, "watchlists": []})));

        let response = h.gateway.execute(GatewayRequest::get("/watchlist")).await.unwrap();

        assert!(response.is_live());
        let seen = h.transport.seen();
        assert_eq!(seen[0].url().as_str(), "http://localhost:5000/api/v1/watchlist");
        assert_eq!(seen[0].headers().get("authorization"), Some("Bearer tok"));
        assert_eq!(seen[0].headers().get("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn missing_credential_fails_without_network() {
        let h = harness(true, false).await;

        let result = h.gateway.execute(GatewayRequest::get("/watchlist")).await;

        assert!(matches!(result, Err(GatewayError::AuthExpired)));
        assert!(h.transport.seen().is_empty());
    }

    #[tokio::test]
    async fn offline_mutation_is_queued_without_network() {
        let h = harness(false, true).await;
        let mut rx = h.events.subscribe();

        let response = h
            .gateway
            .execute(GatewayRequest::put("/watchlist/1", json!({"name": "x"})))
            .await
            .unwrap();

        assert!(response.is_queued());
        assert!(h.transport.seen().is_empty());
        assert_eq!(h.gateway.queue().len().await, 1);
        assert!(matches!(rx.recv().await.unwrap(), CoreEvent::MutationQueued { .. }));
    }

    #[tokio::test]
    async fn offline_read_without_plan_is_unavailable() {
        let h = harness(false, true).await;
        let result = h.gateway.execute(GatewayRequest::get("/volume-spikes")).await;
        assert!(matches!(result, Err(GatewayError::TransportUnavailable { .. })));
    }

    #[tokio::test]
    async fn offline_entity_read_missing_from_shadow() {
        let h = harness(false, true).await;
        let result = h
            .gateway
            .execute(GatewayRequest::get("/watchlist/7").fallback(ShadowQuery::One {
                collection: "watchlists".into(),
                id: EntityId::new("7"),
            }))
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), "not_in_shadow");
    }

    #[tokio::test]
    async fn non_2xx_is_surfaced_not_queued() {
        let h = harness(true, true).await;
        h.transport.push(Scripted::Status(422, json!({"error": "name taken"})));

        let result = h
            .gateway
            .execute(GatewayRequest::post("/watchlist", json!({"name": "x"})))
            .await;

        match result {
            Err(GatewayError::RequestFailed { status, body }) => {
                assert_eq!(status, 422);
                assert!(body.contains("name taken"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.gateway.queue().is_empty().await);
    }

    #[tokio::test]
    async fn non_deferrable_transport_failure_not_queued() {
        let h = harness(true, false).await;
        h.transport.push(Scripted::Down);

        let result = h
            .gateway
            .execute(
                GatewayRequest::post("/auth/login", json!({"email": "a@b.c"}))
                    .unauthenticated()
                    .non_deferrable(),
            )
            .await;

        assert!(matches!(result, Err(GatewayError::TransportUnavailable { .. })));
        assert!(h.gateway.queue().is_empty().await);
        assert!(!h.gateway.monitor().is_online());
    }

    #[tokio::test]
    async fn online_with_backlog_queues_behind() {
        let h = harness(false, true).await;
        h.gateway
            .execute(GatewayRequest::delete("/watchlist/1"))
            .await
            .unwrap();
        h.gateway.monitor().set_online(true).await;

        let response = h
            .gateway
            .execute(GatewayRequest::delete("/watchlist/2"))
            .await
            .unwrap();

        assert!(response.is_queued());
        assert!(h.transport.seen().is_empty());
        let endpoints: Vec<_> = h
            .gateway
            .queue()
            .snapshot()
            .await
            .into_iter()
            .map(|m| m.endpoint)
            .collect();
        assert_eq!(endpoints, vec!["/watchlist/1", "/watchlist/2"]);
    }

    #[tokio::test]
    async fn live_sync_mirrors_response() {
        let h = harness(true, true).await;
        h.transport.push(Scripted::Status(
            200,
            json!({"count": 1, "watchlists": [{"id": 5, "name": "Semis"}]}),
        ));

        h.gateway
            .execute(GatewayRequest::get("/watchlist").on_live(LiveSync::ReplaceFromResponse {
                collection: "watchlists".into(),
                pointer: "/watchlists".into(),
            }))
            .await
            .unwrap();

        let mirrored = h.gateway.shadow().read_all("watchlists").await;
        assert_eq!(mirrored, vec![json!({"id": 5, "name": "Semis"})]);
    }

    #[tokio::test]
    async fn plain_text_success_is_still_live() {
        let h = harness(true, true).await;
        h.transport.push(Scripted::Text(200, "Deleted"));

        let response = h
            .gateway
            .execute(GatewayRequest::delete("/watchlist/4"))
            .await
            .unwrap();

        assert_eq!(response, GatewayResponse::Live(Value::String("Deleted".into())));
        assert!(h.gateway.queue().is_empty().await);
    }

    #[tokio::test]
    async fn bad_endpoint_rejected() {
        let h = harness(true, true).await;
        let result = h.gateway.execute(GatewayRequest::get("watchlist")).await;
        assert!(matches!(result, Err(GatewayError::Http(_))));
    }
}
