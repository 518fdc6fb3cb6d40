#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use signalhub_core::capabilities::http::{
    HttpError, HttpHeaders, HttpRequest, HttpResponse, HttpResult, HttpTransport,
};
use signalhub_core::capabilities::kv::{KvKey, KvStore, MemoryKvStore};
use signalhub_core::capabilities::notify::{BufferedNotifier, Notification};
use signalhub_core::{App, AppDeps, CoreConfig};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const BASE: &str = "http://localhost:5000/api/v1";

#[derive(Debug, Clone, PartialEq)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    pub authorization: Option<String>,
}

pub enum Reply {
    Json(u16, Value),
    /// Raw body, not JSON.
    Text(u16, &'static str),
    Down,
}

type Handler = Box<dyn Fn(&Recorded) -> Reply + Send + Sync>;

/// Records every request and answers from a swappable handler.
pub struct ScriptedTransport {
    handler: Mutex<Handler>,
    log: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(handler: impl Fn(&Recorded) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(handler)),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Every request fails as if the server were unreachable.
    pub fn unreachable() -> Arc<Self> {
        Self::new(|_| Reply::Down)
    }

    pub fn respond_with(&self, handler: impl Fn(&Recorded) -> Reply + Send + Sync + 'static) {
        *self.handler.lock().unwrap() = Box::new(handler);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> HttpResult {
        let recorded = Recorded {
            method: request.method().as_str().to_string(),
            path: request
                .url()
                .as_str()
                .trim_start_matches(BASE)
                .to_string(),
            body: request.body().map(|b| serde_json::from_slice(b).unwrap()),
            authorization: request.headers().get("authorization").map(str::to_string),
        };
        self.log.lock().unwrap().push(recorded.clone());

        let reply = (self.handler.lock().unwrap())(&recorded);
        match reply {
            Reply::Json(status, body) => Ok(HttpResponse::new(
                status,
                HttpHeaders::new(),
                serde_json::to_vec(&body).unwrap(),
                request.request_id().to_string(),
                1,
            )),
            Reply::Text(status, body) => Ok(HttpResponse::new(
                status,
                HttpHeaders::new(),
                body.as_bytes().to_vec(),
                request.request_id().to_string(),
                1,
            )),
            Reply::Down => Err(HttpError::ConnectionError {
                host: "localhost".into(),
                message: "connection refused".into(),
            }),
        }
    }
}

pub fn ok() -> Reply {
    Reply::Json(200, json!({ "success": true }))
}

pub struct Harness {
    pub app: App,
    pub transport: Arc<ScriptedTransport>,
    pub notifier: Arc<BufferedNotifier>,
    pub store: Arc<MemoryKvStore>,
    pub reachability: watch::Sender<bool>,
}

impl Harness {
    pub fn titles(&self) -> Vec<String> {
        self.notifier
            .take()
            .into_iter()
            .map(|n: Notification| n.title)
            .collect()
    }
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        // Timer drains stay out of the way; tests trigger drains explicitly.
        retry_interval_ms: 3_600_000,
        ..CoreConfig::default()
    }
}

pub async fn sign_in(store: &MemoryKvStore, token: &str) {
    store
        .set(&KvKey::auth_token(), serde_json::to_string(token).unwrap())
        .await
        .unwrap();
    store
        .set(&KvKey::auth_user(), json!({"id": "u1", "email": "a@b.c"}).to_string())
        .await
        .unwrap();
}

pub async fn boot_with(
    store: Arc<MemoryKvStore>,
    transport: Arc<ScriptedTransport>,
    online: bool,
) -> Harness {
    let notifier = Arc::new(BufferedNotifier::new());
    let (reachability, reach_rx) = watch::channel(online);

    let app = App::bootstrap(
        test_config(),
        AppDeps {
            store: store.clone(),
            transport: transport.clone(),
            notifier: notifier.clone(),
            reachability: reach_rx,
        },
    )
    .await
    .unwrap();

    Harness {
        app,
        transport,
        notifier,
        store,
        reachability,
    }
}

/// Signed-in app with a fresh store.
pub async fn boot(transport: Arc<ScriptedTransport>, online: bool) -> Harness {
    let store = Arc::new(MemoryKvStore::new());
    sign_in(&store, "tok").await;
    boot_with(store, transport, online).await
}
