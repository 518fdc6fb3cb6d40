//! I/O boundaries the core calls into: the remote server, durable storage and
//! platform notifications. Each is a trait so hosts and tests can substitute
//! their own implementation.

pub mod http;
pub mod kv;
pub mod notify;

pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    ValidatedUrl,
};
#[cfg(feature = "reqwest-transport")]
pub use self::http::ReqwestTransport;
pub use self::kv::{KvError, KvKey, KvStore, MemoryKvStore, StorageErrorCode, TypedKvStore};
pub use self::notify::{
    BufferedNotifier, ChannelNotifier, Notification, Notifier, TracingNotifier,
};
