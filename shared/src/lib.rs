//! Offline-resilient data access for the SignalHub client.
//!
//! Reads and writes go through the [`DataGateway`]. While the server is
//! unreachable, writes are queued durably and reads are served from a local
//! shadow copy; the [`Reconciler`] replays the queue in order once
//! connectivity returns.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod alerts;
pub mod app;
pub mod auth;
pub mod capabilities;
pub mod config;
pub mod connection;
pub mod events;
pub mod gateway;
pub mod model;
pub mod offline_store;
pub mod queue;
pub mod reconcile;
pub mod shadow;
#[cfg(not(target_arch = "wasm32"))]
pub mod sqlite_store;
pub mod telemetry;
pub mod watchlist;

pub use alerts::AlertsApi;
pub use app::{App, AppDeps, BootstrapError};
pub use auth::{AuthSession, SessionCredentials};
pub use config::{ConfigError, CoreConfig};
pub use connection::{ConnectionMonitor, ConnectionObserver, ConnectionState};
pub use events::{CoreEvent, EventBus};
pub use gateway::{
    DataGateway, GatewayError, GatewayRequest, GatewayResponse, LiveSync, ShadowPlan, ShadowQuery,
};
pub use model::{Alert, EntityId, Watchlist, WatchlistItem, WatchlistItems, WatchlistPage};
pub use offline_store::SnapshotDirStore;
pub use queue::{
    FailedMutation, LocalRef, MutationId, MutationMethod, MutationQueue, QueueConfig, QueueError,
    QueuedMutation, RequeueOutcome, UnixTimeMs,
};
pub use reconcile::{DrainOutcome, DrainReport, DrainTrigger, Reconciler};
pub use shadow::{ShadowError, ShadowOp, ShadowStore};
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite_store::SqliteKvStore;
pub use watchlist::{Classified, WatchlistApi};
