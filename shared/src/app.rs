//! Startup wiring and teardown.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::alerts::AlertsApi;
use crate::auth::{AuthSession, SessionCredentials};
use crate::capabilities::http::HttpTransport;
use crate::capabilities::kv::{KvError, KvStore};
use crate::capabilities::notify::Notifier;
use crate::config::{ConfigError, CoreConfig};
use crate::connection::{ConnectionMonitor, ConnectionObserver};
use crate::events::EventBus;
use crate::gateway::{DataGateway, GatewayError};
use crate::queue::{MutationQueue, QueueError};
use crate::reconcile::{DrainReport, DrainTrigger, ReconcileConfig, Reconciler};
use crate::shadow::{ShadowError, ShadowStore};
use crate::watchlist::WatchlistApi;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("session storage: {0}")]
    Session(#[from] KvError),

    #[error("mutation queue: {0}")]
    Queue(#[from] QueueError),

    #[error("shadow store: {0}")]
    Shadow(#[from] ShadowError),

    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),
}

/// Host-supplied collaborators.
pub struct AppDeps {
    pub store: Arc<dyn KvStore>,
    pub transport: Arc<dyn HttpTransport>,
    pub notifier: Arc<dyn Notifier>,
    /// Current value is the reachability at startup.
    pub reachability: watch::Receiver<bool>,
}

pub struct App {
    pub config: CoreConfig,
    pub events: EventBus,
    pub monitor: Arc<ConnectionMonitor>,
    pub gateway: Arc<DataGateway>,
    pub reconciler: Arc<Reconciler>,
    pub auth: AuthSession,
    pub watchlists: WatchlistApi,
    pub alerts: AlertsApi,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Rehydrates persisted state, wires the services and starts the
    /// background retry loop. Must be called inside a tokio runtime.
    #[instrument(skip_all)]
    pub async fn bootstrap(config: CoreConfig, deps: AppDeps) -> Result<Self, BootstrapError> {
        config.validate()?;

        let AppDeps {
            store,
            transport,
            notifier,
            reachability,
        } = deps;

        let events = EventBus::default();
        let initially_online = *reachability.borrow();
        let monitor = Arc::new(ConnectionMonitor::new(initially_online, events.clone()));

        let queue = Arc::new(MutationQueue::open(store.clone(), config.queue_config()).await?);
        let shadow = Arc::new(ShadowStore::open(store.clone(), &config.shadow_collections).await?);
        let credentials = Arc::new(SessionCredentials::restore(store).await?);

        let gateway = Arc::new(DataGateway::new(
            &config,
            transport,
            monitor.clone(),
            queue.clone(),
            shadow,
            credentials,
            events.clone(),
        )?);

        let reconciler = Arc::new(Reconciler::new(
            gateway.clone(),
            notifier,
            events.clone(),
            ReconcileConfig::from(&config),
        ));
        let observer: Arc<dyn ConnectionObserver> = reconciler.clone();
        monitor.register(&observer);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(reconciler.clone().run(shutdown_rx.clone())),
            monitor.clone().follow(reachability, shutdown_rx),
        ];

        let pending = queue.len().await;
        if initially_online && pending > 0 {
            gateway.request_drain();
        }

        info!(online = initially_online, pending, "Core bootstrapped");

        Ok(Self {
            auth: AuthSession::new(gateway.clone(), events.clone()),
            watchlists: WatchlistApi::new(gateway.clone()),
            alerts: AlertsApi::new(gateway.clone()),
            config,
            events,
            monitor,
            gateway,
            reconciler,
            shutdown,
            tasks,
        })
    }

    /// Replays the queue now instead of waiting for the retry timer.
    pub async fn sync_now(&self) -> DrainReport {
        self.reconciler.drain(DrainTrigger::Manual).await
    }

    /// Stops the retry loop and the reachability pump.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            warn!("Background tasks already stopped");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Core shut down");
    }
}
