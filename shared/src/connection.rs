//! Process-wide reachability state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::events::{CoreEvent, EventBus};

/// `is_channel_connected` is never true while `is_online` is false.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub is_online: bool,
    pub is_channel_connected: bool,
}

/// Reacts to reachability transitions. Called once per actual transition,
/// never for repeated values.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn on_online(&self);
    async fn on_offline(&self);
}

pub struct ConnectionMonitor {
    state: watch::Sender<ConnectionState>,
    observers: Mutex<Vec<Weak<dyn ConnectionObserver>>>,
    events: EventBus,
}

impl ConnectionMonitor {
    /// `initially_online` must come from the runtime's reachability signal.
    pub fn new(initially_online: bool, events: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState {
            is_online: initially_online,
            is_channel_connected: false,
        });
        Self {
            state,
            observers: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Held weakly; a dropped observer is pruned on the next transition.
    pub fn register(&self, observer: &Arc<dyn ConnectionObserver>) {
        let mut observers = match self.observers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.push(Arc::downgrade(observer));
    }

    fn live_observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        let mut observers = match self.observers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.retain(|o| o.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Returns whether the state changed. Observers run to completion before
    /// this returns, so a reconnect drain has finished by then.
    #[instrument(skip(self))]
    pub async fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if s.is_online == online {
                return false;
            }
            s.is_online = online;
            if !online {
                s.is_channel_connected = false;
            }
            true
        });

        if !changed {
            debug!("Reachability unchanged");
            return false;
        }

        let state = self.state();
        if online {
            info!("Connection restored");
        } else {
            warn!("Connection lost");
        }
        self.events.emit(CoreEvent::ConnectionChanged(state));

        for observer in self.live_observers() {
            if online {
                observer.on_online().await;
            } else {
                observer.on_offline().await;
            }
        }
        true
    }

    /// Connecting the real-time channel while offline is refused.
    #[instrument(skip(self))]
    pub fn set_channel_connected(&self, connected: bool) -> bool {
        let changed = self.state.send_if_modified(|s| {
            if s.is_channel_connected == connected || (connected && !s.is_online) {
                return false;
            }
            s.is_channel_connected = connected;
            true
        });

        if changed {
            self.events.emit(CoreEvent::ConnectionChanged(self.state()));
        }
        changed
    }

    /// Pumps host reachability events into [`Self::set_online`] until the
    /// source closes or `shutdown` flips.
    pub fn follow(
        self: Arc<Self>,
        mut reachability: watch::Receiver<bool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // The initial value was consumed at construction.
            reachability.borrow_and_update();
            loop {
                tokio::select! {
                    changed = reachability.changed() => {
                        if changed.is_err() {
                            debug!("Reachability source closed");
                            break;
                        }
                        let online = *reachability.borrow_and_update();
                        self.set_online(online).await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
