//! Replays the mutation queue once the server is reachable again.

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::notify::{Notification, Notifier};
use crate::config::CoreConfig;
use crate::connection::ConnectionObserver;
use crate::events::{CoreEvent, EventBus};
use crate::gateway::{DataGateway, Delivery, GatewayError};
use crate::model::EntityId;
use crate::queue::{MutationId, RequeueOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    /// The monitor observed an offline to online transition.
    Reconnect,
    Timer,
    /// The gateway queued a write while online.
    Requested,
    /// The host asked for an immediate sync.
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// Another drain was already running.
    Skipped,
    /// The queue is empty.
    Drained,
    WentOffline,
    /// The server rejected the session; replay resumes after sign-in.
    AuthRequired,
    /// The head failed and stays queued for another attempt.
    Retrying {
        mutation_id: MutationId,
        attempts: u32,
        error: String,
    },
    /// The head used up its attempts and moved to the failed-sync list.
    Exhausted {
        mutation_id: MutationId,
        attempts: u32,
        last_error: String,
    },
    StorageFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainReport {
    pub trigger: DrainTrigger,
    pub replayed: usize,
    pub remaining: usize,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.outcome == DrainOutcome::Drained
    }

    pub fn exhausted(&self) -> Option<GatewayError> {
        match &self.outcome {
            DrainOutcome::Exhausted {
                mutation_id,
                attempts,
                last_error,
            } => Some(GatewayError::ReplayExhausted {
                mutation_id: mutation_id.clone(),
                attempts: *attempts,
                last_error: last_error.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub retry_interval: Duration,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl From<&CoreConfig> for ReconcileConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            retry_interval: config.retry_interval(),
            base_backoff_ms: config.base_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

/// Exponential backoff with up to two seconds of jitter.
fn calculate_backoff(config: &ReconcileConfig, attempt: u32) -> u64 {
    let mut rng = rand::rngs::StdRng::from_entropy();
    let jitter: u64 = rng.gen_range(0..=2000);

    let exponent = attempt.min(16);
    let base_delay = config.base_backoff_ms.saturating_mul(1u64 << exponent);
    let capped_delay = base_delay.min(config.max_backoff_ms);

    capped_delay.saturating_add(jitter)
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    gateway: Arc<DataGateway>,
    notifier: Arc<dyn Notifier>,
    events: EventBus,
    config: ReconcileConfig,
    draining: AtomicBool,
}

impl Reconciler {
    pub fn new(
        gateway: Arc<DataGateway>,
        notifier: Arc<dyn Notifier>,
        events: EventBus,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            gateway,
            notifier,
            events,
            config,
            draining: AtomicBool::new(false),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Replays queued mutations strictly in order until the queue empties or
    /// a replay fails. Only one drain runs at a time.
    #[instrument(skip(self))]
    pub async fn drain(&self, trigger: DrainTrigger) -> DrainReport {
        let queue = self.gateway.queue();

        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already in progress");
            return DrainReport {
                trigger,
                replayed: 0,
                remaining: queue.len().await,
                outcome: DrainOutcome::Skipped,
            };
        }
        let _guard = DrainGuard(&self.draining);

        let mut replayed = 0;
        let outcome = loop {
            if !self.gateway.monitor().is_online() {
                break DrainOutcome::WentOffline;
            }
            let Some(head) = queue.peek_head().await else {
                break DrainOutcome::Drained;
            };

            match self.gateway.replay(&head).await {
                Ok(Delivery::Response(body)) => {
                    let rename = head.local_ref.as_ref().and_then(|local_ref| {
                        body.pointer(&local_ref.id_pointer)
                            .and_then(EntityId::from_value)
                            .map(|server_id| (local_ref, server_id))
                    });
                    if head.local_ref.is_some() && rename.is_none() {
                        warn!(mutation_id = %head.id, "Create response carried no server id");
                    }

                    let rewrite = rename
                        .as_ref()
                        .map(|(local_ref, server_id)| (local_ref.local_id.as_str(), server_id.as_str()));
                    if let Err(e) = queue.complete_head(&head.id, rewrite).await {
                        error!("Replayed mutation could not be removed from the queue: {}", e);
                        break DrainOutcome::StorageFailed {
                            reason: e.to_string(),
                        };
                    }

                    if let Some((local_ref, server_id)) = rename {
                        let local_id = EntityId::new(local_ref.local_id.as_str());
                        if let Err(e) = self
                            .gateway
                            .shadow()
                            .rekey(&local_ref.collection, &local_id, &server_id)
                            .await
                        {
                            warn!("Failed to re-key shadow entity: {}", e);
                        }
                    }

                    replayed += 1;
                    info!(mutation_id = %head.id, endpoint = %head.endpoint, "Mutation replayed");
                }
                Ok(Delivery::Unreachable(e)) => {
                    warn!("Replay failed in transit: {}", e);
                    self.gateway.monitor().set_online(false).await;
                    break DrainOutcome::WentOffline;
                }
                Err(GatewayError::AuthExpired) => break DrainOutcome::AuthRequired,
                Err(e) => {
                    let reason = e.to_string();
                    match queue.requeue_at_head(&head.id, reason.as_str()).await {
                        Ok(RequeueOutcome::Retained { attempts }) => {
                            break DrainOutcome::Retrying {
                                mutation_id: head.id.clone(),
                                attempts,
                                error: reason,
                            };
                        }
                        Ok(RequeueOutcome::Exhausted(failed)) => {
                            self.notifier.dispatch(&Notification::sync_failed(
                                &failed.mutation.endpoint,
                                failed.mutation.attempts,
                            ));
                            self.events.emit(CoreEvent::SyncFailed {
                                mutation_id: failed.mutation.id.clone(),
                                endpoint: failed.mutation.endpoint.clone(),
                                attempts: failed.mutation.attempts,
                            });
                            break DrainOutcome::Exhausted {
                                mutation_id: failed.mutation.id,
                                attempts: failed.mutation.attempts,
                                last_error: failed.reason,
                            };
                        }
                        Err(qe) => {
                            break DrainOutcome::StorageFailed {
                                reason: qe.to_string(),
                            };
                        }
                    }
                }
            }
        };

        let report = DrainReport {
            trigger,
            replayed,
            remaining: queue.len().await,
            outcome,
        };

        if report.is_complete() && (replayed > 0 || trigger == DrainTrigger::Reconnect) {
            self.notifier.dispatch(&Notification::connection_restored());
        }
        if replayed > 0 {
            self.events.emit(CoreEvent::SyncCompleted { replayed });
        }

        info!(
            replayed = report.replayed,
            remaining = report.remaining,
            outcome = ?report.outcome,
            "Drain finished"
        );
        report
    }

    async fn next_delay(&self) -> Duration {
        match self.gateway.queue().peek_head().await {
            Some(head) if head.attempts > 0 => {
                Duration::from_millis(calculate_backoff(&self.config, head.attempts))
            }
            _ => self.config.retry_interval,
        }
    }

    /// Drains on a timer or on request until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let requests = self.gateway.drain_requests();
        info!("Reconciler started");

        loop {
            let delay = self.next_delay().await;
            let trigger = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(delay) => DrainTrigger::Timer,
                _ = requests.notified() => DrainTrigger::Requested,
            };

            if self.gateway.monitor().is_online() && !self.gateway.queue().is_empty().await {
                self.drain(trigger).await;
            }
        }

        info!("Reconciler stopped");
    }
}

#[async_trait]
impl ConnectionObserver for Reconciler {
    async fn on_online(&self) {
        self.drain(DrainTrigger::Reconnect).await;
    }

    async fn on_offline(&self) {
        self.notifier.dispatch(&Notification::connection_lost());
    }
}
