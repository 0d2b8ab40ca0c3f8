//! Work-queue controller loop
//!
//! Keys arrive from store events, periodic resync and delayed requeues. A
//! bounded channel caps the queue; keys already waiting are not queued
//! twice. Each worker runs one reconcile at a time on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::interval;

use super::cluster::{ObjectKey, StoreEvent};
use crate::cancel::CancellationToken;
use crate::config::ControllerConfig;
use crate::error::{PorchError, Result};
use crate::retry::Backoff;

/// Reconciles objects of one kind
pub trait Reconciler: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Every key that currently exists, for resync
    fn keys(&self) -> Vec<ObjectKey>;

    /// Drive the object named `key` towards its declared state
    fn reconcile(&self, key: &ObjectKey, token: &CancellationToken) -> Result<()>;

    /// Record a failed reconcile on the object, typically as a condition
    fn record_failure(&self, key: &ObjectKey, error: &PorchError);
}

/// Enqueues keys for a running [`Controller`]
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<ObjectKey>,
    queued: Arc<DashSet<ObjectKey>>,
}

impl QueueHandle {
    /// Queue `key` unless it is already waiting
    pub async fn enqueue(&self, key: ObjectKey) {
        if !self.queued.insert(key.clone()) {
            return;
        }
        if self.tx.send(key.clone()).await.is_err() {
            self.queued.remove(&key);
        }
    }

    fn enqueue_after(&self, key: ObjectKey, delay: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.enqueue(key).await;
        });
    }
}

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    config: ControllerConfig,
    backoff: Backoff,
    handle: QueueHandle,
    rx: mpsc::Receiver<ObjectKey>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, config: &ControllerConfig, backoff: Backoff) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        Self {
            reconciler,
            config: config.clone(),
            backoff,
            handle: QueueHandle {
                tx,
                queued: Arc::new(DashSet::new()),
            },
            rx,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Run until `shutdown` flips to true
    ///
    /// `events` feeds keys of this controller's kind into the queue. Every
    /// known key is queued at start and then once per resync period.
    pub async fn run(self, mut events: broadcast::Receiver<StoreEvent>, mut shutdown: watch::Receiver<bool>) {
        let kind = self.reconciler.kind();
        let token = CancellationToken::new();
        let failures: Arc<DashMap<ObjectKey, u32>> = Arc::new(DashMap::new());
        let rx = Arc::new(Mutex::new(self.rx));

        let mut workers = Vec::new();
        for worker in 0..self.config.workers_per_kind.max(1) {
            let rx = Arc::clone(&rx);
            let reconciler = Arc::clone(&self.reconciler);
            let handle = self.handle.clone();
            let failures = Arc::clone(&failures);
            let backoff = self.backoff.clone();
            let token = token.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let Some(key) = rx.lock().await.recv().await else { break };
                    handle.queued.remove(&key);
                    if token.is_cancelled() {
                        break;
                    }
                    let reconciler = Arc::clone(&reconciler);
                    let child = token.child();
                    let task_key = key.clone();
                    let outcome = tokio::task::spawn_blocking(move || {
                        let result = reconciler.reconcile(&task_key, &child);
                        if let Err(e) = &result {
                            reconciler.record_failure(&task_key, e);
                        }
                        result
                    })
                    .await
                    .unwrap_or_else(|e| Err(PorchError::internal(format!("reconcile task failed: {e}"))));

                    match outcome {
                        Ok(()) => {
                            failures.remove(&key);
                            tracing::debug!(kind, %key, worker, "reconciled");
                        }
                        Err(e) if e.kind().is_retryable() => {
                            let attempt = {
                                let mut count = failures.entry(key.clone()).or_insert(0);
                                *count += 1;
                                *count - 1
                            };
                            let delay = backoff.delay(attempt);
                            tracing::warn!(kind, %key, attempt, delay_ms = delay.as_millis() as u64, error = %e, "reconcile failed, requeueing");
                            handle.enqueue_after(key, delay);
                        }
                        Err(e) => {
                            failures.remove(&key);
                            tracing::warn!(kind, %key, error = %e, "reconcile failed");
                        }
                    }
                }
            }));
        }

        let mut resync = interval(self.config.resync());
        tracing::info!(kind, workers = workers.len(), "controller started");
        loop {
            tokio::select! {
                _ = resync.tick() => {
                    for key in self.reconciler.keys() {
                        self.handle.enqueue(key).await;
                    }
                }
                event = events.recv() => match event {
                    Ok(event) if event.kind == kind => self.handle.enqueue(event.key).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(kind, missed, "event stream lagged, resyncing");
                        for key in self.reconciler.keys() {
                            self.handle.enqueue(key).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        token.cancel();
        for worker in workers {
            worker.abort();
        }
        tracing::info!(kind, "controller stopped");
    }
}
