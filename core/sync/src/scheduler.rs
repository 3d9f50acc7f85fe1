//! Sync scheduling - manual and periodic triggers.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use edgesync_common::{Error, Result};

use crate::manager::{SyncManager, SyncReason, TriggerResult};

/// Requests handled by the scheduler task.
#[derive(Debug)]
enum SchedulerRequest {
    Trigger(SyncReason, oneshot::Sender<Result<TriggerResult>>),
    Shutdown,
}

/// Front end for asking the scheduler task to sync.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a scheduler, triggering every `period` when given.
    pub fn new(period: Option<Duration>) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let handle = SyncSchedulerHandle { period, request_rx };
        (Self { request_tx }, handle)
    }

    /// Request a sync and wait for its outcome.
    pub async fn request_sync(&self, reason: SyncReason) -> Result<TriggerResult> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SchedulerRequest::Trigger(reason, response_tx))
            .await
            .map_err(|_| Error::Internal("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Internal("Failed to receive sync result".to_string()))?
    }

    /// Stop the scheduler task. Syncs already started run to completion.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// The scheduler's background half.
pub struct SyncSchedulerHandle {
    period: Option<Duration>,
    request_rx: mpsc::Receiver<SchedulerRequest>,
}

impl SyncSchedulerHandle {
    /// Run until shut down or every [`SyncScheduler`] is dropped.
    ///
    /// Each trigger is handed to the manager on its own task, so triggers
    /// arriving during a sync coalesce in the manager instead of queueing
    /// here.
    pub async fn run(mut self, manager: SyncManager) {
        let mut periodic = self.period.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(period_secs = self.period.map(|p| p.as_secs()), "Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(SchedulerRequest::Trigger(reason, response_tx)) => {
                            debug!(reason = %reason, "Processing sync request");
                            let manager = manager.clone();
                            tokio::spawn(async move {
                                let _ = response_tx.send(manager.trigger_sync(reason).await);
                            });
                        }
                        Some(SchedulerRequest::Shutdown) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = wait_for_periodic(&mut periodic) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        match manager.trigger_sync(SyncReason::scheduled()).await {
                            Ok(result) => debug!(ran = result.ran, queued = result.queued, "Scheduled sync finished"),
                            Err(e) => error!(error = %e, "Scheduled sync failed"),
                        }
                    });
                }
            }
        }
    }
}

async fn wait_for_periodic(periodic: &mut Option<Interval>) {
    match periodic {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
