//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use repsync_common::{Error, Result};

use crate::orchestrator::{SyncOrchestrator, SyncOutcome, SyncReport};

/// When syncs run without an explicit trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only on request.
    #[default]
    Manual,
    /// Additionally every `interval`.
    Periodic { interval: Duration },
}

enum SchedulerRequest {
    Full(oneshot::Sender<Option<SyncReport>>),
    Store(String, oneshot::Sender<Result<SyncOutcome>>),
    ModeChanged,
    Shutdown,
}

/// Background task serializing sync requests and periodic ticks.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<SchedulerRequest>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    /// Spawn the scheduler task for `orchestrator`.
    pub fn spawn(orchestrator: SyncOrchestrator, mode: SyncMode) -> Self {
        let (request_tx, request_rx) = mpsc::channel(32);
        let mode = Arc::new(RwLock::new(mode));
        let task = tokio::spawn(run(orchestrator, mode.clone(), request_rx));

        Self {
            mode,
            request_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a full sync and wait for its report.
    pub async fn request_sync(&self) -> Result<Option<SyncReport>> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerRequest::Full(tx)).await?;
        rx.await.map_err(|_| stopped())
    }

    /// Request a sync of one store and wait for the outcome.
    pub async fn request_store_sync(&self, name: impl Into<String>) -> Result<SyncOutcome> {
        let (tx, rx) = oneshot::channel();
        self.send(SchedulerRequest::Store(name.into(), tx)).await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Switch modes; a periodic interval restarts from now.
    pub async fn set_mode(&self, mode: SyncMode) -> Result<()> {
        *self.mode.write().await = mode;
        self.send(SchedulerRequest::ModeChanged).await
    }

    /// Current mode.
    pub async fn mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Ask the task to stop without waiting for it.
    ///
    /// A sync already running finishes first.
    pub fn stop(&self) {
        if self.request_tx.try_send(SchedulerRequest::Shutdown).is_err() {
            if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn send(&self, request: SchedulerRequest) -> Result<()> {
        self.request_tx.send(request).await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::InvalidInput("Sync scheduler is not running".to_string())
}

async fn run(
    orchestrator: SyncOrchestrator,
    mode: Arc<RwLock<SyncMode>>,
    mut request_rx: mpsc::Receiver<SchedulerRequest>,
) {
    let mut ticker = periodic_interval(&*mode.read().await);
    info!("Sync scheduler started");

    loop {
        tokio::select! {
            request = request_rx.recv() => match request {
                None | Some(SchedulerRequest::Shutdown) => break,
                Some(SchedulerRequest::Full(reply)) => {
                    let _ = reply.send(orchestrator.trigger_sync().await);
                }
                Some(SchedulerRequest::Store(name, reply)) => {
                    let _ = reply.send(orchestrator.trigger_store_sync(&name).await);
                }
                Some(SchedulerRequest::ModeChanged) => {
                    let mode = mode.read().await.clone();
                    debug!(?mode, "Sync mode changed");
                    ticker = periodic_interval(&mode);
                }
            },
            _ = tick(&mut ticker) => {
                debug!("Periodic sync tick");
                if let Some(report) = orchestrator.trigger_sync().await {
                    debug!(
                        succeeded = report.succeeded.len(),
                        failed = report.failed.len(),
                        "Periodic sync completed"
                    );
                }
            }
        }
    }

    info!("Sync scheduler stopped");
}

fn periodic_interval(mode: &SyncMode) -> Option<Interval> {
    match mode {
        SyncMode::Manual => None,
        SyncMode::Periodic { interval } => {
            let mut ticker = interval_at(Instant::now() + *interval, *interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ManualProbe, NetworkState};
    use crate::orchestrator::{Session, StoreConfig, SyncConfig};
    use crate::retry::RetryConfig;
    use crate::store::SyncableStore;
    use async_trait::async_trait;
    use repsync_common::UserId;
    use repsync_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingStore {
        pulls: AtomicUsize,
    }

    #[async_trait]
    impl SyncableStore for CountingStore {
        async fn pull(&self) -> Result<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn push(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn signed_in() -> (SyncOrchestrator, Arc<CountingStore>) {
        let orchestrator = SyncOrchestrator::with_storage(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualProbe::new(NetworkState::online("wifi"))),
            SyncConfig::default().with_retry(RetryConfig::none()),
        );
        orchestrator.initialize().await.unwrap();
        let store = Arc::new(CountingStore::default());
        orchestrator
            .register_store(StoreConfig::new("workouts", store.clone()).with_sync_on_sign_in(false))
            .await
            .unwrap();
        orchestrator
            .on_sign_in(Session::new(UserId::new("alice").unwrap()))
            .await;
        (orchestrator, store)
    }

    #[tokio::test]
    async fn test_mode_change() {
        let (orchestrator, _store) = signed_in().await;
        let scheduler = SyncScheduler::spawn(orchestrator, SyncMode::Manual);
        assert_eq!(scheduler.mode().await, SyncMode::Manual);

        let periodic = SyncMode::Periodic {
            interval: Duration::from_secs(60),
        };
        scheduler.set_mode(periodic.clone()).await.unwrap();
        assert_eq!(scheduler.mode().await, periodic);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_run_syncs() {
        let (orchestrator, store) = signed_in().await;
        let scheduler = SyncScheduler::spawn(orchestrator, SyncMode::Manual);

        let report = scheduler.request_sync().await.unwrap().unwrap();
        assert_eq!(report.succeeded, vec!["workouts".to_string()]);

        let outcome = scheduler.request_store_sync("workouts").await.unwrap();
        assert_eq!(outcome, SyncOutcome::Synced);
        assert_eq!(store.pulls.load(Ordering::SeqCst), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_ticks() {
        let (orchestrator, store) = signed_in().await;
        let scheduler = SyncScheduler::spawn(
            orchestrator,
            SyncMode::Periodic {
                interval: Duration::from_millis(20),
            },
        );

        for _ in 0..100 {
            if store.pulls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.pulls.load(Ordering::SeqCst) >= 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let (orchestrator, _store) = signed_in().await;
        let scheduler = SyncScheduler::spawn(orchestrator, SyncMode::Manual);
        scheduler.shutdown().await;

        assert!(scheduler.request_sync().await.is_err());
        assert!(scheduler.set_mode(SyncMode::Manual).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let (orchestrator, _store) = signed_in().await;
        let scheduler = SyncScheduler::spawn(orchestrator, SyncMode::Manual);
        scheduler.stop();

        for _ in 0..100 {
            if scheduler.request_sync().await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scheduler.request_sync().await.is_err());
    }
}
