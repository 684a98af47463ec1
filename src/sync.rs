use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

use crate::api::{ApiError, ResilientClient};
use crate::connectivity::ConnectivityMonitor;
use crate::operation::{OperationStatus, RetryStrategy};
use crate::queue::{OperationStore, QueueStats};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Queue error: {0}")]
    Queue(String),
    #[error("Task join error: {0}")]
    Join(String),
}

/// Configuration for drain cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum operations fetched per queue read
    pub batch_size: usize,
    /// Interval between background drain cycles in seconds
    pub drain_interval_seconds: u64,
    /// Maximum operations dispatched to the network concurrently
    pub max_concurrent_dispatches: usize,
    /// Age after which an in-progress claim is considered abandoned
    pub stale_claim_seconds: u64,
    /// Enable the automatic background drain loop
    pub background_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            drain_interval_seconds: 300,
            max_concurrent_dispatches: 4,
            stale_claim_seconds: 600,
            background_sync: true,
        }
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default)]
pub struct DrainResult {
    /// Operations claimed and dispatched this cycle
    pub attempted: usize,
    /// Operations acknowledged by the backend
    pub completed: usize,
    /// Operations returned to pending for a later backoff retry
    pub retried: usize,
    /// Operations that failed terminally (validation or retries exhausted)
    pub failed: usize,
    /// In-progress claims from a previous crash returned to pending
    pub reclaimed: usize,
    /// True when the cycle was cut short because the session expired
    pub session_expired: bool,
    /// True when the cycle was skipped because the device is offline
    pub skipped_offline: bool,
    pub duration: Duration,
}

/// Drains the durable operation queue against the backend.
///
/// One drain runs at a time; within a cycle, dispatch concurrency is bounded
/// and operations touching the same entity never run in parallel (the store
/// hands out at most one claim per entity).
pub struct SyncManager {
    config: SyncConfig,
    retry_strategy: RetryStrategy,
    client: Arc<ResilientClient>,
    connectivity: Arc<ConnectivityMonitor>,
    db_path: PathBuf,
    /// Serializes drain cycles so a timer tick and a reconnect signal cannot
    /// double-dispatch the same batch.
    drain_lock: Mutex<()>,
    /// Latched true when the backend invalidates the session mid-drain.
    session_expired_tx: watch::Sender<bool>,
    total_drains: AtomicU64,
    total_completed: AtomicU64,
    total_failed: AtomicU64,
}

impl SyncManager {
    pub fn new(
        client: Arc<ResilientClient>,
        connectivity: Arc<ConnectivityMonitor>,
        db_path: PathBuf,
    ) -> Self {
        Self::with_config(SyncConfig::default(), client, connectivity, db_path)
    }

    pub fn with_config(
        config: SyncConfig,
        client: Arc<ResilientClient>,
        connectivity: Arc<ConnectivityMonitor>,
        db_path: PathBuf,
    ) -> Self {
        let (session_expired_tx, _) = watch::channel(false);
        Self {
            config,
            retry_strategy: RetryStrategy::default(),
            client,
            connectivity,
            db_path,
            drain_lock: Mutex::new(()),
            session_expired_tx,
            total_drains: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        }
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    /// Watch channel that flips to true when re-authentication is required.
    pub fn subscribe_session_expiry(&self) -> watch::Receiver<bool> {
        self.session_expired_tx.subscribe()
    }

    /// Drain pending operations, skipping entirely while offline.
    pub async fn drain(&self) -> Result<DrainResult, SyncError> {
        self.drain_inner(false).await
    }

    /// Drain regardless of the cached connectivity state. Used for the
    /// explicit sync command, where the user asserts reachability.
    pub async fn force_drain(&self) -> Result<DrainResult, SyncError> {
        self.drain_inner(true).await
    }

    async fn drain_inner(&self, ignore_connectivity: bool) -> Result<DrainResult, SyncError> {
        if !ignore_connectivity && !self.connectivity.is_online() {
            tracing::debug!("Device offline, skipping drain cycle");
            return Ok(DrainResult {
                skipped_offline: true,
                ..DrainResult::default()
            });
        }

        let _guard = self.drain_lock.lock().await;
        let started = Instant::now();
        let mut result = DrainResult::default();

        // Claims abandoned by a crashed process go back to pending first so
        // this cycle can pick them up.
        let stale_after = Duration::from_secs(self.config.stale_claim_seconds);
        result.reclaimed = self
            .with_store(move |store| store.reclaim_stale(stale_after, Utc::now()))
            .await?;
        if result.reclaimed > 0 {
            tracing::info!(
                reclaimed = result.reclaimed,
                "Returned stale in-progress operations to pending"
            );
        }

        // Each operation gets at most one attempt per cycle, even when the
        // configured backoff would make a failed one eligible again at once.
        let mut attempted_ids = std::collections::HashSet::new();

        loop {
            let batch_size = self.config.batch_size;
            let strategy = self.retry_strategy.clone();
            let mut batch = self
                .with_store(move |store| store.next_batch(batch_size, Utc::now(), &strategy))
                .await?;
            batch.retain(|op| !attempted_ids.contains(&op.id));
            if batch.is_empty() {
                break;
            }

            // Claim each operation before dispatch; a claim can fail if a
            // competing process took the entity first.
            let claimed = self
                .with_store(move |store| {
                    let now = Utc::now();
                    let mut claimed = Vec::with_capacity(batch.len());
                    for op in batch {
                        if store.mark_in_progress(&op.id, now)? {
                            claimed.push(op);
                        }
                    }
                    Ok(claimed)
                })
                .await?;
            if claimed.is_empty() {
                break;
            }
            for op in &claimed {
                attempted_ids.insert(op.id.clone());
            }
            result.attempted += claimed.len();

            let mut join_set = JoinSet::new();
            let mut outcomes: Vec<(String, Result<(), ApiError>)> = Vec::new();
            for op in claimed {
                while join_set.len() >= self.config.max_concurrent_dispatches {
                    if let Some(joined) = join_set.join_next().await {
                        match joined {
                            Ok(outcome) => outcomes.push(outcome),
                            // A panicked dispatch leaves the claim in place;
                            // reclaim_stale recovers it next cycle.
                            Err(e) => tracing::warn!("Dispatch task failed: {}", e),
                        }
                    }
                }
                let client = Arc::clone(&self.client);
                join_set.spawn(async move {
                    let outcome = client.submit_operation(&op).await;
                    (op.id, outcome)
                });
            }
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => tracing::warn!("Dispatch task failed: {}", e),
                }
            }

            let (completed, retried, failed, expired) = self
                .with_store(move |store| {
                    let now = Utc::now();
                    let mut completed = 0;
                    let mut retried = 0;
                    let mut failed = 0;
                    let mut expired = false;
                    for (id, outcome) in outcomes {
                        match outcome {
                            Ok(()) => {
                                store.mark_completed(&id)?;
                                completed += 1;
                            }
                            Err(ApiError::SessionExpired) => {
                                // The operation itself is fine; it retries
                                // once the user signs back in.
                                store.mark_failed(
                                    &id,
                                    "session expired, re-authentication required",
                                    false,
                                    now,
                                )?;
                                expired = true;
                            }
                            Err(e) if e.is_retryable() => {
                                match store.mark_failed(&id, &e.to_string(), false, now)? {
                                    OperationStatus::Failed => failed += 1,
                                    _ => retried += 1,
                                }
                            }
                            Err(e) => {
                                store.mark_failed(&id, &e.to_string(), true, now)?;
                                failed += 1;
                            }
                        }
                    }
                    Ok((completed, retried, failed, expired))
                })
                .await?;

            result.completed += completed;
            result.retried += retried;
            result.failed += failed;

            if expired {
                result.session_expired = true;
                tracing::warn!("Session expired mid-drain, aborting cycle");
                self.session_expired_tx.send_replace(true);
                break;
            }
        }

        result.duration = started.elapsed();
        self.record_drain(&result);
        Ok(result)
    }

    fn record_drain(&self, result: &DrainResult) {
        self.total_drains.fetch_add(1, Ordering::Relaxed);
        self.total_completed
            .fetch_add(result.completed as u64, Ordering::Relaxed);
        self.total_failed
            .fetch_add(result.failed as u64, Ordering::Relaxed);

        tracing::info!(
            attempted = result.attempted,
            completed = result.completed,
            retried = result.retried,
            failed = result.failed,
            reclaimed = result.reclaimed,
            session_expired = result.session_expired,
            duration_ms = result.duration.as_millis() as u64,
            total_drains = self.total_drains.load(Ordering::Relaxed),
            "Drain cycle finished"
        );
    }

    /// Current queue composition, for the status command.
    pub async fn status(&self) -> Result<QueueStats, SyncError> {
        self.with_store(|store| store.stats()).await
    }

    /// Delete terminal operations older than `max_age_days` (0 deletes all).
    pub async fn cleanup(&self, max_age_days: i64) -> Result<usize, SyncError> {
        self.with_store(move |store| {
            let removed = store.cleanup_terminal(max_age_days)?;
            store.vacuum()?;
            Ok(removed)
        })
        .await
    }

    /// Background drain loop plus a reconnect-triggered drain. Runs until
    /// the process exits.
    pub fn start_background(self: &Arc<Self>) {
        if !self.config.background_sync {
            tracing::info!("Background sync disabled in configuration");
            return;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(
                interval_seconds = manager.config.drain_interval_seconds,
                "Background drain loop started"
            );
            loop {
                // Jitter between cycles so many clients recovering from the
                // same outage do not drain in lockstep.
                let jitter = if manager.retry_strategy.jitter_seconds > 0 {
                    rand::random::<u64>() % manager.retry_strategy.jitter_seconds
                } else {
                    0
                };
                tokio::time::sleep(Duration::from_secs(
                    manager.config.drain_interval_seconds + jitter,
                ))
                .await;

                if let Err(e) = manager.drain().await {
                    tracing::warn!("Background drain failed: {}", e);
                }
            }
        });

        let manager = Arc::clone(self);
        let mut rx = self.connectivity.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow();
                if online {
                    tracing::info!("Connectivity restored, draining queue");
                    if let Err(e) = manager.drain().await {
                        tracing::warn!("Drain on reconnect failed: {}", e);
                    }
                }
            }
        });
    }

    /// Run a closure against the SQLite store on the blocking pool. The
    /// store is opened per call; connections are cheap and this keeps the
    /// rusqlite handle off the async runtime.
    async fn with_store<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&OperationStore) -> Result<T, crate::queue::QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let store = OperationStore::open(path).map_err(|e| SyncError::Queue(e.to_string()))?;
            f(&store).map_err(|e| SyncError::Queue(e.to_string()))
        })
        .await
        .map_err(|e| SyncError::Join(e.to_string()))?
    }
}
