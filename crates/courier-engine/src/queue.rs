//! Delivery queue: a priority/delay broker, the durable per-notification
//! queue entry, and the worker pool that drains the broker.
//!
//! The broker holds at most one job per notification. Re-enqueueing
//! supersedes the previous job, which makes enqueue idempotent and lets a
//! retry reschedule without leaving a stale duplicate behind. The durable
//! `QueueEntry` mirrors broker state in the store so processing history
//! survives the broker's memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use courier_core::EngineConfig;
use crate::delivery::{DeliveryDisposition, DeliveryEngine};
use crate::retry::resolve_priority;
use crate::store::NotificationStore;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("storage error: {0}")]
    Store(#[from] crate::store::StoreError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Lifecycle of a durable queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueEntryStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl QueueEntryStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }
}

/// Durable record of a notification's place in the queue. Keyed by
/// notification id in the store; terminal entries remain for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub queue: String,
    pub status: QueueEntryStatus,
    pub attempts: u32,
    pub next_attempt: DateTime<Utc>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(notification_id: Uuid, queue: impl Into<String>, next_attempt: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            notification_id,
            queue: queue.into(),
            status: QueueEntryStatus::Queued,
            attempts: 0,
            next_attempt,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A scheduled unit of delivery work in the broker.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub queue: String,
    /// Smaller is more urgent.
    pub priority: u8,
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(
        notification_id: Uuid,
        queue: impl Into<String>,
        priority: u8,
        run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            queue: queue.into(),
            priority,
            run_at,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }
}

/// Broker holding at most one pending job per notification.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Insert a job, replacing any pending job for the same notification.
    async fn push(&self, job: DeliveryJob) -> QueueResult<()>;

    /// Remove and return the most urgent ready job on the queue: smallest
    /// `(priority, run_at)` among jobs whose `run_at` has passed.
    async fn pop_ready(&self, queue: &str) -> QueueResult<Option<DeliveryJob>>;

    /// Drop the pending job for a notification. Returns whether one existed.
    async fn remove(&self, notification_id: Uuid) -> QueueResult<bool>;

    /// Whether a pending job exists for the notification.
    async fn contains(&self, notification_id: Uuid) -> QueueResult<bool>;

    /// Jobs ready to run now.
    async fn waiting_count(&self) -> QueueResult<usize>;

    /// Jobs scheduled for the future.
    async fn delayed_count(&self) -> QueueResult<usize>;
}

/// In-memory broker for development and testing.
pub struct MemoryDeliveryQueue {
    jobs: RwLock<HashMap<Uuid, DeliveryJob>>,
}

impl Default for MemoryDeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDeliveryQueue {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl DeliveryQueue for MemoryDeliveryQueue {
    async fn push(&self, job: DeliveryJob) -> QueueResult<()> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.notification_id, job);
        Ok(())
    }

    async fn pop_ready(&self, queue: &str) -> QueueResult<Option<DeliveryJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let best = jobs
            .values()
            .filter(|j| j.queue == queue && j.is_ready(now))
            .min_by_key(|j| (j.priority, j.run_at, j.enqueued_at))
            .map(|j| j.notification_id);
        Ok(best.and_then(|id| jobs.remove(&id)))
    }

    async fn remove(&self, notification_id: Uuid) -> QueueResult<bool> {
        let mut jobs = self.jobs.write().await;
        Ok(jobs.remove(&notification_id).is_some())
    }

    async fn contains(&self, notification_id: Uuid) -> QueueResult<bool> {
        let jobs = self.jobs.read().await;
        Ok(jobs.contains_key(&notification_id))
    }

    async fn waiting_count(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| j.is_ready(now)).count())
    }

    async fn delayed_count(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| !j.is_ready(now)).count())
    }
}

/// Aggregate queue health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub waiting: usize,
    pub delayed: usize,
}

/// Drives deliveries through the broker with a pool of workers.
///
/// A per-notification lease guards against two workers processing the same
/// notification concurrently; a job that hits a held lease is pushed back
/// with a short delay instead of being dropped.
pub struct QueueCoordinator {
    store: Arc<dyn NotificationStore>,
    broker: Arc<dyn DeliveryQueue>,
    engine: Arc<DeliveryEngine>,
    config: EngineConfig,
    leases: DashMap<Uuid, ()>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueCoordinator {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        broker: Arc<dyn DeliveryQueue>,
        engine: Arc<DeliveryEngine>,
        config: EngineConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            broker,
            engine,
            config,
            leases: DashMap::new(),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Schedule delivery of a notification. `run_at` of `None` means now.
    /// Re-enqueueing supersedes any pending job for the same notification.
    pub async fn enqueue(&self, notification_id: Uuid, run_at: Option<DateTime<Utc>>) -> QueueResult<()> {
        let now = Utc::now();
        let run_at = run_at.unwrap_or(now);
        let priority = resolve_priority(run_at, now);

        // Keep attempt history across re-enqueues.
        let mut entry = match self.store.get_queue_entry(notification_id).await? {
            Some(existing) => existing,
            None => QueueEntry::new(notification_id, &self.config.queue_name, run_at),
        };
        entry.status = QueueEntryStatus::Queued;
        entry.next_attempt = run_at;
        entry.updated_at = now;
        self.store.upsert_queue_entry(&entry).await?;

        let job = DeliveryJob::new(notification_id, &self.config.queue_name, priority, run_at);
        self.broker.push(job).await?;
        debug!(%notification_id, %priority, %run_at, "delivery enqueued");
        Ok(())
    }

    /// Remove a notification's pending job and cancel its queue entry.
    /// An entry already being processed is left to finish. Returns whether
    /// anything was withdrawn.
    pub async fn cancel(&self, notification_id: Uuid) -> QueueResult<bool> {
        let removed = self.broker.remove(notification_id).await?;

        let mut cancelled = false;
        if let Some(mut entry) = self.store.get_queue_entry(notification_id).await? {
            if entry.status == QueueEntryStatus::Queued {
                entry.status = QueueEntryStatus::Cancelled;
                entry.updated_at = Utc::now();
                self.store.upsert_queue_entry(&entry).await?;
                cancelled = true;
            }
        }
        Ok(removed || cancelled)
    }

    /// Spawn the worker pool.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.config.worker_concurrency {
            let coordinator = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                coordinator.worker_loop(worker_id, shutdown_rx).await;
            }));
        }
        info!(
            workers = self.config.worker_concurrency,
            queue = %self.config.queue_name,
            "delivery workers started"
        );
    }

    /// Signal the workers to stop and wait for them to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        info!("delivery workers stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        let poll_interval = StdDuration::from_millis(self.config.poll_interval_ms);
        debug!(worker_id, "worker loop started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.broker.pop_ready(&self.config.queue_name).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "failed to poll delivery queue");
                    tokio::select! {
                        _ = tokio::time::sleep(StdDuration::from_secs(1)) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
            }
        }
        debug!(worker_id, "worker loop stopped");
    }

    async fn process_job(&self, job: DeliveryJob) {
        let notification_id = job.notification_id;
        if !self.try_lease(notification_id) {
            // Another worker holds this notification. A job already in the
            // broker (such as a backoff retry scheduled by the in-flight
            // attempt) keeps its slot; otherwise come back shortly.
            match self.broker.contains(notification_id).await {
                Ok(true) => {}
                Ok(false) => {
                    let retry_at = Utc::now()
                        + chrono::Duration::milliseconds(2 * self.config.poll_interval_ms as i64);
                    let mut retry_job = job;
                    retry_job.run_at = retry_at;
                    if let Err(e) = self.broker.push(retry_job).await {
                        warn!(%notification_id, error = %e, "failed to re-push busy job");
                    }
                }
                Err(e) => {
                    warn!(%notification_id, error = %e, "failed to check for pending job");
                }
            }
            return;
        }

        if let Err(e) = self.process_locked(notification_id).await {
            warn!(%notification_id, error = %e, "delivery job failed");
        }
        self.leases.remove(&notification_id);
    }

    /// Process a notification immediately on the caller's task, bypassing
    /// the broker. A no-op when a worker already holds the lease.
    pub async fn deliver_now(&self, notification_id: Uuid) -> QueueResult<()> {
        if !self.try_lease(notification_id) {
            return Ok(());
        }
        let result = self.process_locked(notification_id).await;
        self.leases.remove(&notification_id);
        result
    }

    fn try_lease(&self, notification_id: Uuid) -> bool {
        match self.leases.entry(notification_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                true
            }
        }
    }

    /// Caller must hold the lease for `notification_id`.
    async fn process_locked(&self, notification_id: Uuid) -> QueueResult<()> {
        let now = Utc::now();
        let mut entry = match self.store.get_queue_entry(notification_id).await? {
            Some(existing) => existing,
            None => QueueEntry::new(notification_id, &self.config.queue_name, now),
        };
        entry.status = QueueEntryStatus::Processing;
        entry.attempts += 1;
        entry.updated_at = now;
        self.store.upsert_queue_entry(&entry).await?;

        match self.engine.deliver(notification_id).await {
            Ok(outcome) => {
                match outcome.disposition {
                    DeliveryDisposition::Delivered | DeliveryDisposition::Skipped => {
                        entry.status = QueueEntryStatus::Completed;
                        entry.error_message = None;
                        entry.updated_at = Utc::now();
                        self.store.upsert_queue_entry(&entry).await?;
                    }
                    DeliveryDisposition::Failed => {
                        entry.status = QueueEntryStatus::Failed;
                        entry.error_message = Some(outcome.failures.join("; "));
                        entry.updated_at = Utc::now();
                        self.store.upsert_queue_entry(&entry).await?;
                    }
                    DeliveryDisposition::Retry(retry_at) => {
                        // enqueue() re-persists the entry as QUEUED and
                        // supersedes the broker job.
                        self.enqueue(notification_id, Some(retry_at)).await?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                entry.status = QueueEntryStatus::Failed;
                entry.error_message = Some(e.to_string());
                entry.updated_at = Utc::now();
                self.store.upsert_queue_entry(&entry).await?;
                Err(QueueError::Backend(e.to_string()))
            }
        }
    }

    /// Combined durable-entry and broker counters.
    pub async fn queue_stats(&self) -> QueueResult<QueueStats> {
        let counts = self.store.queue_entry_counts().await?;
        let count = |status: QueueEntryStatus| counts.get(&status).copied().unwrap_or(0);
        Ok(QueueStats {
            queued: count(QueueEntryStatus::Queued),
            processing: count(QueueEntryStatus::Processing),
            completed: count(QueueEntryStatus::Completed),
            failed: count(QueueEntryStatus::Failed),
            cancelled: count(QueueEntryStatus::Cancelled),
            waiting: self.broker.waiting_count().await?,
            delayed: self.broker.delayed_count().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::channels::GatewayRegistry;
    use crate::store::MemoryNotificationStore;
    use crate::webhook::{WebhookDispatcher, WebhookRequest, WebhookResult, WebhookTransport};

    fn job(priority: u8, run_at: DateTime<Utc>) -> DeliveryJob {
        DeliveryJob::new(Uuid::new_v4(), "notifications", priority, run_at)
    }

    struct NullTransport;

    #[async_trait]
    impl WebhookTransport for NullTransport {
        async fn post(
            &self,
            _request: &WebhookRequest,
            _timeout: std::time::Duration,
        ) -> WebhookResult<u16> {
            Ok(200)
        }
    }

    fn new_coordinator() -> (Arc<QueueCoordinator>, Arc<MemoryDeliveryQueue>) {
        let config = EngineConfig::default();
        let store = Arc::new(MemoryNotificationStore::new());
        let broker = Arc::new(MemoryDeliveryQueue::new());
        let webhooks = Arc::new(WebhookDispatcher::new(
            store.clone(),
            Arc::new(NullTransport),
            &config,
        ));
        let engine = Arc::new(DeliveryEngine::new(
            store.clone(),
            GatewayRegistry::new().with_defaults(),
            webhooks,
            &config,
        ));
        let coordinator = Arc::new(QueueCoordinator::new(store, broker.clone(), engine, config));
        (coordinator, broker)
    }

    #[tokio::test]
    async fn test_pop_ready_orders_by_priority_then_time() {
        let queue = MemoryDeliveryQueue::new();
        let now = Utc::now();

        let urgent = job(1, now - Duration::minutes(1));
        let earlier_but_lazy = job(5, now - Duration::minutes(10));
        let future = job(1, now + Duration::minutes(10));

        queue.push(earlier_but_lazy.clone()).await.unwrap();
        queue.push(urgent.clone()).await.unwrap();
        queue.push(future).await.unwrap();

        let first = queue.pop_ready("notifications").await.unwrap().unwrap();
        assert_eq!(first.notification_id, urgent.notification_id);

        let second = queue.pop_ready("notifications").await.unwrap().unwrap();
        assert_eq!(second.notification_id, earlier_but_lazy.notification_id);

        // The future job is not ready yet.
        assert!(queue.pop_ready("notifications").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_push_supersedes_same_notification() {
        let queue = MemoryDeliveryQueue::new();
        let notification_id = Uuid::new_v4();
        let now = Utc::now();

        let first = DeliveryJob::new(notification_id, "notifications", 8, now + Duration::hours(1));
        let second = DeliveryJob::new(notification_id, "notifications", 1, now);
        queue.push(first).await.unwrap();
        queue.push(second).await.unwrap();

        let popped = queue.pop_ready("notifications").await.unwrap().unwrap();
        assert_eq!(popped.priority, 1);
        assert!(queue.pop_ready("notifications").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_counts() {
        let queue = MemoryDeliveryQueue::new();
        let now = Utc::now();

        let ready = job(3, now - Duration::seconds(1));
        let delayed = job(3, now + Duration::hours(1));
        queue.push(ready.clone()).await.unwrap();
        queue.push(delayed).await.unwrap();

        assert_eq!(queue.waiting_count().await.unwrap(), 1);
        assert_eq!(queue.delayed_count().await.unwrap(), 1);
        assert!(queue.contains(ready.notification_id).await.unwrap());

        assert!(queue.remove(ready.notification_id).await.unwrap());
        assert!(!queue.remove(ready.notification_id).await.unwrap());
        assert!(!queue.contains(ready.notification_id).await.unwrap());
        assert_eq!(queue.waiting_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_ready_respects_queue_name() {
        let queue = MemoryDeliveryQueue::new();
        let now = Utc::now();
        queue
            .push(DeliveryJob::new(Uuid::new_v4(), "other", 1, now))
            .await
            .unwrap();

        assert!(queue.pop_ready("notifications").await.unwrap().is_none());
        assert!(queue.pop_ready("other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_busy_job_keeps_existing_scheduled_job() {
        let (coordinator, broker) = new_coordinator();
        let notification_id = Uuid::new_v4();
        coordinator.leases.insert(notification_id, ());

        // A backoff retry is already scheduled well into the future.
        let scheduled = DeliveryJob::new(
            notification_id,
            "notifications",
            3,
            Utc::now() + Duration::hours(1),
        );
        broker.push(scheduled).await.unwrap();

        coordinator
            .process_job(DeliveryJob::new(
                notification_id,
                "notifications",
                1,
                Utc::now(),
            ))
            .await;

        // The scheduled job keeps its slot instead of being replaced with a
        // near-immediate one (the re-push delay is 2x the poll interval).
        assert_eq!(broker.delayed_count().await.unwrap(), 1);
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        assert!(broker.pop_ready("notifications").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_busy_job_re_pushed_when_nothing_scheduled() {
        let (coordinator, broker) = new_coordinator();
        let notification_id = Uuid::new_v4();
        coordinator.leases.insert(notification_id, ());

        coordinator
            .process_job(DeliveryJob::new(
                notification_id,
                "notifications",
                1,
                Utc::now(),
            ))
            .await;

        assert!(broker.contains(notification_id).await.unwrap());
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        let job = broker.pop_ready("notifications").await.unwrap().unwrap();
        assert_eq!(job.notification_id, notification_id);
    }

    #[test]
    fn test_entry_status_active() {
        assert!(QueueEntryStatus::Queued.is_active());
        assert!(QueueEntryStatus::Processing.is_active());
        assert!(!QueueEntryStatus::Completed.is_active());
        assert!(!QueueEntryStatus::Failed.is_active());
        assert!(!QueueEntryStatus::Cancelled.is_active());
    }
}
