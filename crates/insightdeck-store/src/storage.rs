// ABOUTME: HybridStorage, the public CRUD surface: cache-synchronous reads and writes, asynchronous persistence.
// ABOUTME: Owns the cache, write-back queue, executor, and flush timer; hydrates lazily and drains on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use insightdeck_core::{
    EnterpriseInquiry, EntityKind, GuidedAnalysisOrder, NewEnterpriseInquiry,
    NewGuidedAnalysisOrder, NewProject, NewUser, Project, ProjectUpdate, UpsertUser, User,
    UserUpdate,
};
use tokio::sync::{Mutex, OnceCell, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use ulid::Ulid;

use crate::cache::{CacheCounts, EntityCache};
use crate::codec::RowCodec;
use crate::config::StorageConfig;
use crate::durable::DurableStore;
use crate::error::StorageError;
use crate::executor::{DeadLetter, FlushReport, PersistenceExecutor, RetryPolicy};
use crate::hydrate::{Hydrated, HydrationReport};
use crate::queue::{Operation, WriteBackQueue};

/// How often shutdown re-checks the queue while draining.
const DRAIN_POLL: Duration = Duration::from_millis(10);

struct Inner {
    config: StorageConfig,
    store: Arc<dyn DurableStore>,
    /// Lock order is always cache, then queue.
    cache: RwLock<EntityCache>,
    queue: Arc<Mutex<WriteBackQueue>>,
    executor: PersistenceExecutor,
    hydration: OnceCell<HydrationReport>,
    flushing: AtomicBool,
    flush_task: StdMutex<Option<JoinHandle<()>>>,
    /// Set once by shutdown; the flush loop exits between ticks.
    stop: watch::Sender<bool>,
}

/// Clears the re-entrancy flag when the flush finishes, even if it is cancelled.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Write-back storage over a durable store.
///
/// Every call mutates the in-memory cache and returns immediately with the
/// cached entity; the durable write is queued and applied later by a flush.
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct HybridStorage {
    inner: Arc<Inner>,
}

impl HybridStorage {
    /// Build the storage. Does no I/O; call `init` to hydrate and start the
    /// flush timer.
    pub fn new(store: Arc<dyn DurableStore>, config: StorageConfig) -> Self {
        let (stop, _) = watch::channel(false);
        let queue = Arc::new(Mutex::new(WriteBackQueue::new(
            config.batch_size,
            config.max_delay,
        )));
        let executor = PersistenceExecutor::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            RetryPolicy::from_config(&config),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                cache: RwLock::new(EntityCache::new()),
                queue,
                executor,
                hydration: OnceCell::new(),
                flushing: AtomicBool::new(false),
                flush_task: StdMutex::new(None),
                stop,
            }),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Hydrate the cache and start the periodic flush loop. Calling it again
    /// returns the same report and does not start a second loop.
    pub async fn init(&self) -> HydrationReport {
        let report = self.hydrate().await.clone();

        let mut task = self
            .inner
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_none() {
            *task = Some(spawn_flush_loop(
                Arc::downgrade(&self.inner),
                self.inner.config.flush_interval,
                self.inner.stop.subscribe(),
            ));
            tracing::info!(
                interval_ms = self.inner.config.flush_interval.as_millis() as u64,
                batch_size = self.inner.config.batch_size,
                "flush loop started"
            );
        }

        report
    }

    /// Load every durable row into the cache. Runs once; later calls wait for
    /// the first to finish and then return its report.
    pub async fn hydrate(&self) -> &HydrationReport {
        self.inner
            .hydration
            .get_or_init(|| async {
                let started = Instant::now();
                let hydrated = Hydrated::load(self.inner.store.as_ref()).await;
                let mut cache = self.inner.cache.write().await;
                let (report, corrected) = hydrated.install(&mut *cache);
                for user in corrected {
                    self.enqueue(Operation::Update(user.encode())).await;
                }
                drop(cache);
                tracing::info!(
                    users = report.users,
                    projects = report.projects,
                    inquiries = report.inquiries,
                    orders = report.orders,
                    skipped_rows = report.skipped_rows,
                    email_conflicts = report.email_conflicts,
                    failed_kinds = ?report.failed_kinds,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "cache hydrated"
                );
                report
            })
            .await
    }

    /// The hydration report, if hydration has run.
    pub fn hydration_report(&self) -> Option<&HydrationReport> {
        self.inner.hydration.get()
    }

    /// Flush everything pending now. Returns None without doing anything if
    /// another flush is already running.
    pub async fn flush(&self) -> Option<FlushReport> {
        let Some(_guard) = FlushGuard::acquire(&self.inner.flushing) else {
            tracing::trace!("flush already running, skipping");
            return None;
        };

        let batch = self.inner.queue.lock().await.take_batch();
        if batch.is_empty() {
            return Some(FlushReport::default());
        }

        let report = self.inner.executor.execute(batch).await;
        tracing::debug!(
            attempted = report.attempted,
            persisted = report.persisted,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            "flushed batch"
        );
        Some(report)
    }

    /// Flush only if the size or age trigger has fired.
    pub async fn flush_if_due(&self) -> Option<FlushReport> {
        if !self.inner.queue.lock().await.is_due(Instant::now()) {
            return None;
        }
        self.flush().await
    }

    /// Stop the flush loop and drain the queue, waiting at most
    /// `shutdown_grace` for pending writes and scheduled retries.
    ///
    /// A flush already running when shutdown starts is allowed to finish.
    /// Anything still unwritten when the grace period ends is logged and
    /// recorded as a dead letter.
    pub async fn shutdown(&self) -> FlushReport {
        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        self.inner.stop.send_replace(true);

        let task = self
            .inner
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task
            && tokio::time::timeout_at(deadline, &mut task).await.is_err()
        {
            tracing::warn!("flush loop still busy at the shutdown deadline, aborting it");
            task.abort();
            let _ = task.await;
        }

        let mut total = FlushReport::default();
        let mut out_of_time = false;
        loop {
            match tokio::time::timeout_at(deadline, self.flush()).await {
                Ok(Some(report)) => total.absorb(report),
                Ok(None) => {}
                Err(_) => {
                    tracing::warn!("shutdown grace elapsed during a flush");
                    out_of_time = true;
                    break;
                }
            }

            let pending = self.pending_len().await;
            let retries = self.retries_in_flight();
            if pending == 0 && retries == 0 && !self.inner.flushing.load(Ordering::Acquire) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(pending, retries_in_flight = retries, "shutdown grace elapsed with writes outstanding");
                out_of_time = true;
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        if out_of_time {
            let leftover = self.inner.queue.lock().await.take_batch();
            total.dead_lettered += self
                .inner
                .executor
                .abandon(leftover, "shutdown grace elapsed before the write finished")
                .await;
        }

        tracing::info!(
            persisted = total.persisted,
            dead_lettered = total.dead_lettered,
            "storage shut down"
        );
        total
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Retries waiting out their backoff delay.
    pub fn retries_in_flight(&self) -> usize {
        self.inner.executor.retries_in_flight()
    }

    /// Operations that exhausted their retry budget.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.executor.dead_letters().await
    }

    pub async fn cache_counts(&self) -> CacheCounts {
        self.inner.cache.read().await.counts()
    }

    /// Queue a durable operation. Callers hold the cache write lock so the
    /// queue sees operations in the same order the cache applied them.
    async fn enqueue(&self, op: Operation) {
        let key = op.key();
        let due = {
            let mut queue = self.inner.queue.lock().await;
            queue.enqueue(key, op);
            queue.is_due(Instant::now())
        };
        if due {
            let storage = self.clone();
            tokio::spawn(async move {
                storage.flush().await;
            });
        }
    }

    // Users

    pub async fn create_user(&self, input: NewUser) -> Result<User, StorageError> {
        self.hydrate().await;
        let user = User::new(input);

        let mut cache = self.inner.cache.write().await;
        if let Some(email) = user.email.as_deref()
            && cache.email_owner(email).is_some()
        {
            return Err(StorageError::EmailTaken(email.to_string()));
        }
        cache.put_user(user.clone());
        self.enqueue(Operation::Insert(user.encode())).await;

        Ok(user)
    }

    pub async fn get_user(&self, id: &Ulid) -> Option<User> {
        self.hydrate().await;
        self.inner.cache.read().await.user(id).cloned()
    }

    pub async fn get_user_by_email(&self, email: &str) -> Option<User> {
        self.hydrate().await;
        self.inner.cache.read().await.user_by_email(email).cloned()
    }

    pub async fn list_users(&self) -> Vec<User> {
        self.hydrate().await;
        self.inner.cache.read().await.users().list()
    }

    pub async fn update_user(&self, id: &Ulid, update: UserUpdate) -> Result<User, StorageError> {
        self.hydrate().await;

        let mut cache = self.inner.cache.write().await;
        let mut user = cache.user(id).cloned().ok_or(StorageError::NotFound {
            kind: EntityKind::User,
            id: *id,
        })?;
        if let Some(email) = update.email.as_deref()
            && let Some(owner) = cache.email_owner(email)
            && owner != *id
        {
            return Err(StorageError::EmailTaken(email.to_string()));
        }
        user.apply(update);
        cache.put_user(user.clone());
        self.enqueue(Operation::Update(user.encode())).await;

        Ok(user)
    }

    /// Insert a user under a caller-chosen id, or merge profile fields into
    /// the existing user with that id.
    pub async fn upsert_user(&self, input: UpsertUser) -> Result<User, StorageError> {
        self.hydrate().await;

        let mut cache = self.inner.cache.write().await;
        if let Some(email) = input.email.as_deref()
            && let Some(owner) = cache.email_owner(email)
            && owner != input.id
        {
            return Err(StorageError::EmailTaken(email.to_string()));
        }
        let user = match cache.user(&input.id).cloned() {
            Some(mut existing) => {
                existing.apply_upsert(input);
                existing
            }
            None => User::from(input),
        };
        cache.put_user(user.clone());
        self.enqueue(Operation::Upsert(user.encode())).await;

        Ok(user)
    }

    pub async fn delete_user(&self, id: &Ulid) -> Result<User, StorageError> {
        self.hydrate().await;

        let mut cache = self.inner.cache.write().await;
        let removed = cache.remove_user(id).ok_or(StorageError::NotFound {
            kind: EntityKind::User,
            id: *id,
        })?;
        self.enqueue(Operation::Delete {
            kind: EntityKind::User,
            id: id.to_string(),
        })
        .await;

        Ok(removed)
    }

    // Projects

    pub async fn create_project(&self, input: NewProject) -> Project {
        self.hydrate().await;
        let project = Project::new(input);

        let mut cache = self.inner.cache.write().await;
        cache.projects.put(project.clone());
        self.enqueue(Operation::Insert(project.encode())).await;

        project
    }

    pub async fn get_project(&self, id: &Ulid) -> Option<Project> {
        self.hydrate().await;
        self.inner.cache.read().await.projects.get(id).cloned()
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        self.hydrate().await;
        self.inner.cache.read().await.projects.list()
    }

    pub async fn list_projects_for_user(&self, owner_id: &Ulid) -> Vec<Project> {
        self.hydrate().await;
        self.inner
            .cache
            .read()
            .await
            .projects
            .list_where(|project| project.owner_id.as_ref() == Some(owner_id))
    }

    pub async fn update_project(
        &self,
        id: &Ulid,
        update: ProjectUpdate,
    ) -> Result<Project, StorageError> {
        self.hydrate().await;

        let mut cache = self.inner.cache.write().await;
        let project = cache.projects.get_mut(id).ok_or(StorageError::NotFound {
            kind: EntityKind::Project,
            id: *id,
        })?;
        project.apply(update);
        let project = project.clone();
        self.enqueue(Operation::Update(project.encode())).await;

        Ok(project)
    }

    pub async fn delete_project(&self, id: &Ulid) -> Result<Project, StorageError> {
        self.hydrate().await;

        let mut cache = self.inner.cache.write().await;
        let removed = cache.projects.remove(id).ok_or(StorageError::NotFound {
            kind: EntityKind::Project,
            id: *id,
        })?;
        self.enqueue(Operation::Delete {
            kind: EntityKind::Project,
            id: id.to_string(),
        })
        .await;

        Ok(removed)
    }

    // Enterprise inquiries and guided analysis orders are append-only.

    pub async fn create_inquiry(&self, input: NewEnterpriseInquiry) -> EnterpriseInquiry {
        self.hydrate().await;
        let inquiry = EnterpriseInquiry::new(input);

        let mut cache = self.inner.cache.write().await;
        cache.inquiries.put(inquiry.clone());
        self.enqueue(Operation::Insert(inquiry.encode())).await;

        inquiry
    }

    pub async fn list_inquiries(&self) -> Vec<EnterpriseInquiry> {
        self.hydrate().await;
        self.inner.cache.read().await.inquiries.list()
    }

    pub async fn create_order(&self, input: NewGuidedAnalysisOrder) -> GuidedAnalysisOrder {
        self.hydrate().await;
        let order = GuidedAnalysisOrder::new(input);

        let mut cache = self.inner.cache.write().await;
        cache.orders.put(order.clone());
        self.enqueue(Operation::Insert(order.encode())).await;

        order
    }

    pub async fn list_orders(&self) -> Vec<GuidedAnalysisOrder> {
        self.hydrate().await;
        self.inner.cache.read().await.orders.list()
    }

    pub async fn list_orders_for_user(&self, user_id: &Ulid) -> Vec<GuidedAnalysisOrder> {
        self.hydrate().await;
        self.inner
            .cache
            .read()
            .await
            .orders
            .list_where(|order| order.user_id.as_ref() == Some(user_id))
    }
}

/// Ticks every `period` and flushes when a trigger has fired. Exits between
/// ticks once `stop` is set or the storage has been dropped, so a flush that
/// has started always runs to completion.
fn spawn_flush_loop(
    inner: Weak<Inner>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        while !*stop.borrow_and_update() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {
                    tracing::debug!("flush loop stopping");
                    break;
                }
            }
            let Some(inner) = inner.upgrade() else {
                tracing::debug!("storage dropped, flush loop exiting");
                break;
            };
            HybridStorage { inner }.flush_if_due().await;
        }
    })
}
