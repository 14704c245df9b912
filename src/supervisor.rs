use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::Result;

/// How often a supervisor diffs repository ids against running tasks
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a per-entity task keeps looping or shuts itself down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Runtime-adjustable concurrency bound shared by all tasks of one kind.
///
/// Resizing swaps in a fresh semaphore: tasks already inside the expensive
/// section keep their old permit, new acquisitions see the new bound, so a
/// lowered ceiling takes effect within one reconciliation interval.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    inner: Arc<Mutex<GateInner>>,
}

#[derive(Debug)]
struct GateInner {
    limit: usize,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                limit,
                semaphore: Arc::new(Semaphore::new(limit)),
            })),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().map(|inner| inner.limit).unwrap_or(1)
    }

    pub fn resize(&self, limit: usize) {
        let limit = limit.max(1);
        if let Ok(mut inner) = self.inner.lock()
            && inner.limit != limit
        {
            debug!("Concurrency bound changed {} -> {limit}", inner.limit);
            inner.limit = limit;
            inner.semaphore = Arc::new(Semaphore::new(limit));
        }
    }

    /// Wait for a permit into the expensive section. The permit is released
    /// on drop, on every exit path.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        let semaphore = match self.inner.lock() {
            Ok(inner) => inner.semaphore.clone(),
            Err(poisoned) => poisoned.into_inner().semaphore.clone(),
        };
        // The semaphore is never closed while the gate exists
        semaphore
            .acquire_owned()
            .await
            .expect("gate semaphore closed")
    }
}

/// One kind of per-entity work (SSH checks, port passes).
///
/// `run` is the long-lived loop for a single entity; it must observe
/// `cancel` at every await point and release any resource it holds before
/// returning.
pub trait EntityWorker: Clone + Send + Sync + 'static {
    /// Entity kind label used in logs
    fn kind(&self) -> &'static str;

    /// Current configured concurrency ceiling
    fn limit(&self) -> impl Future<Output = usize> + Send;

    /// Ids of every entity that should have a running task
    fn list_ids(&self) -> impl Future<Output = Result<Vec<i64>>> + Send;

    /// Long-lived loop for one entity
    fn run(
        &self,
        id: i64,
        cancel: CancellationToken,
        gate: ConcurrencyGate,
    ) -> impl Future<Output = ()> + Send;
}

struct EntityTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Runs exactly one long-lived task per live entity of one kind.
///
/// Every reconciliation pass the supervisor spawns tasks for ids that
/// appeared, cancels tasks for ids that disappeared, harvests finished
/// tasks (re-spawning on the next pass while the entity still exists) and
/// re-reads the concurrency bound.
pub struct Supervisor<W: EntityWorker> {
    worker: W,
    gate: ConcurrencyGate,
    tasks: HashMap<i64, EntityTask>,
    reconcile_interval: Duration,
}

impl<W: EntityWorker> Supervisor<W> {
    pub fn new(worker: W, initial_limit: usize) -> Self {
        Self {
            worker,
            gate: ConcurrencyGate::new(initial_limit),
            tasks: HashMap::new(),
            reconcile_interval: RECONCILE_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_reconcile_interval(mut self, reconcile_interval: Duration) -> Self {
        self.reconcile_interval = reconcile_interval;
        self
    }

    /// Supervisor loop; returns only after `shutdown` fires and every child
    /// task has acknowledged cancellation.
    pub async fn run(mut self, shutdown: CancellationToken) {
        debug!("{} supervisor started", self.worker.kind());
        let mut ticker = interval(self.reconcile_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.reconcile().await;
        }

        self.stop().await;
        debug!("{} supervisor stopped", self.worker.kind());
    }

    async fn reconcile(&mut self) {
        self.harvest_finished().await;

        let ids = match self.worker.list_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(
                    "{} reconciliation skipped, repository unavailable: {err}",
                    self.worker.kind()
                );
                return;
            }
        };

        let desired: HashSet<i64> = ids.into_iter().collect();
        let running: HashSet<i64> = self.tasks.keys().copied().collect();

        for id in desired.difference(&running) {
            self.spawn_task(*id);
        }

        for id in running.difference(&desired) {
            if let Some(task) = self.tasks.remove(id) {
                debug!("{} {id} is gone, cancelling its task", self.worker.kind());
                task.cancel.cancel();
            }
        }

        self.gate.resize(self.worker.limit().await);
    }

    fn spawn_task(&mut self, id: i64) {
        let worker = self.worker.clone();
        let gate = self.gate.clone();
        let cancel = CancellationToken::new();
        let child = cancel.clone();

        debug!("{} {id} task started", self.worker.kind());
        let handle = tokio::spawn(async move { worker.run(id, child, gate).await });
        self.tasks.insert(id, EntityTask { handle, cancel });
    }

    /// Reap tasks that ended on their own. A panic is logged and the entity
    /// gets a fresh task on the next pass if it still exists.
    async fn harvest_finished(&mut self) {
        let finished: Vec<i64> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for id in finished {
            if let Some(task) = self.tasks.remove(&id) {
                match task.handle.await {
                    Ok(()) => debug!("{} {id} task exited", self.worker.kind()),
                    Err(err) if err.is_panic() => {
                        error!("{} {id} task panicked: {err}", self.worker.kind());
                    }
                    Err(_) => {}
                }
            }
        }
    }

    /// Cancel all child tasks and wait until each has acknowledged.
    async fn stop(&mut self) {
        for task in self.tasks.values() {
            task.cancel.cancel();
        }
        for (id, task) in self.tasks.drain() {
            if let Err(err) = task.handle.await
                && err.is_panic()
            {
                error!("{} {id} task panicked during shutdown: {err}", self.worker.kind());
            }
        }
    }
}
