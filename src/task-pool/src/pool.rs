use crate::{JobMetadata, Task, TaskError, TaskId, TaskStatus, WorkerPool};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// A group of tasks whose progress is tracked together. Pools chain into a
/// tree: counters roll up to the root pool so a subscriber watching the
/// parent task sees aggregate progress of all children.
///
/// The waiter gate is a condition over (all queued, total == completed):
/// waiters block until both hold. Global pools are the process defaults;
/// they never drain and never wake waiters.
pub struct TaskPool<M: JobMetadata> {
    pool_id: TaskId,
    treat_as_global: bool,

    total_tasks: AtomicI64,
    completed_tasks: AtomicI64,
    waiter_count: AtomicI64,
    all_queued: AtomicBool,
    cancelled: AtomicBool,
    has_queue_thread: AtomicBool,

    gate: Notify,

    worker_pool: Weak<WorkerPool<M>>,
    parent: Option<Arc<TaskPool<M>>>,
    created_by: Option<Arc<Task<M>>>,

    errored: Mutex<Vec<Arc<Task<M>>>>,
}

impl<M: JobMetadata> TaskPool<M> {
    pub(crate) fn new(
        worker_pool: Weak<WorkerPool<M>>,
        parent: Option<Arc<TaskPool<M>>>,
        created_by: Option<Arc<Task<M>>>,
        global: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool_id: TaskId::new(format!("pool-{:x}", rand_pool_nonce())),
            treat_as_global: global,
            total_tasks: AtomicI64::new(0),
            completed_tasks: AtomicI64::new(0),
            waiter_count: AtomicI64::new(0),
            all_queued: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            has_queue_thread: AtomicBool::new(false),
            gate: Notify::new(),
            worker_pool,
            parent,
            created_by,
            errored: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.pool_id
    }

    pub fn is_global(&self) -> bool {
        self.treat_as_global
    }

    pub fn is_root(&self) -> bool {
        match &self.parent {
            None => true,
            Some(parent) => parent.is_global(),
        }
    }

    pub fn worker_pool(&self) -> Option<Arc<WorkerPool<M>>> {
        self.worker_pool.upgrade()
    }

    /// The task this pool was created under, if any. Progress subscribers
    /// follow this edge to attribute child work to the parent task.
    pub fn created_in_task(&self) -> Option<Arc<Task<M>>> {
        self.created_by.clone()
    }

    pub fn root_pool(self: &Arc<Self>) -> Arc<TaskPool<M>> {
        let mut current = self.clone();
        while !current.is_root() {
            match &current.parent {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }
        current
    }

    pub(crate) fn mark_queue_thread(&self) {
        self.has_queue_thread.store(true, Ordering::Release);
    }

    /// (completed, total, percent complete).
    pub fn status(&self) -> (i64, i64, f64) {
        let complete = self.completed_tasks.load(Ordering::Acquire);
        let total = self.total_tasks.load(Ordering::Acquire);
        let progress = if total > 0 {
            (complete * 100) as f64 / total as f64
        } else {
            0.0
        };
        (complete, total, progress)
    }

    pub fn waiter_count(&self) -> i64 {
        self.waiter_count.load(Ordering::Acquire)
    }

    fn drained(&self) -> bool {
        self.all_queued.load(Ordering::Acquire)
            && self.total_tasks.load(Ordering::Acquire)
                == self.completed_tasks.load(Ordering::Acquire)
    }

    /// Put a task on the worker stream. Tasks with an error set are not
    /// re-tried, and a task can never be transferred between pools.
    pub fn queue_task(self: &Arc<Self>, task: &Arc<Task<M>>) -> Result<(), TaskError> {
        let wp = self
            .worker_pool
            .upgrade()
            .ok_or(TaskError::GoingDown)?;
        if wp.is_exiting() {
            warn!("not queuing task while worker pool is going down");
            return Err(TaskError::GoingDown);
        }

        if self.cancelled.load(Ordering::Acquire) {
            return Err(TaskError::PoolClosed(format!("{} cancelled", self.pool_id)));
        }

        if task.error().is_some() {
            // A failed task keeps its error so it is not silently re-run.
            warn!("not re-queueing task [{}] that has an error set", task.id());
            return Ok(());
        }

        if let Some(existing_pool) = task.pool() {
            if !Arc::ptr_eq(&existing_pool, self) || task.status() != TaskStatus::PreQueued {
                warn!("attempted to re-queue task [{}] already in a queue", task.id());
                return Ok(());
            }
        }

        if self.all_queued.load(Ordering::Acquire) {
            return Err(TaskError::PoolClosed(format!("{} already signalled", self.pool_id)));
        }

        self.total_tasks.fetch_add(1, Ordering::AcqRel);
        let root = self.root_pool();
        if !Arc::ptr_eq(&root, self) {
            root.total_tasks.fetch_add(1, Ordering::AcqRel);
        }

        task.set_pool(self.clone());
        task.set_status(TaskStatus::InQueue);
        wp.push_task(task.clone())
    }

    /// Counter bookkeeping when a member task finishes, waking waiters when
    /// the pool drains. The worker loop handles replacement retirement.
    pub(crate) fn handle_task_exit(self: &Arc<Self>) {
        self.completed_tasks.fetch_add(1, Ordering::AcqRel);
        if !self.treat_as_global && self.drained() {
            self.gate.notify_waiters();
        }

        let root = self.root_pool();
        if !Arc::ptr_eq(&root, self) {
            root.completed_tasks.fetch_add(1, Ordering::AcqRel);
            if !root.treat_as_global && root.drained() {
                root.gate.notify_waiters();
            }
        }
    }

    /// Park until every queued task has finished. **Waiters only wake after
    /// [`TaskPool::signal_all_queued`]** — a pool that never signals keeps
    /// its waiters parked forever.
    ///
    /// `supplement_worker` adds a transient replacement worker for the
    /// duration, so a worker parked here (a directory scan waiting on its
    /// per-file children) cannot starve the pool.
    pub async fn wait(&self, supplement_worker: bool) {
        if self.treat_as_global || self.drained() {
            return;
        }

        let wp = self.worker_pool.upgrade();
        if supplement_worker {
            if let Some(wp) = &wp {
                wp.add_replacement_worker();
            }
        }

        if let Some(wp) = &wp {
            wp.mark_parked();
        }
        self.waiter_count.fetch_add(1, Ordering::AcqRel);
        debug!("parking on pool [{}]", self.pool_id);
        loop {
            let notified = self.gate.notified();
            if self.drained() {
                break;
            }
            notified.await;
        }
        self.waiter_count.fetch_sub(1, Ordering::AcqRel);
        debug!("woke up from pool [{}]", self.pool_id);
        if let Some(wp) = &wp {
            wp.mark_unparked();
        }

        if supplement_worker {
            if let Some(wp) = &wp {
                wp.remove_worker();
            }
        }
    }

    /// Close the pool to new tasks. If everything already finished (early
    /// failures, empty pool), the waiters are woken here since no exiting
    /// task remains to do it.
    pub fn signal_all_queued(&self) {
        if self.treat_as_global {
            error!("attempt to signal all-queued on a global pool");
            return;
        }

        self.all_queued.store(true, Ordering::Release);
        if self.drained() {
            self.gate.notify_waiters();
        }

        if self.has_queue_thread.swap(false, Ordering::AcqRel) {
            if let Some(wp) = self.worker_pool.upgrade() {
                wp.remove_worker();
            }
        }
    }

    pub fn clear_all_queued(&self) {
        if self.waiter_count.load(Ordering::Acquire) != 0 {
            warn!("clearing all-queued flag on pool that still has sleepers");
        }
        self.all_queued.store(false, Ordering::Release);
    }

    /// Best-effort: cancel every in-flight member task and refuse new ones.
    pub fn cancel(self: &Arc<Self>) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(wp) = self.worker_pool.upgrade() {
            for task in wp.tasks() {
                if let Some(pool) = task.pool() {
                    if Arc::ptr_eq(&pool, self) && !task.is_complete() {
                        task.cancel();
                    }
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn add_error(&self, task: Arc<Task<M>>) {
        self.errored.lock().unwrap().push(task);
    }

    pub fn errors(&self) -> Vec<Arc<Task<M>>> {
        self.errored.lock().unwrap().clone()
    }
}

// Pool ids only need process-local uniqueness.
fn rand_pool_nonce() -> u64 {
    use std::sync::atomic::AtomicU64;
    static NONCE: AtomicU64 = AtomicU64::new(1);
    NONCE.fetch_add(1, Ordering::Relaxed)
}
