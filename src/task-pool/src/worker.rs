use crate::{
    JobMetadata, JobResult, Task, TaskBroadcaster, TaskError, TaskId, TaskPool, TaskResult,
    TaskStatus, POOL_COMPLETE_EVENT, TASK_CANCELED_EVENT, TASK_COMPLETE_EVENT, TASK_FAILED_EVENT,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, Notify};

pub type JobHandler<M> =
    Arc<dyn Fn(Arc<Task<M>>) -> BoxFuture<'static, JobResult> + Send + Sync + 'static>;

/// The process-wide executor: a fixed set of permanent workers draining one
/// task stream, plus transient replacement workers that cover for permanent
/// ones parked on a child pool's gate.
///
/// Jobs are registered by name; dispatching builds (or dedupes into) a task
/// and queues it. A panicking or failing job is translated into the task
/// failure path inside the worker - it never takes the worker down.
pub struct WorkerPool<M: JobMetadata> {
    max_workers: AtomicI64,
    current_workers: AtomicI64,
    busy_count: AtomicI64,
    lifetime_queued: AtomicI64,
    next_worker_id: AtomicI64,

    exit_flag: AtomicBool,
    shutdown: Notify,
    retire_signal: Notify,

    task_tx: mpsc::UnboundedSender<Arc<Task<M>>>,
    task_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Task<M>>>>>,

    task_map: RwLock<HashMap<TaskId, Arc<Task<M>>>>,
    registry: RwLock<HashMap<&'static str, JobHandler<M>>>,

    global_pool: Mutex<Option<Arc<TaskPool<M>>>>,
    self_ref: Weak<WorkerPool<M>>,
}

impl<M: JobMetadata> WorkerPool<M> {
    /// Build a pool targeting `max_workers` permanent workers. Workers do
    /// not run until [`WorkerPool::start`].
    pub fn new(max_workers: usize) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        let (task_tx, task_rx) = mpsc::unbounded_channel();

        let wp = Arc::new_cyclic(|self_ref| Self {
            max_workers: AtomicI64::new(max_workers as i64),
            current_workers: AtomicI64::new(0),
            busy_count: AtomicI64::new(0),
            lifetime_queued: AtomicI64::new(0),
            next_worker_id: AtomicI64::new(1),
            exit_flag: AtomicBool::new(false),
            shutdown: Notify::new(),
            retire_signal: Notify::new(),
            task_tx,
            task_rx: Arc::new(tokio::sync::Mutex::new(task_rx)),
            task_map: RwLock::new(HashMap::new()),
            registry: RwLock::new(HashMap::new()),
            global_pool: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let global = TaskPool::new(wp.self_ref.clone(), None, None, true);
        *wp.global_pool.lock().unwrap() = Some(global);
        wp
    }

    /// Spawn the permanent workers.
    pub fn start(self: &Arc<Self>) {
        let target = self.max_workers.load(Ordering::Acquire);
        info!("worker pool starting {} workers", target);
        for _ in 0..target {
            self.spawn_worker(false);
        }
    }

    pub fn register_job(
        &self,
        name: &'static str,
        handler: impl Fn(Arc<Task<M>>) -> BoxFuture<'static, JobResult> + Send + Sync + 'static,
    ) {
        self.registry.write().unwrap().insert(name, Arc::new(handler));
    }

    pub fn global_pool(&self) -> Arc<TaskPool<M>> {
        self.global_pool.lock().unwrap().clone().unwrap()
    }

    /// A child pool, optionally owned by the task that is spawning it.
    /// `replace` also stands up a temporary queue-drainer worker, so a
    /// caller stuffing the queue cannot deadlock against a full stream;
    /// [`TaskPool::signal_all_queued`] retires it.
    pub fn new_task_pool(
        self: &Arc<Self>,
        replace: bool,
        created_by: Option<Arc<Task<M>>>,
    ) -> Arc<TaskPool<M>> {
        let parent = created_by.as_ref().and_then(|t| t.pool());
        let pool = TaskPool::new(self.self_ref.clone(), parent, created_by, false);
        if replace {
            self.add_replacement_worker();
            pool.mark_queue_thread();
        }
        pool
    }

    /// Build (or dedupe into) a task without queueing it. Upload tasks use
    /// this: they enter the queue only when their first chunk announces a
    /// file.
    pub fn new_task(
        &self,
        metadata: M,
        caster: Option<Arc<dyn TaskBroadcaster>>,
    ) -> Result<Arc<Task<M>>, TaskError> {
        let job_name = metadata.job_name();
        if !self.registry.read().unwrap().contains_key(job_name) {
            return Err(TaskError::NoJob(job_name.to_string()));
        }

        let task_id = crate::task_id_for(job_name, &metadata.meta_string());

        {
            let task_map = self.task_map.read().unwrap();
            if let Some(existing) = task_map.get(&task_id) {
                if metadata.always_resets() {
                    existing.clear_and_reset();
                } else {
                    trace!("dedup hit for task [{}] ({})", task_id, job_name);
                }
                return Ok(existing.clone());
            }
        }

        let task = Task::new(task_id.clone(), metadata, caster);
        self.task_map.write().unwrap().insert(task_id, task.clone());
        Ok(task)
    }

    /// Build a task and queue it on `pool` (the global pool when absent).
    pub fn dispatch_job(
        self: &Arc<Self>,
        metadata: M,
        caster: Option<Arc<dyn TaskBroadcaster>>,
        pool: Option<Arc<TaskPool<M>>>,
    ) -> Result<Arc<Task<M>>, TaskError> {
        let task = self.new_task(metadata, caster)?;
        if task.is_complete() || task.status() == TaskStatus::Running {
            // Dedup hit on live or finished work; hand it back as-is.
            return Ok(task);
        }
        let pool = pool.unwrap_or_else(|| self.global_pool());
        pool.queue_task(&task)?;
        Ok(task)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<Arc<Task<M>>> {
        self.task_map.read().unwrap().get(id).cloned()
    }

    pub fn tasks(&self) -> Vec<Arc<Task<M>>> {
        self.task_map.read().unwrap().values().cloned().collect()
    }

    pub(crate) fn push_task(&self, task: Arc<Task<M>>) -> Result<(), TaskError> {
        self.lifetime_queued.fetch_add(1, Ordering::AcqRel);
        self.task_tx
            .send(task)
            .map_err(|_| TaskError::GoingDown)
    }

    pub fn worker_count(&self) -> i64 {
        self.current_workers.load(Ordering::Acquire)
    }

    pub fn busy_count(&self) -> i64 {
        self.busy_count.load(Ordering::Acquire)
    }

    pub fn lifetime_queued_count(&self) -> i64 {
        self.lifetime_queued.load(Ordering::Acquire)
    }

    pub fn is_exiting(&self) -> bool {
        self.exit_flag.load(Ordering::Acquire)
    }

    /// Stop accepting work and let every worker retire after its current
    /// task.
    pub fn stop(&self) {
        self.exit_flag.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        for task in self.tasks() {
            task.cancel();
        }
    }

    /// Raise the worker target by one and spawn a transient worker to meet
    /// it. The replacement retires once the pool has workers in excess of
    /// the target again.
    pub fn add_replacement_worker(self: &Arc<Self>) {
        self.max_workers.fetch_add(1, Ordering::AcqRel);
        self.spawn_worker(true);
    }

    /// Lower the worker target. Replacement workers check for the excess
    /// after each task and are nudged awake if they are idle on the stream.
    pub fn remove_worker(&self) {
        self.max_workers.fetch_sub(1, Ordering::AcqRel);
        self.retire_signal.notify_waiters();
    }

    // Claim one retirement slot. The compare-exchange keeps two replacement
    // workers from both retiring over a single excess.
    fn try_retire(&self) -> bool {
        loop {
            let current = self.current_workers.load(Ordering::Acquire);
            if current <= self.max_workers.load(Ordering::Acquire) {
                return false;
            }
            if self
                .current_workers
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn mark_parked(&self) {
        self.busy_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_unparked(&self) {
        self.busy_count.fetch_add(1, Ordering::AcqRel);
    }

    fn spawn_worker(self: &Arc<Self>, replacement: bool) {
        let wp = self.clone();
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::AcqRel);
        self.current_workers.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            wp.worker_loop(worker_id, replacement).await;
        });
    }

    async fn worker_loop(self: Arc<Self>, worker_id: i64, replacement: bool) {
        trace!("worker {} starting (replacement: {})", worker_id, replacement);
        loop {
            enum Wake<M: JobMetadata> {
                Task(Arc<Task<M>>),
                Retire,
                Shutdown,
            }

            let wake = {
                let mut rx = self.task_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.notified() => Wake::Shutdown,
                    _ = self.retire_signal.notified(), if replacement => Wake::Retire,
                    t = rx.recv() => match t {
                        Some(task) => Wake::Task(task),
                        None => Wake::Shutdown,
                    },
                }
            };

            let task = match wake {
                Wake::Shutdown => break,
                Wake::Retire => {
                    if self.try_retire() {
                        trace!("replacement worker {} retiring", worker_id);
                        return;
                    }
                    continue;
                }
                Wake::Task(task) => task,
            };

            self.busy_count.fetch_add(1, Ordering::AcqRel);
            self.run_task(&task).await;
            self.busy_count.fetch_sub(1, Ordering::AcqRel);

            if let Some(pool) = task.pool() {
                pool.handle_task_exit();
                self.broadcast_pool_progress(&task, &pool);
            }

            if !task.is_persistent() {
                self.task_map.write().unwrap().remove(task.id());
            }

            // A replacement worker retires as soon as the pool exceeds its
            // target again.
            if replacement && self.try_retire() {
                trace!("replacement worker {} retiring", worker_id);
                return;
            }
            if self.is_exiting() {
                break;
            }
        }
        self.current_workers.fetch_sub(1, Ordering::AcqRel);
        trace!("worker {} exiting", worker_id);
    }

    /// Run one task under a panic boundary, translating failures and panics
    /// into the task error path.
    async fn run_task(&self, task: &Arc<Task<M>>) {
        if task.is_cancel_requested() {
            task.run_cleanup();
            task.set_status(TaskStatus::Cancelled);
            self.broadcast_exit(task, TASK_CANCELED_EVENT);
            return;
        }

        let handler = self.registry.read().unwrap().get(task.job_name()).cloned();
        let Some(handler) = handler else {
            task.set_error(TaskError::NoJob(task.job_name().to_string()));
            task.set_status(TaskStatus::Error);
            return;
        };

        task.set_status(TaskStatus::Running);
        task.start_stopwatch();
        trace!("worker running [{}] task [{}]", task.job_name(), task.id());

        let outcome = AssertUnwindSafe(handler(task.clone())).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                if !task.is_complete() {
                    task.set_status(TaskStatus::Success);
                }
                self.broadcast_exit(task, TASK_COMPLETE_EVENT);
            }
            Ok(Err(TaskError::Cancelled)) => {
                debug!("task [{}] cancelled", task.id());
                task.run_cleanup();
                task.set_status(TaskStatus::Cancelled);
                self.broadcast_exit(task, TASK_CANCELED_EVENT);
            }
            Ok(Err(err)) => {
                error!("task [{}] ({}) failed: {}", task.id(), task.job_name(), err);
                task.set_error(err);
                task.run_cleanup();
                task.set_status(TaskStatus::Error);
                if let Some(pool) = task.pool() {
                    pool.add_error(task.clone());
                }
                self.broadcast_exit(task, TASK_FAILED_EVENT);
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "job panicked".to_string());
                error!("task [{}] ({}) panicked: {}", task.id(), task.job_name(), msg);
                task.set_error(TaskError::Internal(msg));
                task.run_cleanup();
                task.set_status(TaskStatus::Error);
                if let Some(pool) = task.pool() {
                    pool.add_error(task.clone());
                }
                self.broadcast_exit(task, TASK_FAILED_EVENT);
            }
        }
    }

    fn broadcast_exit(&self, task: &Arc<Task<M>>, event: &str) {
        if let Some(caster) = task.caster() {
            let mut result = task.results();
            result.insert(
                "runtime".to_string(),
                serde_json::json!(task.exe_time().as_millis() as i64),
            );
            caster.push_task_update(task.id(), task.job_name(), event, result);
        }
    }

    // Progress rolls up to the task that created the root pool, so one
    // subscription covers an entire scan hierarchy.
    fn broadcast_pool_progress(&self, task: &Arc<Task<M>>, pool: &Arc<TaskPool<M>>) {
        let root = pool.root_pool();
        if root.is_global() {
            return;
        }
        let Some(caster) = task.caster() else { return };
        let Some(owner) = root.created_in_task() else { return };

        let (complete, total, progress) = root.status();
        let mut result = TaskResult::new();
        result.insert("tasksComplete".to_string(), serde_json::json!(complete));
        result.insert("tasksTotal".to_string(), serde_json::json!(total));
        result.insert("percentProgress".to_string(), serde_json::json!(progress));

        let event = if complete == total {
            POOL_COMPLETE_EVENT
        } else {
            crate::SUB_TASK_COMPLETE_EVENT
        };
        caster.push_pool_update(owner.id(), owner.job_name(), event, result);
    }
}
