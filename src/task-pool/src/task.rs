use crate::{JobMetadata, TaskBroadcaster, TaskError, TaskId, TaskPool, TaskResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    PreQueued,
    InQueue,
    Running,
    Success,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Error | TaskStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::PreQueued => "pre-queued",
            TaskStatus::InQueue => "in-queue",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

type CleanupFn = Box<dyn FnOnce() + Send>;

/// One unit of work. The id is a hash of job name plus metadata, so two
/// requests for the same work share one task. Cancellation is cooperative:
/// the signal is observed at the job's next suspension point.
pub struct Task<M: JobMetadata> {
    task_id: TaskId,
    metadata: M,

    status: Mutex<TaskStatus>,
    result: Mutex<TaskResult>,
    error: Mutex<Option<TaskError>>,

    cancel_flag: AtomicBool,
    cancel_signal: Notify,

    // Closed when the task reaches a terminal status; subscribers to an
    // already-complete task read the result straight away.
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,

    pool: Mutex<Option<Arc<TaskPool<M>>>>,
    child_pool: Mutex<Option<Arc<TaskPool<M>>>>,
    caster: Mutex<Option<Arc<dyn TaskBroadcaster>>>,
    cleanup: Mutex<Option<CleanupFn>>,

    // Persistent tasks stay in the worker pool map after finishing, so a
    // repeated request is answered with the finished result (zip builds).
    persistent: AtomicBool,

    started: Mutex<Option<Instant>>,
    laps: Mutex<Vec<(String, Duration)>>,
}

impl<M: JobMetadata> Task<M> {
    pub fn new(task_id: TaskId, metadata: M, caster: Option<Arc<dyn TaskBroadcaster>>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            task_id,
            metadata,
            status: Mutex::new(TaskStatus::PreQueued),
            result: Mutex::new(TaskResult::new()),
            error: Mutex::new(None),
            cancel_flag: AtomicBool::new(false),
            cancel_signal: Notify::new(),
            done_tx,
            done_rx,
            pool: Mutex::new(None),
            child_pool: Mutex::new(None),
            caster: Mutex::new(caster),
            cleanup: Mutex::new(None),
            persistent: AtomicBool::new(false),
            started: Mutex::new(None),
            laps: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub fn job_name(&self) -> &'static str {
        self.metadata.job_name()
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap() = status;
        if status.is_terminal() {
            let _ = self.done_tx.send(true);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> Option<Arc<TaskPool<M>>> {
        self.pool.lock().unwrap().clone()
    }

    pub(crate) fn set_pool(&self, pool: Arc<TaskPool<M>>) {
        *self.pool.lock().unwrap() = Some(pool);
    }

    /// The pool this task spawned for its own children, if any.
    pub fn child_pool(&self) -> Option<Arc<TaskPool<M>>> {
        self.child_pool.lock().unwrap().clone()
    }

    pub fn set_child_pool(&self, pool: Arc<TaskPool<M>>) {
        *self.child_pool.lock().unwrap() = Some(pool);
    }

    pub fn caster(&self) -> Option<Arc<dyn TaskBroadcaster>> {
        self.caster.lock().unwrap().clone()
    }

    pub fn set_caster(&self, caster: Arc<dyn TaskBroadcaster>) {
        *self.caster.lock().unwrap() = Some(caster);
    }

    // ==================== Results ====================

    pub fn set_result(&self, key: &str, value: serde_json::Value) {
        self.result.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn set_results(&self, entries: TaskResult) {
        self.result.lock().unwrap().extend(entries);
    }

    pub fn results(&self) -> TaskResult {
        self.result.lock().unwrap().clone()
    }

    pub fn error(&self) -> Option<TaskError> {
        self.error.lock().unwrap().clone()
    }

    pub(crate) fn set_error(&self, err: TaskError) {
        *self.error.lock().unwrap() = Some(err);
    }

    // ==================== Cancellation ====================

    /// Ask the task to stop. Non-blocking; the job observes the signal at
    /// its next suspension point. Cancelling a finished task is a no-op.
    pub fn cancel(&self) {
        if self.is_complete() {
            return;
        }
        self.cancel_flag.store(true, Ordering::Release);
        self.cancel_signal.notify_waiters();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::Acquire)
    }

    /// Resolve once cancellation has been requested. Usable inside
    /// `tokio::select!` alongside the job's other suspension points.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_signal.notified();
            if self.cancel_flag.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    /// Cooperative suspension point: return the cancel error if a cancel
    /// has been requested.
    pub fn check_exit(&self) -> crate::JobResult {
        if self.is_cancel_requested() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    // ==================== Cleanup ====================

    /// Register the hook run when this task errors or is cancelled.
    pub fn set_error_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        *self.cleanup.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn run_cleanup(&self) {
        if let Some(f) = self.cleanup.lock().unwrap().take() {
            f();
        }
    }

    // ==================== Timing ====================

    pub(crate) fn start_stopwatch(&self) {
        *self.started.lock().unwrap() = Some(Instant::now());
    }

    pub fn lap(&self, note: &str) {
        let elapsed = self
            .started
            .lock()
            .unwrap()
            .map(|s| s.elapsed())
            .unwrap_or_default();
        self.laps.lock().unwrap().push((note.to_string(), elapsed));
    }

    pub fn exe_time(&self) -> Duration {
        self.started
            .lock()
            .unwrap()
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    // ==================== Completion ====================

    /// Wait until the task reaches a terminal status.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Record success, broadcast completion. Called by the job body; the
    /// worker loop owns the pool bookkeeping.
    pub fn success(&self, note: Option<&str>) {
        if let Some(note) = note {
            self.set_result("note", serde_json::Value::String(note.to_string()));
        }
        self.set_status(TaskStatus::Success);
        debug!("task [{}] completed in {:?}", self.task_id, self.exe_time());
    }

    /// Reset a finished or errored task so it can run again. Used when a
    /// dedup hit lands on a job kind that always resets.
    pub(crate) fn clear_and_reset(&self) {
        *self.status.lock().unwrap() = TaskStatus::PreQueued;
        *self.error.lock().unwrap() = None;
        self.result.lock().unwrap().clear();
        self.cancel_flag.store(false, Ordering::Release);
        let _ = self.done_tx.send(false);
        *self.pool.lock().unwrap() = None;
    }
}
