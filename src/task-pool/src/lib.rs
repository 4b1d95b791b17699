mod pool;
mod task;
mod worker;

pub use pool::*;
pub use task::*;
pub use worker::*;

#[cfg(test)]
mod worker_tests;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,
    #[error("no task: {0}")]
    NoTask(String),
    #[error("no such job: {0}")]
    NoJob(String),
    #[error("task pool is closed: {0}")]
    PoolClosed(String),
    #[error("task already queued: {0}")]
    AlreadyQueued(String),
    #[error("worker pool is going down")]
    GoingDown,
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type JobResult = std::result::Result<(), TaskError>;

/// The per-task result map carried in task-update broadcasts.
pub type TaskResult = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed task payloads: one implementor variant per job kind. The job name
/// routes the task to its registered executor; the meta string is the
/// canonical form hashed into the task id, which is what dedupes repeated
/// identical requests.
pub trait JobMetadata: Clone + Send + Sync + 'static {
    fn job_name(&self) -> &'static str;

    fn meta_string(&self) -> String;

    /// Jobs that hold live client streams (file uploads) cannot be answered
    /// by a previous task; a dedup hit resets them instead.
    fn always_resets(&self) -> bool {
        false
    }
}

/// The seam to the broadcast fabric: tasks and pools push progress without
/// knowing how it reaches subscribers.
pub trait TaskBroadcaster: Send + Sync {
    fn push_task_update(&self, task_id: &TaskId, job_name: &str, event: &str, result: TaskResult);

    fn push_pool_update(&self, task_id: &TaskId, job_name: &str, event: &str, result: TaskResult);
}

/// Repeated identical requests hash to the same task id.
pub fn task_id_for(job_name: &str, meta_string: &str) -> TaskId {
    let mut hasher = Sha256::new();
    hasher.update(job_name.as_bytes());
    hasher.update(b"#");
    hasher.update(meta_string.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", b));
    }
    TaskId::new(out)
}

// Broadcast event tags for the task lifecycle.
pub const TASK_CREATED_EVENT: &str = "task_created";
pub const TASK_COMPLETE_EVENT: &str = "task_complete";
pub const TASK_FAILED_EVENT: &str = "task_failure";
pub const TASK_CANCELED_EVENT: &str = "task_canceled";
pub const SUB_TASK_COMPLETE_EVENT: &str = "sub_task_complete";
pub const POOL_CREATED_EVENT: &str = "pool_created";
pub const POOL_COMPLETE_EVENT: &str = "pool_complete";
pub const POOL_CANCELLED_EVENT: &str = "pool_cancelled";
