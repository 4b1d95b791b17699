use crate::{JobMetadata, Task, TaskError, TaskStatus, WorkerPool};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
enum TestMeta {
    Count { label: String, hits: Arc<AtomicUsize> },
    CountReset { label: String, hits: Arc<AtomicUsize> },
    Fail { label: String },
    Panic { label: String },
    Block { label: String },
    FanOut { label: String, width: usize, hits: Arc<AtomicUsize> },
}

impl JobMetadata for TestMeta {
    fn job_name(&self) -> &'static str {
        match self {
            TestMeta::Count { .. } => "count",
            TestMeta::CountReset { .. } => "count_reset",
            TestMeta::Fail { .. } => "fail",
            TestMeta::Panic { .. } => "panic",
            TestMeta::Block { .. } => "block",
            TestMeta::FanOut { .. } => "fan_out",
        }
    }

    fn meta_string(&self) -> String {
        match self {
            TestMeta::Count { label, .. }
            | TestMeta::CountReset { label, .. }
            | TestMeta::Fail { label }
            | TestMeta::Panic { label }
            | TestMeta::Block { label }
            | TestMeta::FanOut { label, .. } => label.clone(),
        }
    }

    fn always_resets(&self) -> bool {
        matches!(self, TestMeta::CountReset { .. })
    }
}

fn test_pool(max_workers: usize) -> Arc<WorkerPool<TestMeta>> {
    let wp = WorkerPool::new(max_workers);

    wp.register_job("count", |task: Arc<Task<TestMeta>>| {
        async move {
            if let TestMeta::Count { hits, .. } = task.metadata() {
                hits.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }
        .boxed()
    });

    wp.register_job("count_reset", |task: Arc<Task<TestMeta>>| {
        async move {
            if let TestMeta::CountReset { hits, .. } = task.metadata() {
                hits.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }
        .boxed()
    });

    wp.register_job("fail", |_task: Arc<Task<TestMeta>>| {
        async move { Err(TaskError::JobFailed("deliberate failure".to_string())) }.boxed()
    });

    wp.register_job("panic", |_task: Arc<Task<TestMeta>>| {
        async move { panic!("deliberate panic") }.boxed()
    });

    wp.register_job("block", |task: Arc<Task<TestMeta>>| {
        async move {
            task.cancelled().await;
            task.check_exit()
        }
        .boxed()
    });

    wp.register_job("fan_out", |task: Arc<Task<TestMeta>>| {
        async move {
            let TestMeta::FanOut { width, hits, label } = task.metadata().clone() else {
                return Err(TaskError::Internal("wrong meta".to_string()));
            };

            let wp = task
                .pool()
                .and_then(|p| p.worker_pool())
                .ok_or(TaskError::GoingDown)?;
            let pool = wp.new_task_pool(true, Some(task.clone()));
            task.set_child_pool(pool.clone());

            for i in 0..width {
                let meta = TestMeta::Count {
                    label: format!("{}-child-{}", label, i),
                    hits: hits.clone(),
                };
                wp.dispatch_job(meta, None, Some(pool.clone()))?;
            }

            pool.signal_all_queued();
            pool.wait(true).await;
            Ok(())
        }
        .boxed()
    });

    wp.start();
    wp
}

// ==================== Dispatch Tests ====================

#[tokio::test]
async fn test_dispatch_runs_job_to_success() {
    let wp = test_pool(2);
    let hits = Arc::new(AtomicUsize::new(0));

    let task = wp
        .dispatch_job(
            TestMeta::Count { label: "a".to_string(), hits: hits.clone() },
            None,
            None,
        )
        .unwrap();

    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Success);
    assert_eq!(hits.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn test_unknown_job_is_rejected() {
    let wp: Arc<WorkerPool<TestMeta>> = WorkerPool::new(1);
    let hits = Arc::new(AtomicUsize::new(0));
    let result = wp.new_task(TestMeta::Count { label: "x".to_string(), hits }, None);
    assert!(matches!(result, Err(TaskError::NoJob(_))));
}

// ==================== Dedup Tests ====================

#[tokio::test]
async fn test_identical_metadata_dedupes_to_one_task() {
    let wp = test_pool(2);
    let hits = Arc::new(AtomicUsize::new(0));

    let meta = TestMeta::Block { label: "same".to_string() };
    let first = wp.dispatch_job(meta.clone(), None, None).unwrap();
    let second = wp.dispatch_job(meta.clone(), None, None).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // Different metadata makes a different task.
    let other = wp
        .dispatch_job(
            TestMeta::Count { label: "other".to_string(), hits },
            None,
            None,
        )
        .unwrap();
    assert_ne!(first.id(), other.id());

    first.cancel();
    first.wait().await;
}

#[tokio::test]
async fn test_always_reset_job_reruns() {
    let wp = test_pool(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let meta = TestMeta::CountReset { label: "upload".to_string(), hits: hits.clone() };

    let first = wp.dispatch_job(meta.clone(), None, None).unwrap();
    first.wait().await;
    assert_eq!(hits.load(Ordering::Acquire), 1);

    // The write-file kind resets and runs again instead of answering from
    // the finished task.
    first.set_persistent(true);
    let again = wp.dispatch_job(meta, None, None).unwrap();
    again.wait().await;
    assert_eq!(hits.load(Ordering::Acquire), 2);
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_failed_job_records_error_and_runs_cleanup() {
    let wp = test_pool(1);
    let cleaned = Arc::new(AtomicBool::new(false));

    let pool = wp.new_task_pool(false, None);
    let task = wp
        .new_task(TestMeta::Fail { label: "f".to_string() }, None)
        .unwrap();
    let flag = cleaned.clone();
    task.set_error_cleanup(move || flag.store(true, Ordering::Release));
    pool.queue_task(&task).unwrap();
    pool.signal_all_queued();
    pool.wait(false).await;

    assert_eq!(task.status(), TaskStatus::Error);
    assert!(task.error().is_some());
    assert!(cleaned.load(Ordering::Acquire));
    assert_eq!(pool.errors().len(), 1);
}

#[tokio::test]
async fn test_panicking_job_does_not_kill_worker() {
    let wp = test_pool(1);

    let task = wp
        .dispatch_job(TestMeta::Panic { label: "p".to_string() }, None, None)
        .unwrap();
    task.wait().await;
    assert_eq!(task.status(), TaskStatus::Error);

    // The single worker survived the panic and still serves jobs.
    let hits = Arc::new(AtomicUsize::new(0));
    let next = wp
        .dispatch_job(
            TestMeta::Count { label: "after".to_string(), hits: hits.clone() },
            None,
            None,
        )
        .unwrap();
    next.wait().await;
    assert_eq!(hits.load(Ordering::Acquire), 1);
}

// ==================== Cancellation Tests ====================

#[tokio::test]
async fn test_cancel_wakes_suspension_point() {
    let wp = test_pool(2);
    let cleaned = Arc::new(AtomicBool::new(false));

    let task = wp
        .new_task(TestMeta::Block { label: "held".to_string() }, None)
        .unwrap();
    let flag = cleaned.clone();
    task.set_error_cleanup(move || flag.store(true, Ordering::Release));
    wp.global_pool().queue_task(&task).unwrap();

    // Give the worker a moment to park inside the job.
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.cancel();
    task.wait().await;

    assert_eq!(task.status(), TaskStatus::Cancelled);
    assert!(cleaned.load(Ordering::Acquire));
}

#[tokio::test]
async fn test_pool_cancel_is_best_effort_and_closes_pool() {
    let wp = test_pool(2);
    let pool = wp.new_task_pool(false, None);

    let a = wp.new_task(TestMeta::Block { label: "a".to_string() }, None).unwrap();
    let b = wp.new_task(TestMeta::Block { label: "b".to_string() }, None).unwrap();
    pool.queue_task(&a).unwrap();
    pool.queue_task(&b).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.cancel();
    a.wait().await;
    b.wait().await;
    assert_eq!(a.status(), TaskStatus::Cancelled);
    assert_eq!(b.status(), TaskStatus::Cancelled);

    let c = wp.new_task(TestMeta::Block { label: "c".to_string() }, None).unwrap();
    assert!(matches!(pool.queue_task(&c), Err(TaskError::PoolClosed(_))));
}

// ==================== Waiter Gate Tests ====================

#[tokio::test]
async fn test_wait_resumes_every_waiter_once() {
    let wp = test_pool(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let pool = wp.new_task_pool(false, None);

    for i in 0..10 {
        let meta = TestMeta::Count { label: format!("w{}", i), hits: hits.clone() };
        wp.dispatch_job(meta, None, Some(pool.clone())).unwrap();
    }
    pool.signal_all_queued();

    let resumed = Arc::new(AtomicUsize::new(0));
    let mut waiters = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        let resumed = resumed.clone();
        waiters.push(tokio::spawn(async move {
            pool.wait(false).await;
            resumed.fetch_add(1, Ordering::AcqRel);
        }));
    }
    for w in waiters {
        w.await.unwrap();
    }

    assert_eq!(resumed.load(Ordering::Acquire), 4);
    assert_eq!(hits.load(Ordering::Acquire), 10);
    let (complete, total, progress) = pool.status();
    assert_eq!((complete, total), (10, 10));
    assert!((progress - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_wait_on_empty_signalled_pool_returns_immediately() {
    let wp = test_pool(1);
    let pool = wp.new_task_pool(false, None);
    pool.signal_all_queued();
    pool.wait(false).await;
}

#[tokio::test]
async fn test_wait_on_global_pool_returns_immediately() {
    let wp = test_pool(1);
    wp.global_pool().wait(false).await;
}

// ==================== Replacement Worker Tests ====================

#[tokio::test]
async fn test_parked_parent_does_not_starve_children() {
    // One permanent worker: the fan-out job parks on its child pool, and
    // only the replacement worker can run the children. Without the
    // replacement this deadlocks.
    let wp = test_pool(1);
    let hits = Arc::new(AtomicUsize::new(0));

    let task = wp
        .dispatch_job(
            TestMeta::FanOut { label: "scan".to_string(), width: 8, hits: hits.clone() },
            None,
            None,
        )
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), task.wait())
        .await
        .expect("fan-out deadlocked");

    assert_eq!(task.status(), TaskStatus::Success);
    assert_eq!(hits.load(Ordering::Acquire), 8);

    // Replacements retired; only the permanent worker remains.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(wp.worker_count(), 1);
}

#[tokio::test]
async fn test_child_pool_progress_rolls_up_to_root() {
    let wp = test_pool(2);
    let hits = Arc::new(AtomicUsize::new(0));

    let task = wp
        .dispatch_job(
            TestMeta::FanOut { label: "rollup".to_string(), width: 5, hits },
            None,
            None,
        )
        .unwrap();
    task.wait().await;

    // The child pool hangs off the global pool, so it is its own root and
    // carries exactly its five children.
    let child = task.child_pool().unwrap();
    let root = child.root_pool();
    assert!(Arc::ptr_eq(&child, &root));
    let (complete, total, _) = root.status();
    assert_eq!(total, 5);
    assert_eq!(complete, total);
}
