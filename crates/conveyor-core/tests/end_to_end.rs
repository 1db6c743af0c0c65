//! End-to-end scenarios against the in-memory backends with in-process
//! handlers standing in for the downstream worker services.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::broker::Broker;
use conveyor_core::config::Config;
use conveyor_core::control::{Caller, ControlPlane};
use conveyor_core::handler::{Handler, HandlerContext, HandlerError, HandlerMap};
use conveyor_core::job::{JobId, JobOptions, JobStatus};
use conveyor_core::registry::{JobTypeRegistry, JobTypeSpec};
use conveyor_core::scheduler::{CronTable, Scheduler};
use conveyor_core::store::JobStore;
use conveyor_core::{MemoryBroker, MemoryJobStore, WorkerPool};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted in-process handler: fails the first `fail_first` calls,
/// hangs for `hang_ms` on the first `hang_first` calls, succeeds after
struct ScriptedHandler {
    calls: AtomicU32,
    fail_first: u32,
    hang_first: u32,
    hang_ms: u64,
    work_ms: u64,
}

impl ScriptedHandler {
    fn succeeding(work_ms: u64) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
            hang_first: 0,
            hang_ms: 0,
            work_ms,
        }
    }

    fn failing_first(fail_first: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first,
            hang_first: 0,
            hang_ms: 0,
            work_ms: 0,
        }
    }

    fn hanging_first(hang_first: u32, hang_ms: u64) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
            hang_first,
            hang_ms,
            work_ms: 0,
        }
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn call(&self, _: &Value, _: &HandlerContext) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.hang_first {
            // Ignores the cancellation signal, like a wedged worker
            tokio::time::sleep(Duration::from_millis(self.hang_ms)).await;
            return Ok(json!({"late": true}));
        }
        if call < self.fail_first {
            return Err(HandlerError::Retriable("503 from worker".to_string()));
        }
        if self.work_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.work_ms)).await;
        }
        Ok(json!({"ok": true}))
    }
}

struct Stack {
    store: Arc<MemoryJobStore>,
    broker: Arc<MemoryBroker>,
    control: Arc<ControlPlane>,
    scheduler: Arc<Scheduler>,
    pools: Vec<Arc<WorkerPool>>,
}

/// Build a full stack for one queue with the given handler
fn stack(queue: &str, job_type: &str, handler: Arc<dyn Handler>, handler_timeout: Duration) -> Stack {
    let mut config = Config::default();
    config.queues.defaults.retry_delay_ms = 200;
    // One slot keeps dispatch order deterministic across these scenarios
    config.queues.defaults.concurrency = 1;
    config.worker.poll_interval_ms = 20;
    config.worker.lease_grace_secs = 0;

    let store = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(MemoryBroker::new());

    let mut registry = JobTypeRegistry::new();
    registry
        .register(queue, job_type, JobTypeSpec::new("http://unused", handler_timeout))
        .unwrap();
    let registry = Arc::new(registry);

    let mut handlers = HandlerMap::new();
    handlers.insert(queue, job_type, handler);
    let handlers = Arc::new(handlers);

    let cron = Arc::new(CronTable::new(chrono_tz::UTC));
    let control = Arc::new(ControlPlane::new(
        store.clone() as Arc<dyn JobStore>,
        broker.clone() as Arc<dyn Broker>,
        registry.clone(),
        cron.clone(),
        &config,
    ));

    let pool = Arc::new(WorkerPool::new(
        queue,
        &config.queue_configuration(queue),
        &config.worker,
        config.scheduler.backoff_ceiling(),
        store.clone() as Arc<dyn JobStore>,
        broker.clone() as Arc<dyn Broker>,
        handlers,
        &registry,
    ));

    let scheduler = Arc::new(Scheduler::new(
        control.clone(),
        cron,
        config.scheduler.clone(),
    ));

    Stack {
        store,
        broker,
        control,
        scheduler,
        pools: vec![pool],
    }
}

impl Stack {
    async fn start_workers(&self) {
        for pool in &self.pools {
            pool.start().await;
        }
    }

    async fn stop(&self) {
        self.scheduler.stop();
        for pool in &self.pools {
            pool.stop().await;
        }
    }

    /// Drive promotion and wait for the job to reach a terminal state
    async fn wait_terminal(&self, id: JobId) -> conveyor_core::Job {
        for _ in 0..600 {
            self.scheduler.promote_once(Utc::now()).await.unwrap();
            let job = self.store.get(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }
}

#[tokio::test]
async fn happy_path_completes_on_first_attempt() {
    let stack = stack(
        "notifications",
        "send-notification",
        Arc::new(ScriptedHandler::succeeding(40)),
        Duration::from_secs(5),
    );
    stack.start_workers().await;

    let caller = Caller::owner("acct-1");
    let id = stack
        .control
        .submit(
            &caller,
            "notifications",
            "send-notification",
            json!({"user": "u1", "msg": "hi"}),
            JobOptions {
                max_attempts: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = stack.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.result.is_some());

    let elapsed = job.processing_time_ms.unwrap();
    assert!((30..2_000).contains(&elapsed), "elapsed {}ms", elapsed);

    let view = stack.control.inspect(&caller, id).await.unwrap();
    assert_eq!(view.placement, "terminal");

    stack.stop().await;
}

#[tokio::test]
async fn retry_after_transient_failure_respects_backoff() {
    let stack = stack(
        "video-scraping",
        "scrape-videos",
        Arc::new(ScriptedHandler::failing_first(1)),
        Duration::from_secs(5),
    );
    stack.start_workers().await;

    let id = stack
        .control
        .submit(
            &Caller::owner("acct-1"),
            "video-scraping",
            "scrape-videos",
            json!({"account": "a1"}),
            JobOptions::default(),
        )
        .await
        .unwrap();

    let job = stack.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);

    // The retry waited out the configured 200ms base backoff
    let waited = (job.completed_at.unwrap() - job.created_at).num_milliseconds();
    assert!(waited >= 200, "retry fired after only {}ms", waited);

    stack.stop().await;
}

#[tokio::test]
async fn exhausted_attempts_leave_a_failed_record_and_empty_broker() {
    let stack = stack(
        "video-analysis",
        "analyze-video",
        Arc::new(ScriptedHandler::failing_first(u32::MAX)),
        Duration::from_secs(5),
    );
    stack.start_workers().await;

    let id = stack
        .control
        .submit(
            &Caller::owner("acct-1"),
            "video-analysis",
            "analyze-video",
            json!({"video": "v1"}),
            JobOptions {
                max_attempts: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let job = stack.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.error.as_deref().unwrap_or("").contains("503"));

    // Present in the store, absent from every broker set
    assert!(stack.store.get(id).await.is_ok());
    assert_eq!(stack.broker.placement("video-analysis", id).await.unwrap(), None);
    let sizes = stack.broker.sizes("video-analysis").await.unwrap();
    assert_eq!((sizes.waiting, sizes.active, sizes.delayed), (0, 0, 0));

    stack.stop().await;
}

#[tokio::test]
async fn cancelling_a_delayed_job_removes_it_before_it_runs() {
    let stack = stack(
        "file-processing",
        "process-file",
        Arc::new(ScriptedHandler::succeeding(0)),
        Duration::from_secs(5),
    );
    stack.start_workers().await;

    let caller = Caller::owner("acct-1");
    let id = stack
        .control
        .submit(
            &caller,
            "file-processing",
            "process-file",
            json!({"file": "f1"}),
            JobOptions {
                delay_ms: Some(60_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(stack.broker.sizes("file-processing").await.unwrap().delayed, 1);

    stack.control.cancel(&caller, id).await.unwrap();

    let job = stack.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("cancelled"));
    assert_eq!(stack.broker.sizes("file-processing").await.unwrap().delayed, 0);

    stack.stop().await;
}

#[tokio::test]
async fn stalled_job_is_requeued_and_eventually_completes() {
    // Handler hangs 10s on its first call; the 1s per-type timeout
    // makes the slot abandon the attempt and the lease lapse
    let stack = stack(
        "business-discovery",
        "discover-businesses",
        Arc::new(ScriptedHandler::hanging_first(1, 10_000)),
        Duration::from_secs(1),
    );
    stack.start_workers().await;

    let id = stack
        .control
        .submit(
            &Caller::owner("acct-1"),
            "business-discovery",
            "discover-businesses",
            json!({"region": "mn"}),
            JobOptions {
                max_attempts: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Wait out the lease, then sweep
    let mut stalled = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stack.scheduler.sweep_stalled_once(Utc::now()).await.unwrap();
        let job = stack.store.get(id).await.unwrap();
        if job.stalled_at.is_some() {
            stalled = true;
            break;
        }
    }
    assert!(stalled, "stall sweep never caught the expired lease");

    // The requeued attempt succeeds once the backoff elapses
    let job = stack.wait_terminal(id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.attempts >= 2);
    assert!(job.stalled_at.is_some());

    stack.stop().await;
}

#[tokio::test]
async fn cron_registration_fires_a_fresh_job_when_due() {
    let stack = stack(
        "cleanup",
        "cleanup-expired-jobs",
        Arc::new(ScriptedHandler::succeeding(0)),
        Duration::from_secs(5),
    );
    // No workers: this test only watches submission

    let caller = Caller::admin();
    let name = stack
        .control
        .schedule_repeating(
            &caller,
            "cleanup",
            "cleanup-expired-jobs",
            json!({"older_than_days": 30}),
            "0 2 * * *",
        )
        .await
        .unwrap();

    let before = stack
        .store
        .query(&conveyor_core::JobQuery::new().with_queue("cleanup"))
        .await
        .unwrap();
    assert_eq!(before.total, 0);

    // Drive the cron task to the entry's fire time
    let next = stack.control.list_scheduled(&caller).await.unwrap()[0]
        .next_fire
        .unwrap();
    let fired = stack.scheduler.fire_due_cron_once(next).await.unwrap();
    assert_eq!(fired, 1);

    let after = stack
        .store
        .query(&conveyor_core::JobQuery::new().with_queue("cleanup"))
        .await
        .unwrap();
    assert_eq!(after.total, 1);
    assert_eq!(after.jobs[0].payload, json!({"older_than_days": 30}));

    // The same instant fires nothing further
    assert_eq!(stack.scheduler.fire_due_cron_once(next).await.unwrap(), 0);

    // Cancellation stops future fires but leaves the submitted job
    stack.control.cancel_scheduled(&caller, &name).await.unwrap();
    let much_later = next + chrono::Duration::days(2);
    assert_eq!(stack.scheduler.fire_due_cron_once(much_later).await.unwrap(), 0);

    stack.stop().await;
}

#[tokio::test]
async fn equal_priority_jobs_start_in_submission_order() {
    let stack = stack(
        "notifications",
        "send-notification",
        Arc::new(ScriptedHandler::succeeding(10)),
        Duration::from_secs(5),
    );

    let caller = Caller::owner("acct-1");
    let first = stack
        .control
        .submit(
            &caller,
            "notifications",
            "send-notification",
            json!({"user": "u1", "msg": "one"}),
            JobOptions::default(),
        )
        .await
        .unwrap();
    let second = stack
        .control
        .submit(
            &caller,
            "notifications",
            "send-notification",
            json!({"user": "u1", "msg": "two"}),
            JobOptions::default(),
        )
        .await
        .unwrap();

    stack.start_workers().await;
    let first_job = stack.wait_terminal(first).await;
    let second_job = stack.wait_terminal(second).await;

    assert!(first_job.started_at.unwrap() <= second_job.started_at.unwrap());

    stack.stop().await;
}

#[tokio::test]
async fn retention_trim_keeps_recent_terminal_records() {
    let stack = stack(
        "cleanup",
        "cleanup-expired-jobs",
        Arc::new(ScriptedHandler::succeeding(0)),
        Duration::from_secs(5),
    );
    stack.start_workers().await;

    let caller = Caller::admin();
    let mut ids = Vec::new();
    for i in 0..5 {
        let id = stack
            .control
            .submit(
                &caller,
                "cleanup",
                "cleanup-expired-jobs",
                json!({"n": i}),
                JobOptions::default(),
            )
            .await
            .unwrap();
        ids.push(id);
    }
    for id in &ids {
        stack.wait_terminal(*id).await;
    }

    // Shrink the retention window, then run the trim
    stack
        .control
        .update_queue_config(
            &caller,
            "cleanup",
            conveyor_core::QueueConfiguration {
                retain_completed: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let removed = stack.scheduler.run_retention_once(Utc::now()).await.unwrap();
    assert_eq!(removed, 3);

    let left = stack
        .store
        .query(&conveyor_core::JobQuery::new().with_queue("cleanup"))
        .await
        .unwrap();
    assert_eq!(left.total, 2);

    stack.stop().await;
}
