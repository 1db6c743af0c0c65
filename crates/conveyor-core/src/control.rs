//! Control Plane: administrative operations over Store + Broker
//!
//! Thin orchestration layer invoked by the HTTP adapter (and by the
//! Scheduler for cron fires). Authorization is explicit: every operation
//! takes a [`Caller`] and the core enforces owner/admin rules itself;
//! how the identity was established is the adapter's business.

use crate::broker::{Broker, Placement};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobOptions, JobPage, JobPatch, JobQuery, JobStatus};
use crate::metrics::{self, HealthSummary, MetricsReport};
use crate::queues::{
    is_registered_queue, QueueConfiguration, QueueCounts, QueueDescriptor, QUEUE_NAMES,
};
use crate::registry::JobTypeRegistry;
use crate::scheduler::{CronEntryInfo, CronTable};
use crate::store::{AggregateDimension, AggregateRow, JobStore};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Caller identity as established by the adapter
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub owner: Option<String>,
    pub is_admin: bool,
}

impl Caller {
    /// Administrative caller
    pub fn admin() -> Self {
        Self {
            owner: None,
            is_admin: true,
        }
    }

    /// Regular producer identified by owner
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            is_admin: false,
        }
    }

    /// Internal identity used for cron fires
    pub fn scheduler() -> Self {
        Self {
            owner: Some("scheduler".to_string()),
            is_admin: true,
        }
    }

    fn require_admin(&self) -> Result<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(Error::AdminRequired)
        }
    }

    fn can_touch(&self, job: &Job) -> bool {
        if self.is_admin {
            return true;
        }
        match (&self.owner, &job.owner) {
            (Some(caller), Some(owner)) => caller == owner,
            _ => false,
        }
    }
}

/// Store record merged with the live broker placement
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    /// `waiting`, `delayed`, `in_flight`, or `terminal`
    pub placement: &'static str,
}

/// Per-id result of a bulk cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    RefusedActive,
    /// Already terminal
    Skipped,
    NotFound,
    Forbidden,
}

/// Descriptor plus live counts
#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    #[serde(flatten)]
    pub descriptor: QueueDescriptor,
    pub counts: QueueCounts,
}

/// Queue detail view: summary, recent jobs, per-type rollup
#[derive(Debug, Clone, Serialize)]
pub struct QueueDetail {
    #[serde(flatten)]
    pub summary: QueueSummary,
    pub recent_jobs: Vec<Job>,
    pub type_rollup: Vec<AggregateRow>,
}

fn queue_description(name: &str) -> &'static str {
    match name {
        "business-discovery" => "Locates candidate businesses for analysis",
        "instagram-detection" => "Resolves Instagram accounts for discovered businesses",
        "video-scraping" => "Collects video content from resolved accounts",
        "video-analysis" => "Runs the analysis pipeline over scraped videos",
        "report-generation" => "Renders analysis results into reports",
        "file-processing" => "Post-processes uploaded and generated files",
        "cleanup" => "Housekeeping over expired platform data",
        "notifications" => "Delivers user-facing notifications",
        _ => "",
    }
}

/// Administrative surface over the orchestration core
pub struct ControlPlane {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<JobTypeRegistry>,
    cron: Arc<CronTable>,
    queues: RwLock<HashMap<String, QueueDescriptor>>,
    max_payload_bytes: usize,
    max_delay: Duration,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<JobTypeRegistry>,
        cron: Arc<CronTable>,
        config: &Config,
    ) -> Self {
        let queues = QUEUE_NAMES
            .iter()
            .map(|name| {
                let descriptor = QueueDescriptor::new(*name, queue_description(name))
                    .with_configuration(config.queue_configuration(name));
                (name.to_string(), descriptor)
            })
            .collect();

        Self {
            store,
            broker,
            registry,
            cron,
            queues: RwLock::new(queues),
            max_payload_bytes: config.limits.max_payload_bytes,
            max_delay: config.limits.max_delay(),
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub fn registry(&self) -> Arc<JobTypeRegistry> {
        Arc::clone(&self.registry)
    }

    /// Effective configuration for a queue
    pub async fn queue_configuration(&self, queue: &str) -> Result<QueueConfiguration> {
        let queues = self.queues.read().await;
        queues
            .get(queue)
            .map(|d| d.configuration.clone())
            .ok_or_else(|| Error::InvalidQueue(queue.to_string()))
    }

    /// Accept a new job: validate, persist in `waiting`, then enqueue.
    pub async fn submit(
        &self,
        caller: &Caller,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        self.registry
            .validate_submission(queue, job_type, &payload, self.max_payload_bytes)?;

        if let Some(delay_ms) = options.delay_ms {
            if Duration::from_millis(delay_ms) > self.max_delay {
                return Err(Error::InvalidDelay(format!(
                    "delay_ms {} exceeds maximum {}",
                    delay_ms,
                    self.max_delay.as_millis()
                )));
            }
        }

        let configuration = self.queue_configuration(queue).await?;
        let now = Utc::now();

        let mut job = Job::new(queue, job_type, payload)
            .with_priority(options.priority)
            .with_max_attempts(options.max_attempts.unwrap_or(configuration.retry_attempts));
        if let Some(id) = options.id {
            job = job.with_id(id);
        }
        if let Some(owner) = &caller.owner {
            job = job.with_owner(owner.clone());
        }
        let delay_until = options
            .delay_ms
            .filter(|ms| *ms > 0)
            .map(|ms| now + chrono::Duration::milliseconds(ms as i64));
        if let Some(until) = delay_until {
            job = job.with_delay_until(until);
        }

        let job_id = job.id;
        let priority = job.priority;
        self.store.create(job).await?;

        if let Err(e) = self
            .broker
            .enqueue(queue, job_id, priority, delay_until, now)
            .await
        {
            // No phantom jobs: a submission that could not reach the
            // broker is rolled back and surfaced to the caller
            warn!(queue, job_id = %job_id, error = %e, "enqueue failed; rolling back submission");
            let _ = self.store.remove(job_id).await;
            return Err(e);
        }

        info!(queue, job_type, job_id = %job_id, "job submitted");
        Ok(job_id)
    }

    /// Store record merged with live broker placement
    pub async fn inspect(&self, caller: &Caller, id: JobId) -> Result<JobView> {
        let job = self.store.get(id).await?;
        if !caller.can_touch(&job) {
            return Err(Error::Forbidden);
        }

        let placement = if job.status.is_terminal() {
            "terminal"
        } else {
            match self.broker.placement(&job.queue, id).await? {
                Some(Placement::Ready) => "waiting",
                Some(Placement::Delayed) => "delayed",
                Some(Placement::InFlight) => "in_flight",
                // Transitional gap between store write and broker state
                None => "waiting",
            }
        };

        Ok(JobView { job, placement })
    }

    /// Cancel a waiting or delayed job. Active jobs are refused; the
    /// handler call cannot be preempted. Cancelling a job that already
    /// reached a terminal state is a no-op.
    pub async fn cancel(&self, caller: &Caller, id: JobId) -> Result<()> {
        let job = self.store.get(id).await?;
        if !caller.can_touch(&job) {
            return Err(Error::Forbidden);
        }

        match job.status {
            JobStatus::Active => Err(Error::RefusedActive),
            JobStatus::Completed | JobStatus::Failed => Ok(()),
            JobStatus::Waiting | JobStatus::Stalled => {
                self.broker.remove(&job.queue, id).await?;
                self.store
                    .update(
                        id,
                        JobPatch::new()
                            .status(JobStatus::Failed)
                            .error("cancelled")
                            .failed_at(Utc::now())
                            .delay_until(None),
                    )
                    .await?;
                info!(queue = %job.queue, job_id = %id, "job cancelled");
                Ok(())
            }
        }
    }

    /// Cancel many ids, reporting a per-id outcome. Jobs that were
    /// already terminal at the moment of the call are skipped.
    pub async fn bulk_cancel(
        &self,
        caller: &Caller,
        ids: &[JobId],
    ) -> Vec<(JobId, CancelOutcome)> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            let terminal = match self.store.get(id).await {
                Ok(job) => caller.can_touch(&job) && job.status.is_terminal(),
                Err(_) => false,
            };
            let outcome = if terminal {
                CancelOutcome::Skipped
            } else {
                match self.cancel(caller, id).await {
                    Ok(()) => CancelOutcome::Cancelled,
                    Err(Error::RefusedActive) => CancelOutcome::RefusedActive,
                    Err(Error::NotFound(_)) => CancelOutcome::NotFound,
                    Err(Error::Forbidden) => CancelOutcome::Forbidden,
                    Err(e) => {
                        warn!(job_id = %id, error = %e, "bulk cancel entry failed");
                        CancelOutcome::NotFound
                    }
                }
            };
            outcomes.push((id, outcome));
        }
        outcomes
    }

    /// Clone a failed job into a fresh record and dispatch it. The
    /// original is left in place, linked via `retried_as`.
    pub async fn retry(&self, caller: &Caller, id: JobId) -> Result<JobId> {
        let job = self.store.get(id).await?;
        if !caller.can_touch(&job) {
            return Err(Error::Forbidden);
        }
        if job.status != JobStatus::Failed {
            return Err(Error::NotRetriable);
        }

        let clone = job.clone_for_retry();
        let clone_id = clone.id;
        let priority = clone.priority;
        self.store.create(clone).await?;

        if let Err(e) = self
            .broker
            .enqueue(&job.queue, clone_id, priority, None, Utc::now())
            .await
        {
            let _ = self.store.remove(clone_id).await;
            return Err(e);
        }

        if let Err(e) = self
            .store
            .update(id, JobPatch::new().retried_as(clone_id))
            .await
        {
            // The clone is already dispatchable; take it back out so a
            // failed retry leaves nothing behind
            let _ = self.broker.remove(&job.queue, clone_id).await;
            let _ = self.store.remove(clone_id).await;
            return Err(e);
        }

        info!(queue = %job.queue, original = %id, retry = %clone_id, "job retried");
        Ok(clone_id)
    }

    /// Jobs belonging to one owner
    pub async fn list_for_owner(
        &self,
        caller: &Caller,
        owner: &str,
        query: JobQuery,
    ) -> Result<JobPage> {
        if !caller.is_admin && caller.owner.as_deref() != Some(owner) {
            return Err(Error::Forbidden);
        }
        self.store.query(&query.with_owner(owner)).await
    }

    /// Jobs in one queue. Non-admin callers see only their own jobs.
    pub async fn list_for_queue(
        &self,
        caller: &Caller,
        queue: &str,
        query: JobQuery,
    ) -> Result<JobPage> {
        if !is_registered_queue(queue) {
            return Err(Error::InvalidQueue(queue.to_string()));
        }
        let mut query = query.with_queue(queue);
        if !caller.is_admin {
            let owner = caller.owner.clone().ok_or(Error::AuthRequired)?;
            query = query.with_owner(owner);
        }
        self.store.query(&query).await
    }

    async fn counts_for(&self, queue: &str) -> Result<QueueCounts> {
        let sizes = self.broker.sizes(queue).await?;
        let rows = self
            .store
            .aggregate(
                &JobQuery::new().with_queue(queue),
                &[AggregateDimension::Status],
            )
            .await?;
        let count_of = |status: JobStatus| {
            rows.iter()
                .find(|row| row.status == Some(status))
                .map(|row| row.count as usize)
                .unwrap_or(0)
        };
        Ok(QueueCounts {
            waiting: sizes.waiting,
            active: sizes.active,
            delayed: sizes.delayed,
            completed: count_of(JobStatus::Completed),
            failed: count_of(JobStatus::Failed),
        })
    }

    /// All descriptors with live counts
    pub async fn queue_list(&self, caller: &Caller) -> Result<Vec<QueueSummary>> {
        caller.require_admin()?;
        let descriptors: Vec<QueueDescriptor> =
            self.queues.read().await.values().cloned().collect();

        let mut summaries = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let counts = self.counts_for(&descriptor.name).await?;
            summaries.push(QueueSummary { descriptor, counts });
        }
        summaries.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        Ok(summaries)
    }

    /// One queue with recent jobs and a per-type rollup
    pub async fn queue_detail(&self, caller: &Caller, queue: &str) -> Result<QueueDetail> {
        caller.require_admin()?;
        let descriptor = self
            .queues
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("queue {}", queue)))?;

        let counts = self.counts_for(queue).await?;
        let recent = self
            .store
            .query(&JobQuery::new().with_queue(queue).with_limit(10))
            .await?;
        let rollup = self
            .store
            .aggregate(
                &JobQuery::new().with_queue(queue),
                &[AggregateDimension::JobType, AggregateDimension::Status],
            )
            .await?;

        Ok(QueueDetail {
            summary: QueueSummary { descriptor, counts },
            recent_jobs: recent.jobs,
            type_rollup: rollup,
        })
    }

    async fn set_queue_active(
        &self,
        caller: &Caller,
        queue: &str,
        active: bool,
    ) -> Result<QueueDescriptor> {
        caller.require_admin()?;
        let mut queues = self.queues.write().await;
        let descriptor = queues
            .get_mut(queue)
            .ok_or_else(|| Error::not_found(format!("queue {}", queue)))?;
        descriptor.is_active = active;
        let descriptor = descriptor.clone();
        drop(queues);

        self.broker.set_paused(queue, !active).await?;
        info!(queue, active, "queue pause flag updated");
        Ok(descriptor)
    }

    /// Stop reservation for a queue; in-flight jobs finish, ready jobs
    /// accumulate
    pub async fn pause_queue(&self, caller: &Caller, queue: &str) -> Result<QueueDescriptor> {
        self.set_queue_active(caller, queue, false).await
    }

    pub async fn resume_queue(&self, caller: &Caller, queue: &str) -> Result<QueueDescriptor> {
        self.set_queue_active(caller, queue, true).await
    }

    /// Purge records older than `older_than`, optionally restricted to
    /// a status set; non-terminal matches are removed from the broker
    /// as well
    pub async fn clean_queue(
        &self,
        caller: &Caller,
        queue: &str,
        older_than: Duration,
        statuses: Option<&[JobStatus]>,
    ) -> Result<usize> {
        caller.require_admin()?;
        if !is_registered_queue(queue) {
            return Err(Error::InvalidQueue(queue.to_string()));
        }

        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        let page = self
            .store
            .query(&JobQuery::new().with_queue(queue).created_before(cutoff))
            .await?;

        let mut removed = 0;
        for job in page.jobs {
            if let Some(statuses) = statuses {
                if !statuses.contains(&job.status) {
                    continue;
                }
            }
            if !job.status.is_terminal() {
                let _ = self.broker.remove(queue, job.id).await;
            }
            if self.store.remove(job.id).await? {
                removed += 1;
            }
        }

        info!(queue, removed, "queue cleaned");
        Ok(removed)
    }

    /// Replace a queue's configuration. Concurrency changes take effect
    /// when the worker pools are next constructed.
    pub async fn update_queue_config(
        &self,
        caller: &Caller,
        queue: &str,
        configuration: QueueConfiguration,
    ) -> Result<QueueDescriptor> {
        caller.require_admin()?;
        configuration.validate().map_err(Error::Validation)?;

        let mut queues = self.queues.write().await;
        let descriptor = queues
            .get_mut(queue)
            .ok_or_else(|| Error::not_found(format!("queue {}", queue)))?;
        descriptor.configuration = configuration;
        info!(queue, "queue configuration updated");
        Ok(descriptor.clone())
    }

    /// Submit with a delay bound by the configured maximum
    pub async fn schedule_delayed(
        &self,
        caller: &Caller,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        delay_ms: u64,
    ) -> Result<JobId> {
        self.submit(
            caller,
            queue,
            job_type,
            payload,
            JobOptions {
                delay_ms: Some(delay_ms),
                ..Default::default()
            },
        )
        .await
    }

    /// Register a recurring cron submission; returns the entry name
    pub async fn schedule_repeating(
        &self,
        caller: &Caller,
        queue: &str,
        job_type: &str,
        payload: serde_json::Value,
        expression: &str,
    ) -> Result<String> {
        caller.require_admin()?;
        // Reject templates that would fail at fire time
        self.registry
            .validate_submission(queue, job_type, &payload, self.max_payload_bytes)?;
        self.cron
            .register(queue, job_type, payload, expression, Utc::now())
    }

    /// Stop future fires of a named entry
    pub async fn cancel_scheduled(&self, caller: &Caller, name: &str) -> Result<()> {
        caller.require_admin()?;
        if self.cron.cancel(name) {
            Ok(())
        } else {
            Err(Error::not_found(format!("cron entry {}", name)))
        }
    }

    pub async fn list_scheduled(&self, caller: &Caller) -> Result<Vec<CronEntryInfo>> {
        caller.require_admin()?;
        Ok(self.cron.list())
    }

    /// Manually fire a registered entry now
    pub async fn trigger_scheduled(&self, caller: &Caller, name: &str) -> Result<JobId> {
        caller.require_admin()?;
        let template = self
            .cron
            .template(name)
            .ok_or_else(|| Error::NotTriggerable(name.to_string()))?;
        self.submit(
            caller,
            &template.queue,
            &template.job_type,
            template.payload,
            JobOptions::default(),
        )
        .await
    }

    /// Hourly buckets plus an overall rollup
    pub async fn metrics(
        &self,
        caller: &Caller,
        queue: Option<&str>,
        window_hours: u32,
    ) -> Result<MetricsReport> {
        caller.require_admin()?;
        if let Some(queue) = queue {
            if !is_registered_queue(queue) {
                return Err(Error::InvalidQueue(queue.to_string()));
            }
        }
        metrics::compute_metrics(self.store.as_ref(), queue, window_hours, Utc::now()).await
    }

    /// Service-wide health; available to any caller
    pub async fn health_summary(&self) -> Result<HealthSummary> {
        metrics::health_summary(self.store.as_ref(), Utc::now()).await
    }

    /// Recompute cached descriptor aggregates (scheduler tick)
    pub async fn refresh_aggregates(&self, now: chrono::DateTime<Utc>) -> Result<()> {
        for queue in QUEUE_NAMES {
            let aggregates =
                metrics::refresh_queue_aggregates(self.store.as_ref(), queue, now).await?;
            let mut queues = self.queues.write().await;
            if let Some(descriptor) = queues.get_mut(queue) {
                descriptor.aggregates = aggregates;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::registry::{JobTypeSpec, PayloadSchema};
    use crate::store::MemoryJobStore;
    use serde_json::json;

    fn test_registry() -> JobTypeRegistry {
        let mut registry = JobTypeRegistry::new();
        for (queue, job_type) in [
            ("notifications", "send-notification"),
            ("cleanup", "cleanup-expired-jobs"),
            ("video-analysis", "analyze-video"),
        ] {
            registry
                .register(
                    queue,
                    job_type,
                    JobTypeSpec::new("http://unused", Duration::from_secs(30))
                        .with_schema(PayloadSchema::any()),
                )
                .unwrap();
        }
        registry
    }

    fn control() -> (Arc<ControlPlane>, Arc<MemoryBroker>) {
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let config = Config::default();
        let cron = Arc::new(CronTable::new(chrono_tz::UTC));
        let control = Arc::new(ControlPlane::new(
            store as Arc<dyn JobStore>,
            broker.clone() as Arc<dyn Broker>,
            Arc::new(test_registry()),
            cron,
            &config,
        ));
        (control, broker)
    }

    #[tokio::test]
    async fn test_submit_then_inspect_round_trip() {
        let (control, _) = control();
        let caller = Caller::owner("acct-1");

        let id = control
            .submit(
                &caller,
                "notifications",
                "send-notification",
                json!({"user": "u1", "msg": "hi"}),
                JobOptions::default(),
            )
            .await
            .unwrap();

        let view = control.inspect(&caller, id).await.unwrap();
        assert_eq!(view.job.queue, "notifications");
        assert_eq!(view.job.job_type, "send-notification");
        assert_eq!(view.job.payload, json!({"user": "u1", "msg": "hi"}));
        assert_eq!(view.job.owner.as_deref(), Some("acct-1"));
        assert_eq!(view.placement, "waiting");
    }

    #[tokio::test]
    async fn test_submit_validates_queue_and_type() {
        let (control, _) = control();
        let caller = Caller::owner("acct-1");

        let bad_queue = control
            .submit(&caller, "payments", "charge", json!({}), JobOptions::default())
            .await;
        assert!(matches!(bad_queue, Err(Error::InvalidQueue(_))));

        let bad_type = control
            .submit(&caller, "cleanup", "scrub", json!({}), JobOptions::default())
            .await;
        assert!(matches!(bad_type, Err(Error::InvalidJobType { .. })));
    }

    #[tokio::test]
    async fn test_submit_rejects_excessive_delay() {
        let (control, _) = control();
        let result = control
            .submit(
                &Caller::admin(),
                "cleanup",
                "cleanup-expired-jobs",
                json!({}),
                JobOptions {
                    delay_ms: Some(8 * 24 * 3600 * 1000),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidDelay(_))));
    }

    #[tokio::test]
    async fn test_submit_duplicate_id_rejected() {
        let (control, _) = control();
        let caller = Caller::admin();
        let id = JobId::new_v4();
        let options = JobOptions {
            id: Some(id),
            ..Default::default()
        };

        control
            .submit(&caller, "cleanup", "cleanup-expired-jobs", json!({}), options.clone())
            .await
            .unwrap();
        let duplicate = control
            .submit(&caller, "cleanup", "cleanup-expired-jobs", json!({}), options)
            .await;
        assert!(matches!(duplicate, Err(Error::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_zero_delay_is_immediately_ready() {
        let (control, broker) = control();
        let id = control
            .schedule_delayed(&Caller::admin(), "cleanup", "cleanup-expired-jobs", json!({}), 0)
            .await
            .unwrap();
        assert_eq!(
            broker.placement("cleanup", id).await.unwrap(),
            Some(Placement::Ready)
        );
    }

    #[tokio::test]
    async fn test_delayed_submission_lands_in_delayed_set() {
        let (control, broker) = control();
        let id = control
            .schedule_delayed(
                &Caller::admin(),
                "cleanup",
                "cleanup-expired-jobs",
                json!({}),
                60_000,
            )
            .await
            .unwrap();
        assert_eq!(
            broker.placement("cleanup", id).await.unwrap(),
            Some(Placement::Delayed)
        );
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let (control, _) = control();
        let id = control
            .submit(
                &Caller::owner("acct-1"),
                "notifications",
                "send-notification",
                json!({}),
                JobOptions::default(),
            )
            .await
            .unwrap();

        // Another owner may not inspect or cancel
        let other = Caller::owner("acct-2");
        assert!(matches!(
            control.inspect(&other, id).await,
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            control.cancel(&other, id).await,
            Err(Error::Forbidden)
        ));

        // Admin may
        assert!(control.inspect(&Caller::admin(), id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_waiting_and_delayed() {
        let (control, broker) = control();
        let caller = Caller::owner("acct-1");

        let delayed = control
            .submit(
                &caller,
                "cleanup",
                "cleanup-expired-jobs",
                json!({}),
                JobOptions {
                    delay_ms: Some(60_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(broker.sizes("cleanup").await.unwrap().delayed, 1);

        control.cancel(&caller, delayed).await.unwrap();
        let view = control.inspect(&caller, delayed).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert_eq!(view.job.error.as_deref(), Some("cancelled"));
        assert_eq!(view.placement, "terminal");
        assert_eq!(broker.sizes("cleanup").await.unwrap().delayed, 0);

        // Cancelling again is an idempotent no-op
        assert!(control.cancel(&caller, delayed).await.is_ok());
        let view = control.inspect(&caller, delayed).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert_eq!(view.job.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_active_refused() {
        let (control, broker) = control();
        let caller = Caller::admin();
        let id = control
            .submit(&caller, "cleanup", "cleanup-expired-jobs", json!({}), JobOptions::default())
            .await
            .unwrap();

        // Simulate a worker reserving and activating the job
        broker
            .reserve("cleanup", Duration::from_secs(60), Utc::now())
            .await
            .unwrap()
            .unwrap();
        control
            .store()
            .update(id, JobPatch::new().status(JobStatus::Active).attempts(1))
            .await
            .unwrap();

        assert!(matches!(
            control.cancel(&caller, id).await,
            Err(Error::RefusedActive)
        ));
    }

    #[tokio::test]
    async fn test_bulk_cancel_outcomes() {
        let (control, broker) = control();
        let caller = Caller::admin();

        let waiting = control
            .submit(&caller, "cleanup", "cleanup-expired-jobs", json!({}), JobOptions::default())
            .await
            .unwrap();

        // Higher priority so the reservation below picks this one up,
        // leaving `waiting` in the ready set
        let active = control
            .submit(
                &caller,
                "cleanup",
                "cleanup-expired-jobs",
                json!({}),
                JobOptions {
                    priority: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let reservation = broker
            .reserve("cleanup", Duration::from_secs(60), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.job_id, active);
        control
            .store()
            .update(active, JobPatch::new().status(JobStatus::Active).attempts(1))
            .await
            .unwrap();

        // A job that already finished is skipped, not re-cancelled
        let terminal = control
            .submit(&caller, "cleanup", "cleanup-expired-jobs", json!({}), JobOptions::default())
            .await
            .unwrap();
        broker.remove("cleanup", terminal).await.unwrap();
        control
            .store()
            .update(
                terminal,
                JobPatch::new()
                    .status(JobStatus::Completed)
                    .completed_at(Utc::now()),
            )
            .await
            .unwrap();

        let missing = JobId::new_v4();
        let outcomes = control
            .bulk_cancel(&caller, &[waiting, active, terminal, missing])
            .await;

        assert_eq!(outcomes[0].1, CancelOutcome::Cancelled);
        assert_eq!(outcomes[1].1, CancelOutcome::RefusedActive);
        assert_eq!(outcomes[2].1, CancelOutcome::Skipped);
        assert_eq!(outcomes[3].1, CancelOutcome::NotFound);

        // The skipped job's record is untouched
        let job = control.store().get(terminal).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn test_retry_links_fresh_record() {
        let (control, broker) = control();
        let caller = Caller::owner("acct-1");
        let id = control
            .submit(
                &caller,
                "video-analysis",
                "analyze-video",
                json!({"video": "v1"}),
                JobOptions::default(),
            )
            .await
            .unwrap();

        // Retry before failure is refused
        assert!(matches!(
            control.retry(&caller, id).await,
            Err(Error::NotRetriable)
        ));

        broker.remove("video-analysis", id).await.unwrap();
        control
            .store()
            .update(
                id,
                JobPatch::new()
                    .status(JobStatus::Failed)
                    .error("boom")
                    .failed_at(Utc::now()),
            )
            .await
            .unwrap();

        let first_retry = control.retry(&caller, id).await.unwrap();
        assert_ne!(first_retry, id);

        let original = control.store().get(id).await.unwrap();
        assert_eq!(original.status, JobStatus::Failed);
        assert_eq!(original.retried_as, Some(first_retry));

        let clone = control.store().get(first_retry).await.unwrap();
        assert_eq!(clone.status, JobStatus::Waiting);
        assert_eq!(clone.payload, json!({"video": "v1"}));

        // Repeating retry yields an independent new id
        let second_retry = control.retry(&caller, id).await.unwrap();
        assert_ne!(second_retry, first_retry);
    }

    #[tokio::test]
    async fn test_pause_resume_requires_admin() {
        let (control, broker) = control();

        assert!(matches!(
            control.pause_queue(&Caller::owner("acct-1"), "cleanup").await,
            Err(Error::AdminRequired)
        ));

        let descriptor = control
            .pause_queue(&Caller::admin(), "cleanup")
            .await
            .unwrap();
        assert!(!descriptor.is_active);
        assert!(broker.is_paused("cleanup").await.unwrap());

        let descriptor = control
            .resume_queue(&Caller::admin(), "cleanup")
            .await
            .unwrap();
        assert!(descriptor.is_active);
        assert!(!broker.is_paused("cleanup").await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_list_counts() {
        let (control, _) = control();
        let caller = Caller::admin();
        for _ in 0..3 {
            control
                .submit(&caller, "notifications", "send-notification", json!({}), JobOptions::default())
                .await
                .unwrap();
        }

        let summaries = control.queue_list(&caller).await.unwrap();
        assert_eq!(summaries.len(), QUEUE_NAMES.len());
        let notifications = summaries
            .iter()
            .find(|s| s.descriptor.name == "notifications")
            .unwrap();
        assert_eq!(notifications.counts.waiting, 3);
    }

    #[tokio::test]
    async fn test_update_queue_config_validates() {
        let (control, _) = control();
        let caller = Caller::admin();

        let bad = QueueConfiguration {
            concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            control.update_queue_config(&caller, "cleanup", bad).await,
            Err(Error::Validation(_))
        ));

        let good = QueueConfiguration {
            concurrency: 16,
            ..Default::default()
        };
        let descriptor = control
            .update_queue_config(&caller, "cleanup", good)
            .await
            .unwrap();
        assert_eq!(descriptor.configuration.concurrency, 16);
        assert_eq!(
            control.queue_configuration("cleanup").await.unwrap().concurrency,
            16
        );
    }

    #[tokio::test]
    async fn test_schedule_repeating_and_trigger() {
        let (control, _) = control();
        let caller = Caller::admin();

        let invalid = control
            .schedule_repeating(&caller, "cleanup", "cleanup-expired-jobs", json!({}), "bogus")
            .await;
        assert!(matches!(invalid, Err(Error::InvalidCron(_))));

        let name = control
            .schedule_repeating(
                &caller,
                "cleanup",
                "cleanup-expired-jobs",
                json!({"older_than_days": 30}),
                "0 2 * * *",
            )
            .await
            .unwrap();

        let entries = control.list_scheduled(&caller).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, name);

        let job_id = control.trigger_scheduled(&caller, &name).await.unwrap();
        let view = control.inspect(&caller, job_id).await.unwrap();
        assert_eq!(view.job.payload, json!({"older_than_days": 30}));

        control.cancel_scheduled(&caller, &name).await.unwrap();
        assert!(matches!(
            control.trigger_scheduled(&caller, &name).await,
            Err(Error::NotTriggerable(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_queue_purges_matching() {
        let (control, broker) = control();
        let caller = Caller::admin();

        let id = control
            .submit(&caller, "cleanup", "cleanup-expired-jobs", json!({}), JobOptions::default())
            .await
            .unwrap();
        // Backdate the record so the cutoff catches it
        let mut job = control.store().get(id).await.unwrap();
        job.created_at = Utc::now() - chrono::Duration::days(2);
        control.store().remove(id).await.unwrap();
        control.store().create(job).await.unwrap();

        let removed = control
            .clean_queue(&caller, "cleanup", Duration::from_secs(24 * 3600), None)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(broker.placement("cleanup", id).await.unwrap(), None);
        assert!(matches!(
            control.store().get(id).await,
            Err(Error::NotFound(_))
        ));
    }
}
