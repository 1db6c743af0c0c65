//! Job Store: authoritative persistent record of all jobs
//!
//! The store is the source of truth for status, attempts, timing, and
//! result/error. Reads-after-writes are linearizable per id; queries may
//! trail in-flight worker updates.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

use crate::error::Result;
use crate::job::{Job, JobId, JobPage, JobPatch, JobQuery, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Group-by dimension for [`JobStore::aggregate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateDimension {
    Status,
    Queue,
    JobType,
}

/// One aggregate group
#[derive(Debug, Clone, Serialize)]
pub struct AggregateRow {
    pub status: Option<JobStatus>,
    pub queue: Option<String>,
    pub job_type: Option<String>,
    pub count: u64,
    /// Mean over records that carry a processing time
    pub avg_processing_time_ms: Option<f64>,
}

/// Authoritative persistence for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record; fails with `Duplicate` if the id exists
    async fn create(&self, job: Job) -> Result<()>;

    /// Load a record by id
    async fn get(&self, id: JobId) -> Result<Job>;

    /// Apply a patch atomically and return the updated record
    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Job>;

    /// Hard-delete one record; returns whether it existed
    async fn remove(&self, id: JobId) -> Result<bool>;

    /// Filtered, paginated listing sorted by `created_at` descending
    async fn query(&self, query: &JobQuery) -> Result<JobPage>;

    /// Group-by over status/queue/type with counts and mean processing time
    async fn aggregate(
        &self,
        filter: &JobQuery,
        dimensions: &[AggregateDimension],
    ) -> Result<Vec<AggregateRow>>;

    /// Keep the N most recent completed and M most recent failed records
    /// for a queue; returns the number deleted
    async fn trim_retention(
        &self,
        queue: &str,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<usize>;

    /// Hard-delete terminal records created before the cutoff
    async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Sort newest-first and slice out the requested page
pub(crate) fn paginate(mut jobs: Vec<Job>, query: &JobQuery) -> JobPage {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let total = jobs.len();
    let offset = query.offset.unwrap_or(0);
    let jobs = jobs
        .into_iter()
        .skip(offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();
    JobPage { jobs, total }
}

/// Group matched records along the requested dimensions
pub(crate) fn group_rows(jobs: &[Job], dimensions: &[AggregateDimension]) -> Vec<AggregateRow> {
    let mut groups: HashMap<(Option<JobStatus>, Option<String>, Option<String>), (u64, u64, f64)> =
        HashMap::new();

    for job in jobs {
        let key = (
            dimensions
                .contains(&AggregateDimension::Status)
                .then_some(job.status),
            dimensions
                .contains(&AggregateDimension::Queue)
                .then(|| job.queue.clone()),
            dimensions
                .contains(&AggregateDimension::JobType)
                .then(|| job.job_type.clone()),
        );
        let entry = groups.entry(key).or_insert((0, 0, 0.0));
        entry.0 += 1;
        if let Some(ms) = job.processing_time_ms {
            entry.1 += 1;
            entry.2 += ms as f64;
        }
    }

    let mut rows: Vec<AggregateRow> = groups
        .into_iter()
        .map(|((status, queue, job_type), (count, timed, total_ms))| AggregateRow {
            status,
            queue,
            job_type,
            count,
            avg_processing_time_ms: (timed > 0).then(|| total_ms / timed as f64),
        })
        .collect();

    // Stable output order for callers and tests
    rows.sort_by(|a, b| {
        (&a.queue, &a.job_type, a.status.map(|s| s.as_str()))
            .cmp(&(&b.queue, &b.job_type, b.status.map(|s| s.as_str())))
    });
    rows
}

/// Select the ids retention should delete: terminal records for a queue
/// beyond the keep windows, newest kept first
pub(crate) fn retention_victims(
    jobs: &[Job],
    queue: &str,
    keep_completed: usize,
    keep_failed: usize,
) -> Vec<JobId> {
    let mut completed: Vec<&Job> = jobs
        .iter()
        .filter(|j| j.queue == queue && j.status == JobStatus::Completed)
        .collect();
    completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

    let mut failed: Vec<&Job> = jobs
        .iter()
        .filter(|j| j.queue == queue && j.status == JobStatus::Failed)
        .collect();
    failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

    completed
        .into_iter()
        .skip(keep_completed)
        .chain(failed.into_iter().skip(keep_failed))
        .map(|j| j.id)
        .collect()
}
