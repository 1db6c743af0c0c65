//! Job records and queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique job identifier
pub type JobId = Uuid;

/// Version written into every persisted job record
pub const RECORD_VERSION: u16 = 1;

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, not yet reserved (includes delayed jobs)
    Waiting,

    /// Reserved by a worker and running
    Active,

    /// Handler succeeded
    Completed,

    /// Exhausted attempts, fatal handler error, or cancelled
    Failed,

    /// Lease expired without ack or nack; pending sweep decision
    Stalled,
}

impl JobStatus {
    /// Check if status is terminal (won't change)
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Stable string form used in persisted records and wire responses
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stalled => "stalled",
        }
    }

    /// Parse from the stable string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobStatus::Waiting),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "stalled" => Some(JobStatus::Stalled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted record per submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, stable forever
    pub id: JobId,

    /// Queue name from the fixed registry
    pub queue: String,

    /// Handler selector within the queue
    pub job_type: String,

    /// Opaque structured payload, stored unchanged
    pub payload: serde_json::Value,

    /// Producer identity, when known
    pub owner: Option<String>,

    /// Lifecycle status
    pub status: JobStatus,

    /// Larger = earlier dispatch within the queue
    pub priority: i32,

    /// Dispatch attempts so far
    pub attempts: u32,

    /// Attempt cap; exhaustion after failure is terminal
    pub max_attempts: u32,

    /// Ineligible for reservation before this instant
    pub delay_until: Option<DateTime<Utc>>,

    /// Success payload, present iff completed
    pub result: Option<serde_json::Value>,

    /// Failure reason for failed/stalled or the last failed attempt
    pub error: Option<String>,

    /// Duration of the most recent successful run
    pub processing_time_ms: Option<u64>,

    /// Id of the admin-retry clone, if one was created
    pub retried_as: Option<JobId>,

    /// Persisted-record schema version
    pub record_version: u16,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub stalled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new waiting job
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: JobId::new_v4(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            owner: None,
            status: JobStatus::Waiting,
            priority: 0,
            attempts: 0,
            max_attempts: 3,
            delay_until: None,
            result: None,
            error: None,
            processing_time_ms: None,
            retried_as: None,
            record_version: RECORD_VERSION,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            stalled_at: None,
        }
    }

    /// Use a caller-provided id
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    /// Attach the producer identity
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set dispatch priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt cap
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Hold the job until the given instant
    pub fn with_delay_until(mut self, until: DateTime<Utc>) -> Self {
        self.delay_until = Some(until);
        self
    }

    /// Check if the job is currently held by a delay
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.delay_until.map(|t| t > now).unwrap_or(false)
    }

    /// Clone the submission fields into a fresh record for an admin retry.
    /// The clone gets a new id; linkage is recorded on the original.
    pub fn clone_for_retry(&self) -> Job {
        Job::new(self.queue.clone(), self.job_type.clone(), self.payload.clone())
            .with_priority(self.priority)
            .with_max_attempts(self.max_attempts)
            .owner_opt(self.owner.clone())
    }

    fn owner_opt(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }
}

/// Restricted mutation set applied atomically by the store.
///
/// Only the fields the Worker Pool and Scheduler are allowed to touch
/// appear here; submission fields are immutable after create.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    /// `Some(None)` clears the delay
    pub delay_until: Option<Option<DateTime<Utc>>>,
    pub result: Option<serde_json::Value>,
    /// `Some(None)` clears the error
    pub error: Option<Option<String>>,
    pub processing_time_ms: Option<u64>,
    pub retried_as: Option<JobId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub stalled_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn delay_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.delay_until = Some(until);
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn processing_time_ms(mut self, ms: u64) -> Self {
        self.processing_time_ms = Some(ms);
        self
    }

    pub fn retried_as(mut self, id: JobId) -> Self {
        self.retried_as = Some(id);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    pub fn stalled_at(mut self, at: DateTime<Utc>) -> Self {
        self.stalled_at = Some(at);
        self
    }

    /// Apply the patch to a record in place
    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(delay_until) = self.delay_until {
            job.delay_until = delay_until;
        }
        if let Some(ref result) = self.result {
            job.result = Some(result.clone());
        }
        if let Some(ref error) = self.error {
            job.error = error.clone();
        }
        if let Some(ms) = self.processing_time_ms {
            job.processing_time_ms = Some(ms);
        }
        if let Some(id) = self.retried_as {
            job.retried_as = Some(id);
        }
        if let Some(at) = self.started_at {
            job.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if let Some(at) = self.failed_at {
            job.failed_at = Some(at);
        }
        if let Some(at) = self.stalled_at {
            job.stalled_at = Some(at);
        }
    }
}

/// Submission options accepted by the Control Plane
#[derive(Debug, Default, Clone, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub priority: i32,

    pub max_attempts: Option<u32>,

    /// Delay before the job becomes reservable, in milliseconds
    pub delay_ms: Option<u64>,

    /// Caller-supplied id; collisions are rejected
    pub id: Option<JobId>,
}

/// Job query for filtering and searching
#[derive(Debug, Default, Clone)]
pub struct JobQuery {
    pub owner: Option<String>,
    pub queue: Option<String>,
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Check a record against every set filter
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ref owner) = self.owner {
            if job.owner.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        if let Some(ref queue) = self.queue {
            if job.queue != *queue {
                return false;
            }
        }
        if let Some(ref job_type) = self.job_type {
            if job.job_type != *job_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if job.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if job.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// One page of query results
#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Total matches before pagination
    pub total: usize,
}
