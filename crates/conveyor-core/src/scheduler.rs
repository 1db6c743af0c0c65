//! Scheduler: the only component that acts on wall-clock time
//!
//! Four periodic tasks (delay promotion, stall sweep, metrics refresh,
//! retention trim) plus named cron entries that submit fresh jobs on
//! each fire. Every task body is also exposed as a `*_once` method
//! taking `now` explicitly so tests can drive the clock.

use crate::control::{Caller, ControlPlane};
use crate::error::{Error, Result};
use crate::job::{JobOptions, JobPatch, JobStatus};
use crate::queues::QUEUE_NAMES;
use crate::worker::BackoffPolicy;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One registered recurring submission template
#[derive(Debug, Clone)]
struct CronEntry {
    queue: String,
    job_type: String,
    payload: serde_json::Value,
    expression: String,
    schedule: Schedule,
    next_fire: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// External view of a cron entry
#[derive(Debug, Clone, Serialize)]
pub struct CronEntryInfo {
    pub name: String,
    pub queue: String,
    pub job_type: String,
    pub expression: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Submission template ready to fire
#[derive(Debug, Clone)]
pub struct CronTemplate {
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
}

/// Accept 5-field expressions by prepending a seconds field; the cron
/// crate itself wants 6 or 7 fields.
fn normalize_cron(expression: &str) -> Result<String> {
    match expression.split_whitespace().count() {
        5 => Ok(format!("0 {}", expression.trim())),
        6 | 7 => Ok(expression.trim().to_string()),
        n => Err(Error::InvalidCron(format!(
            "expected 5 or 6 fields, got {}",
            n
        ))),
    }
}

fn next_fire(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// Registry of named cron entries.
///
/// Registering the same expression twice creates two independent
/// entries; cancellation is by name and only stops future fires.
#[derive(Debug)]
pub struct CronTable {
    tz: Tz,
    entries: RwLock<HashMap<String, CronEntry>>,
}

impl CronTable {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Validate the expression and register an entry; returns its name
    pub fn register(
        &self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let queue = queue.into();
        let job_type = job_type.into();
        let normalized = normalize_cron(expression)?;
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron(e.to_string()))?;

        let name = format!(
            "{}:{}:{}",
            queue,
            job_type,
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let entry = CronEntry {
            queue,
            job_type,
            payload,
            expression: expression.to_string(),
            next_fire: next_fire(&schedule, self.tz, now),
            schedule,
            created_at: now,
        };
        self.entries
            .write()
            .expect("cron table lock poisoned")
            .insert(name.clone(), entry);

        info!(name = %name, expression, "registered cron entry");
        Ok(name)
    }

    /// Stop future fires; already-submitted jobs are unaffected
    pub fn cancel(&self, name: &str) -> bool {
        let removed = self
            .entries
            .write()
            .expect("cron table lock poisoned")
            .remove(name)
            .is_some();
        if removed {
            info!(name, "cancelled cron entry");
        }
        removed
    }

    /// Template for a manual fire
    pub fn template(&self, name: &str) -> Option<CronTemplate> {
        self.entries
            .read()
            .expect("cron table lock poisoned")
            .get(name)
            .map(|entry| CronTemplate {
                queue: entry.queue.clone(),
                job_type: entry.job_type.clone(),
                payload: entry.payload.clone(),
            })
    }

    pub fn list(&self) -> Vec<CronEntryInfo> {
        let entries = self.entries.read().expect("cron table lock poisoned");
        let mut infos: Vec<CronEntryInfo> = entries
            .iter()
            .map(|(name, entry)| CronEntryInfo {
                name: name.clone(),
                queue: entry.queue.clone(),
                job_type: entry.job_type.clone(),
                expression: entry.expression.clone(),
                next_fire: entry.next_fire,
                created_at: entry.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Collect entries due at `now`, advancing each to its next fire.
    /// An entry fires at most once per call even if several periods
    /// were missed.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<(String, CronTemplate)> {
        let mut entries = self.entries.write().expect("cron table lock poisoned");
        let mut due = Vec::new();
        for (name, entry) in entries.iter_mut() {
            if entry.next_fire.map(|t| t <= now).unwrap_or(false) {
                due.push((
                    name.clone(),
                    CronTemplate {
                        queue: entry.queue.clone(),
                        job_type: entry.job_type.clone(),
                        payload: entry.payload.clone(),
                    },
                ));
                entry.next_fire = next_fire(&entry.schedule, self.tz, now);
            }
        }
        due
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskKind {
    Promotion,
    StallSweep,
    MetricsRefresh,
    Retention,
    Cron,
}

impl TaskKind {
    fn name(&self) -> &'static str {
        match self {
            TaskKind::Promotion => "promotion",
            TaskKind::StallSweep => "stall-sweep",
            TaskKind::MetricsRefresh => "metrics-refresh",
            TaskKind::Retention => "retention",
            TaskKind::Cron => "cron",
        }
    }
}

/// Wall-clock driver for the periodic tasks and cron entries
pub struct Scheduler {
    control: Arc<ControlPlane>,
    settings: crate::config::SchedulerSettings,
    cron: Arc<CronTable>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        control: Arc<ControlPlane>,
        cron: Arc<CronTable>,
        settings: crate::config::SchedulerSettings,
    ) -> Self {
        Self {
            control,
            settings,
            cron,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the periodic tasks on independent timers. Each task runs
    /// its body inline in its own loop, so a slow tick delays the next
    /// one instead of stacking.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(
            timezone = %self.settings.timezone,
            "starting scheduler"
        );

        vec![
            self.spawn_task(TaskKind::Promotion, self.settings.promotion_interval()),
            self.spawn_task(TaskKind::StallSweep, self.settings.stall_sweep_interval()),
            self.spawn_task(TaskKind::MetricsRefresh, self.settings.metrics_refresh_interval()),
            self.spawn_task(TaskKind::Retention, self.settings.retention_interval()),
            self.spawn_task(TaskKind::Cron, Duration::from_secs(1)),
        ]
    }

    pub fn stop(&self) {
        info!("stopping scheduler");
        self.shutdown.cancel();
    }

    fn spawn_task(self: &Arc<Self>, kind: TaskKind, period: Duration) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Utc::now();
                        let result = match kind {
                            TaskKind::Promotion => scheduler.promote_once(now).await.map(|_| ()),
                            TaskKind::StallSweep => scheduler.sweep_stalled_once(now).await.map(|_| ()),
                            TaskKind::MetricsRefresh => scheduler.refresh_metrics_once(now).await,
                            TaskKind::Retention => scheduler.run_retention_once(now).await.map(|_| ()),
                            TaskKind::Cron => scheduler.fire_due_cron_once(now).await.map(|_| ()),
                        };
                        if let Err(e) = result {
                            // Task failures are logged and retried on the
                            // next tick; they never terminate the service
                            error!(task = kind.name(), error = %e, "scheduler task failed");
                        }
                    }
                    _ = scheduler.shutdown.cancelled() => {
                        debug!(task = kind.name(), "scheduler task stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Promote due delayed jobs on every queue
    pub async fn promote_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let broker = self.control.broker();
        let mut promoted = 0;
        for queue in QUEUE_NAMES {
            match broker.promote_due(queue, now).await {
                Ok(count) => promoted += count,
                Err(e) => warn!(queue, error = %e, "delay promotion failed"),
            }
        }
        if promoted > 0 {
            debug!(promoted, "promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Reap expired leases and retry or fail the stalled jobs
    pub async fn sweep_stalled_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let broker = self.control.broker();
        let store = self.control.store();
        let mut swept = 0;

        for queue in QUEUE_NAMES {
            let expired = match broker.reap_expired(queue, now).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(queue, error = %e, "lease reap failed");
                    continue;
                }
            };
            if expired.is_empty() {
                continue;
            }

            let configuration = self.control.queue_configuration(queue).await?;
            let backoff = BackoffPolicy::new(
                Duration::from_millis(configuration.retry_delay_ms),
                self.settings.backoff_ceiling(),
            );

            for job_id in expired {
                let job = match store.get(job_id).await {
                    Ok(job) => job,
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => {
                        warn!(queue, job_id = %job_id, error = %e, "store read failed during sweep");
                        continue;
                    }
                };

                if job.attempts < job.max_attempts {
                    let delay = backoff.delay_for(job.attempts.max(1));
                    let due = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    let patch = JobPatch::new()
                        .status(JobStatus::Waiting)
                        .stalled_at(now)
                        .error("stalled: lease expired")
                        .delay_until(Some(due));
                    if let Err(e) = store.update(job_id, patch).await {
                        warn!(queue, job_id = %job_id, error = %e, "failed recording stall");
                        continue;
                    }
                    if let Err(e) = broker
                        .enqueue(queue, job_id, job.priority, Some(due), now)
                        .await
                    {
                        warn!(queue, job_id = %job_id, error = %e, "failed requeueing stalled job");
                        continue;
                    }
                    info!(queue, job_id = %job_id, attempts = job.attempts, "stalled job requeued");
                } else {
                    let patch = JobPatch::new()
                        .status(JobStatus::Failed)
                        .stalled_at(now)
                        .failed_at(now)
                        .error(format!(
                            "stalled: lease expired after {} attempts",
                            job.attempts
                        ));
                    if let Err(e) = store.update(job_id, patch).await {
                        warn!(queue, job_id = %job_id, error = %e, "failed recording stall failure");
                        continue;
                    }
                    warn!(queue, job_id = %job_id, attempts = job.attempts, "stalled job failed permanently");
                }
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Recompute the cached descriptor aggregates
    pub async fn refresh_metrics_once(&self, now: DateTime<Utc>) -> Result<()> {
        self.control.refresh_aggregates(now).await
    }

    /// Enforce retention caps and the hard expiry cutoff
    pub async fn run_retention_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let store = self.control.store();
        let mut removed = 0;

        for queue in QUEUE_NAMES {
            let configuration = self.control.queue_configuration(queue).await?;
            match store
                .trim_retention(
                    queue,
                    configuration.retain_completed,
                    configuration.retain_failed,
                )
                .await
            {
                Ok(count) => removed += count,
                Err(e) => warn!(queue, error = %e, "retention trim failed"),
            }
        }

        let cutoff = now - chrono::Duration::days(self.settings.retention_cutoff_days as i64);
        match store.expire_older_than(cutoff).await {
            Ok(count) => removed += count,
            Err(e) => warn!(error = %e, "hard expiry failed"),
        }

        if removed > 0 {
            info!(removed, "retention removed terminal jobs");
        }
        Ok(removed)
    }

    /// Submit a fresh job for every due cron entry
    pub async fn fire_due_cron_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.cron.take_due(now);
        let mut fired = 0;
        for (name, template) in due {
            match self
                .control
                .submit(
                    &Caller::scheduler(),
                    &template.queue,
                    &template.job_type,
                    template.payload,
                    JobOptions::default(),
                )
                .await
            {
                Ok(job_id) => {
                    info!(name = %name, job_id = %job_id, "cron entry fired");
                    fired += 1;
                }
                Err(e) => {
                    error!(name = %name, error = %e, "cron fire failed");
                }
            }
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 2 * * *").unwrap(), "0 0 2 * * *");
        assert_eq!(normalize_cron("*/5 0 2 * * *").unwrap(), "*/5 0 2 * * *");
        assert!(matches!(
            normalize_cron("* *"),
            Err(Error::InvalidCron(_))
        ));
    }

    #[test]
    fn test_register_rejects_invalid_expression() {
        let table = CronTable::new(chrono_tz::UTC);
        let result = table.register("cleanup", "cleanup-expired-jobs", json!({}), "not a cron", Utc::now());
        assert!(matches!(result, Err(Error::InvalidCron(_))));

        let result = table.register("cleanup", "cleanup-expired-jobs", json!({}), "99 99 * * *", Utc::now());
        assert!(matches!(result, Err(Error::InvalidCron(_))));
    }

    #[test]
    fn test_take_due_fires_once_and_advances() {
        let table = CronTable::new(chrono_tz::UTC);
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 1, 59, 0).unwrap();

        let name = table
            .register(
                "cleanup",
                "cleanup-expired-jobs",
                json!({"older_than_days": 30}),
                "0 2 * * *",
                t0,
            )
            .unwrap();

        // Not yet due
        assert!(table.take_due(t0).is_empty());

        let at_two = Utc.with_ymd_and_hms(2026, 8, 1, 2, 0, 0).unwrap();
        let due = table.take_due(at_two);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, name);
        assert_eq!(due[0].1.queue, "cleanup");

        // Same instant again: entry has advanced to tomorrow
        assert!(table.take_due(at_two).is_empty());

        let next = table.list()[0].next_fire.unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_duplicate_registration_is_independent() {
        let table = CronTable::new(chrono_tz::UTC);
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 1, 0, 0).unwrap();

        let first = table
            .register("cleanup", "cleanup-expired-jobs", json!({}), "0 2 * * *", t0)
            .unwrap();
        let second = table
            .register("cleanup", "cleanup-expired-jobs", json!({}), "0 2 * * *", t0)
            .unwrap();
        assert_ne!(first, second);

        let at_two = Utc.with_ymd_and_hms(2026, 8, 1, 2, 0, 0).unwrap();
        assert_eq!(table.take_due(at_two).len(), 2);

        // Cancelling one leaves the other firing
        assert!(table.cancel(&first));
        let tomorrow = Utc.with_ymd_and_hms(2026, 8, 2, 2, 0, 0).unwrap();
        assert_eq!(table.take_due(tomorrow).len(), 1);
    }

    #[test]
    fn test_timezone_evaluation() {
        // 02:00 in New York is 06:00 UTC during DST
        let table = CronTable::new(chrono_tz::America::New_York);
        let t0 = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        table
            .register("cleanup", "cleanup-expired-jobs", json!({}), "0 2 * * *", t0)
            .unwrap();

        let next = table.list()[0].next_fire.unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 8, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_cancel_unknown_entry() {
        let table = CronTable::new(chrono_tz::UTC);
        assert!(!table.cancel("cleanup:missing:00000000"));
    }
}
