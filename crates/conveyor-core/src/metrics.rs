//! Store-driven metrics aggregation
//!
//! Everything here is computed from job records; nothing is counted
//! inline on the hot path. The Scheduler calls into this module on its
//! refresh tick, and the Control Plane serves ad-hoc reports from it.

use crate::error::Result;
use crate::job::{JobQuery, JobStatus};
use crate::queues::{evaluate_health, HealthStatus, QueueAggregates, QUEUE_NAMES};
use crate::store::JobStore;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

/// One hour of submissions and outcomes
#[derive(Debug, Clone, Serialize)]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_processing_time_ms: Option<f64>,
}

/// Rollup over the whole requested window
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsTotals {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_processing_time_ms: Option<f64>,
}

/// Windowed metrics report
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub queue: Option<String>,
    pub window_hours: u32,
    pub overall: MetricsTotals,
    pub hourly: Vec<HourlyBucket>,
}

/// Health of one queue over the observation window
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub queue: String,
    pub status: HealthStatus,
    pub completed_last_hour: u64,
    pub failed_last_hour: u64,
}

/// Service-wide health rollup
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub overall: HealthStatus,
    pub queues: Vec<QueueHealth>,
}

/// Completion/failure activity for one queue inside a window
#[derive(Debug, Default, Clone)]
pub struct WindowStats {
    pub completed: u64,
    pub failed: u64,
    pub avg_processing_time_ms: Option<f64>,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Measure a queue's terminal activity within `window` of `now`.
///
/// Retention keeps the per-queue terminal sets bounded, so loading them
/// through the store is acceptable here.
pub async fn queue_window_stats(
    store: &dyn JobStore,
    queue: &str,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<WindowStats> {
    let cutoff = now - window;

    let completed_page = store
        .query(&JobQuery::new().with_queue(queue).with_status(JobStatus::Completed))
        .await?;
    let failed_page = store
        .query(&JobQuery::new().with_queue(queue).with_status(JobStatus::Failed))
        .await?;

    let mut stats = WindowStats::default();
    let mut total_ms = 0.0;
    let mut timed = 0u64;

    for job in &completed_page.jobs {
        stats.last_processed_at = stats.last_processed_at.max(job.completed_at);
        if job.completed_at.map(|t| t >= cutoff).unwrap_or(false) {
            stats.completed += 1;
            if let Some(ms) = job.processing_time_ms {
                total_ms += ms as f64;
                timed += 1;
            }
        }
    }
    for job in &failed_page.jobs {
        if job.failed_at.map(|t| t >= cutoff).unwrap_or(false) {
            stats.failed += 1;
        }
    }
    if timed > 0 {
        stats.avg_processing_time_ms = Some(total_ms / timed as f64);
    }
    Ok(stats)
}

/// Recompute the cached descriptor aggregates for one queue
pub async fn refresh_queue_aggregates(
    store: &dyn JobStore,
    queue: &str,
    now: DateTime<Utc>,
) -> Result<QueueAggregates> {
    let stats = queue_window_stats(store, queue, Duration::hours(1), now).await?;
    Ok(QueueAggregates {
        processing_rate_per_min: stats.completed as f64 / 60.0,
        avg_processing_time_ms: stats.avg_processing_time_ms.unwrap_or(0.0),
        last_processed_at: stats.last_processed_at,
        health_status: evaluate_health(stats.completed, stats.failed),
        last_health_check: Some(now),
    })
}

/// Build the hourly report over the last `window_hours`
pub async fn compute_metrics(
    store: &dyn JobStore,
    queue: Option<&str>,
    window_hours: u32,
    now: DateTime<Utc>,
) -> Result<MetricsReport> {
    let window_hours = window_hours.clamp(1, 24 * 7);
    let cutoff = now - Duration::hours(window_hours as i64);

    let mut query = JobQuery::new().created_after(cutoff);
    if let Some(queue) = queue {
        query = query.with_queue(queue);
    }
    let page = store.query(&query).await?;

    let window_start = cutoff
        .duration_trunc(Duration::hours(1))
        .unwrap_or(cutoff);
    let bucket_count = ((now - window_start).num_hours() + 1).max(1) as usize;

    struct Accum {
        submitted: u64,
        completed: u64,
        failed: u64,
        total_ms: f64,
        timed: u64,
    }
    let mut buckets: Vec<Accum> = (0..bucket_count)
        .map(|_| Accum {
            submitted: 0,
            completed: 0,
            failed: 0,
            total_ms: 0.0,
            timed: 0,
        })
        .collect();
    let mut overall = MetricsTotals::default();
    let mut overall_ms = 0.0;
    let mut overall_timed = 0u64;

    for job in &page.jobs {
        let index = (job.created_at - window_start).num_hours();
        if index < 0 || index as usize >= bucket_count {
            continue;
        }
        let bucket = &mut buckets[index as usize];
        bucket.submitted += 1;
        overall.submitted += 1;
        match job.status {
            JobStatus::Completed => {
                bucket.completed += 1;
                overall.completed += 1;
                if let Some(ms) = job.processing_time_ms {
                    bucket.total_ms += ms as f64;
                    bucket.timed += 1;
                    overall_ms += ms as f64;
                    overall_timed += 1;
                }
            }
            JobStatus::Failed => {
                bucket.failed += 1;
                overall.failed += 1;
            }
            _ => {}
        }
    }
    if overall_timed > 0 {
        overall.avg_processing_time_ms = Some(overall_ms / overall_timed as f64);
    }

    let hourly = buckets
        .into_iter()
        .enumerate()
        .map(|(i, b)| HourlyBucket {
            hour_start: window_start + Duration::hours(i as i64),
            submitted: b.submitted,
            completed: b.completed,
            failed: b.failed,
            avg_processing_time_ms: (b.timed > 0).then(|| b.total_ms / b.timed as f64),
        })
        .collect();

    Ok(MetricsReport {
        queue: queue.map(str::to_string),
        window_hours,
        overall,
        hourly,
    })
}

/// Evaluate every queue over the last hour and roll up the worst status
pub async fn health_summary(store: &dyn JobStore, now: DateTime<Utc>) -> Result<HealthSummary> {
    let mut queues = Vec::with_capacity(QUEUE_NAMES.len());
    let mut overall = HealthStatus::Healthy;

    for queue in QUEUE_NAMES {
        let stats = queue_window_stats(store, queue, Duration::hours(1), now).await?;
        let status = evaluate_health(stats.completed, stats.failed);
        if status.rank() > overall.rank() {
            overall = status;
        }
        queues.push(QueueHealth {
            queue: queue.to_string(),
            status,
            completed_last_hour: stats.completed,
            failed_last_hour: stats.failed,
        });
    }

    Ok(HealthSummary { overall, queues })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::store::{JobStore, MemoryJobStore};
    use serde_json::json;

    async fn seed(store: &MemoryJobStore, queue: &str, completed: usize, failed: usize, now: DateTime<Utc>) {
        for i in 0..completed {
            let mut job = Job::new(queue, "t", json!({}));
            job.status = JobStatus::Completed;
            job.created_at = now - Duration::minutes(30);
            job.completed_at = Some(now - Duration::minutes(10));
            job.processing_time_ms = Some(100 + i as u64 * 100);
            store.create(job).await.unwrap();
        }
        for _ in 0..failed {
            let mut job = Job::new(queue, "t", json!({}));
            job.status = JobStatus::Failed;
            job.created_at = now - Duration::minutes(30);
            job.failed_at = Some(now - Duration::minutes(5));
            store.create(job).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_queue_window_stats() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        seed(&store, "cleanup", 3, 1, now).await;

        // Stale completion outside the window
        let mut old = Job::new("cleanup", "t", json!({}));
        old.status = JobStatus::Completed;
        old.completed_at = Some(now - Duration::hours(3));
        store.create(old).await.unwrap();

        let stats = queue_window_stats(&store, "cleanup", Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.avg_processing_time_ms, Some(200.0));
        assert_eq!(stats.last_processed_at, Some(now - Duration::minutes(10)));
    }

    #[tokio::test]
    async fn test_refresh_queue_aggregates() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        seed(&store, "notifications", 60, 0, now).await;

        let aggregates = refresh_queue_aggregates(&store, "notifications", now)
            .await
            .unwrap();
        assert_eq!(aggregates.processing_rate_per_min, 1.0);
        assert_eq!(aggregates.health_status, HealthStatus::Healthy);
        assert_eq!(aggregates.last_health_check, Some(now));
    }

    #[tokio::test]
    async fn test_health_summary_worst_of() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        seed(&store, "cleanup", 2, 5, now).await; // failed > completed
        seed(&store, "notifications", 10, 0, now).await;

        let summary = health_summary(&store, now).await.unwrap();
        assert_eq!(summary.overall, HealthStatus::Error);

        let cleanup = summary.queues.iter().find(|q| q.queue == "cleanup").unwrap();
        assert_eq!(cleanup.status, HealthStatus::Error);
        let notifications = summary
            .queues
            .iter()
            .find(|q| q.queue == "notifications")
            .unwrap();
        assert_eq!(notifications.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_compute_metrics_buckets() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        seed(&store, "cleanup", 2, 1, now).await;

        let report = compute_metrics(&store, Some("cleanup"), 2, now).await.unwrap();
        assert_eq!(report.overall.submitted, 3);
        assert_eq!(report.overall.completed, 2);
        assert_eq!(report.overall.failed, 1);
        assert!(!report.hourly.is_empty());

        let bucket_totals: u64 = report.hourly.iter().map(|b| b.submitted).sum();
        assert_eq!(bucket_totals, 3);
    }

    #[tokio::test]
    async fn test_compute_metrics_scopes_by_queue() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        seed(&store, "cleanup", 2, 0, now).await;
        seed(&store, "notifications", 4, 0, now).await;

        let cleanup = compute_metrics(&store, Some("cleanup"), 1, now).await.unwrap();
        assert_eq!(cleanup.overall.submitted, 2);

        let all = compute_metrics(&store, None, 1, now).await.unwrap();
        assert_eq!(all.overall.submitted, 6);
    }
}
