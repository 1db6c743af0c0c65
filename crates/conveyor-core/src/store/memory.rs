//! In-memory job store
//!
//! Reference implementation of the store semantics; also the unit-test
//! backend and the default when Redis is disabled.

use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobPage, JobPatch, JobQuery};
use crate::store::{
    group_rows, paginate, retention_victims, AggregateDimension, AggregateRow, JobStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Job store holding every record in process memory
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&job.id) {
            return Err(Error::Duplicate(job.id));
        }
        records.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("job {}", id)))
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Job> {
        let mut records = self.records.write().await;
        let job = records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("job {}", id)))?;
        patch.apply(job);
        Ok(job.clone())
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn query(&self, query: &JobQuery) -> Result<JobPage> {
        let records = self.records.read().await;
        let matched: Vec<Job> = records
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        Ok(paginate(matched, query))
    }

    async fn aggregate(
        &self,
        filter: &JobQuery,
        dimensions: &[AggregateDimension],
    ) -> Result<Vec<AggregateRow>> {
        let records = self.records.read().await;
        let matched: Vec<Job> = records
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        Ok(group_rows(&matched, dimensions))
    }

    async fn trim_retention(
        &self,
        queue: &str,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<usize> {
        let mut records = self.records.write().await;
        let jobs: Vec<Job> = records.values().cloned().collect();
        let victims = retention_victims(&jobs, queue, keep_completed, keep_failed);
        for id in &victims {
            records.remove(id);
        }
        Ok(victims.len())
    }

    async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.write().await;
        let victims: Vec<JobId> = records
            .values()
            .filter(|job| job.status.is_terminal() && job.created_at < cutoff)
            .map(|job| job.id)
            .collect();
        for id in &victims {
            records.remove(id);
        }
        Ok(victims.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_get_duplicate() {
        let store = MemoryJobStore::new();
        let job = Job::new("cleanup", "cleanup-expired-jobs", json!({}));
        let id = job.id;

        store.create(job.clone()).await.unwrap();
        let loaded = store.get(id).await.unwrap();
        assert_eq!(loaded.queue, "cleanup");

        let dup = store.create(job).await;
        assert!(matches!(dup, Err(Error::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryJobStore::new();
        let result = store.get(JobId::new_v4()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_patch() {
        let store = MemoryJobStore::new();
        let job = Job::new("cleanup", "cleanup-expired-jobs", json!({}));
        let id = job.id;
        store.create(job).await.unwrap();

        let now = Utc::now();
        let updated = store
            .update(
                id,
                JobPatch::new()
                    .status(JobStatus::Active)
                    .attempts(1)
                    .started_at(now),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Active);
        assert_eq!(updated.attempts, 1);

        // Read-your-writes
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Active);
    }

    #[tokio::test]
    async fn test_query_filter_and_pagination() {
        let store = MemoryJobStore::new();
        for i in 0..5 {
            let job = Job::new("notifications", "send-notification", json!({"i": i}))
                .with_owner(if i % 2 == 0 { "a" } else { "b" });
            store.create(job).await.unwrap();
        }

        let all = store
            .query(&JobQuery::new().with_queue("notifications"))
            .await
            .unwrap();
        assert_eq!(all.total, 5);

        let owned = store
            .query(&JobQuery::new().with_owner("a"))
            .await
            .unwrap();
        assert_eq!(owned.total, 3);

        let page = store
            .query(&JobQuery::new().with_queue("notifications").with_limit(2).with_offset(4))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_query_sorted_newest_first() {
        let store = MemoryJobStore::new();
        let mut old = Job::new("cleanup", "cleanup-expired-jobs", json!({}));
        old.created_at = Utc::now() - chrono::Duration::hours(1);
        let old_id = old.id;
        store.create(old).await.unwrap();
        let new = Job::new("cleanup", "cleanup-expired-jobs", json!({}));
        let new_id = new.id;
        store.create(new).await.unwrap();

        let page = store.query(&JobQuery::new()).await.unwrap();
        assert_eq!(page.jobs[0].id, new_id);
        assert_eq!(page.jobs[1].id, old_id);
    }

    #[tokio::test]
    async fn test_trim_retention() {
        let store = MemoryJobStore::new();
        for i in 0..6u32 {
            let mut job = Job::new("cleanup", "cleanup-expired-jobs", json!({}));
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now() + chrono::Duration::seconds(i as i64));
            store.create(job).await.unwrap();
        }

        let removed = store.trim_retention("cleanup", 2, 10).await.unwrap();
        assert_eq!(removed, 4);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_expire_older_than_spares_non_terminal() {
        let store = MemoryJobStore::new();
        let cutoff = Utc::now();

        let mut done = Job::new("cleanup", "cleanup-expired-jobs", json!({}));
        done.status = JobStatus::Completed;
        done.created_at = cutoff - chrono::Duration::days(40);
        store.create(done).await.unwrap();

        let mut waiting = Job::new("cleanup", "cleanup-expired-jobs", json!({}));
        waiting.created_at = cutoff - chrono::Duration::days(40);
        let waiting_id = waiting.id;
        store.create(waiting).await.unwrap();

        let removed = store
            .expire_older_than(cutoff - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(waiting_id).await.is_ok());
    }
}
