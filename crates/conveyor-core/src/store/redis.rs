//! Redis-backed job store
//!
//! Records are stored as JSON strings keyed by id, with a per-queue
//! ZSET index scored by creation time. Queries load candidates through
//! the index (bounded) and filter in process.

use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobPage, JobPatch, JobQuery};
use crate::queues::QUEUE_NAMES;
use crate::redis::{KeyPrefix, RedisPool};
use crate::store::{
    group_rows, paginate, retention_victims, AggregateDimension, AggregateRow, JobStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Upper bound on ids pulled from one queue index per query
const SCAN_LIMIT: isize = 10_000;

/// Job store backed by Redis
#[derive(Debug, Clone)]
pub struct RedisJobStore {
    pool: RedisPool,
    prefix: KeyPrefix,
}

impl RedisJobStore {
    pub fn new(pool: RedisPool, prefix: KeyPrefix) -> Self {
        Self { pool, prefix }
    }

    fn record_key(&self, id: JobId) -> String {
        self.prefix.key(format!("record:{}", id))
    }

    fn index_key(&self, queue: &str) -> String {
        self.prefix.queue_key(queue, "created")
    }

    fn unavailable(err: crate::redis::RedisError) -> Error {
        Error::StoreUnavailable(err.to_string())
    }

    async fn load_record(&self, id: JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.manager();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.record_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::unavailable(e.into()))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_record(&self, job: &Job) -> Result<()> {
        let mut conn = self.pool.manager();
        let raw = serde_json::to_string(job)?;
        let _: () = redis::cmd("SET")
            .arg(self.record_key(job.id))
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::unavailable(e.into()))?;
        Ok(())
    }

    /// Load candidate records for the queues a query touches
    async fn load_candidates(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        let queues: Vec<&str> = match queue {
            Some(queue) => vec![queue],
            None => QUEUE_NAMES.to_vec(),
        };

        let mut conn = self.pool.manager();
        let mut jobs = Vec::new();
        for queue in queues {
            let ids: Vec<String> = redis::cmd("ZREVRANGE")
                .arg(self.index_key(queue))
                .arg(0)
                .arg(SCAN_LIMIT - 1)
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::unavailable(e.into()))?;
            if ids.is_empty() {
                continue;
            }

            let keys: Vec<String> = ids
                .iter()
                .filter_map(|id| id.parse::<JobId>().ok())
                .map(|id| self.record_key(id))
                .collect();
            let raws: Vec<Option<String>> = redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(|e| Self::unavailable(e.into()))?;
            for raw in raws.into_iter().flatten() {
                match serde_json::from_str::<Job>(&raw) {
                    Ok(job) => jobs.push(job),
                    Err(e) => debug!(error = %e, "skipping unparseable job record"),
                }
            }
        }
        Ok(jobs)
    }

    async fn delete_records(&self, queue: &str, ids: &[JobId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.manager();
        let mut pipe = ::redis::pipe();
        for id in ids {
            pipe.cmd("DEL").arg(self.record_key(*id)).ignore();
            pipe.cmd("ZREM")
                .arg(self.index_key(queue))
                .arg(id.to_string())
                .ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::unavailable(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: Job) -> Result<()> {
        let mut conn = self.pool.manager();
        let raw = serde_json::to_string(&job)?;

        // SET NX is the duplicate check and the insert in one step
        let created: Option<String> = redis::cmd("SET")
            .arg(self.record_key(job.id))
            .arg(raw)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::unavailable(e.into()))?;
        if created.is_none() {
            return Err(Error::Duplicate(job.id));
        }

        let _: () = redis::cmd("ZADD")
            .arg(self.index_key(&job.queue))
            .arg(job.created_at.timestamp_millis())
            .arg(job.id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::unavailable(e.into()))?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.load_record(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {}", id)))
    }

    async fn update(&self, id: JobId, patch: JobPatch) -> Result<Job> {
        // One logical writer per record: the worker that holds the
        // reservation (or the sweep once the lease lapsed), so a plain
        // read-modify-write is sufficient. The SET itself is atomic for
        // concurrent readers.
        let mut job = self
            .load_record(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {}", id)))?;
        patch.apply(&mut job);
        self.save_record(&job).await?;
        Ok(job)
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        let Some(job) = self.load_record(id).await? else {
            return Ok(false);
        };
        self.delete_records(&job.queue, &[id]).await?;
        Ok(true)
    }

    async fn query(&self, query: &JobQuery) -> Result<JobPage> {
        let candidates = self.load_candidates(query.queue.as_deref()).await?;
        let matched: Vec<Job> = candidates
            .into_iter()
            .filter(|job| query.matches(job))
            .collect();
        Ok(paginate(matched, query))
    }

    async fn aggregate(
        &self,
        filter: &JobQuery,
        dimensions: &[AggregateDimension],
    ) -> Result<Vec<AggregateRow>> {
        let candidates = self.load_candidates(filter.queue.as_deref()).await?;
        let matched: Vec<Job> = candidates
            .into_iter()
            .filter(|job| filter.matches(job))
            .collect();
        Ok(group_rows(&matched, dimensions))
    }

    async fn trim_retention(
        &self,
        queue: &str,
        keep_completed: usize,
        keep_failed: usize,
    ) -> Result<usize> {
        let jobs = self.load_candidates(Some(queue)).await?;
        let victims = retention_victims(&jobs, queue, keep_completed, keep_failed);
        // Bounded-batch deletes so a large backlog cannot hold a
        // connection for long
        for chunk in victims.chunks(200) {
            self.delete_records(queue, chunk).await?;
        }
        Ok(victims.len())
    }

    async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for queue in QUEUE_NAMES {
            let jobs = self.load_candidates(Some(queue)).await?;
            let victims: Vec<JobId> = jobs
                .iter()
                .filter(|job| job.status.is_terminal() && job.created_at < cutoff)
                .map(|job| job.id)
                .collect();
            for chunk in victims.chunks(200) {
                self.delete_records(queue, chunk).await?;
            }
            removed += victims.len();
        }
        Ok(removed)
    }
}
