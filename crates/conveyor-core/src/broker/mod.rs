//! Queue Broker: per-queue ready/delayed/in-flight sets
//!
//! The broker organizes eligible work; it knows nothing about payloads
//! or handlers. Within one queue every operation is linearizable, and a
//! reservation is exclusive: the returned token is the only one that can
//! ack or nack the job until the lease lapses.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

use crate::error::Result;
use crate::job::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Where a job currently sits inside the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Ready,
    Delayed,
    InFlight,
}

impl Placement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Placement::Ready => "ready",
            Placement::Delayed => "delayed",
            Placement::InFlight => "in_flight",
        }
    }
}

/// Exclusive right to execute a reserved job for a bounded time
#[derive(Debug, Clone)]
pub struct Reservation {
    pub job_id: JobId,
    pub token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// Per-queue set sizes
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrokerSizes {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
}

/// Per-queue multiset of eligible work
#[async_trait]
pub trait Broker: Send + Sync {
    /// Place a job into `ready` (or `delayed` when `delay_until` is in
    /// the future). Idempotent on id: re-enqueue of a present id is a
    /// no-op returning the existing placement.
    async fn enqueue(
        &self,
        queue: &str,
        job_id: JobId,
        priority: i32,
        delay_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Placement>;

    /// Pop the highest-priority/oldest ready job and lease it. Returns
    /// `None` when the queue is empty or paused.
    async fn reserve(
        &self,
        queue: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>>;

    /// Release a lease after success. `BadToken` if it expired or was
    /// never issued.
    async fn ack(&self, queue: &str, job_id: JobId, token: Uuid) -> Result<()>;

    /// Release a lease after failure; re-inserts into `delayed` when
    /// `requeue_after` is given, otherwise drops the job from the broker
    /// (the Worker Pool decides retry vs give-up).
    async fn nack(
        &self,
        queue: &str,
        job_id: JobId,
        token: Uuid,
        requeue_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Remove a job from whichever set holds it; used by cancel
    async fn remove(&self, queue: &str, job_id: JobId) -> Result<bool>;

    /// Move all delayed entries that are due into `ready`
    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize>;

    /// Drop in-flight entries whose lease elapsed and return their ids;
    /// the stall sweep decides what happens to them. A late ack or nack
    /// for a reaped id gets `BadToken`.
    async fn reap_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    /// Current set sizes
    async fn sizes(&self, queue: &str) -> Result<BrokerSizes>;

    /// Ids currently in one of the sets, bounded
    async fn peek(&self, queue: &str, placement: Placement, limit: usize) -> Result<Vec<JobId>>;

    /// Which set holds the job, if any
    async fn placement(&self, queue: &str, job_id: JobId) -> Result<Option<Placement>>;

    /// Pause or resume reservation for a queue. In-flight work is
    /// unaffected; ready jobs accumulate until resumed.
    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()>;

    async fn is_paused(&self, queue: &str) -> Result<bool>;
}
