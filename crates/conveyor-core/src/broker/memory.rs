//! In-memory queue broker
//!
//! Each queue owns one `QueueState` inside a `DashMap`; the map guard
//! gives exclusive access per queue, so operations on one queue are
//! linearizable while distinct queues never contend.

use crate::broker::{Broker, BrokerSizes, Placement, Reservation};
use crate::error::{Error, Result};
use crate::job::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use uuid::Uuid;

/// Ready-set ordering key: higher priority first, then older first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyKey {
    priority: i32,
    seq: u64,
    job_id: JobId,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.seq.cmp(&other.seq))
            .then(self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delayed-set ordering key: earliest due first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedKey {
    due: DateTime<Utc>,
    seq: u64,
    job_id: JobId,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
    priority: i32,
}

#[derive(Debug, Default)]
struct QueueState {
    paused: bool,
    next_seq: u64,
    ready: BTreeSet<ReadyKey>,
    ready_index: HashMap<JobId, ReadyKey>,
    /// key → priority of the entry
    delayed: BTreeMap<DelayedKey, i32>,
    delayed_index: HashMap<JobId, DelayedKey>,
    in_flight: HashMap<JobId, Lease>,
}

impl QueueState {
    fn placement_of(&self, job_id: JobId) -> Option<Placement> {
        if self.ready_index.contains_key(&job_id) {
            Some(Placement::Ready)
        } else if self.delayed_index.contains_key(&job_id) {
            Some(Placement::Delayed)
        } else if self.in_flight.contains_key(&job_id) {
            Some(Placement::InFlight)
        } else {
            None
        }
    }

    fn insert_ready(&mut self, job_id: JobId, priority: i32, seq: u64) {
        let key = ReadyKey {
            priority,
            seq,
            job_id,
        };
        self.ready.insert(key);
        self.ready_index.insert(job_id, key);
    }

    fn insert_delayed(&mut self, job_id: JobId, priority: i32, seq: u64, due: DateTime<Utc>) {
        let key = DelayedKey { due, seq, job_id };
        self.delayed.insert(key, priority);
        self.delayed_index.insert(job_id, key);
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Broker holding every queue in process memory
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: DashMap<String, QueueState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut state = self.queues.entry(queue.to_string()).or_default();
        f(&mut state)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        job_id: JobId,
        priority: i32,
        delay_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Placement> {
        Ok(self.with_queue(queue, |state| {
            if let Some(existing) = state.placement_of(job_id) {
                return existing;
            }
            let seq = state.take_seq();
            match delay_until {
                Some(due) if due > now => {
                    state.insert_delayed(job_id, priority, seq, due);
                    Placement::Delayed
                }
                _ => {
                    state.insert_ready(job_id, priority, seq);
                    Placement::Ready
                }
            }
        }))
    }

    async fn reserve(
        &self,
        queue: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>> {
        Ok(self.with_queue(queue, |state| {
            if state.paused {
                return None;
            }
            let key = *state.ready.iter().next()?;
            state.ready.remove(&key);
            state.ready_index.remove(&key.job_id);

            let expires_at = now + chrono::Duration::milliseconds(lease.as_millis() as i64);
            let lease = Lease {
                token: Uuid::new_v4(),
                expires_at,
                priority: key.priority,
            };
            state.in_flight.insert(key.job_id, lease);
            Some(Reservation {
                job_id: key.job_id,
                token: lease.token,
                lease_expires_at: expires_at,
            })
        }))
    }

    async fn ack(&self, queue: &str, job_id: JobId, token: Uuid) -> Result<()> {
        self.with_queue(queue, |state| match state.in_flight.get(&job_id) {
            Some(lease) if lease.token == token => {
                state.in_flight.remove(&job_id);
                Ok(())
            }
            _ => Err(Error::BadToken),
        })
    }

    async fn nack(
        &self,
        queue: &str,
        job_id: JobId,
        token: Uuid,
        requeue_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_queue(queue, |state| {
            let lease = match state.in_flight.get(&job_id) {
                Some(lease) if lease.token == token => *lease,
                _ => return Err(Error::BadToken),
            };
            state.in_flight.remove(&job_id);
            if let Some(after) = requeue_after {
                let due = now + chrono::Duration::milliseconds(after.as_millis() as i64);
                let seq = state.take_seq();
                state.insert_delayed(job_id, lease.priority, seq, due);
            }
            Ok(())
        })
    }

    async fn remove(&self, queue: &str, job_id: JobId) -> Result<bool> {
        Ok(self.with_queue(queue, |state| {
            if let Some(key) = state.ready_index.remove(&job_id) {
                state.ready.remove(&key);
                true
            } else if let Some(key) = state.delayed_index.remove(&job_id) {
                state.delayed.remove(&key);
                true
            } else {
                state.in_flight.remove(&job_id).is_some()
            }
        }))
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.with_queue(queue, |state| {
            let due: Vec<(DelayedKey, i32)> = state
                .delayed
                .range(
                    ..=DelayedKey {
                        due: now,
                        seq: u64::MAX,
                        job_id: JobId::max(),
                    },
                )
                .map(|(key, priority)| (*key, *priority))
                .collect();

            for (key, priority) in &due {
                state.delayed.remove(key);
                state.delayed_index.remove(&key.job_id);
                // Original seq survives promotion so FIFO stays anchored
                // to enqueue time
                state.insert_ready(key.job_id, *priority, key.seq);
            }
            due.len()
        }))
    }

    async fn reap_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        Ok(self.with_queue(queue, |state| {
            let expired: Vec<JobId> = state
                .in_flight
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                state.in_flight.remove(id);
            }
            expired
        }))
    }

    async fn sizes(&self, queue: &str) -> Result<BrokerSizes> {
        Ok(self.with_queue(queue, |state| BrokerSizes {
            waiting: state.ready.len(),
            active: state.in_flight.len(),
            delayed: state.delayed.len(),
        }))
    }

    async fn peek(&self, queue: &str, placement: Placement, limit: usize) -> Result<Vec<JobId>> {
        Ok(self.with_queue(queue, |state| match placement {
            Placement::Ready => state.ready.iter().take(limit).map(|k| k.job_id).collect(),
            Placement::Delayed => state.delayed.keys().take(limit).map(|k| k.job_id).collect(),
            Placement::InFlight => state.in_flight.keys().take(limit).copied().collect(),
        }))
    }

    async fn placement(&self, queue: &str, job_id: JobId) -> Result<Option<Placement>> {
        Ok(self.with_queue(queue, |state| state.placement_of(job_id)))
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<()> {
        self.with_queue(queue, |state| state.paused = paused);
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool> {
        Ok(self.with_queue(queue, |state| state.paused))
    }
}
