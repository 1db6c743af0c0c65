//! Worker pools
//!
//! One pool per queue. Each of the pool's `concurrency` slots loops:
//! reserve from the Broker, mark the record active, invoke the handler,
//! then ack or nack. The pool is the only component that writes to the
//! Store and the Broker in the same logical step; the state-machine
//! rules in the store record keep the two consistent.

use crate::broker::{Broker, Reservation};
use crate::config::WorkerSettings;
use crate::error::Error;
use crate::handler::{HandlerContext, HandlerError, HandlerMap};
use crate::job::{Job, JobPatch, JobStatus};
use crate::queues::QueueConfiguration;
use crate::registry::JobTypeRegistry;
use crate::store::JobStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Fallback per-type timeout when a queue has no registered types
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(120);

/// Worker pool state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Stopping,
    Stopped,
}

/// Exponential retry backoff with a ceiling and optional jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,

    /// Upper bound on any computed delay
    pub ceiling: Duration,

    /// Growth factor per attempt
    pub multiplier: f64,

    /// Jitter factor (0.0 - 1.0) to randomize delays
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry that follows `attempts` completed attempts
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let capped = raw.min(self.ceiling.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            use rand::Rng;
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Bounded-concurrency executor for one queue
pub struct WorkerPool {
    queue: String,
    concurrency: usize,
    lease: Duration,
    poll_interval: Duration,
    backoff: BackoffPolicy,
    timeouts: HashMap<String, Duration>,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    handlers: Arc<HandlerMap>,
    state: Arc<RwLock<PoolState>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: impl Into<String>,
        configuration: &QueueConfiguration,
        settings: &WorkerSettings,
        backoff_ceiling: Duration,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        handlers: Arc<HandlerMap>,
        registry: &JobTypeRegistry,
    ) -> Self {
        let queue = queue.into();

        // The lease must outlive the slowest handler this queue can run
        let lease = registry
            .max_timeout_for(&queue)
            .unwrap_or(DEFAULT_HANDLER_TIMEOUT)
            + settings.lease_grace();

        let timeouts = registry
            .entries()
            .filter(|(q, _, _)| *q == queue)
            .map(|(_, job_type, spec)| (job_type.to_string(), spec.timeout))
            .collect();

        Self {
            queue,
            concurrency: configuration.concurrency,
            lease,
            poll_interval: settings.poll_interval(),
            backoff: BackoffPolicy::new(
                Duration::from_millis(configuration.retry_delay_ms),
                backoff_ceiling,
            ),
            timeouts,
            store,
            broker,
            handlers,
            state: Arc::new(RwLock::new(PoolState::Stopped)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn state(&self) -> PoolState {
        *self.state.read().await
    }

    /// Spawn the slot loops; one task per concurrency slot
    pub async fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!(queue = %self.queue, concurrency = self.concurrency, "starting worker pool");
        *self.state.write().await = PoolState::Running;

        (0..self.concurrency)
            .map(|slot| {
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    pool.slot_loop(slot).await;
                })
            })
            .collect()
    }

    /// Signal slots to exit after their current job
    pub async fn stop(&self) {
        info!(queue = %self.queue, "stopping worker pool");
        *self.state.write().await = PoolState::Stopping;
        self.shutdown.cancel();
    }

    async fn slot_loop(&self, slot: usize) {
        debug!(queue = %self.queue, slot, "worker slot running");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.broker.reserve(&self.queue, self.lease, Utc::now()).await {
                Ok(Some(reservation)) => {
                    self.process(reservation).await;
                }
                Ok(None) => {
                    // Empty or paused; back off briefly
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, slot, error = %e, "reserve failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval.max(Duration::from_secs(1))) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        debug!(queue = %self.queue, slot, "worker slot stopped");
        *self.state.write().await = PoolState::Stopped;
    }

    async fn process(&self, reservation: Reservation) {
        let started = Utc::now();
        let job_id = reservation.job_id;

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(Error::NotFound(_)) => {
                // Record was purged underneath us; drop the token
                let _ = self.broker.ack(&self.queue, job_id, reservation.token).await;
                return;
            }
            Err(e) => {
                warn!(queue = %self.queue, job_id = %job_id, error = %e, "store read failed; requeueing");
                let _ = self
                    .broker
                    .nack(
                        &self.queue,
                        job_id,
                        reservation.token,
                        Some(self.backoff.base),
                        started,
                    )
                    .await;
                return;
            }
        };

        let attempt = job.attempts + 1;
        let activate = JobPatch::new()
            .status(JobStatus::Active)
            .attempts(attempt)
            .started_at(started);
        if let Err(e) = self.store.update(job_id, activate).await {
            // The broker still holds the in-flight token, so the job is
            // not lost; retry after backoff
            warn!(queue = %self.queue, job_id = %job_id, error = %e, "store update failed; requeueing");
            let _ = self
                .broker
                .nack(
                    &self.queue,
                    job_id,
                    reservation.token,
                    Some(self.backoff.delay_for(attempt)),
                    started,
                )
                .await;
            return;
        }

        let Some(handler) = self.handlers.get(&self.queue, &job.job_type) else {
            self.finish_failed(
                &job,
                attempt,
                &reservation,
                format!("no handler registered for type '{}'", job.job_type),
            )
            .await;
            return;
        };

        let timeout = self
            .timeouts
            .get(&job.job_type)
            .copied()
            .unwrap_or(DEFAULT_HANDLER_TIMEOUT);

        let cancel = CancellationToken::new();
        let ctx = HandlerContext {
            job_id,
            queue: self.queue.clone(),
            job_type: job.job_type.clone(),
            attempt,
            max_attempts: job.max_attempts,
            owner: job.owner.clone(),
            timeout,
            cancel: cancel.clone(),
        };

        // Tie the cancellation signal to the lease
        let lease_left = (reservation.lease_expires_at - started)
            .to_std()
            .unwrap_or_default();
        let lease_guard = tokio::spawn(async move {
            tokio::time::sleep(lease_left).await;
            cancel.cancel();
        });

        debug!(
            queue = %self.queue,
            job_id = %job_id,
            job_type = %job.job_type,
            attempt,
            max_attempts = job.max_attempts,
            "processing job"
        );

        let outcome = tokio::select! {
            result = handler.call(&job.payload, &ctx) => Some(result),
            _ = tokio::time::sleep(timeout) => None,
        };
        lease_guard.abort();

        match outcome {
            None | Some(Err(HandlerError::Timeout(_))) => {
                // The slot abandons the attempt; the stall sweep will
                // observe the expired lease and requeue or fail
                warn!(
                    queue = %self.queue,
                    job_id = %job_id,
                    attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    "handler timed out; abandoning attempt"
                );
            }
            Some(Ok(result)) => {
                let finished = Utc::now();
                let elapsed_ms = (finished - started).num_milliseconds().max(0) as u64;

                match self.broker.ack(&self.queue, job_id, reservation.token).await {
                    Ok(()) => {
                        let patch = JobPatch::new()
                            .status(JobStatus::Completed)
                            .result(result)
                            .completed_at(finished)
                            .processing_time_ms(elapsed_ms)
                            .delay_until(None)
                            .clear_error();
                        if let Err(e) = self.store.update(job_id, patch).await {
                            error!(queue = %self.queue, job_id = %job_id, error = %e, "failed recording completion");
                        } else {
                            info!(
                                queue = %self.queue,
                                job_id = %job_id,
                                attempt,
                                elapsed_ms,
                                "job completed"
                            );
                        }
                    }
                    Err(Error::BadToken) => {
                        // Lease lapsed mid-run and the sweep took over;
                        // the late result is discarded
                        warn!(queue = %self.queue, job_id = %job_id, "ack rejected: lease expired");
                    }
                    Err(e) => {
                        error!(queue = %self.queue, job_id = %job_id, error = %e, "ack failed");
                    }
                }
            }
            Some(Err(HandlerError::Retriable(reason))) if attempt < job.max_attempts => {
                let delay = self.backoff.delay_for(attempt);
                match self
                    .broker
                    .nack(&self.queue, job_id, reservation.token, Some(delay), Utc::now())
                    .await
                {
                    Ok(()) => {
                        let patch = JobPatch::new()
                            .status(JobStatus::Waiting)
                            .error(reason.as_str())
                            .delay_until(Some(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64)));
                        if let Err(e) = self.store.update(job_id, patch).await {
                            error!(queue = %self.queue, job_id = %job_id, error = %e, "failed recording retry");
                        }
                        info!(
                            queue = %self.queue,
                            job_id = %job_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "job failed; retrying"
                        );
                    }
                    Err(Error::BadToken) => {
                        warn!(queue = %self.queue, job_id = %job_id, "nack rejected: lease expired");
                    }
                    Err(e) => {
                        error!(queue = %self.queue, job_id = %job_id, error = %e, "nack failed");
                    }
                }
            }
            Some(Err(err)) => {
                // Fatal, or retriable with attempts exhausted
                self.finish_failed(&job, attempt, &reservation, err.to_string())
                    .await;
            }
        }
    }

    /// Terminal failure path: release the token and record `failed`
    async fn finish_failed(
        &self,
        job: &Job,
        attempt: u32,
        reservation: &Reservation,
        reason: String,
    ) {
        match self
            .broker
            .nack(&self.queue, job.id, reservation.token, None, Utc::now())
            .await
        {
            Ok(()) => {}
            Err(Error::BadToken) => {
                warn!(queue = %self.queue, job_id = %job.id, "nack rejected: lease expired");
                return;
            }
            Err(e) => {
                error!(queue = %self.queue, job_id = %job.id, error = %e, "nack failed");
                return;
            }
        }

        let patch = JobPatch::new()
            .status(JobStatus::Failed)
            .error(reason.as_str())
            .failed_at(Utc::now());
        if let Err(e) = self.store.update(job.id, patch).await {
            error!(queue = %self.queue, job_id = %job.id, error = %e, "failed recording failure");
        } else {
            warn!(
                queue = %self.queue,
                job_id = %job.id,
                attempt,
                reason = %reason,
                "job failed permanently"
            );
        }
    }
}
