//! Handler invocation
//!
//! A handler executes one job's payload. The production implementation
//! is an outbound HTTP call to the downstream worker service; tests
//! register in-process handlers through the same trait.

use crate::job::JobId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Header carrying the job id so workers can deduplicate redeliveries
pub const JOB_ID_HEADER: &str = "x-conveyor-job-id";

/// Header carrying the submitting owner's identity
pub const OWNER_HEADER: &str = "x-conveyor-owner";

/// Handler outcome classification; drives retry-vs-fail in the pool
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure (5xx, network); retried while attempts remain
    #[error("retriable handler failure: {0}")]
    Retriable(String),

    /// Permanent failure (4xx, unusable response); skips remaining attempts
    #[error("fatal handler failure: {0}")]
    Fatal(String),

    /// Handler exceeded its configured duration
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything a handler may need beyond the payload
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub owner: Option<String>,

    /// Per-type maximum duration for this call
    pub timeout: Duration,

    /// Cancelled when the lease lapses; handlers that honor it abort
    /// cleanly with a retriable error
    pub cancel: CancellationToken,
}

impl HandlerContext {
    /// Check if this is the last attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Executes one job; must be idempotent (delivery is at-least-once)
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, payload: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError>;
}

/// Handler lookup by `(queue, type)`
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<(String, String), Arc<dyn Handler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) {
        self.handlers
            .insert((queue.into(), job_type.into()), handler);
    }

    pub fn get(&self, queue: &str, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .get(&(queue.to_string(), job_type.to_string()))
            .cloned()
    }

    /// Build the production map: one HTTP handler per registered type
    pub fn from_registry(registry: &crate::registry::JobTypeRegistry) -> Self {
        let client = reqwest::Client::new();
        let mut map = Self::new();
        for (queue, job_type, spec) in registry.entries() {
            map.insert(
                queue,
                job_type,
                Arc::new(HttpHandler::new(client.clone(), spec)),
            );
        }
        map
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerMap")
            .field("len", &self.handlers.len())
            .finish()
    }
}

/// Default handler: POST the payload to the downstream worker service
pub struct HttpHandler {
    client: reqwest::Client,
    endpoint: String,
    method: reqwest::Method,
    headers: Vec<(String, String)>,
}

impl HttpHandler {
    pub fn new(client: reqwest::Client, spec: &crate::registry::JobTypeSpec) -> Self {
        Self {
            client,
            endpoint: spec.endpoint.clone(),
            method: spec.method.clone(),
            headers: spec.headers.clone(),
        }
    }

    async fn dispatch(&self, payload: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        let mut request = self
            .client
            .request(self.method.clone(), &self.endpoint)
            .timeout(ctx.timeout)
            .header(JOB_ID_HEADER, ctx.job_id.to_string())
            .json(payload);
        if let Some(owner) = &ctx.owner {
            request = request.header(OWNER_HEADER, owner);
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                HandlerError::Timeout(ctx.timeout)
            } else {
                HandlerError::Retriable(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::Fatal(format!(
                "worker rejected job: {} {}",
                status,
                truncate(&body, 256)
            )));
        }
        if !status.is_success() {
            return Err(HandlerError::Retriable(format!(
                "worker returned {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| HandlerError::Retriable(format!("failed reading response: {}", e)))?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| HandlerError::Retriable(format!("unparseable worker response: {}", e)))
    }
}

#[async_trait]
impl Handler for HttpHandler {
    async fn call(&self, payload: &Value, ctx: &HandlerContext) -> Result<Value, HandlerError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                Err(HandlerError::Retriable("cancelled: lease expired".to_string()))
            }
            result = self.dispatch(payload, ctx) => result,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
