//! Job-type registry
//!
//! Each queue declares the `type` values it accepts. A type registration
//! carries the downstream endpoint, the headers to forward, the handler
//! timeout, and a payload schema checked at submit time. The core stores
//! the raw payload unchanged; the schema only gates admission.

use crate::error::{Error, Result};
use crate::queues::is_registered_queue;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Expected JSON kind for a schema field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
    /// Presence is required but any kind is accepted
    Any,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }
}

/// Declarative payload shape: top-level required fields and their kinds
#[derive(Debug, Clone, Default)]
pub struct PayloadSchema {
    required: Vec<(String, FieldKind)>,
}

impl PayloadSchema {
    /// Schema accepting any object
    pub fn any() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.required.push((field.into(), kind));
        self
    }

    /// Validate a payload against the schema
    pub fn validate(&self, payload: &Value) -> std::result::Result<(), String> {
        if self.required.is_empty() {
            return Ok(());
        }
        let object = payload
            .as_object()
            .ok_or_else(|| "payload must be a JSON object".to_string())?;
        for (field, kind) in &self.required {
            match object.get(field) {
                None => return Err(format!("missing required field '{}'", field)),
                Some(value) if !kind.matches(value) => {
                    return Err(format!("field '{}' must be a {}", field, kind.name()));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Registration record for one `(queue, type)` pair
#[derive(Debug, Clone)]
pub struct JobTypeSpec {
    /// Downstream worker endpoint invoked per job
    pub endpoint: String,

    /// HTTP method for the handler call
    pub method: reqwest::Method,

    /// Static headers forwarded on every call
    pub headers: Vec<(String, String)>,

    /// Per-call handler timeout
    pub timeout: Duration,

    /// Payload shape checked at submit
    pub schema: PayloadSchema,
}

impl JobTypeSpec {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: reqwest::Method::POST,
            headers: Vec::new(),
            timeout,
            schema: PayloadSchema::any(),
        }
    }

    pub fn with_schema(mut self, schema: PayloadSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Registry of accepted `(queue, type)` pairs
#[derive(Debug, Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, HashMap<String, JobTypeSpec>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type for a queue. Fails for names outside the fixed
    /// queue registry; re-registration replaces the previous spec.
    pub fn register(
        &mut self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        spec: JobTypeSpec,
    ) -> Result<()> {
        let queue = queue.into();
        if !is_registered_queue(&queue) {
            return Err(Error::InvalidQueue(queue));
        }
        self.types
            .entry(queue)
            .or_default()
            .insert(job_type.into(), spec);
        Ok(())
    }

    /// Look up the spec for a pair
    pub fn get(&self, queue: &str, job_type: &str) -> Option<&JobTypeSpec> {
        self.types.get(queue).and_then(|types| types.get(job_type))
    }

    /// Registered type names for a queue
    pub fn types_for(&self, queue: &str) -> Vec<&str> {
        self.types
            .get(queue)
            .map(|types| types.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// All registered `(queue, type)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &JobTypeSpec)> {
        self.types.iter().flat_map(|(queue, types)| {
            types
                .iter()
                .map(move |(job_type, spec)| (queue.as_str(), job_type.as_str(), spec))
        })
    }

    /// Longest handler timeout registered for a queue; the worker pool
    /// derives its lease duration from this.
    pub fn max_timeout_for(&self, queue: &str) -> Option<Duration> {
        self.types
            .get(queue)
            .and_then(|types| types.values().map(|spec| spec.timeout).max())
    }

    /// Admission check applied by `Submit`
    pub fn validate_submission(
        &self,
        queue: &str,
        job_type: &str,
        payload: &Value,
        max_payload_bytes: usize,
    ) -> Result<()> {
        if !is_registered_queue(queue) {
            return Err(Error::InvalidQueue(queue.to_string()));
        }
        let spec = self.get(queue, job_type).ok_or_else(|| Error::InvalidJobType {
            queue: queue.to_string(),
            job_type: job_type.to_string(),
        })?;
        let size = serde_json::to_vec(payload)?.len();
        if size > max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size,
                limit: max_payload_bytes,
            });
        }
        spec.schema
            .validate(payload)
            .map_err(Error::Validation)?;
        Ok(())
    }
}
