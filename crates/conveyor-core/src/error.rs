//! Error types for the orchestration core
//!
//! Every fallible Control Plane operation returns [`Error`]; the HTTP
//! adapter maps variants onto status codes via [`Error::status_code`].
//! Handler-level failures are deliberately kept out of this enum; they
//! live in [`crate::handler::HandlerError`] and never surface to
//! producers except through the job record.

use uuid::Uuid;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for conveyor
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Queue name is not in the fixed registry
    #[error("unknown queue: {0}")]
    InvalidQueue(String),

    /// Job type is not registered for the queue
    #[error("job type '{job_type}' is not registered for queue '{queue}'")]
    InvalidJobType { queue: String, job_type: String },

    /// Requested delay is out of range
    #[error("invalid delay: {0}")]
    InvalidDelay(String),

    /// Cron expression failed to parse
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Payload exceeds the configured size limit
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Submission or configuration input failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// Caller identity is missing
    #[error("authentication required")]
    AuthRequired,

    /// Caller may not touch this job
    #[error("forbidden")]
    Forbidden,

    /// Operation requires an admin caller
    #[error("admin privileges required")]
    AdminRequired,

    /// No record for the given identifier
    #[error("not found: {0}")]
    NotFound(String),

    /// A job with this id already exists
    #[error("duplicate job id: {0}")]
    Duplicate(Uuid),

    /// Cancel refused because the job is running
    #[error("job is active and cannot be cancelled")]
    RefusedActive,

    /// Retry is only possible from the failed state
    #[error("job is not in a retriable state")]
    NotRetriable,

    /// Named cron entry does not exist or cannot be fired
    #[error("scheduled entry cannot be triggered: {0}")]
    NotTriggerable(String),

    /// Reservation token expired or never existed
    #[error("reservation token is stale or unknown")]
    BadToken,

    /// Backing store is unreachable
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Queue broker backing is unreachable
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidQueue(_)
            | Error::InvalidJobType { .. }
            | Error::InvalidDelay(_)
            | Error::InvalidCron(_)
            | Error::Validation(_) => 400,
            Error::PayloadTooLarge { .. } => 413,
            Error::AuthRequired => 401,
            Error::Forbidden | Error::AdminRequired => 403,
            Error::NotFound(_) => 404,
            Error::Duplicate(_) | Error::RefusedActive | Error::NotRetriable => 409,
            Error::NotTriggerable(_) => 409,
            Error::BadToken => 409,
            Error::StoreUnavailable(_) | Error::BrokerUnavailable(_) => 503,
            Error::Config(_) | Error::Serialization(_) | Error::Io(_) => 500,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidQueue(_) => "invalid_queue",
            Error::InvalidJobType { .. } => "invalid_job_type",
            Error::InvalidDelay(_) => "invalid_delay",
            Error::InvalidCron(_) => "invalid_cron",
            Error::PayloadTooLarge { .. } => "payload_too_large",
            Error::Validation(_) => "validation",
            Error::AuthRequired => "auth_required",
            Error::Forbidden => "forbidden",
            Error::AdminRequired => "admin_required",
            Error::NotFound(_) => "not_found",
            Error::Duplicate(_) => "duplicate",
            Error::RefusedActive => "refused_active",
            Error::NotRetriable => "not_retriable",
            Error::NotTriggerable(_) => "not_triggerable",
            Error::BadToken => "bad_token",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::BrokerUnavailable(_) => "broker_unavailable",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
        }
    }

    /// Whether the error is the caller's fault (4xx-class)
    pub fn is_caller_error(&self) -> bool {
        let code = self.status_code();
        (400..500).contains(&code)
    }
}
