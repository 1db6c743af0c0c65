use axum::http::HeaderMap;
use conveyor_core::{Caller, ControlPlane};
use std::sync::Arc;

/// Header naming the producer identity established upstream
pub const OWNER_HEADER: &str = "x-owner-id";

/// Header flagging an administrative caller
pub const ADMIN_HEADER: &str = "x-admin";

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
}

impl AppState {
    pub fn new(control: Arc<ControlPlane>) -> Self {
        Self { control }
    }
}

/// Authentication itself happens upstream; this adapter only carries
/// the established identity into the core.
pub fn caller_from_headers(headers: &HeaderMap) -> Caller {
    let owner = headers
        .get(OWNER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let is_admin = headers
        .get(ADMIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    Caller { owner, is_admin }
}
