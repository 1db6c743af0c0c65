//! HTTP adapter for the conveyor control plane
//!
//! A thin axum surface: handlers extract the caller identity from
//! headers, call into [`conveyor_core::ControlPlane`], and map core
//! errors onto status codes. No orchestration logic lives here.

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
