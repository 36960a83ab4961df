//! Fastlane HTTP/WebSocket API
//!
//! A thin axum surface over the core job operations: task and job reads,
//! submissions, stop/retry, last-execution logs and live log streaming.

pub mod error;
pub mod routes;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use server::run;
pub use state::AppState;
