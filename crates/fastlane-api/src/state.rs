use std::sync::Arc;

use fastlane_core::{Context, JobService};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Engine context
    pub ctx: Arc<Context>,

    /// Core job operations
    pub service: Arc<JobService>,
}

impl AppState {
    /// Build handler state over an engine context
    pub fn new(ctx: Arc<Context>) -> Self {
        let service = Arc::new(JobService::new(ctx.clone()));
        Self { ctx, service }
    }
}
