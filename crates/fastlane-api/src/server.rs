use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use fastlane_core::{Context, Result};

use crate::routes::create_router;
use crate::state::AppState;

/// Serve the API until the shutdown flag flips
pub async fn run(ctx: Arc<Context>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = SocketAddr::from((
        ctx.config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| fastlane_core::Error::config(format!("invalid host: {}", e)))?,
        ctx.config.server.port,
    ));

    let app = create_router(AppState::new(ctx));

    info!("fastlane API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| fastlane_core::Error::network(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .map_err(|e| fastlane_core::Error::network(e.to_string()))?;

    Ok(())
}
