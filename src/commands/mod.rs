//! Command implementations for the porch binary

pub mod git_server;
pub mod serve;
pub mod version;

/// Resolves when the process receives Ctrl-C
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
