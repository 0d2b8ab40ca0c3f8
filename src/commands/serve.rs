//! serve command implementation
//!
//! Wires the configuration into the backends, engine, API and controllers,
//! then serves until Ctrl-C.

use std::sync::Arc;

use porch::api::Porch;
use porch::api::rest::{self, AppState};
use porch::cancel::CancellationToken;
use porch::config::Config;
use porch::controllers::{self, cluster::ClusterStore};
use porch::engine::Engine;
use porch::engine::function::ExecRuntime;
use porch::metadata::MetadataStore;
use porch::repository::{BackendContext, RepositorySet, StaticCredentials};
use porch::{PorchError, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::cli::ServeArgs;

pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    if let Some(dir) = args.cache_dir {
        config.cache_dir = dir;
    }
    tracing::info!(cache_dir = %config.cache_dir.display(), data_dir = ?config.data_dir, "starting");

    let porch = Arc::new(build(&config)?);
    let cluster = Arc::new(ClusterStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = controllers::spawn(&porch, &cluster, &config.controllers, &config.retry, &shutdown_rx);

    let token = CancellationToken::new();
    let state = AppState::new(Arc::clone(&porch), cluster, token.clone());
    let listener = TcpListener::bind(args.addr)
        .await
        .map_err(|e| PorchError::IoError {
            message: format!("Failed to bind {}: {e}", args.addr),
        })?;
    let served = rest::serve(listener, state, super::shutdown_signal()).await;

    token.cancel();
    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "controller task ended abnormally");
        }
    }
    served
}

fn build(config: &Config) -> Result<Porch> {
    let credentials = StaticCredentials::new();
    for (key, secret) in &config.secrets {
        if let Some((namespace, name)) = key.split_once('/') {
            credentials.insert(namespace, name, secret.clone());
        }
    }

    let mut ctx = BackendContext::new(&config.cache_dir);
    ctx.credentials = Arc::new(credentials);
    ctx.committer = config.committer.clone();
    ctx.backoff = config.retry.clone();
    ctx.git_timeout = config.git_timeout();

    let runtime = Arc::new(ExecRuntime::new(config.functions.clone()));
    let engine = Engine::new(Arc::new(RepositorySet::new()), ctx, runtime);
    let metadata = match &config.data_dir {
        Some(dir) => MetadataStore::on_disk(dir)?,
        None => MetadataStore::in_memory(),
    };
    Ok(Porch::new(Arc::new(engine), metadata, config.api_read_timeout()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = Config {
            cache_dir: temp.path().join("cache"),
            data_dir: Some(temp.path().join("data")),
            ..Config::default()
        };
        let porch = build(&config).unwrap();
        assert!(porch.list_repositories("default").is_empty());
    }
}
