//! git-server command implementation

use std::sync::Arc;

use porch::git::Credentials;
use porch::gitserver::{self, GitServer};
use porch::{PorchError, Result};
use tokio::net::TcpListener;

use crate::cli::GitServerArgs;

pub async fn run(args: GitServerArgs) -> Result<()> {
    std::fs::create_dir_all(&args.root)
        .map_err(|e| porch::file_error_context!("Failed to create directory", args.root.display(), e))?;

    let mut server = GitServer::new(&args.root);
    if let (Some(user), Some(password)) = (args.user, args.password) {
        server = server.with_credentials(Credentials::new(user, password));
    }
    for name in &args.init {
        server.create_repository(name)?;
    }

    let listener = TcpListener::bind(args.addr)
        .await
        .map_err(|e| PorchError::IoError {
            message: format!("Failed to bind {}: {e}", args.addr),
        })?;
    gitserver::serve(listener, Arc::new(server), super::shutdown_signal()).await
}
