//! CLI definitions using clap derive API

use clap::builder::{Styles, styling::AnsiColor};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Porch - package orchestration server
#[derive(Parser, Debug)]
#[command(
    name = "porch",
    author,
    version,
    styles = Styles::styled()
        .header(AnsiColor::Green.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default().bold())
        .placeholder(AnsiColor::Cyan.on_default()),
    about = "Package orchestration for KRM configuration packages",
    long_about = "Porch manages versioned configuration packages stored in git repositories, \
                  OCI registries and directories, and keeps package variants up to date \
                  with their upstreams.",
    after_help = "\x1b[1m\x1b[32mExamples:\x1b[0m\n    \
                  porch serve --addr 127.0.0.1:7007 --config porch.yaml\n    \
                  porch git-server --addr 127.0.0.1:8080 --root ./repos"
)]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the package API server and controllers
    Serve(ServeArgs),

    /// Run a git smart-HTTP server over a directory of bare repositories
    GitServer(GitServerArgs),

    /// Show version information
    Version,
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "PORCH_ADDR", default_value = "127.0.0.1:7007")]
    pub addr: SocketAddr,

    /// YAML configuration file
    #[arg(long, short = 'c', env = "PORCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Persist package revision metadata under this directory
    #[arg(long, env = "PORCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Cache directory for git mirrors
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

/// Arguments for the git-server command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                   Serve ./repos and create an empty repository:\n    \
                   porch git-server --root ./repos --init blueprints\n\n\
                   Require basic auth:\n    \
                   porch git-server --root ./repos --user porch --password secret")]
pub struct GitServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Directory holding bare repositories
    #[arg(long)]
    pub root: PathBuf,

    /// Basic-auth user required for every repository
    #[arg(long, requires = "password")]
    pub user: Option<String>,

    /// Basic-auth password
    #[arg(long, env = "PORCH_GIT_PASSWORD", requires = "user")]
    pub password: Option<String>,

    /// Create these repositories if missing
    #[arg(long = "init", value_name = "NAME")]
    pub init: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["porch", "serve"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.addr.port(), 7007);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_git_server_requires_user_and_password_together() {
        assert!(Cli::try_parse_from(["porch", "git-server", "--root", "r", "--user", "u"]).is_err());
        let cli = Cli::try_parse_from([
            "porch", "-v", "git-server", "--root", "r", "--user", "u", "--password", "p", "--init", "a", "--init", "b",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::GitServer(args) = cli.command else {
            panic!("expected git-server");
        };
        assert_eq!(args.init, vec!["a", "b"]);
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
