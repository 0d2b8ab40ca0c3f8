//! Minimal git smart-HTTP server
//!
//! Serves the bare repositories under a root directory:
//! - `GET /<repo>/info/refs?service=...` ref advertisement
//! - `POST /<repo>/git-upload-pack` full packfile of the wanted tips
//! - `POST /<repo>/git-receive-pack` stores a pushed pack and updates refs
//!
//! Used by integration tests and isolated deployments. Requests are
//! buffered whole and handled on the blocking pool.

pub mod pack;
pub mod pktline;

use std::future::Future;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use git2::{Oid, Repository};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use crate::error::{PorchError, Result};
use crate::git::Credentials;
use pktline::Packet;

const UPLOAD_PACK: &str = "git-upload-pack";
const RECEIVE_PACK: &str = "git-receive-pack";
const MAX_PUSH_BYTES: usize = 512 * 1024 * 1024;

fn agent() -> String {
    format!("agent=porch/{}", env!("CARGO_PKG_VERSION"))
}

/// Repositories served from `root`, with optional basic auth
pub struct GitServer {
    root: PathBuf,
    default_credentials: Option<Credentials>,
    credentials: DashMap<String, Credentials>,
}

impl GitServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_credentials: None,
            credentials: DashMap::new(),
        }
    }

    /// Require `credentials` for every repository without its own
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.default_credentials = Some(credentials);
        self
    }

    /// Require `credentials` for `repo` only
    pub fn set_repository_credentials(&self, repo: &str, credentials: Credentials) {
        self.credentials.insert(repo.to_string(), credentials);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create an empty bare repository whose HEAD points at `refs/heads/main`
    pub fn create_repository(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(PorchError::invalid_field("Repository", name, "name", "not a valid repository name"));
        }
        let path = self.root.join(format!("{name}.git"));
        let repo = crate::git::open_or_init_bare(&path)?;
        repo.set_head("refs/heads/main")?;
        tracing::info!(repo = name, path = %path.display(), "created repository");
        Ok(path)
    }

    /// `<root>/<name>.git` or `<root>/<name>`, when it is a repository
    fn repository_path(&self, name: &str) -> Option<PathBuf> {
        let name = name.strip_suffix(".git").unwrap_or(name);
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return None;
        }
        [self.root.join(format!("{name}.git")), self.root.join(name)]
            .into_iter()
            .find(|p| p.join("HEAD").is_file())
    }

    fn authorized(&self, repo: &str, headers: &HeaderMap) -> bool {
        let name = repo.strip_suffix(".git").unwrap_or(repo);
        let required = match self.credentials.get(name) {
            Some(entry) => Some(entry.value().clone()),
            None => self.default_credentials.clone(),
        };
        let Some(required) = required else {
            return true;
        };
        basic_credentials(headers).is_some_and(|given| given == required)
    }

    /// The HTTP routes
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/:repo/info/refs", get(info_refs))
            .route("/:repo/git-upload-pack", post(upload_pack))
            .route("/:repo/git-receive-pack", post(receive_pack))
            .layer(DefaultBodyLimit::max(MAX_PUSH_BYTES))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

/// Serve on `listener` until `shutdown` completes
pub async fn serve(
    listener: TcpListener,
    server: Arc<GitServer>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| PorchError::IoError { message: e.to_string() })?;
    tracing::info!(%addr, root = %server.root().display(), "git server listening");
    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| PorchError::IoError { message: e.to_string() })
}

/// A server running on its own thread and runtime; stops on drop
pub struct BackgroundServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl BackgroundServer {
    /// Bind an ephemeral localhost port and serve `server` there
    pub fn start(server: GitServer) -> Result<Self> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let server = Arc::new(server);
        let thread = std::thread::Builder::new()
            .name("git-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "git server runtime failed to start");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(e) => {
                            tracing::error!(error = %e, "git server failed to listen");
                            return;
                        }
                    };
                    let shutdown = async {
                        let _ = rx.await;
                    };
                    if let Err(e) = serve(listener, server, shutdown).await {
                        tracing::error!(error = %e, "git server stopped");
                    }
                });
            })?;
        Ok(Self {
            addr,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    /// Base URL; repositories live at `<url>/<name>.git`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn repository_url(&self, name: &str) -> String {
        format!("{}/{name}.git", self.url())
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

fn basic_credentials(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(Credentials::new(username, password))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"porch\"")],
        "authentication required\n",
    )
        .into_response()
}

fn not_found(repo: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("repository {repo} not found\n")).into_response()
}

/// Resolve the repository and check credentials before doing any work
fn admit(server: &GitServer, repo: &str, headers: &HeaderMap) -> std::result::Result<PathBuf, Response> {
    let Some(path) = server.repository_path(repo) else {
        return Err(not_found(repo));
    };
    if !server.authorized(repo, headers) {
        return Err(unauthorized());
    }
    Ok(path)
}

/// Run `work` against the opened repository on the blocking pool
async fn with_repository<F>(path: PathBuf, content_type: String, work: F) -> Response
where
    F: FnOnce(&Repository) -> Result<Vec<u8>> + Send + 'static,
{
    let shown = path.display().to_string();
    let result = tokio::task::spawn_blocking(move || {
        let repo = crate::git::open(&path)?;
        work(&repo)
    })
    .await
    .map_err(|e| PorchError::internal(format!("git server task failed: {e}")))
    .and_then(|r| r);

    match result {
        Ok(body) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache".to_string()),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(repo = %shown, error = %e, "git request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error\n").into_response()
        }
    }
}

async fn info_refs(
    State(server): State<Arc<GitServer>>,
    UrlPath(repo): UrlPath<String>,
    Query(query): Query<ServiceQuery>,
    headers: HeaderMap,
) -> Response {
    let service = match query.service.as_deref() {
        Some(s @ (UPLOAD_PACK | RECEIVE_PACK)) => s.to_string(),
        _ => return (StatusCode::FORBIDDEN, "only smart HTTP is supported\n").into_response(),
    };
    let path = match admit(&server, &repo, &headers) {
        Ok(path) => path,
        Err(response) => return response,
    };
    tracing::debug!(%repo, %service, "advertising refs");
    let content_type = format!("application/x-{service}-advertisement");
    with_repository(path, content_type, move |repo| advertise(repo, &service)).await
}

async fn upload_pack(
    State(server): State<Arc<GitServer>>,
    UrlPath(repo): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = match admit(&server, &repo, &headers) {
        Ok(path) => path,
        Err(response) => return response,
    };
    let body = match decode_body(&headers, body) {
        Ok(body) => body,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
    };
    tracing::debug!(%repo, "upload-pack");
    with_repository(path, format!("application/x-{UPLOAD_PACK}-result"), move |repo| {
        send_pack(repo, &body)
    })
    .await
}

async fn receive_pack(
    State(server): State<Arc<GitServer>>,
    UrlPath(repo): UrlPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = match admit(&server, &repo, &headers) {
        Ok(path) => path,
        Err(response) => return response,
    };
    let body = match decode_body(&headers, body) {
        Ok(body) => body,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
    };
    tracing::debug!(%repo, "receive-pack");
    with_repository(path, format!("application/x-{RECEIVE_PACK}-result"), move |repo| {
        store_push(repo, &body)
    })
    .await
}

/// Request body, inflated when sent with `Content-Encoding: gzip`
fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Vec<u8>> {
    let gzip = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
    if !gzip {
        return Ok(body.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(body.as_ref()).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Every ref with its target, HEAD first, then sorted by name
fn list_refs(repo: &Repository) -> Result<Vec<(String, Oid)>> {
    let mut refs = Vec::new();
    for reference in repo.references()? {
        let reference = reference?;
        let (Some(name), Some(target)) = (reference.name(), reference.target()) else {
            continue;
        };
        refs.push((name.to_string(), target));
    }
    refs.sort();

    let mut listed = Vec::with_capacity(refs.len() + 1);
    if let Ok(head) = repo.refname_to_id("HEAD") {
        listed.push(("HEAD".to_string(), head));
    }
    listed.extend(refs);
    Ok(listed)
}

fn advertise(repo: &Repository, service: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    pktline::write_line(&mut out, &format!("# service={service}"));
    pktline::flush(&mut out);

    let refs = list_refs(repo)?;
    let mut capabilities = if service == UPLOAD_PACK {
        vec![agent()]
    } else {
        vec![
            "report-status".to_string(),
            "delete-refs".to_string(),
            "ofs-delta".to_string(),
            "no-thin".to_string(),
            agent(),
        ]
    };
    if service == UPLOAD_PACK && refs.first().is_some_and(|(name, _)| name == "HEAD") {
        if let Some(target) = repo.find_reference("HEAD")?.symbolic_target() {
            capabilities.insert(0, format!("symref=HEAD:{target}"));
        }
    }
    let capabilities = capabilities.join(" ");

    if refs.is_empty() {
        write_ref(&mut out, Oid::zero(), "capabilities^{}", Some(&capabilities));
    }
    for (i, (name, id)) in refs.iter().enumerate() {
        write_ref(&mut out, *id, name, (i == 0).then_some(capabilities.as_str()));
        if service == UPLOAD_PACK && name.starts_with("refs/tags/") {
            if let Ok(tag) = repo.find_tag(*id) {
                write_ref(&mut out, tag.target_id(), &format!("{name}^{{}}"), None);
            }
        }
    }
    pktline::flush(&mut out);
    Ok(out)
}

fn write_ref(out: &mut Vec<u8>, id: Oid, name: &str, capabilities: Option<&str>) {
    let mut line = format!("{id} {name}").into_bytes();
    if let Some(capabilities) = capabilities {
        line.push(0);
        line.extend_from_slice(capabilities.as_bytes());
    }
    line.push(b'\n');
    pktline::write(out, &line);
}

fn parse_oid(text: &[u8]) -> Result<Oid> {
    let text = std::str::from_utf8(text).map_err(|_| protocol_error("object id is not utf-8"))?;
    Oid::from_str(text).map_err(|_| protocol_error(&format!("bad object id {text}")))
}

fn protocol_error(message: &str) -> PorchError {
    PorchError::GitOperationFailed {
        message: format!("protocol error: {message}"),
    }
}

/// Answer one negotiation round; the pack follows only once the client is done
fn send_pack(repo: &Repository, body: &[u8]) -> Result<Vec<u8>> {
    let mut wants = Vec::new();
    let mut done = false;
    let mut reader = pktline::Reader::new(body);
    while let Some(packet) = reader.next_packet()? {
        let Packet::Data(data) = packet else {
            continue;
        };
        let line = pktline::trim(data);
        if let Some(rest) = line.strip_prefix(b"want ") {
            let id = rest.get(..40).ok_or_else(|| protocol_error("short want line"))?;
            wants.push(parse_oid(id)?);
        } else if line == b"done" {
            done = true;
            break;
        }
    }

    let mut out = Vec::new();
    if wants.is_empty() {
        pktline::flush(&mut out);
        return Ok(out);
    }
    pktline::write_line(&mut out, "NAK");
    if done {
        let objects = pack::reachable(repo, &wants)?;
        tracing::debug!(objects = objects.len(), "sending pack");
        out.extend(pack::write_pack(repo, &objects)?);
    }
    Ok(out)
}

/// One ref update from a push
#[derive(Debug)]
struct Command {
    old: Oid,
    new: Oid,
    name: String,
}

fn parse_commands(body: &[u8]) -> Result<(Vec<Command>, &[u8])> {
    let mut commands = Vec::new();
    let mut reader = pktline::Reader::new(body);
    while let Some(packet) = reader.next_packet()? {
        let Packet::Data(data) = packet else {
            break;
        };
        let line = pktline::trim(data);
        let line = line.split(|b| *b == 0).next().unwrap_or(line);
        let text = std::str::from_utf8(line).map_err(|_| protocol_error("command is not utf-8"))?;
        let mut parts = text.splitn(3, ' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(protocol_error(&format!("bad command {text}")));
        };
        commands.push(Command {
            old: parse_oid(old.as_bytes())?,
            new: parse_oid(new.as_bytes())?,
            name: name.to_string(),
        });
    }
    Ok((commands, reader.rest()))
}

fn store_push(repo: &Repository, body: &[u8]) -> Result<Vec<u8>> {
    let (commands, pack_data) = parse_commands(body)?;
    let mut out = Vec::new();

    if let Err(e) = pack::unpack(repo, pack_data) {
        tracing::error!(error = %e, "failed to store pushed pack");
        pktline::write_line(&mut out, &format!("unpack error {e}"));
        for command in &commands {
            pktline::write_line(&mut out, &format!("ng {} unpacker error", command.name));
        }
        pktline::flush(&mut out);
        return Ok(out);
    }

    pktline::write_line(&mut out, "unpack ok");
    for command in &commands {
        match update_ref(repo, command) {
            Ok(()) => {
                tracing::debug!(refname = %command.name, new = %command.new, "updated ref");
                pktline::write_line(&mut out, &format!("ok {}", command.name));
            }
            Err(reason) => {
                tracing::debug!(refname = %command.name, %reason, "rejected ref update");
                pktline::write_line(&mut out, &format!("ng {} {reason}", command.name));
            }
        }
    }
    pktline::flush(&mut out);
    Ok(out)
}

/// Apply one update if the ref still holds the value the client saw
fn update_ref(repo: &Repository, command: &Command) -> std::result::Result<(), String> {
    if !command.name.starts_with("refs/") {
        return Err("funny refname".to_string());
    }
    let current = repo.refname_to_id(&command.name).ok();
    let message = format!("push {}", command.name);

    if command.new.is_zero() {
        let Some(current) = current else {
            return Err("no such ref".to_string());
        };
        if !command.old.is_zero() && current != command.old {
            return Err("stale info".to_string());
        }
        let mut reference = repo.find_reference(&command.name).map_err(|e| e.message().to_string())?;
        return reference.delete().map_err(|e| e.message().to_string());
    }

    if repo.find_object(command.new, None).is_err() {
        return Err("missing necessary objects".to_string());
    }
    match (command.old.is_zero(), current) {
        (true, Some(_)) => Err("already exists".to_string()),
        (true, None) => repo
            .reference(&command.name, command.new, false, &message)
            .map(|_| ())
            .map_err(|e| e.message().to_string()),
        (false, None) => Err("stale info".to_string()),
        (false, Some(current)) if current != command.old => Err("fetch first".to_string()),
        (false, Some(_)) => repo
            .reference_matching(&command.name, command.new, true, command.old, &message)
            .map(|_| ())
            .map_err(|e| e.message().to_string()),
    }
}
