//! HTTP surface of the aggregated API
//!
//! Kubernetes-style paths and bodies. Handlers run the synchronous [`Porch`]
//! calls on the blocking pool; errors become `Status` bodies with the HTTP
//! code of their [`ErrorKind`](crate::error::ErrorKind).
//!
//! PackageVariants, PackageVariantSets and the arbitrary objects read by
//! set targets are kept in the [`ClusterStore`] the controllers watch.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::Porch;
use super::objects::{
    ApprovalRequest, CONFIG_API_VERSION, List, PORCH_API_VERSION, PackageObject, PackageRevision,
    PackageRevisionResources, RepositoryObject, Status, StatusCause, StatusDetails,
};
use crate::cancel::CancellationToken;
use crate::controllers::cluster::{ClusterStore, DynamicObject, Object, ObjectKey, Store};
use crate::controllers::packagevariant::PackageVariant;
use crate::controllers::variantset::PackageVariantSet;
use crate::error::{ErrorKind, PorchError, Result};

const PORCH_PREFIX: &str = "/apis/porch.kpt.dev/v1alpha1/namespaces/:ns";
const CONFIG_PREFIX: &str = "/apis/config.porch.kpt.dev/v1alpha1/namespaces/:ns";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub porch: Arc<Porch>,
    pub cluster: Arc<ClusterStore>,
    /// Parent of every request token; cancelled on shutdown
    pub token: CancellationToken,
}

impl AppState {
    pub fn new(porch: Arc<Porch>, cluster: Arc<ClusterStore>, token: CancellationToken) -> Self {
        Self { porch, cluster, token }
    }
}

/// Error response wrapper
#[derive(Debug)]
pub struct ApiError(pub PorchError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<PorchError> for ApiError {
    fn from(err: PorchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        match kind {
            ErrorKind::Internal => tracing::error!(error = %self.0, "request failed"),
            ErrorKind::Backend => tracing::warn!(error = %self.0, "request failed"),
            _ => tracing::debug!(error = %self.0, "request rejected"),
        }
        let code = kind.http_status();
        let details = match self.0.root() {
            PorchError::Invalid { errors, .. } => Some(StatusDetails {
                causes: errors
                    .iter()
                    .map(|e| StatusCause {
                        field: e.field.clone(),
                        message: e.message.clone(),
                    })
                    .collect(),
            }),
            _ => None,
        };
        let body = Status {
            api_version: "v1".to_string(),
            kind: "Status".to_string(),
            status: "Failure".to_string(),
            message: self.0.to_string(),
            reason: kind.reason().to_string(),
            code,
            details,
        };
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    let porch = Router::new()
        .route("/packagerevisions", get(list_revisions).post(create_revision))
        .route(
            "/packagerevisions/:name",
            get(get_revision).put(update_revision).delete(delete_revision),
        )
        .route("/packagerevisions/:name/approval", put(approve).patch(approve))
        .route("/packagerevisionresources/:name", get(get_resources).put(update_resources))
        .route("/packages", get(list_packages))
        .route("/discovery", get(discover));
    let config = Router::new()
        .route("/repositories", get(list_repositories).post(register_repository))
        .route("/repositories/:name", get(get_repository).delete(delete_repository))
        .route(
            "/packagevariants",
            get(list_stored::<PackageVariant>).post(create_stored::<PackageVariant>),
        )
        .route(
            "/packagevariants/:name",
            get(get_stored::<PackageVariant>)
                .put(update_stored::<PackageVariant>)
                .delete(delete_stored::<PackageVariant>),
        )
        .route(
            "/packagevariantsets",
            get(list_stored::<PackageVariantSet>).post(create_stored::<PackageVariantSet>),
        )
        .route(
            "/packagevariantsets/:name",
            get(get_stored::<PackageVariantSet>)
                .put(update_stored::<PackageVariantSet>)
                .delete(delete_stored::<PackageVariantSet>),
        )
        .route("/objects", get(list_dynamic).post(apply_dynamic))
        .route("/objects/:name", axum::routing::delete(delete_dynamic));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .nest(PORCH_PREFIX, porch)
        .nest(CONFIG_PREFIX, config)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` completes
pub async fn serve(listener: TcpListener, state: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| PorchError::IoError { message: e.to_string() })?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| PorchError::IoError { message: e.to_string() })
}

/// Run a synchronous API call on the blocking pool
async fn blocking<T, F>(state: &AppState, call: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Porch, &CancellationToken) -> Result<T> + Send + 'static,
{
    let porch = Arc::clone(&state.porch);
    let token = state.token.child();
    tokio::task::spawn_blocking(move || call(&porch, &token))
        .await
        .map_err(|e| PorchError::internal(format!("request task failed: {e}")))?
        .map_err(ApiError)
}

fn success(message: String) -> Json<Status> {
    Json(Status {
        api_version: "v1".to_string(),
        kind: "Status".to_string(),
        status: "Success".to_string(),
        message,
        reason: String::new(),
        code: 200,
        details: None,
    })
}

// Package revisions

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionQuery {
    repository: Option<String>,
}

async fn list_revisions(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Query(query): Query<RevisionQuery>,
) -> ApiResult<Json<List<PackageRevision>>> {
    let items = blocking(&state, move |porch, token| {
        porch.list_package_revisions(&ns, query.repository.as_deref(), token)
    })
    .await?;
    Ok(Json(List::new(PORCH_API_VERSION, "PackageRevision", items)))
}

async fn get_revision(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<PackageRevision>> {
    let revision = blocking(&state, move |porch, token| porch.get_package_revision(&ns, &name, token)).await?;
    Ok(Json(revision))
}

async fn create_revision(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(mut object): Json<PackageRevision>,
) -> ApiResult<(StatusCode, Json<PackageRevision>)> {
    object.metadata.namespace = ns;
    let created = blocking(&state, move |porch, token| porch.create_package_revision(&object, token)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_revision(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(mut object): Json<PackageRevision>,
) -> ApiResult<Json<PackageRevision>> {
    object.metadata.namespace = ns;
    object.metadata.name = name;
    let updated = blocking(&state, move |porch, token| porch.update_package_revision(&object, token)).await?;
    Ok(Json(updated))
}

async fn approve(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(request): Json<ApprovalRequest>,
) -> ApiResult<Json<PackageRevision>> {
    let updated = blocking(&state, move |porch, token| porch.update_approval(&ns, &name, &request, token)).await?;
    Ok(Json(updated))
}

async fn delete_revision(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<Status>> {
    let message = format!("package revision {name} deleted");
    blocking(&state, move |porch, token| porch.delete_package_revision(&ns, &name, token)).await?;
    Ok(success(message))
}

// Resources

async fn get_resources(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<PackageRevisionResources>> {
    let resources = blocking(&state, move |porch, token| porch.get_resources(&ns, &name, token)).await?;
    Ok(Json(resources))
}

async fn update_resources(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(mut object): Json<PackageRevisionResources>,
) -> ApiResult<Json<PackageRevisionResources>> {
    object.metadata.namespace = ns;
    object.metadata.name = name;
    let updated = blocking(&state, move |porch, token| porch.update_resources(&object, token)).await?;
    Ok(Json(updated))
}

// Packages and discovery

async fn list_packages(State(state): State<AppState>, Path(ns): Path<String>) -> ApiResult<Json<List<PackageObject>>> {
    let items = blocking(&state, move |porch, token| porch.list_packages(&ns, token)).await?;
    Ok(Json(List::new(PORCH_API_VERSION, "PorchPackage", items)))
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Direction {
    #[default]
    Upstream,
    Downstream,
}

#[derive(Debug, Default, Deserialize)]
struct DiscoveryQuery {
    #[serde(default)]
    direction: Direction,
}

async fn discover(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Query(query): Query<DiscoveryQuery>,
) -> ApiResult<Response> {
    Ok(match query.direction {
        Direction::Upstream => {
            Json(blocking(&state, move |porch, token| porch.upstream_updates(&ns, token)).await?).into_response()
        }
        Direction::Downstream => {
            Json(blocking(&state, move |porch, token| porch.downstream_updates(&ns, token)).await?).into_response()
        }
    })
}

// Repositories

async fn list_repositories(
    State(state): State<AppState>,
    Path(ns): Path<String>,
) -> ApiResult<Json<List<RepositoryObject>>> {
    let items = blocking(&state, move |porch, _| Ok(porch.list_repositories(&ns))).await?;
    Ok(Json(List::new(CONFIG_API_VERSION, "Repository", items)))
}

async fn get_repository(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<RepositoryObject>> {
    Ok(Json(state.porch.get_repository(&ns, &name)?))
}

async fn register_repository(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(mut object): Json<RepositoryObject>,
) -> ApiResult<(StatusCode, Json<RepositoryObject>)> {
    object.metadata.namespace = ns;
    let registered = blocking(&state, move |porch, token| porch.register_repository(&object, token)).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn delete_repository(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<Status>> {
    let message = format!("repository {name} deleted");
    blocking(&state, move |porch, _| porch.delete_repository(&ns, &name)).await?;
    Ok(success(message))
}

// Controller objects

/// Kinds kept in the cluster store and served under the config group
trait Stored: Object + Serialize + DeserializeOwned {
    fn store(cluster: &ClusterStore) -> &Store<Self>;
}

impl Stored for PackageVariant {
    fn store(cluster: &ClusterStore) -> &Store<Self> {
        &cluster.variants
    }
}

impl Stored for PackageVariantSet {
    fn store(cluster: &ClusterStore) -> &Store<Self> {
        &cluster.variant_sets
    }
}

async fn list_stored<T: Stored>(State(state): State<AppState>, Path(ns): Path<String>) -> Json<List<T>> {
    Json(List::new(CONFIG_API_VERSION, T::KIND, T::store(&state.cluster).list(&ns)))
}

async fn get_stored<T: Stored>(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<T>> {
    let key = ObjectKey::new(ns, name);
    T::store(&state.cluster)
        .get(&key)
        .map(Json)
        .ok_or_else(|| {
            ApiError(PorchError::ObjectNotFound {
                kind: T::KIND.to_string(),
                name: key.to_string(),
            })
        })
}

async fn create_stored<T: Stored>(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(mut object): Json<T>,
) -> ApiResult<(StatusCode, Json<T>)> {
    object.meta_mut().namespace = ns;
    let created = T::store(&state.cluster).create(object)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_stored<T: Stored>(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Json(mut object): Json<T>,
) -> ApiResult<Json<T>> {
    let meta = object.meta_mut();
    meta.namespace = ns;
    meta.name = name;
    Ok(Json(T::store(&state.cluster).update(object)?))
}

async fn delete_stored<T: Stored>(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
) -> ApiResult<Json<Status>> {
    let gone = T::store(&state.cluster).delete(&ObjectKey::new(ns, name.clone()))?;
    let message = if gone {
        format!("{} {name} deleted", T::KIND)
    } else {
        format!("{} {name} marked for deletion", T::KIND)
    };
    Ok(success(message))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectQuery {
    api_version: String,
    kind: String,
}

async fn list_dynamic(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Query(query): Query<ObjectQuery>,
) -> Json<List<DynamicObject>> {
    let items = state.cluster.list_objects(&ns, &query.api_version, &query.kind);
    Json(List::new(&query.api_version, &query.kind, items))
}

async fn apply_dynamic(
    State(state): State<AppState>,
    Path(ns): Path<String>,
    Json(mut object): Json<DynamicObject>,
) -> ApiResult<Json<DynamicObject>> {
    object.metadata.namespace = ns;
    Ok(Json(state.cluster.apply_object(object)?))
}

async fn delete_dynamic(
    State(state): State<AppState>,
    Path((ns, name)): Path<(String, String)>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<Json<Status>> {
    let key = ObjectKey::new(ns, name.clone());
    let gone = state.cluster.delete_object(&query.api_version, &query.kind, &key)?;
    let message = if gone {
        format!("{} {name} deleted", query.kind)
    } else {
        format!("{} {name} marked for deletion", query.kind)
    };
    Ok(success(message))
}
