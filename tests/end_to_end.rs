//! End-to-end scenarios against the in-process git server

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{DEPLOYMENT, KPTFILE, NS, TestEnv, publish_plain};
use porch::api::objects::{ApprovalRequest, ApprovalSpec, PackageRevision};
use porch::api::rest::{AppState, router};
use porch::cancel::CancellationToken;
use porch::config::ControllerConfig;
use porch::controllers::cluster::{ClusterStore, ObjectKey};
use porch::controllers::variantset::{
    PackageName, PackageVariantSet, PackageVariantSetSpec, RepositoryTarget, Target, UpstreamSpec,
};
use porch::model::task::{CloneTask, PackageRevisionRef, UpdateTask};
use porch::model::{Lifecycle, Task};
use porch::retry::Backoff;
use pretty_assertions::assert_eq;
use tokio::sync::watch;
use tower::ServiceExt;

fn clone_of(upstream: &str) -> Task {
    Task::Clone(CloneTask {
        upstream_ref: Some(PackageRevisionRef::new(upstream)),
        ..CloneTask::default()
    })
}

fn approval(lifecycle: Lifecycle) -> ApprovalRequest {
    ApprovalRequest {
        metadata: porch::model::ObjectMeta::default(),
        spec: ApprovalSpec { lifecycle },
    }
}

/// Clone `r1.pkg-a.v1` into `r2` as workspace `ws1`
fn clone_to_draft(env: &TestEnv) -> PackageRevision {
    let object = PackageRevision::draft(NS, "r2", "pkg-a", "ws1", vec![clone_of("r1.pkg-a.v1")]);
    env.porch
        .create_package_revision(&object, &CancellationToken::none())
        .unwrap()
}

fn publish(env: &TestEnv, name: &str) -> PackageRevision {
    let token = CancellationToken::none();
    let mut object = env.porch.get_package_revision(NS, name, &token).unwrap();
    object.spec.lifecycle = Lifecycle::Proposed;
    env.porch.update_package_revision(&object, &token).unwrap();
    env.porch
        .update_approval(NS, name, &approval(Lifecycle::Published), &token)
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_register_and_list() {
    let env = TestEnv::new();
    publish_plain(&env.repo_path("r1"), "pkg-a", "v1", &[("Kptfile", KPTFILE), ("deployment.yaml", DEPLOYMENT)]);

    let app = router(AppState::new(
        Arc::clone(&env.porch),
        Arc::new(ClusterStore::new()),
        CancellationToken::new(),
    ));
    let registration = serde_json::json!({
        "metadata": {"name": "r1"},
        "spec": {"type": "git", "git": {"repo": env.server.repository_url("r1")}}
    });
    let request = Request::builder()
        .method("POST")
        .uri("/apis/config.porch.kpt.dev/v1alpha1/namespaces/default/repositories")
        .header("content-type", "application/json")
        .body(Body::from(registration.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let request = Request::builder()
        .uri("/apis/porch.kpt.dev/v1alpha1/namespaces/default/packagerevisions")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let list: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let items = list["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    let spec = &items[0]["spec"];
    assert_eq!(spec["packageName"], "pkg-a");
    assert_eq!(spec["revision"], "v1");
    assert_eq!(spec["lifecycle"], "Published");
    assert_eq!(spec["repositoryName"], "r1");
}

#[test]
fn test_clone_to_draft() {
    let env = TestEnv::new();
    publish_plain(&env.repo_path("r1"), "pkg-a", "v1", &[("Kptfile", KPTFILE), ("deployment.yaml", DEPLOYMENT)]);
    env.register("r1", &[]);
    env.register("r2", &[]);

    let draft = clone_to_draft(&env);
    assert_eq!(draft.metadata.name, "r2.pkg-a.ws1");
    assert_eq!(draft.spec.lifecycle, Lifecycle::Draft);
    assert_eq!(draft.spec.revision, "");
    let lock = draft.status.upstream_lock.as_ref().expect("upstream lock");
    assert_eq!(lock.git_ref(), Some("pkg-a/v1"));

    let resources = env
        .porch
        .get_resources(NS, "r2.pkg-a.ws1", &CancellationToken::none())
        .unwrap();
    let files: Vec<&str> = resources.spec.resources.keys().map(String::as_str).collect();
    assert_eq!(files, vec!["Kptfile", "deployment.yaml"]);
    assert_eq!(
        resources.spec.resources["deployment.yaml"],
        DEPLOYMENT.replace("metadata:\n", "metadata: # kpt-merge: /web\n")
    );
}

#[test]
fn test_discover_update() {
    let env = TestEnv::new();
    publish_plain(&env.repo_path("r1"), "pkg-a", "v1", &[("Kptfile", KPTFILE), ("deployment.yaml", DEPLOYMENT)]);
    env.register("r1", &[]);
    env.register("r2", &[]);
    clone_to_draft(&env);
    let published = publish(&env, "r2.pkg-a.ws1");
    assert_eq!(published.spec.revision, "v1");

    let v2 = DEPLOYMENT.replace("replicas: 1", "replicas: 2");
    publish_plain(&env.repo_path("r1"), "pkg-a", "v2", &[("Kptfile", KPTFILE), ("deployment.yaml", &v2)]);

    let updates = env
        .porch
        .upstream_updates(NS, &CancellationToken::none())
        .unwrap();
    let downstream = updates
        .iter()
        .find(|u| u.downstream == "r2.pkg-a.ws1")
        .expect("downstream with updates");
    assert_eq!(downstream.upstream_repository, "r1");
    assert_eq!(downstream.current, "v1");
    assert_eq!(downstream.available, vec!["v2".to_string()]);
}

#[test]
fn test_three_way_merge_with_upstream_edit() {
    let env = TestEnv::new();
    publish_plain(&env.repo_path("r1"), "pkg-a", "v1", &[("Kptfile", KPTFILE), ("deployment.yaml", DEPLOYMENT)]);
    let updated = DEPLOYMENT.replace("  replicas: 1\n", "  replicas: 3\n  image: x\n");
    publish_plain(&env.repo_path("r1"), "pkg-a", "v2", &[("Kptfile", KPTFILE), ("deployment.yaml", &updated)]);
    env.register("r1", &[]);
    env.register("r2", &[]);
    clone_to_draft(&env);

    let token = CancellationToken::none();
    let mut resources = env.porch.get_resources(NS, "r2.pkg-a.ws1", &token).unwrap();
    resources
        .spec
        .resources
        .insert("deployment.yaml".to_string(), DEPLOYMENT.replace("replicas: 1", "replicas: 5"));
    env.porch.update_resources(&resources, &token).unwrap();

    let mut draft = env.porch.get_package_revision(NS, "r2.pkg-a.ws1", &token).unwrap();
    draft.spec.tasks.push(Task::Update(UpdateTask {
        upstream_ref: Some(PackageRevisionRef::new("r1.pkg-a.v2")),
        ..UpdateTask::default()
    }));
    let draft = env.porch.update_package_revision(&draft, &token).unwrap();
    assert_eq!(draft.spec.tasks.len(), 3);
    assert_eq!(
        draft.status.upstream_lock.as_ref().and_then(|l| l.git_ref()),
        Some("pkg-a/v2")
    );

    let merged = env.porch.get_resources(NS, "r2.pkg-a.ws1", &token).unwrap();
    let deployment: serde_yaml::Value = serde_yaml::from_str(&merged.spec.resources["deployment.yaml"]).unwrap();
    let expected: serde_yaml::Value = serde_yaml::from_str("replicas: 5\nimage: x").unwrap();
    assert_eq!(deployment["spec"], expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_approval_rejects_published_to_draft() {
    let env = TestEnv::new();
    publish_plain(&env.repo_path("r1"), "pkg-a", "v1", &[("Kptfile", KPTFILE)]);
    env.register("r1", &[]);

    let app = router(AppState::new(
        Arc::clone(&env.porch),
        Arc::new(ClusterStore::new()),
        CancellationToken::new(),
    ));
    let request = Request::builder()
        .method("PATCH")
        .uri("/apis/porch.kpt.dev/v1alpha1/namespaces/default/packagerevisions/r1.pkg-a.v1/approval")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::json!({"spec": {"lifecycle": "Draft"}}).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(status["reason"], "Invalid");
    let causes = status["details"]["causes"].as_array().unwrap();
    assert!(causes.iter().any(|c| c["field"] == "spec.lifecycle"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_package_variant_set_fan_out() {
    let env = TestEnv::new();
    publish_plain(&env.repo_path("r1"), "pkg-a", "v1", &[("Kptfile", KPTFILE), ("deployment.yaml", DEPLOYMENT)]);
    for name in ["dev-1", "dev-2", "prod-1"] {
        env.create_repository(name);
    }
    env.register("r1", &[]);
    env.register("dev-1", &[("env", "dev")]);
    env.register("dev-2", &[("env", "dev")]);
    env.register("prod-1", &[("env", "prod")]);

    let cluster = Arc::new(ClusterStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = ControllerConfig {
        resync_seconds: 1,
        ..ControllerConfig::default()
    };
    let backoff = Backoff {
        base_ms: 50,
        cap_ms: 500,
        ..Backoff::default()
    };
    let workers = porch::controllers::spawn(&env.porch, &cluster, &config, &backoff, &shutdown_rx);

    let spec = PackageVariantSetSpec {
        upstream: Some(UpstreamSpec {
            package: Some(PackageName {
                repo: "r1".to_string(),
                name: "pkg-a".to_string(),
            }),
            revision: "v1".to_string(),
            tag: String::new(),
        }),
        targets: vec![Target {
            repositories: Some(RepositoryTarget {
                labels: BTreeMap::from([("env".to_string(), "dev".to_string())]),
                ..RepositoryTarget::default()
            }),
            ..Target::default()
        }],
        ..PackageVariantSetSpec::default()
    };
    let set = cluster
        .variant_sets
        .create(PackageVariantSet::new(NS, "pkg-a-dev", spec))
        .unwrap();

    let porch = Arc::clone(&env.porch);
    let drafts = wait_for(Duration::from_secs(30), || {
        let porch = Arc::clone(&porch);
        async move {
            let revisions = tokio::task::spawn_blocking(move || {
                porch.list_package_revisions(NS, None, &CancellationToken::none())
            })
            .await
            .unwrap()
            .unwrap();
            let drafts: Vec<PackageRevision> = revisions
                .into_iter()
                .filter(|r| r.spec.repository_name.starts_with("dev-"))
                .collect();
            (drafts.len() == 2).then_some(drafts)
        }
    })
    .await;

    let variants = cluster.variants.list(NS);
    assert_eq!(variants.len(), 2);
    let mut targets: Vec<String> = variants
        .iter()
        .map(|v| {
            assert!(v.metadata.name.starts_with("pkg-a-dev-"));
            assert_eq!(v.metadata.name.len(), "pkg-a-dev-".len() + 12);
            v.spec.downstream.as_ref().unwrap().repo.clone()
        })
        .collect();
    targets.sort();
    assert_eq!(targets, vec!["dev-1", "dev-2"]);
    for draft in &drafts {
        assert_eq!(draft.spec.package_name, "pkg-a");
        assert_eq!(draft.spec.lifecycle, Lifecycle::Draft);
    }
    assert!(cluster.variant_sets.get(&ObjectKey::of(&set.metadata)).is_some());

    let _ = shutdown_tx.send(true);
    for worker in workers {
        worker.await.unwrap();
    }
}

async fn wait_for<T, F, Fut>(limit: Duration, mut poll: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = poll().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
