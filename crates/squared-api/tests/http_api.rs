use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use gitops_squared::http::{ServerState, router};
use serde_json::{Value, json};
use squared_core::{
    ArtifactStore, Catalog, Digest, MemoryStore, PulledArtifact, PushReceipt, PushRequest,
    Reference, RegistryLayout, RepoPath, ResourceVersioner, StoreError, VersionTag,
};
use tower::ServiceExt;

/// Wraps a MemoryStore, delaying or failing version pushes.
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
    unavailable: bool,
}

impl ArtifactStore for SlowStore {
    fn push(
        &self,
        repo: &RepoPath,
        tag: &VersionTag,
        request: PushRequest,
    ) -> Result<PushReceipt, StoreError> {
        thread::sleep(self.delay);
        if self.unavailable {
            return Err(StoreError::Unavailable {
                registry: "http://localhost:5000/".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.inner.push(repo, tag, request)
    }

    fn push_latest(&self, repo: &RepoPath, request: PushRequest) -> Result<Digest, StoreError> {
        self.inner.push_latest(repo, request)
    }

    fn pull(&self, repo: &RepoPath, reference: &Reference) -> Result<PulledArtifact, StoreError> {
        self.inner.pull(repo, reference)
    }

    fn list_repositories(&self, prefix: &RepoPath) -> Result<Vec<RepoPath>, StoreError> {
        self.inner.list_repositories(prefix)
    }

    fn list_tags(&self, repo: &RepoPath) -> Result<Vec<String>, StoreError> {
        self.inner.list_tags(repo)
    }
}

fn app_with(store: Arc<dyn ArtifactStore>, timeout: Duration) -> (Router, Arc<Catalog>) {
    let layout = RegistryLayout::new("gitops-squared").unwrap();
    let catalog = Arc::new(Catalog::in_memory(ResourceVersioner::new(store, layout)));
    let state = ServerState::new(Arc::clone(&catalog), "default", timeout);
    (router(state), catalog)
}

fn app() -> (Router, Arc<MemoryStore>, Arc<Catalog>) {
    let store = Arc::new(MemoryStore::new());
    let (router, catalog) = app_with(store.clone(), Duration::from_secs(10));
    (router, store, catalog)
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> Result<(StatusCode, Value)> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json)?)
        }
        None => Body::empty(),
    };
    let response = router.clone().oneshot(builder.body(body)?).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)?
    };
    Ok((status, value))
}

fn database(name: &str) -> Value {
    json!({
        "name": name,
        "spec": { "type": "database", "size": "small", "region": "eu-north-1" }
    })
}

#[tokio::test]
async fn create_then_read_back() -> Result<()> {
    let (router, store, _) = app();
    let (status, created) =
        send(&router, "POST", "/api/v1/resources", Some(database("orders"))).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "orders");
    assert_eq!(created["repository"], "gitops-squared/resources/default/orders");
    assert_eq!(created["spec"]["replicas"], 1);
    let version = created["version"].as_str().unwrap().to_string();
    assert!(version.starts_with('v'));
    assert!(created["digest"].as_str().unwrap().starts_with("sha256:"));

    let (status, fetched) = send(&router, "GET", "/api/v1/resources/orders", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["spec"]["type"], "database");
    assert_eq!(fetched["spec"]["region"], "eu-north-1");

    let (status, listed) = send(&router, "GET", "/api/v1/resources", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["resources"][0]["name"], "orders");

    // The pushed manifest carries the version it was stored under.
    let repo = RepoPath::parse("gitops-squared/resources/default/orders")?;
    let pulled = store.pull(&repo, &Reference::latest())?;
    let yaml = String::from_utf8(pulled.payload)?;
    assert!(yaml.contains(&format!("gitops-squared.io/version: {version}")));
    assert!(yaml.contains("kind: PlatformResource"));
    Ok(())
}

#[tokio::test]
async fn list_is_sorted_by_name() -> Result<()> {
    let (router, _, _) = app();
    for name in ["web", "cache", "orders"] {
        let (status, _) = send(&router, "POST", "/api/v1/resources", Some(database(name))).await?;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (_, listed) = send(&router, "GET", "/api/v1/resources", None).await?;
    let names: Vec<&str> = listed["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["cache", "orders", "web"]);
    Ok(())
}

#[tokio::test]
async fn invalid_requests_are_rejected() -> Result<()> {
    let (router, _, catalog) = app();
    let cases = [
        json!({ "spec": { "type": "vm", "size": "small" } }),
        json!({ "name": "box", "spec": { "type": "mainframe", "size": "small" } }),
        json!({ "name": "box", "spec": { "type": "vm", "size": "huge" } }),
        json!({ "name": "box", "spec": { "type": "vm", "size": "small", "replicas": 11 } }),
        json!({ "name": "Box", "spec": { "type": "vm", "size": "small" } }),
        json!({ "name": "box" }),
    ];
    for case in cases {
        let (status, body) = send(&router, "POST", "/api/v1/resources", Some(case.clone())).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST, "accepted {case}");
        assert!(body["error"].is_string());
    }

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/resources")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))?;
    let response = router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(catalog.is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_tombstones_and_keeps_history() -> Result<()> {
    let (router, store, _) = app();
    send(&router, "POST", "/api/v1/resources", Some(database("orders"))).await?;

    let (status, deleted) = send(&router, "DELETE", "/api/v1/resources/orders", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["deleted"], true);
    assert!(deleted["version"].is_string());

    let (status, _) = send(&router, "GET", "/api/v1/resources/orders", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&router, "DELETE", "/api/v1/resources/orders", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, history) = send(&router, "GET", "/api/v1/resources/orders/versions", None).await?;
    assert_eq!(status, StatusCode::OK);
    let versions = history["versions"].as_array().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[1]["version"], deleted["version"]);

    let repo = RepoPath::parse("gitops-squared/resources/default/orders")?;
    assert!(store.pull(&repo, &Reference::latest())?.is_tombstone());
    Ok(())
}

#[tokio::test]
async fn unknown_resources_are_not_found() -> Result<()> {
    let (router, _, _) = app();
    for (method, uri) in [
        ("GET", "/api/v1/resources/ghost"),
        ("DELETE", "/api/v1/resources/ghost"),
        ("GET", "/api/v1/resources/ghost/versions"),
    ] {
        let (status, body) = send(&router, method, uri, None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }
    Ok(())
}

#[tokio::test]
async fn health_reports_catalog_staleness() -> Result<()> {
    let (router, _, _) = app();
    let (status, health) = send(&router, "GET", "/healthz", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["catalog_stale"], true);

    send(&router, "POST", "/api/v1/resources", Some(database("orders"))).await?;
    let (_, health) = send(&router, "GET", "/healthz", None).await?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["resources"], 1);
    assert_eq!(health["catalog_stale"], false);
    Ok(())
}

#[tokio::test]
async fn unreachable_registry_is_service_unavailable() -> Result<()> {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::ZERO,
        unavailable: true,
    });
    let (router, catalog) = app_with(store, Duration::from_secs(10));
    let (status, body) =
        send(&router, "POST", "/api/v1/resources", Some(database("orders"))).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("connection refused"));
    assert!(catalog.is_empty());
    Ok(())
}

#[tokio::test]
async fn slow_registry_hits_the_request_deadline() -> Result<()> {
    let store = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(500),
        unavailable: false,
    });
    let (router, catalog) = app_with(store.clone(), Duration::from_millis(50));
    let (status, body) =
        send(&router, "POST", "/api/v1/resources", Some(database("orders"))).await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body["error"].as_str().unwrap().contains("timed out"));

    // The abandoned push finishes after the deadline and must not commit.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(catalog.is_empty());
    let layout = catalog.versioner().layout();
    assert!(store.inner.list_repositories(layout.resources())?.is_empty());
    Ok(())
}
