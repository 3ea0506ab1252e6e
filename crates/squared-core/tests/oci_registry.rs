use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use squared_core::{
    ArtifactStore, Digest, OciStore, PushRequest, Reference, RepoPath, StoreConfig, StoreError,
    VersionTag,
};
use tiny_http::{Header, Method, Request, Response, Server};
use url::Url;

const CATALOG_PAGE: usize = 2;

/// Just enough of the distribution API to exercise the client.
#[derive(Default)]
struct Registry {
    blobs: HashMap<Digest, Vec<u8>>,
    manifests: HashMap<(String, String), Vec<u8>>,
    tags: BTreeMap<String, BTreeSet<String>>,
    manifest_puts: Vec<String>,
    uploads: usize,
}

type Shared = Arc<Mutex<Registry>>;
type Reply = Response<std::io::Cursor<Vec<u8>>>;

fn reply(status: u16, body: Vec<u8>) -> Reply {
    Response::from_data(body).with_status_code(status)
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("valid header")
}

fn handle(registry: &Shared, request: &mut Request) -> Reply {
    let url = Url::parse(&format!("http://registry{}", request.url())).expect("request url");
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
    let head = *request.method() == Method::Head;
    let path = url.path().trim_start_matches("/v2/").to_string();
    let mut body = Vec::new();
    let _ = request.as_reader().read_to_end(&mut body);
    let mut registry = registry.lock().expect("registry lock");

    if path == "_catalog" {
        let repos: Vec<&String> = registry
            .tags
            .keys()
            .filter(|repo| query.get("last").is_none_or(|last| *repo > last))
            .collect();
        let page: Vec<&String> = repos.iter().take(CATALOG_PAGE).copied().collect();
        let mut response = reply(
            200,
            serde_json::to_vec(&serde_json::json!({ "repositories": page })).expect("json"),
        );
        if repos.len() > CATALOG_PAGE {
            if let Some(last) = page.last() {
                response = response.with_header(header(
                    "Link",
                    &format!("</v2/_catalog?n={CATALOG_PAGE}&last={last}>; rel=\"next\""),
                ));
            }
        }
        return response;
    }
    if let Some(repo) = path.strip_suffix("/tags/list") {
        return match registry.tags.get(repo) {
            Some(tags) => reply(
                200,
                serde_json::to_vec(&serde_json::json!({ "name": repo, "tags": tags }))
                    .expect("json"),
            ),
            None => reply(404, Vec::new()),
        };
    }
    if let Some((repo, _session)) = path.split_once("/blobs/uploads/") {
        return match *request.method() {
            Method::Post => reply(202, Vec::new()).with_header(header(
                "Location",
                &format!("/v2/{repo}/blobs/uploads/session-{}", registry.uploads),
            )),
            Method::Put => {
                let Some(digest) = query.get("digest").and_then(|d| Digest::parse(d.as_str()).ok())
                else {
                    return reply(400, Vec::new());
                };
                if !digest.verifies(&body) {
                    return reply(400, b"digest mismatch".to_vec());
                }
                registry.uploads += 1;
                registry.blobs.insert(digest, body);
                reply(201, Vec::new())
            }
            _ => reply(405, Vec::new()),
        };
    }
    if let Some((_repo, digest)) = path.rsplit_once("/blobs/") {
        let blob = Digest::parse(digest)
            .ok()
            .and_then(|digest| registry.blobs.get(&digest).cloned());
        return match blob {
            Some(_) if head => reply(200, Vec::new()),
            Some(bytes) => reply(200, bytes),
            None => reply(404, Vec::new()),
        };
    }
    if let Some((repo, reference)) = path.rsplit_once("/manifests/") {
        let slot = (repo.to_string(), reference.to_string());
        if *request.method() == Method::Put {
            let digest = Digest::sha256_from_bytes(&body);
            registry.manifest_puts.push(reference.to_string());
            registry
                .manifests
                .insert((repo.to_string(), digest.to_string()), body.clone());
            registry.manifests.insert(slot, body);
            registry
                .tags
                .entry(repo.to_string())
                .or_default()
                .insert(reference.to_string());
            return reply(201, Vec::new())
                .with_header(header("Docker-Content-Digest", digest.as_str()));
        }
        return match registry.manifests.get(&slot) {
            Some(_) if head => reply(200, Vec::new()),
            Some(bytes) => reply(200, bytes.clone()).with_header(header(
                "Content-Type",
                "application/vnd.oci.image.manifest.v1+json",
            )),
            None => reply(404, Vec::new()),
        };
    }
    reply(404, Vec::new())
}

struct MockRegistry {
    state: Shared,
    store: OciStore,
}

fn start_registry() -> Result<Option<MockRegistry>> {
    let listener = match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            eprintln!("skipping registry test: {err}");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let addr = listener.local_addr()?;
    let server =
        Server::from_listener(listener, None).map_err(|err| anyhow!("server error: {err}"))?;
    let state: Shared = Arc::default();
    let handler_state = Arc::clone(&state);
    thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let response = handle(&handler_state, &mut request);
            let _ = request.respond(response);
        }
    });

    let mut config = StoreConfig::new(addr.to_string());
    config.timeout = Duration::from_secs(5);
    Ok(Some(MockRegistry {
        state,
        store: OciStore::new(&config)?,
    }))
}

fn repo(path: &str) -> RepoPath {
    RepoPath::parse(path).unwrap()
}

fn yaml_request(payload: &[u8]) -> PushRequest {
    PushRequest::new("application/vnd.gitops-squared.manifest.v1+yaml", payload.to_vec())
        .with_layer_annotation("io.gitops-squared.resource.name", "db")
        .with_annotation("io.gitops-squared.resource.namespace", "default")
}

#[test]
fn push_then_pull_round_trips_through_http() -> Result<()> {
    let Some(registry) = start_registry()? else {
        return Ok(());
    };
    let r = repo("gitops-squared/resources/default/db");
    let receipt = registry
        .store
        .push(&r, &VersionTag::from_unix(1_700_000_000), yaml_request(b"kind: A\n"))?;
    assert_eq!(receipt.tag.as_str(), "v1700000000");

    let latest = registry.store.pull(&r, &Reference::latest())?;
    assert_eq!(latest.payload, b"kind: A\n");
    assert_eq!(latest.digest, receipt.digest);
    assert_eq!(latest.annotation("io.gitops-squared.resource.name"), Some("db"));
    assert_eq!(
        latest.annotation("io.gitops-squared.resource.namespace"),
        Some("default")
    );
    assert!(latest.annotation("org.opencontainers.image.created").is_some());

    let by_digest = registry
        .store
        .pull(&r, &Reference::Digest(receipt.digest.clone()))?;
    assert_eq!(by_digest.payload, b"kind: A\n");

    let puts = registry.state.lock().unwrap().manifest_puts.clone();
    assert_eq!(puts, ["v1700000000", "latest"]);
    Ok(())
}

#[test]
fn second_push_moves_latest_and_keeps_first_version() -> Result<()> {
    let Some(registry) = start_registry()? else {
        return Ok(());
    };
    let r = repo("gitops-squared/resources/default/db");
    registry
        .store
        .push(&r, &VersionTag::from_unix(1), yaml_request(b"one"))?;
    registry
        .store
        .push(&r, &VersionTag::from_unix(2), yaml_request(b"two"))?;

    assert_eq!(registry.store.pull(&r, &Reference::latest())?.payload, b"two");
    assert_eq!(
        registry.store.pull(&r, &Reference::parse("v1")?)?.payload,
        b"one"
    );
    let mut tags = registry.store.list_tags(&r)?;
    tags.sort();
    assert_eq!(tags, ["latest", "v1", "v2"]);
    // The empty config blob is shared and only uploaded once.
    assert_eq!(registry.state.lock().unwrap().uploads, 3);
    Ok(())
}

#[test]
fn existing_version_tags_are_not_overwritten() -> Result<()> {
    let Some(registry) = start_registry()? else {
        return Ok(());
    };
    let r = repo("gitops-squared/resources/default/db");
    let tag = VersionTag::from_unix(7);
    registry.store.push(&r, &tag, yaml_request(b"first"))?;
    let err = registry
        .store
        .push(&r, &tag, yaml_request(b"second"))
        .unwrap_err();
    assert!(matches!(err, StoreError::TagConflict { .. }));
    assert_eq!(registry.store.pull(&r, &Reference::latest())?.payload, b"first");
    Ok(())
}

#[test]
fn expired_deadline_writes_nothing() -> Result<()> {
    let Some(registry) = start_registry()? else {
        return Ok(());
    };
    let r = repo("gitops-squared/resources/default/db");
    let request = yaml_request(b"late").with_deadline(Instant::now());
    let err = registry
        .store
        .push(&r, &VersionTag::from_unix(1), request)
        .unwrap_err();
    assert!(err.is_deadline_exceeded());
    let state = registry.state.lock().unwrap();
    assert_eq!(state.uploads, 0);
    assert!(state.manifest_puts.is_empty());
    Ok(())
}

#[test]
fn lists_repositories_across_pages() -> Result<()> {
    let Some(registry) = start_registry()? else {
        return Ok(());
    };
    for path in [
        "gitops-squared/resources/a/one",
        "gitops-squared/resources/b/two",
        "gitops-squared/resources/c/three",
        "gitops-squared/catalog",
        "other/resources/x/y",
    ] {
        registry
            .store
            .push_latest(&repo(path), PushRequest::new("text/plain", path.as_bytes().to_vec()))?;
    }
    let listed = registry
        .store
        .list_repositories(&repo("gitops-squared/resources"))?;
    let listed: Vec<&str> = listed.iter().map(RepoPath::as_str).collect();
    assert_eq!(
        listed,
        [
            "gitops-squared/resources/a/one",
            "gitops-squared/resources/b/two",
            "gitops-squared/resources/c/three",
        ]
    );
    Ok(())
}

#[test]
fn missing_repository_and_missing_layer_are_distinct() -> Result<()> {
    let Some(registry) = start_registry()? else {
        return Ok(());
    };
    let r = repo("gitops-squared/resources/default/db");
    let err = registry.store.pull(&r, &Reference::latest()).unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    registry
        .store
        .push(&r, &VersionTag::from_unix(1), yaml_request(b"payload"))?;
    registry
        .state
        .lock()
        .unwrap()
        .blobs
        .remove(&Digest::sha256_from_bytes(b"payload"));
    let err = registry.store.pull(&r, &Reference::latest()).unwrap_err();
    assert!(matches!(err, StoreError::MissingLayer { .. }), "unexpected error: {err}");
    assert!(err.is_malformed());
    Ok(())
}

#[test]
fn refused_connection_is_unavailable() -> Result<()> {
    let listener = match TcpListener::bind("127.0.0.1:0") {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            eprintln!("skipping registry test: {err}");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let addr = listener.local_addr()?;
    drop(listener);

    let mut config = StoreConfig::new(addr.to_string());
    config.timeout = Duration::from_secs(2);
    let store = OciStore::new(&config)?;
    let err = store
        .list_repositories(&repo("gitops-squared/resources"))
        .unwrap_err();
    assert!(err.is_unavailable(), "unexpected error: {err}");
    Ok(())
}
