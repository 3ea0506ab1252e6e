//! Content-addressable artifact store: push, pull and enumerate tagged
//! blobs in an OCI registry.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::StoreError;

mod digest;
pub mod manifest;
mod memory;
mod oci;
mod reference;

pub use digest::Digest;
pub use memory::MemoryStore;
pub use oci::OciStore;
pub use reference::{LATEST, Reference, RepoPath, VersionTag};

/// String key/value pairs attached to manifests and layers.
pub type Annotations = BTreeMap<String, String>;

pub const ARTIFACT_TYPE_RESOURCE: &str = "application/vnd.gitops-squared.resource.v1";
pub const MEDIA_TYPE_RESOURCE_YAML: &str = "application/vnd.gitops-squared.manifest.v1+yaml";
pub const MEDIA_TYPE_FLUX_CONTENT: &str = "application/vnd.cncf.flux.content.v1.tar+gzip";
pub const MEDIA_TYPE_FLUX_CONFIG: &str = "application/vnd.cncf.flux.config.v1+json";

pub const ANNOTATION_RESOURCE_NAME: &str = "io.gitops-squared.resource.name";
pub const ANNOTATION_RESOURCE_NAMESPACE: &str = "io.gitops-squared.resource.namespace";
pub const ANNOTATION_RESOURCE_VERSION: &str = "io.gitops-squared.resource.version";
pub const ANNOTATION_RESOURCE_DELETED: &str = "io.gitops-squared.resource.deleted";
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Registry access used by the versioner and the restore procedure.
///
/// Every push writes the manifest under its version tag first and then
/// reassigns `latest` to it; no tag other than `latest` is ever replaced.
/// Implementations never retry; retry policy belongs to callers.
pub trait ArtifactStore: Send + Sync {
    /// Push an immutable version under `tag` and move `latest` to it.
    fn push(
        &self,
        repo: &RepoPath,
        tag: &VersionTag,
        request: PushRequest,
    ) -> Result<PushReceipt, StoreError>;

    /// Replace whatever `latest` points at without creating a version tag.
    fn push_latest(&self, repo: &RepoPath, request: PushRequest) -> Result<Digest, StoreError>;

    fn pull(&self, repo: &RepoPath, reference: &Reference) -> Result<PulledArtifact, StoreError>;

    /// Every repository at or below `prefix`, sorted.
    fn list_repositories(&self, prefix: &RepoPath) -> Result<Vec<RepoPath>, StoreError>;

    /// All tags in `repo`, including `latest`.
    fn list_tags(&self, repo: &RepoPath) -> Result<Vec<String>, StoreError>;

    /// Push a deletion marker as a new version. It joins the same version
    /// chain and becomes `latest` like any other push.
    fn push_tombstone(
        &self,
        repo: &RepoPath,
        tag: &VersionTag,
        marker: Vec<u8>,
        mut annotations: Annotations,
        deadline: Option<Instant>,
    ) -> Result<PushReceipt, StoreError> {
        annotations.insert(ANNOTATION_RESOURCE_DELETED.to_string(), "true".to_string());
        let mut request = PushRequest::new(MEDIA_TYPE_RESOURCE_YAML, marker)
            .with_artifact_type(ARTIFACT_TYPE_RESOURCE)
            .with_layer_annotations(annotations)
            .with_annotation(ANNOTATION_RESOURCE_DELETED, "true");
        request.deadline = deadline;
        self.push(repo, tag, request)
    }
}

/// One single-layer artifact to push.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub artifact_type: Option<String>,
    pub config_media_type: String,
    pub config: Vec<u8>,
    pub layer_media_type: String,
    pub payload: Vec<u8>,
    pub layer_annotations: Annotations,
    pub annotations: Annotations,
    /// Past this instant the store refuses to start another registry write,
    /// so a version whose caller gave up never becomes `latest`.
    pub deadline: Option<Instant>,
}

impl PushRequest {
    /// A request with the OCI empty config (`{}`).
    pub fn new(layer_media_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            artifact_type: None,
            config_media_type: manifest::MEDIA_TYPE_EMPTY.to_string(),
            config: b"{}".to_vec(),
            layer_media_type: layer_media_type.into(),
            payload,
            layer_annotations: Annotations::new(),
            annotations: Annotations::new(),
            deadline: None,
        }
    }

    pub fn with_artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    pub fn with_config(mut self, media_type: impl Into<String>, config: Vec<u8>) -> Self {
        self.config_media_type = media_type.into();
        self.config = config;
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_layer_annotation(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.layer_annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_layer_annotations(mut self, annotations: Annotations) -> Self {
        self.layer_annotations.extend(annotations);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stamp the creation time unless the caller already set one.
    pub(crate) fn stamped(mut self) -> Self {
        if !self.annotations.contains_key(ANNOTATION_CREATED) {
            let now = time::OffsetDateTime::now_utc()
                .replace_nanosecond(0)
                .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
            if let Ok(created) = now.format(&time::format_description::well_known::Rfc3339) {
                self.annotations.insert(ANNOTATION_CREATED.to_string(), created);
            }
        }
        self
    }
}

/// Fail with [`StoreError::DeadlineExceeded`] once `deadline` has passed.
pub(crate) fn ensure_before(
    deadline: Option<Instant>,
    repo: &RepoPath,
    operation: &str,
) -> Result<(), StoreError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(StoreError::DeadlineExceeded {
            repository: repo.to_string(),
            operation: operation.to_string(),
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub digest: Digest,
    pub tag: VersionTag,
}

/// Payload and merged annotations of a pulled artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledArtifact {
    pub digest: Digest,
    pub payload: Vec<u8>,
    pub annotations: Annotations,
}

impl PulledArtifact {
    pub fn is_tombstone(&self) -> bool {
        self.annotations
            .get(ANNOTATION_RESOURCE_DELETED)
            .is_some_and(|value| value == "true")
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}
