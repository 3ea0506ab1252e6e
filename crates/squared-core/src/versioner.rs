//! Turns a resource's current manifest into immutable artifact versions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::resource::ResourceKey;
use crate::store::{
    ANNOTATION_RESOURCE_NAME, ANNOTATION_RESOURCE_NAMESPACE, ANNOTATION_RESOURCE_VERSION,
    ANNOTATION_TITLE, ARTIFACT_TYPE_RESOURCE, Annotations, ArtifactStore, Digest,
    MEDIA_TYPE_FLUX_CONFIG, MEDIA_TYPE_FLUX_CONTENT, MEDIA_TYPE_RESOURCE_YAML, PushReceipt,
    PushRequest, Reference, RepoPath, VersionTag,
};

const MANIFEST_TITLE: &str = "platformresource.yaml";
const CATALOG_TITLE: &str = "catalog.tar.gz";

/// Wall-clock source for version tags.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_secs())
            .unwrap_or(0)
    }
}

/// Where resources and the catalog live in the registry:
///
/// ```text
/// <prefix>/resources/<namespace>/<name>
/// <prefix>/catalog
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryLayout {
    resources: RepoPath,
    catalog: RepoPath,
}

impl RegistryLayout {
    pub fn new(prefix: &str) -> Result<Self, StoreError> {
        let root = RepoPath::parse(prefix.trim_matches('/'))?;
        Ok(Self {
            resources: root.join("resources")?,
            catalog: root.join("catalog")?,
        })
    }

    pub fn resources(&self) -> &RepoPath {
        &self.resources
    }

    pub fn catalog(&self) -> &RepoPath {
        &self.catalog
    }

    pub fn resource(&self, key: &ResourceKey) -> Result<RepoPath, StoreError> {
        self.resources.join(key.namespace())?.join(key.name())
    }

    /// Map a repository below [`Self::resources`] back to its key. Paths
    /// that do not split into exactly `namespace/name` yield `None`.
    pub fn key_for(&self, repo: &RepoPath) -> Option<ResourceKey> {
        repo.strip_prefix(&self.resources)
            .and_then(|suffix| ResourceKey::parse(suffix).ok())
    }
}

/// One pulled version of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceVersion {
    pub key: ResourceKey,
    pub digest: Digest,
    pub manifest: Vec<u8>,
    pub annotations: Annotations,
    pub deleted: bool,
}

impl ResourceVersion {
    pub fn version(&self) -> Option<VersionTag> {
        self.annotations
            .get(ANNOTATION_RESOURCE_VERSION)
            .and_then(|raw| VersionTag::parse(raw).ok())
    }
}

/// Allocates `v<unix>` tags that never repeat for the same resource within
/// this process: a second publish in the same clock second takes the next
/// second instead of colliding. Tags pushed by an earlier process are only
/// known after [`ResourceVersioner::resync`].
struct TagSequencer {
    clock: Arc<dyn Clock>,
    issued: Mutex<HashMap<ResourceKey, u64>>,
}

impl TagSequencer {
    fn next(&self, key: &ResourceKey) -> VersionTag {
        let now = self.clock.now_unix();
        let mut issued = self.issued.lock();
        let seconds = match issued.get(key) {
            Some(last) if *last >= now => last + 1,
            _ => now,
        };
        issued.insert(key.clone(), seconds);
        VersionTag::from_unix(seconds)
    }

    fn advance_past(&self, key: &ResourceKey, seconds: u64) {
        let mut issued = self.issued.lock();
        let last = issued.entry(key.clone()).or_insert(seconds);
        *last = (*last).max(seconds);
    }
}

pub struct ResourceVersioner {
    store: Arc<dyn ArtifactStore>,
    layout: RegistryLayout,
    tags: TagSequencer,
}

impl ResourceVersioner {
    pub fn new(store: Arc<dyn ArtifactStore>, layout: RegistryLayout) -> Self {
        Self::with_clock(store, layout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ArtifactStore>,
        layout: RegistryLayout,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            layout,
            tags: TagSequencer {
                clock,
                issued: Mutex::new(HashMap::new()),
            },
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn layout(&self) -> &RegistryLayout {
        &self.layout
    }

    /// Allocate the tag the next version of `key` will be pushed under.
    pub fn next_tag(&self, key: &ResourceKey) -> VersionTag {
        self.tags.next(key)
    }

    /// Move the tag sequence of `key` past every version already in the
    /// registry, so the next tag cannot collide with one an earlier process
    /// pushed ahead of the clock.
    pub fn resync(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let history = match self.history(key) {
            Ok(history) => history,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };
        if let Some(newest) = history.last() {
            self.observe(key, newest);
            tracing::debug!(resource = %key, newest = %newest, "tag sequence resynced");
        }
        Ok(())
    }

    /// Record that `tag` already exists for `key`.
    pub(crate) fn observe(&self, key: &ResourceKey, tag: &VersionTag) {
        self.tags.advance_past(key, tag.unix_seconds());
    }

    pub fn publish(&self, key: &ResourceKey, manifest: Vec<u8>) -> Result<PushReceipt, StoreError> {
        let tag = self.next_tag(key);
        self.publish_as(key, &tag, manifest, None)
    }

    /// Push `manifest` as a new version under a tag from [`Self::next_tag`].
    /// No registry write starts once `deadline` has passed.
    pub fn publish_as(
        &self,
        key: &ResourceKey,
        tag: &VersionTag,
        manifest: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Result<PushReceipt, StoreError> {
        let repo = self.layout.resource(key)?;
        let mut request = PushRequest::new(MEDIA_TYPE_RESOURCE_YAML, manifest)
            .with_artifact_type(ARTIFACT_TYPE_RESOURCE)
            .with_layer_annotation(ANNOTATION_TITLE, MANIFEST_TITLE)
            .with_layer_annotations(resource_annotations(key, tag))
            .with_annotation(ANNOTATION_RESOURCE_NAME, key.name())
            .with_annotation(ANNOTATION_RESOURCE_NAMESPACE, key.namespace());
        request.deadline = deadline;
        let receipt = self.store.push(&repo, tag, request)?;
        tracing::info!(
            resource = %key,
            version = %receipt.tag,
            digest = %receipt.digest.short(),
            "resource.version.pushed"
        );
        Ok(receipt)
    }

    /// Push a tombstone version; `latest` then resolves to the deletion marker.
    pub fn retract(
        &self,
        key: &ResourceKey,
        deadline: Option<Instant>,
    ) -> Result<PushReceipt, StoreError> {
        let repo = self.layout.resource(key)?;
        let tag = self.next_tag(key);
        let marker = format!("# deleted: {key}\n").into_bytes();
        let annotations = resource_annotations(key, &tag);
        let receipt = self
            .store
            .push_tombstone(&repo, &tag, marker, annotations, deadline)?;
        tracing::info!(
            resource = %key,
            version = %receipt.tag,
            digest = %receipt.digest.short(),
            "resource.tombstone.pushed"
        );
        Ok(receipt)
    }

    pub fn fetch_latest(&self, key: &ResourceKey) -> Result<ResourceVersion, StoreError> {
        self.fetch(key, &Reference::latest())
    }

    pub fn fetch(
        &self,
        key: &ResourceKey,
        reference: &Reference,
    ) -> Result<ResourceVersion, StoreError> {
        let repo = self.layout.resource(key)?;
        let pulled = self.store.pull(&repo, reference)?;
        Ok(ResourceVersion {
            key: key.clone(),
            deleted: pulled.is_tombstone(),
            digest: pulled.digest,
            manifest: pulled.payload,
            annotations: pulled.annotations,
        })
    }

    /// Immutable version tags of `key`, oldest first. `latest` and any
    /// foreign tags are left out.
    pub fn history(&self, key: &ResourceKey) -> Result<Vec<VersionTag>, StoreError> {
        let repo = self.layout.resource(key)?;
        let mut tags: Vec<VersionTag> = self
            .store
            .list_tags(&repo)?
            .iter()
            .filter_map(|tag| VersionTag::parse(tag).ok())
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Replace the aggregate catalog. It has no version chain; only
    /// `latest` is written.
    pub fn publish_catalog(&self, archive: Vec<u8>) -> Result<Digest, StoreError> {
        let request = PushRequest::new(MEDIA_TYPE_FLUX_CONTENT, archive)
            .with_config(MEDIA_TYPE_FLUX_CONFIG, b"{}".to_vec())
            .with_layer_annotation(ANNOTATION_TITLE, CATALOG_TITLE);
        self.store.push_latest(self.layout.catalog(), request)
    }
}

fn resource_annotations(key: &ResourceKey, tag: &VersionTag) -> Annotations {
    Annotations::from([
        (ANNOTATION_RESOURCE_NAME.to_string(), key.name().to_string()),
        (
            ANNOTATION_RESOURCE_NAMESPACE.to_string(),
            key.namespace().to_string(),
        ),
        (ANNOTATION_RESOURCE_VERSION.to_string(), tag.to_string()),
    ])
}
