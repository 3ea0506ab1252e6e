use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::error::StoreError;

use super::manifest::{self, ImageManifest};
use super::{
    ArtifactStore, Digest, LATEST, PulledArtifact, PushReceipt, PushRequest, Reference, RepoPath,
    VersionTag, ensure_before,
};

/// In-process registry with the same contract as [`super::OciStore`].
///
/// Each repository keeps its immutable version tags apart from the single
/// `latest` pointer, and a push updates both under one write lock.
#[derive(Default)]
pub struct MemoryStore {
    repos: RwLock<BTreeMap<RepoPath, Repository>>,
}

#[derive(Default)]
struct Repository {
    blobs: HashMap<Digest, Vec<u8>>,
    manifests: HashMap<Digest, Vec<u8>>,
    versions: BTreeMap<String, Digest>,
    latest: Option<Digest>,
}

impl Repository {
    fn resolve(&self, reference: &Reference) -> Option<&Digest> {
        match reference {
            Reference::Tag(tag) if tag == LATEST => self.latest.as_ref(),
            Reference::Tag(tag) => self.versions.get(tag),
            Reference::Digest(digest) => self.manifests.get_key_value(digest).map(|(d, _)| d),
        }
    }

    fn store(&mut self, packed: manifest::PackedArtifact) -> Digest {
        for (digest, bytes) in packed.blobs {
            self.blobs.entry(digest).or_insert(bytes);
        }
        self.manifests.insert(packed.digest.clone(), packed.manifest);
        self.latest = Some(packed.digest.clone());
        packed.digest
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a blob from a repository, leaving manifests that reference it
    /// dangling. Used to simulate partially replicated registries.
    pub fn remove_blob(&self, repo: &RepoPath, digest: &Digest) -> bool {
        self.repos
            .write()
            .get_mut(repo)
            .is_some_and(|repository| repository.blobs.remove(digest).is_some())
    }

    /// Digest `latest` currently points at, if any.
    pub fn latest_digest(&self, repo: &RepoPath) -> Option<Digest> {
        self.repos
            .read()
            .get(repo)
            .and_then(|repository| repository.latest.clone())
    }
}

impl ArtifactStore for MemoryStore {
    fn push(
        &self,
        repo: &RepoPath,
        tag: &VersionTag,
        request: PushRequest,
    ) -> Result<PushReceipt, StoreError> {
        ensure_before(request.deadline, repo, "push")?;
        let packed = manifest::pack(&request.stamped())?;
        let mut repos = self.repos.write();
        let repository = repos.entry(repo.clone()).or_default();
        if repository.versions.contains_key(tag.as_str()) {
            return Err(StoreError::TagConflict {
                repository: repo.to_string(),
                tag: tag.to_string(),
            });
        }
        let digest = repository.store(packed);
        repository
            .versions
            .insert(tag.as_str().to_string(), digest.clone());
        Ok(PushReceipt {
            digest,
            tag: tag.clone(),
        })
    }

    fn push_latest(&self, repo: &RepoPath, request: PushRequest) -> Result<Digest, StoreError> {
        ensure_before(request.deadline, repo, "push")?;
        let packed = manifest::pack(&request.stamped())?;
        let mut repos = self.repos.write();
        Ok(repos.entry(repo.clone()).or_default().store(packed))
    }

    fn pull(&self, repo: &RepoPath, reference: &Reference) -> Result<PulledArtifact, StoreError> {
        let repos = self.repos.read();
        let not_found = || StoreError::not_found(repo.as_str(), reference.as_str());
        let repository = repos.get(repo).ok_or_else(not_found)?;
        let digest = repository.resolve(reference).ok_or_else(not_found)?;
        let bytes = repository.manifests.get(digest).ok_or_else(not_found)?;
        let manifest = ImageManifest::parse(repo.as_str(), reference.as_str(), bytes)?;
        let layer = manifest.payload_layer(repo.as_str(), reference.as_str())?;
        let payload = repository
            .blobs
            .get(&layer.digest)
            .ok_or_else(|| StoreError::MissingLayer {
                repository: repo.to_string(),
                reference: reference.to_string(),
                digest: layer.digest.to_string(),
            })?;
        Ok(PulledArtifact {
            digest: digest.clone(),
            payload: payload.clone(),
            annotations: manifest.merged_annotations(),
        })
    }

    fn list_repositories(&self, prefix: &RepoPath) -> Result<Vec<RepoPath>, StoreError> {
        Ok(self
            .repos
            .read()
            .keys()
            .filter(|repo| *repo == prefix || repo.strip_prefix(prefix).is_some())
            .cloned()
            .collect())
    }

    fn list_tags(&self, repo: &RepoPath) -> Result<Vec<String>, StoreError> {
        let repos = self.repos.read();
        let repository = repos
            .get(repo)
            .ok_or_else(|| StoreError::not_found(repo.as_str(), "tags"))?;
        let mut tags: Vec<String> = repository.versions.keys().cloned().collect();
        if repository.latest.is_some() {
            tags.push(LATEST.to_string());
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::store::ANNOTATION_RESOURCE_DELETED;

    fn repo(path: &str) -> RepoPath {
        RepoPath::parse(path).unwrap()
    }

    #[test]
    fn push_moves_latest_and_keeps_versions() {
        let store = MemoryStore::new();
        let r = repo("p/resources/default/db");
        let first = store
            .push(&r, &VersionTag::from_unix(1), PushRequest::new("text/plain", b"one".to_vec()))
            .unwrap();
        let second = store
            .push(&r, &VersionTag::from_unix(2), PushRequest::new("text/plain", b"two".to_vec()))
            .unwrap();
        assert_ne!(first.digest, second.digest);

        let latest = store.pull(&r, &Reference::latest()).unwrap();
        assert_eq!(latest.payload, b"two");
        assert_eq!(latest.digest, second.digest);
        let old = store.pull(&r, &Reference::parse("v1").unwrap()).unwrap();
        assert_eq!(old.payload, b"one");
        let by_digest = store.pull(&r, &Reference::Digest(first.digest)).unwrap();
        assert_eq!(by_digest.payload, b"one");

        assert_eq!(store.list_tags(&r).unwrap(), ["v1", "v2", "latest"]);
    }

    #[test]
    fn version_tags_are_never_overwritten() {
        let store = MemoryStore::new();
        let r = repo("p/resources/default/db");
        let tag = VersionTag::from_unix(5);
        store
            .push(&r, &tag, PushRequest::new("text/plain", b"a".to_vec()))
            .unwrap();
        let err = store
            .push(&r, &tag, PushRequest::new("text/plain", b"b".to_vec()))
            .unwrap_err();
        assert!(matches!(err, StoreError::TagConflict { .. }));
        assert_eq!(store.pull(&r, &Reference::latest()).unwrap().payload, b"a");
    }

    #[test]
    fn tombstones_join_the_version_chain() {
        let store = MemoryStore::new();
        let r = repo("p/resources/default/db");
        store
            .push(&r, &VersionTag::from_unix(1), PushRequest::new("text/plain", b"a".to_vec()))
            .unwrap();
        let tag = VersionTag::from_unix(2);
        store
            .push_tombstone(&r, &tag, b"# deleted".to_vec(), Default::default(), None)
            .unwrap();
        let latest = store.pull(&r, &Reference::latest()).unwrap();
        assert!(latest.is_tombstone());
        assert_eq!(latest.annotation(ANNOTATION_RESOURCE_DELETED), Some("true"));
        assert!(!store.pull(&r, &Reference::parse("v1").unwrap()).unwrap().is_tombstone());
    }

    #[test]
    fn expired_deadline_leaves_repository_untouched() {
        let store = MemoryStore::new();
        let r = repo("p/resources/default/db");
        let request = PushRequest::new("text/plain", b"late".to_vec())
            .with_deadline(Instant::now());
        let err = store.push(&r, &VersionTag::from_unix(1), request).unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert!(store.list_repositories(&repo("p")).unwrap().is_empty());

        let request = PushRequest::new("text/plain", b"on time".to_vec())
            .with_deadline(Instant::now() + Duration::from_secs(60));
        store.push(&r, &VersionTag::from_unix(1), request).unwrap();
        assert_eq!(store.pull(&r, &Reference::latest()).unwrap().payload, b"on time");
    }

    #[test]
    fn missing_repositories_and_layers_are_distinct_errors() {
        let store = MemoryStore::new();
        let r = repo("p/resources/default/db");
        assert!(store.pull(&r, &Reference::latest()).unwrap_err().is_not_found());

        let request = PushRequest::new("text/plain", b"payload".to_vec());
        store.push(&r, &VersionTag::from_unix(1), request).unwrap();
        assert!(store.remove_blob(&r, &Digest::sha256_from_bytes(b"payload")));
        let err = store.pull(&r, &Reference::latest()).unwrap_err();
        assert!(matches!(err, StoreError::MissingLayer { .. }));
        assert!(
            store
                .pull(&r, &Reference::parse("v9").unwrap())
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn lists_repositories_below_a_prefix() {
        let store = MemoryStore::new();
        for path in ["p/resources/a/b", "p/resources/c/d", "p/catalog", "q/resources/x/y"] {
            store
                .push_latest(&repo(path), PushRequest::new("text/plain", Vec::new()))
                .unwrap();
        }
        let listed = store.list_repositories(&repo("p/resources")).unwrap();
        let listed: Vec<_> = listed.iter().map(RepoPath::as_str).collect();
        assert_eq!(listed, ["p/resources/a/b", "p/resources/c/d"]);
    }
}
