//! The in-memory view of desired state and the aggregate artifact built
//! from it.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{CatalogError, StoreError};
use crate::resource::ResourceKey;
use crate::store::{Digest, VersionTag, ensure_before};
use crate::versioner::ResourceVersioner;

mod assemble;
mod index;
mod restore;

pub use assemble::{assemble, read_archive};
pub use index::{CatalogIndex, InMemoryIndex};
pub use restore::RestoreReport;

/// Result of a successful publish or retract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub key: ResourceKey,
    pub digest: Digest,
    pub version: VersionTag,
    /// Digest of the republished catalog, `None` if that push failed and
    /// the catalog is now stale.
    pub catalog: Option<Digest>,
}

/// Versioner, index and catalog publication behind one commit lock.
///
/// Every mutation runs push, index update and catalog republish as a single
/// critical section, so the published catalog always reflects a prefix of
/// the committed mutations. Reads go to the index and never wait on it.
pub struct Catalog {
    versioner: ResourceVersioner,
    index: Box<dyn CatalogIndex>,
    commit: Mutex<()>,
    stale: AtomicBool,
}

impl Catalog {
    pub fn new(versioner: ResourceVersioner, index: impl CatalogIndex + 'static) -> Self {
        Self {
            versioner,
            index: Box::new(index),
            commit: Mutex::new(()),
            // Nothing has been published yet.
            stale: AtomicBool::new(true),
        }
    }

    pub fn in_memory(versioner: ResourceVersioner) -> Self {
        Self::new(versioner, InMemoryIndex::new())
    }

    pub fn versioner(&self) -> &ResourceVersioner {
        &self.versioner
    }

    pub fn publish(&self, key: ResourceKey, manifest: Vec<u8>) -> Result<Committed, CatalogError> {
        self.publish_with(key, |_| Ok::<_, Infallible>(manifest.clone()))
    }

    /// Publish a manifest rendered for the version tag it will be stored
    /// under. The rendered bytes are both pushed and indexed.
    pub fn publish_with<F, E>(&self, key: ResourceKey, render: F) -> Result<Committed, CatalogError>
    where
        F: FnMut(&VersionTag) -> Result<Vec<u8>, E>,
        E: Display,
    {
        self.publish_before(key, None, render)
    }

    /// [`Self::publish_with`] that gives up once `deadline` has passed.
    ///
    /// The deadline is checked after the commit lock is taken and before each
    /// registry write of the new version. A publish that misses it leaves the
    /// index and `latest` untouched.
    pub fn publish_before<F, E>(
        &self,
        key: ResourceKey,
        deadline: Option<Instant>,
        mut render: F,
    ) -> Result<Committed, CatalogError>
    where
        F: FnMut(&VersionTag) -> Result<Vec<u8>, E>,
        E: Display,
    {
        let _commit = self.commit.lock();
        self.ensure_time_left(&key, deadline)?;
        self.ensure_file_name_free(&key)?;
        let (receipt, manifest) = self.resync_on_conflict(&key, || {
            let tag = self.versioner.next_tag(&key);
            let manifest = render(&tag).map_err(|err| CatalogError::Render {
                key: key.clone(),
                reason: err.to_string(),
            })?;
            let receipt = self
                .versioner
                .publish_as(&key, &tag, manifest.clone(), deadline)?;
            Ok((receipt, manifest))
        })?;
        self.index.set(key.clone(), manifest);
        let catalog = self.republish_committed();
        tracing::info!(resource = %key, version = %receipt.tag, "resource.published");
        Ok(Committed {
            key,
            digest: receipt.digest,
            version: receipt.tag,
            catalog,
        })
    }

    /// Tombstone a live resource and drop it from the index.
    pub fn retract(&self, key: &ResourceKey) -> Result<Committed, CatalogError> {
        self.retract_before(key, None)
    }

    /// [`Self::retract`] bounded by `deadline` like [`Self::publish_before`].
    pub fn retract_before(
        &self,
        key: &ResourceKey,
        deadline: Option<Instant>,
    ) -> Result<Committed, CatalogError> {
        let _commit = self.commit.lock();
        if !self.index.contains(key) {
            return Err(CatalogError::NotFound { key: key.clone() });
        }
        self.ensure_time_left(key, deadline)?;
        let receipt =
            self.resync_on_conflict(key, || Ok(self.versioner.retract(key, deadline)?))?;
        self.index.delete(key);
        let catalog = self.republish_committed();
        tracing::info!(resource = %key, version = %receipt.tag, "resource.retracted");
        Ok(Committed {
            key: key.clone(),
            digest: receipt.digest,
            version: receipt.tag,
            catalog,
        })
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Vec<u8>> {
        self.index.get(key)
    }

    pub fn list(&self) -> BTreeMap<ResourceKey, Vec<u8>> {
        self.index.snapshot()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Version tags in the registry for `key`, oldest first. Includes the
    /// tombstones of retracted resources.
    pub fn history(&self, key: &ResourceKey) -> Result<Vec<VersionTag>, CatalogError> {
        Ok(self.versioner.history(key)?)
    }

    /// Whether the registry's catalog may lag behind the index.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Rebuild and push the catalog from the current index.
    pub fn republish(&self) -> Result<Digest, CatalogError> {
        let _commit = self.commit.lock();
        self.push_catalog()
    }

    /// Replace the index with the live resources found in the registry and
    /// republish the catalog, even when nothing was restored.
    pub fn restore(&self) -> Result<RestoreReport, CatalogError> {
        let _commit = self.commit.lock();
        let mut report = RestoreReport::default();
        let live = restore::collect(&self.versioner, &mut report).inspect_err(|_| {
            self.stale.store(true, Ordering::SeqCst);
        })?;
        self.index.replace(live);
        report.catalog = self.republish_committed();
        tracing::info!(
            restored = report.restored,
            tombstoned = report.tombstoned,
            skipped = report.skipped.len(),
            malformed = report.malformed_paths.len(),
            collisions = report.collisions.len(),
            "catalog.restored"
        );
        Ok(report)
    }

    /// Run `push` once more after a tag conflict, with the tag sequence moved
    /// past the versions already in the registry.
    fn resync_on_conflict<T>(
        &self,
        key: &ResourceKey,
        mut push: impl FnMut() -> Result<T, CatalogError>,
    ) -> Result<T, CatalogError> {
        match push() {
            Err(CatalogError::Store(StoreError::TagConflict { tag, .. })) => {
                tracing::warn!(resource = %key, tag = %tag, "version tag taken; resyncing");
                self.versioner.resync(key)?;
                push()
            }
            other => other,
        }
    }

    fn ensure_time_left(
        &self,
        key: &ResourceKey,
        deadline: Option<Instant>,
    ) -> Result<(), CatalogError> {
        let repo = self.versioner.layout().resource(key)?;
        Ok(ensure_before(deadline, &repo, "commit")?)
    }

    /// Two live resources must not flatten to the same archive file, or no
    /// catalog could be assembled at all.
    fn ensure_file_name_free(&self, key: &ResourceKey) -> Result<(), CatalogError> {
        let stem = key.file_stem();
        let holder = self
            .index
            .snapshot()
            .into_keys()
            .find(|live| live != key && live.file_stem() == stem);
        match holder {
            Some(holder) => Err(CatalogError::FileNameTaken {
                key: key.clone(),
                holder,
                file: format!("{stem}.yaml"),
            }),
            None => Ok(()),
        }
    }

    /// Republish after a mutation that already landed; a failure here is
    /// logged and recorded rather than returned.
    fn republish_committed(&self) -> Option<Digest> {
        match self.push_catalog() {
            Ok(digest) => Some(digest),
            Err(err) => {
                tracing::warn!(error = %err, "catalog.push.failed");
                None
            }
        }
    }

    fn push_catalog(&self) -> Result<Digest, CatalogError> {
        let entries = self.index.snapshot();
        let pushed = assemble(&entries)
            .map_err(CatalogError::from)
            .and_then(|archive| Ok(self.versioner.publish_catalog(archive)?));
        match pushed {
            Ok(digest) => {
                self.stale.store(false, Ordering::SeqCst);
                tracing::info!(
                    resources = entries.len(),
                    digest = %digest.short(),
                    "catalog.pushed"
                );
                Ok(digest)
            }
            Err(err) => {
                self.stale.store(true, Ordering::SeqCst);
                Err(err)
            }
        }
    }
}
