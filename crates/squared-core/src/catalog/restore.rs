use std::collections::{BTreeMap, HashMap};

use crate::error::StoreError;
use crate::resource::ResourceKey;
use crate::store::Digest;
use crate::versioner::ResourceVersioner;

/// Outcome of rebuilding the index from the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Live resources now in the index.
    pub restored: usize,
    /// Resources whose `latest` is a tombstone.
    pub tombstoned: usize,
    /// Resources that could not be pulled or decoded.
    pub skipped: Vec<ResourceKey>,
    /// Repositories under the resource prefix that are not `namespace/name`.
    pub malformed_paths: Vec<String>,
    /// Live resources left out because an earlier key already claimed their
    /// catalog file name.
    pub collisions: Vec<ResourceKey>,
    /// Digest of the republished catalog; `None` when that push failed.
    pub catalog: Option<Digest>,
}

/// Pull `latest` of every resource repository and keep the live ones.
///
/// Only a failure to enumerate repositories is fatal. Anything wrong with
/// a single resource lands in the report instead.
pub(crate) fn collect(
    versioner: &ResourceVersioner,
    report: &mut RestoreReport,
) -> Result<BTreeMap<ResourceKey, Vec<u8>>, StoreError> {
    let layout = versioner.layout();
    let repos = versioner.store().list_repositories(layout.resources())?;

    let mut live = BTreeMap::new();
    for repo in repos {
        let Some(key) = layout.key_for(&repo) else {
            if repo != *layout.resources() {
                tracing::debug!(repository = %repo, "restore.path.malformed");
                report.malformed_paths.push(repo.to_string());
            }
            continue;
        };
        let latest = versioner.fetch_latest(&key);
        if let Some(tag) = latest.as_ref().ok().and_then(|version| version.version()) {
            versioner.observe(&key, &tag);
        }
        match latest {
            Ok(version) if version.deleted => {
                tracing::debug!(resource = %key, "restore.tombstone.skipped");
                report.tombstoned += 1;
            }
            Ok(version) => {
                live.insert(key, version.manifest);
            }
            Err(err) => {
                tracing::warn!(resource = %key, error = %err, "restore.resource.skipped");
                report.skipped.push(key);
            }
        }
    }
    drop_file_name_collisions(&mut live, report);
    report.restored = live.len();
    Ok(live)
}

/// Keep the first key, in key order, for every catalog file name.
fn drop_file_name_collisions(
    live: &mut BTreeMap<ResourceKey, Vec<u8>>,
    report: &mut RestoreReport,
) {
    let mut claimed: HashMap<String, ResourceKey> = HashMap::new();
    let mut colliding = Vec::new();
    for key in live.keys() {
        match claimed.get(&key.file_stem()) {
            Some(holder) => {
                tracing::warn!(resource = %key, holder = %holder, "restore.file_name.collision");
                colliding.push(key.clone());
            }
            None => {
                claimed.insert(key.file_stem(), key.clone());
            }
        }
    }
    for key in &colliding {
        live.remove(key);
    }
    report.collisions.extend(colliding);
}
