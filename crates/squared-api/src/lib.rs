//! HTTP front end for gitops-squared: validates resource requests, renders
//! them as `PlatformResource` manifests and hands them to the core catalog.

pub mod config;
pub mod http;
pub mod model;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use squared_core::{ArtifactStore, Catalog, OciStore, RegistryLayout, ResourceVersioner};

use crate::config::ServerConfig;

/// Wire the registry client into a catalog with an empty index.
pub fn build_catalog(config: &ServerConfig) -> Result<Catalog> {
    let store: Arc<dyn ArtifactStore> =
        Arc::new(OciStore::new(&config.store).context("failed to create registry client")?);
    let layout = RegistryLayout::new(&config.store.repo_prefix)
        .with_context(|| format!("invalid repository prefix `{}`", config.store.repo_prefix))?;
    Ok(Catalog::in_memory(ResourceVersioner::new(store, layout)))
}

/// Rebuild the index from the registry. An unreachable registry is not
/// fatal: the process starts with an empty index and a stale catalog.
pub fn restore_or_warn(catalog: &Catalog) {
    match catalog.restore() {
        Ok(report) => {
            for key in report.skipped.iter().chain(&report.collisions) {
                tracing::warn!(resource = %key, "resource left out of restored index");
            }
            if report.catalog.is_none() {
                tracing::warn!("catalog could not be republished after restore");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "restore failed; starting with an empty index");
        }
    }
}
