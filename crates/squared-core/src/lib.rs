//! Resource versioning and catalog aggregation for gitops-squared.
//!
//! Every declared resource is stored as an append-only chain of immutable
//! artifact versions in an OCI registry. The process keeps an in-memory
//! index of the latest manifest per resource, assembles that index into a
//! single catalog artifact for the downstream reconciler, and can rebuild
//! the index from the registry's `latest` tags after a restart.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod catalog;
pub mod env;
pub mod error;
pub mod resource;
pub mod store;
pub mod versioner;

pub use catalog::{
    Catalog, CatalogIndex, Committed, InMemoryIndex, RestoreReport, assemble, read_archive,
};
pub use env::StoreConfig;
pub use error::{AssembleError, CatalogError, StoreError};
pub use resource::{ResourceKey, validate_component};
pub use store::{
    Annotations, ArtifactStore, Digest, MemoryStore, OciStore, PulledArtifact, PushReceipt,
    PushRequest, Reference, RepoPath, VersionTag,
};
pub use versioner::{Clock, RegistryLayout, ResourceVersion, ResourceVersioner, SystemClock};
