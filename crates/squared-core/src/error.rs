//! Error types for registry access, catalog mutation and archive assembly.

use std::io;

use thiserror::Error;

use crate::resource::ResourceKey;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("registry {registry} is unavailable: {reason}")]
    Unavailable { registry: String, reason: String },
    #[error("{repository}@{reference} was not found")]
    NotFound {
        repository: String,
        reference: String,
    },
    #[error("invalid reference `{value}`: {reason}")]
    InvalidReference { value: String, reason: String },
    #[error("{repository}@{reference} is missing layer {digest}")]
    MissingLayer {
        repository: String,
        reference: String,
        digest: String,
    },
    #[error("malformed artifact {repository}@{reference}: {reason}")]
    MalformedArtifact {
        repository: String,
        reference: String,
        reason: String,
    },
    #[error("tag {tag} already exists in {repository}")]
    TagConflict { repository: String, tag: String },
    #[error("deadline passed before {operation} on {repository}")]
    DeadlineExceeded {
        repository: String,
        operation: String,
    },
    #[error("registry returned {status} for {operation}: {body}")]
    Registry {
        operation: String,
        status: u16,
        body: String,
    },
}

impl StoreError {
    pub fn invalid_reference(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(repository: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::NotFound {
            repository: repository.into(),
            reference: reference.into(),
        }
    }

    pub fn malformed(
        repository: impl Into<String>,
        reference: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedArtifact {
            repository: repository.into(),
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }

    /// Artifact exists but cannot be read back as a resource version.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MissingLayer { .. } | Self::MalformedArtifact { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("resources {first} and {second} both flatten to {file}")]
    FileNameCollision {
        file: String,
        first: String,
        second: String,
    },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("resource {key} not found")]
    NotFound { key: ResourceKey },
    #[error("failed to render manifest for {key}: {reason}")]
    Render { key: ResourceKey, reason: String },
    #[error("{key} would share catalog file {file} with {holder}")]
    FileNameTaken {
        key: ResourceKey,
        holder: ResourceKey,
        file: String,
    },
    #[error("failed to assemble catalog: {0}")]
    Assemble(#[from] AssembleError),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Store(err) => err.is_not_found(),
            _ => false,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_unavailable())
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_deadline_exceeded())
    }
}
