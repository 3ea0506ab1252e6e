//! OCI image manifest (v1.1) encoding shared by the store implementations.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::{Annotations, Digest, PushRequest};

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl Descriptor {
    fn for_blob(media_type: &str, bytes: &[u8], annotations: Annotations) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest: Digest::sha256_from_bytes(bytes),
            size: bytes.len() as u64,
            annotations,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl ImageManifest {
    pub fn parse(repository: &str, reference: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        let manifest: Self = serde_json::from_slice(bytes).map_err(|err| {
            StoreError::malformed(repository, reference, format!("manifest is not valid: {err}"))
        })?;
        if manifest.schema_version != 2 {
            return Err(StoreError::malformed(
                repository,
                reference,
                format!("unsupported schemaVersion {}", manifest.schema_version),
            ));
        }
        Ok(manifest)
    }

    /// The payload layer. Artifacts written by this crate carry exactly one.
    pub fn payload_layer(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<&Descriptor, StoreError> {
        self.layers.first().ok_or_else(|| StoreError::MissingLayer {
            repository: repository.to_string(),
            reference: reference.to_string(),
            digest: "<none>".to_string(),
        })
    }

    /// Manifest annotations overlaid with the payload layer's annotations.
    pub fn merged_annotations(&self) -> Annotations {
        let mut merged = self.annotations.clone();
        if let Some(layer) = self.layers.first() {
            merged.extend(layer.annotations.clone());
        }
        merged
    }
}

/// A manifest ready to push together with the blobs it references.
pub(crate) struct PackedArtifact {
    pub manifest: Vec<u8>,
    pub digest: Digest,
    pub blobs: Vec<(Digest, Vec<u8>)>,
}

pub(crate) fn pack(request: &PushRequest) -> Result<PackedArtifact, StoreError> {
    let config = Descriptor::for_blob(
        &request.config_media_type,
        &request.config,
        Annotations::new(),
    );
    let layer = Descriptor::for_blob(
        &request.layer_media_type,
        &request.payload,
        request.layer_annotations.clone(),
    );
    let manifest = ImageManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
        artifact_type: request.artifact_type.clone(),
        config: config.clone(),
        layers: vec![layer.clone()],
        annotations: request.annotations.clone(),
    };
    let bytes = serde_json::to_vec(&manifest)
        .map_err(|err| StoreError::malformed("<local>", "<unpushed>", err.to_string()))?;
    Ok(PackedArtifact {
        digest: Digest::sha256_from_bytes(&bytes),
        manifest: bytes,
        blobs: vec![
            (config.digest, request.config.clone()),
            (layer.digest, request.payload.clone()),
        ],
    })
}
