//! Request/response bodies and the `PlatformResource` manifest rendered
//! for each resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml_bw as serde_yaml;
use squared_core::{ResourceKey, VersionTag, validate_component};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const API_VERSION: &str = "gitops-squared.io/v1alpha1";
pub const KIND: &str = "PlatformResource";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "gitops-squared";
pub const VERSION_ANNOTATION: &str = "gitops-squared.io/version";
pub const PUSHED_AT_ANNOTATION: &str = "gitops-squared.io/pushed-at";

const MAX_REPLICAS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Vm,
    Database,
    Bucket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub size: ResourceSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub replicas: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub name: String,
    pub spec: ResourceSpec,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name is required")]
    MissingName,
    #[error("invalid name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },
    #[error("replicas must be between 1 and 10")]
    Replicas,
}

impl ResourceRequest {
    /// Check the request and fill in defaults: an absent or zero replica
    /// count becomes 1.
    pub fn validate(mut self) -> Result<Self, ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingName);
        }
        validate_component(&self.name).map_err(|err| ValidationError::InvalidName {
            name: self.name.clone(),
            reason: err.to_string(),
        })?;
        if self.spec.replicas > MAX_REPLICAS {
            return Err(ValidationError::Replicas);
        }
        if self.spec.replicas == 0 {
            self.spec.replicas = 1;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformResource {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ResourceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl PlatformResource {
    pub fn new(key: &ResourceKey, spec: ResourceSpec, version: &VersionTag) -> Self {
        let pushed_at = OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .ok()
            .and_then(|now| now.format(&Rfc3339).ok())
            .unwrap_or_default();
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ObjectMeta {
                name: key.name().to_string(),
                namespace: key.namespace().to_string(),
                labels: BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())]),
                annotations: BTreeMap::from([
                    (VERSION_ANNOTATION.to_string(), version.to_string()),
                    (PUSHED_AT_ANNOTATION.to_string(), pushed_at),
                ]),
            },
            spec,
        }
    }

    pub fn to_yaml(&self) -> Result<Vec<u8>, serde_yaml::Error> {
        serde_yaml::to_string(self).map(String::into_bytes)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceResponse {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<ResourceSpec>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ResourceResponse {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            digest: None,
            repository: None,
            spec: None,
            deleted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceList {
    pub resources: Vec<ResourceResponse>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionEntry {
    pub version: String,
    #[serde(rename = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&VersionTag> for VersionEntry {
    fn from(tag: &VersionTag) -> Self {
        let created_at = i64::try_from(tag.unix_seconds())
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .and_then(|ts| ts.format(&Rfc3339).ok());
        Self {
            version: tag.to_string(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionHistory {
    pub name: String,
    pub versions: Vec<VersionEntry>,
}
