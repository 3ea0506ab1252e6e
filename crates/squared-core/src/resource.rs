use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Identity of a declared resource: `namespace/name`. Serialized as that
/// string and validated again when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    namespace: String,
    name: String,
}

impl ResourceKey {
    /// Both segments must be valid registry path components since they
    /// become part of the resource's repository path.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, StoreError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_component(&namespace)?;
        validate_component(&name)?;
        Ok(Self { namespace, name })
    }

    /// Parse a `namespace/name` suffix. Anything that does not split into
    /// exactly two valid segments is rejected.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut parts = raw.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(namespace), Some(name), None) => Self::new(namespace, name),
            _ => Err(StoreError::invalid_reference(
                raw,
                "expected exactly two segments `namespace/name`",
            )),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Archive file stem: the separator replaced with a hyphen.
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = StoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// OCI distribution path component: `[a-z0-9]+([._-][a-z0-9]+)*`.
pub fn validate_component(value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::invalid_reference(value, "path component is empty"));
    }
    if value.len() > 128 {
        return Err(StoreError::invalid_reference(
            value,
            "path component is longer than 128 characters",
        ));
    }
    let mut previous_separator = true;
    for ch in value.chars() {
        match ch {
            'a'..='z' | '0'..='9' => previous_separator = false,
            '.' | '_' | '-' if !previous_separator => previous_separator = true,
            _ => {
                return Err(StoreError::invalid_reference(
                    value,
                    "path components are lowercase alphanumerics joined by `.`, `_` or `-`",
                ));
            }
        }
    }
    if previous_separator {
        return Err(StoreError::invalid_reference(
            value,
            "path component must end with an alphanumeric character",
        ));
    }
    Ok(())
}
