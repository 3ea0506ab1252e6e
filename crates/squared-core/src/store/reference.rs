use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;
use crate::resource::validate_component;

use super::Digest;

/// The one mutable alias every read resolves through.
pub const LATEST: &str = "latest";

/// Repository path inside the registry, e.g. `gitops-squared/resources/default/db`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoPath(String);

impl RepoPath {
    pub fn parse(raw: impl Into<String>) -> Result<Self, StoreError> {
        let raw = raw.into();
        if raw.len() > 255 {
            return Err(StoreError::invalid_reference(
                &raw,
                "repository path is longer than 255 characters",
            ));
        }
        for component in raw.split('/') {
            validate_component(component)
                .map_err(|_| StoreError::invalid_reference(&raw, "invalid repository path"))?;
        }
        Ok(Self(raw))
    }

    pub fn join(&self, component: &str) -> Result<Self, StoreError> {
        Self::parse(format!("{}/{component}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part of the path below `prefix`, if this path lives under it.
    pub fn strip_prefix(&self, prefix: &RepoPath) -> Option<&str> {
        self.0
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RepoPath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Immutable, time-derived version tag such as `v1718035200`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionTag {
    raw: String,
    seconds: u64,
}

impl VersionTag {
    pub fn from_unix(seconds: u64) -> Self {
        Self {
            raw: format!("v{seconds}"),
            seconds,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let seconds = raw
            .strip_prefix('v')
            .filter(|digits| !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u64>().ok())
            .ok_or_else(|| StoreError::invalid_reference(raw, "version tags look like v<unix>"))?;
        Ok(Self::from_unix(seconds))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn unix_seconds(&self) -> u64 {
        self.seconds
    }
}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seconds.cmp(&other.seconds)
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// What a pull resolves: a tag (including `latest`) or a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    pub fn latest() -> Self {
        Self::Tag(LATEST.to_string())
    }

    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        if raw.contains(':') {
            return Digest::parse(raw).map(Self::Digest);
        }
        validate_tag(raw)?;
        Ok(Self::Tag(raw.to_string()))
    }

    pub fn is_latest(&self) -> bool {
        matches!(self, Self::Tag(tag) if tag == LATEST)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(tag) => tag,
            Self::Digest(digest) => digest.as_str(),
        }
    }
}

impl From<&VersionTag> for Reference {
    fn from(tag: &VersionTag) -> Self {
        Self::Tag(tag.as_str().to_string())
    }
}

impl From<Digest> for Reference {
    fn from(digest: Digest) -> Self {
        Self::Digest(digest)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OCI tag grammar: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
fn validate_tag(raw: &str) -> Result<(), StoreError> {
    let mut chars = raw.chars();
    let first_ok = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if !first_ok || raw.len() > 128 {
        return Err(StoreError::invalid_reference(raw, "invalid tag"));
    }
    if !chars.all(|ch| ch.is_ascii_alphanumeric() || "._-".contains(ch)) {
        return Err(StoreError::invalid_reference(raw, "invalid tag"));
    }
    Ok(())
}
