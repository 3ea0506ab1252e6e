use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::StoreError;

/// Content digest (`algorithm:hex`) identifying an immutable blob or manifest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    raw: String,
    split: usize,
}

impl Digest {
    pub fn parse(raw: impl Into<String>) -> Result<Self, StoreError> {
        let raw = raw.into();
        let split = raw
            .find(':')
            .ok_or_else(|| StoreError::invalid_reference(&raw, "expected algorithm:hex"))?;
        let (algorithm, value) = (&raw[..split], &raw[split + 1..]);
        if algorithm.is_empty() || value.is_empty() {
            return Err(StoreError::invalid_reference(&raw, "digest has an empty part"));
        }
        if !algorithm
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "+._-".contains(ch))
        {
            return Err(StoreError::invalid_reference(&raw, "invalid digest algorithm"));
        }
        if !value.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(StoreError::invalid_reference(&raw, "digest value is not hex"));
        }
        if algorithm == "sha256" && value.len() != 64 {
            return Err(StoreError::invalid_reference(
                &raw,
                "sha256 digests are 64 hex characters",
            ));
        }
        let raw = raw.to_ascii_lowercase();
        Ok(Self { raw, split })
    }

    pub fn sha256_from_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self {
            raw: format!("sha256:{}", hex::encode(digest)),
            split: "sha256".len(),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.raw[..self.split]
    }

    pub fn value(&self) -> &str {
        &self.raw[self.split + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when `bytes` hash to this digest. Only sha256 is understood;
    /// other algorithms never verify.
    pub fn verifies(&self, bytes: &[u8]) -> bool {
        self.algorithm() == "sha256" && Self::sha256_from_bytes(bytes) == *self
    }

    /// Short form used in log lines: `sha256:0123456789ab`.
    pub fn short(&self) -> &str {
        let end = (self.split + 13).min(self.raw.len());
        &self.raw[..end]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Digest {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}
