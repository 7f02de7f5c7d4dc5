//! Artifact keys.
//!
//! A key names one stored build output. It is derived from the build target
//! label plus a digest of the target's inputs, e.g. `//src/core:lib` with
//! inputs hash `ab12..` becomes `src/core/lib/ab12..`. Segments must be
//! non-empty and may not start with a dot.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Key validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("artifact key is empty")]
    Empty,

    #[error("artifact key exceeds 1024 bytes")]
    TooLong,

    #[error("artifact key has an empty path segment")]
    EmptySegment,

    #[error("artifact key segment '{0}' is not allowed")]
    ForbiddenSegment(String),

    #[error("artifact key contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// Opaque, validated artifact key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Parse and validate a key.
    pub fn parse(raw: impl Into<String>) -> Result<Self, KeyError> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    /// Derive a key from a build target label and the digest of its inputs.
    pub fn for_target(label: &str, inputs_hash: &[u8]) -> Result<Self, KeyError> {
        let path = label.trim_start_matches('/').replace(':', "/");
        Self::parse(format!("{}/{}", path, hex::encode(inputs_hash)))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// SHA-256 digest of the key bytes, used for placement.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.0.as_bytes()).into()
    }
}

fn validate(raw: &str) -> Result<(), KeyError> {
    if raw.is_empty() {
        return Err(KeyError::Empty);
    }
    if raw.len() > MAX_KEY_LEN {
        return Err(KeyError::TooLong);
    }
    if let Some(c) = raw.chars().find(|c| *c == '\\' || *c == '\0' || c.is_control()) {
        return Err(KeyError::ForbiddenChar(c));
    }
    for segment in raw.split('/') {
        if segment.is_empty() {
            return Err(KeyError::EmptySegment);
        }
        if segment.starts_with('.') {
            return Err(KeyError::ForbiddenSegment(segment.to_string()));
        }
    }
    Ok(())
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}
