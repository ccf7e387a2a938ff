//! Content identifiers (`sha256:<hex>`).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{KraError, Result};

const SHA256_PREFIX: &str = "sha256:";

/// A sha256 content identifier, always rendered as `sha256:<64 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Build from a bare lowercase hex digest.
    pub fn from_hex(hex: &str) -> Result<Self> {
        Self::parse(&format!("{SHA256_PREFIX}{hex}"))
    }

    /// Build from the raw output of a sha256 hasher.
    pub fn from_sha256(digest: &[u8]) -> Self {
        Self(format!("{SHA256_PREFIX}{}", hex::encode(digest)))
    }

    /// Parse a prefixed content id.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s.strip_prefix(SHA256_PREFIX).ok_or_else(|| {
            KraError::ArchiveDecode(format!("content id must start with sha256: ({s})"))
        })?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(KraError::ArchiveDecode(format!(
                "content id is not a sha256 digest: {s}"
            )));
        }
        Ok(Self(format!("{SHA256_PREFIX}{}", hex.to_ascii_lowercase())))
    }

    /// The hex part without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256_PREFIX.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentId {
    type Error = KraError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}
