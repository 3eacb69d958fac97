//! Data-item identifiers.

use std::{fmt, str::FromStr};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The identity of a data item: SHA-256 over its raw signature bytes.
///
/// Rendered as unpadded base64url everywhere it leaves the process (JSON,
/// object keys, filesystem paths).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataItemId([u8; 32]);

impl DataItemId {
    /// Derives the id from the raw signature field.
    pub fn from_signature(signature: &[u8]) -> Self {
        let digest: [u8; 32] = Sha256::digest(signature).into();
        Self(digest)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DataItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for DataItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataItemId({self})")
    }
}

/// The string was not 32 base64url-encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid data item id `{input}`")]
pub struct ParseIdError {
    pub input: String,
}

impl FromStr for DataItemId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reject = || ParseIdError { input: s.into() };
        let decoded = URL_SAFE_NO_PAD.decode(s).map_err(|_| reject())?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| reject())?;
        Ok(Self(bytes))
    }
}

impl Serialize for DataItemId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DataItemId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_sha256_of_signature() {
        let id = DataItemId::from_signature(b"signature bytes");
        let expected: [u8; 32] = Sha256::digest(b"signature bytes").into();
        assert_eq!(id.as_bytes(), &expected);
    }

    #[test]
    fn display_round_trips() {
        let id = DataItemId::from_signature(&[7u8; 64]);
        let rendered = id.to_string();
        assert_eq!(rendered.len(), 43); // 32 bytes, unpadded base64
        assert_eq!(rendered.parse::<DataItemId>().unwrap(), id);
    }

    #[test]
    fn rejects_wrong_length_and_non_base64() {
        assert!("short".parse::<DataItemId>().is_err());
        assert!("!!!not-base64!!!".parse::<DataItemId>().is_err());
    }
}
