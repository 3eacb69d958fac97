//! Signature-type lookup table.
//!
//! The first two little-endian bytes of every data item select the signature
//! scheme, which in turn fixes the length of the `signature` and `owner`
//! fields that follow. All length knowledge lives here; the parser and the
//! verifiers only consult [`SignatureConfig`].

use std::fmt;

/// Supported signature schemes, keyed by the on-wire numeric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SignatureType {
    /// RSA-PSS over a 4096-bit Arweave wallet key.
    Arweave = 1,
    /// Plain Ed25519.
    Ed25519 = 2,
    /// secp256k1 over an EIP-191 personal message.
    Ethereum = 3,
    /// Ed25519 with a Solana keypair.
    Solana = 4,
    /// Ed25519 with an Aptos account key.
    Aptos = 5,
    /// Aptos K-of-N multisig: 32 Ed25519 slots plus a signer bitmap.
    MultiAptos = 6,
}

/// Field lengths for one signature scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureConfig {
    pub signature_type: SignatureType,
    /// Exact byte length of the `signature` field.
    pub signature_len: usize,
    /// Exact byte length of the `owner` (public key) field.
    pub owner_len: usize,
}

/// Largest `signature` field across all supported schemes (MultiAptos).
pub const MAX_SIGNATURE_LEN: usize = 64 * 32 + 4;
/// Largest `owner` field across all supported schemes (MultiAptos).
pub const MAX_OWNER_LEN: usize = 32 * 32 + 1;

impl SignatureType {
    /// Looks up a wire value, rejecting unknown types.
    pub fn from_wire(value: u16) -> Result<Self, SignatureTypeError> {
        match value {
            1 => Ok(Self::Arweave),
            2 => Ok(Self::Ed25519),
            3 => Ok(Self::Ethereum),
            4 => Ok(Self::Solana),
            5 => Ok(Self::Aptos),
            6 => Ok(Self::MultiAptos),
            other => Err(SignatureTypeError { value: other }),
        }
    }

    /// The on-wire numeric value.
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Field lengths for this scheme.
    pub const fn config(self) -> SignatureConfig {
        let (signature_len, owner_len) = match self {
            Self::Arweave => (512, 512),
            Self::Ed25519 | Self::Solana | Self::Aptos => (64, 32),
            Self::Ethereum => (65, 65),
            Self::MultiAptos => (MAX_SIGNATURE_LEN, MAX_OWNER_LEN),
        };
        SignatureConfig {
            signature_type: self,
            signature_len,
            owner_len,
        }
    }
}

impl fmt::Display for SignatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Arweave => "arweave",
            Self::Ed25519 => "ed25519",
            Self::Ethereum => "ethereum",
            Self::Solana => "solana",
            Self::Aptos => "aptos",
            Self::MultiAptos => "multiaptos",
        };
        f.write_str(name)
    }
}

impl serde::Serialize for SignatureType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

impl<'de> serde::Deserialize<'de> for SignatureType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = u16::deserialize(deserializer)?;
        Self::from_wire(wire).map_err(serde::de::Error::custom)
    }
}

/// The wire value did not name a supported scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported signature type {value}")]
pub struct SignatureTypeError {
    pub value: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(1, 512, 512; "arweave")]
    #[test_case(2, 64, 32; "ed25519")]
    #[test_case(3, 65, 65; "ethereum")]
    #[test_case(4, 64, 32; "solana")]
    #[test_case(5, 64, 32; "aptos")]
    #[test_case(6, 2052, 1025; "multiaptos")]
    fn field_lengths(wire: u16, sig_len: usize, owner_len: usize) {
        let config = SignatureType::from_wire(wire).unwrap().config();
        assert_eq!(config.signature_len, sig_len);
        assert_eq!(config.owner_len, owner_len);
    }

    #[test]
    fn unknown_types_are_rejected() {
        for wire in [0u16, 7, 255, u16::MAX] {
            let err = SignatureType::from_wire(wire).unwrap_err();
            assert_eq!(err.value, wire);
        }
    }

    #[test]
    fn wire_round_trip() {
        for wire in 1..=6u16 {
            let ty = SignatureType::from_wire(wire).unwrap();
            assert_eq!(ty.as_u16(), wire);
        }
    }
}
