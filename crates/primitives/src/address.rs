//! Native-address derivation from owner public keys.
//!
//! Each signature scheme has its own notion of a human-facing account
//! address. The payment service, the blocklist and the `x-paid-by` header
//! all speak native addresses, never raw public keys.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::signature::SignatureType;

/// A scheme-native account address.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct NativeAddress(String);

impl NativeAddress {
    /// Derives the address for `owner` under `signature_type`.
    pub fn derive(signature_type: SignatureType, owner: &[u8]) -> Self {
        let rendered = match signature_type {
            SignatureType::Arweave => {
                let digest: [u8; 32] = Sha256::digest(owner).into();
                URL_SAFE_NO_PAD.encode(digest)
            }
            SignatureType::Ed25519
            | SignatureType::Solana
            | SignatureType::Aptos
            | SignatureType::MultiAptos => bs58::encode(owner).into_string(),
            SignatureType::Ethereum => ethereum_address(owner),
        };
        Self(rendered)
    }

    /// Wraps an already-rendered address (config, headers).
    pub fn from_rendered(rendered: impl Into<String>) -> Self {
        Self(rendered.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// EIP-55 checksummed address of a 65-byte uncompressed secp256k1 key.
fn ethereum_address(owner: &[u8]) -> String {
    // Strip the 0x04 SEC1 prefix; the address is the low 20 bytes of the
    // keccak of the raw point.
    let point = owner.get(1..).unwrap_or(owner);
    let digest: [u8; 32] = Keccak256::digest(point).into();
    let raw = &digest[12..];

    let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
    let casing: [u8; 32] = Keccak256::digest(hex.as_bytes()).into();
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, ch) in hex.chars().enumerate() {
        let nibble = (casing[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0xf;
        if ch.is_ascii_alphabetic() && nibble >= 8 {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}
