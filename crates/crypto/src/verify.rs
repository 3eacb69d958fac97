//! Per-scheme signature verification over the data-item deep hash.

use anchorage_primitives::{DataItemHeader, SignatureType};
use rsa::{BigUint, Pss, RsaPublicKey};
use secp256k1::{Message, PublicKey, Secp256k1, ecdsa};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::deep_hash::{DeepHashChunk, DeepHashDigest, deep_hash};

/// Builds the signed message for a data item whose payload was reduced to
/// `payload` (see [`crate::deep_hash::StreamedBlob`]).
pub fn data_item_signing_payload(
    header: &DataItemHeader,
    payload: DeepHashDigest,
) -> DeepHashDigest {
    let sig_type = header.signature_type.as_u16().to_string();
    let empty: &[u8] = &[];
    deep_hash(&DeepHashChunk::List(vec![
        DeepHashChunk::Blob(b"dataitem"),
        DeepHashChunk::Blob(b"1"),
        DeepHashChunk::Blob(sig_type.as_bytes()),
        DeepHashChunk::Blob(&header.owner),
        DeepHashChunk::Blob(header.target.as_ref().map_or(empty, |t| &t[..])),
        DeepHashChunk::Blob(header.anchor.as_ref().map_or(empty, |a| &a[..])),
        DeepHashChunk::Blob(&header.tags_bytes),
        DeepHashChunk::Reduced(payload),
    ]))
}

/// Checks `header.signature` over `message` under `header.owner`.
///
/// Returns a plain verdict: malformed keys and malformed signatures are
/// invalid items, not errors.
pub fn verify_data_item(header: &DataItemHeader, message: &DeepHashDigest) -> bool {
    match header.signature_type {
        SignatureType::Arweave => verify_rsa(&header.owner, message, &header.signature),
        SignatureType::Ed25519 | SignatureType::Solana | SignatureType::Aptos => {
            verify_ed25519(&header.owner, message, &header.signature)
        }
        SignatureType::Ethereum => verify_ethereum(&header.owner, message, &header.signature),
        SignatureType::MultiAptos => verify_multi_aptos(&header.owner, message, &header.signature),
    }
}

/// [`verify_data_item`] off the async runtime's worker threads.
///
/// RSA verification in particular is enough CPU to matter under thousands of
/// concurrent uploads.
pub async fn verify_data_item_blocking(header: DataItemHeader, message: DeepHashDigest) -> bool {
    tokio::task::spawn_blocking(move || verify_data_item(&header, &message))
        .await
        .unwrap_or(false)
}

/// RSA-PSS (SHA-256, zero salt) under a raw big-endian modulus.
pub(crate) fn verify_rsa(owner: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let modulus = BigUint::from_bytes_be(owner);
    let exponent = BigUint::from(65_537u32);
    let Ok(key) = RsaPublicKey::new(modulus, exponent) else {
        return false;
    };
    let hashed = Sha256::digest(message);
    key.verify(Pss::new_with_salt::<Sha256>(0), &hashed, signature)
        .is_ok()
}

fn verify_ed25519(owner: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(owner): Result<[u8; 32], _> = owner.try_into() else {
        return false;
    };
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&owner) else {
        return false;
    };
    let Ok(signature): Result<[u8; 64], _> = signature.try_into() else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&signature);
    use ed25519_dalek::Verifier as _;
    key.verify(message, &signature).is_ok()
}

/// secp256k1 over the EIP-191 personal-message digest of the deep hash.
fn verify_ethereum(owner: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = PublicKey::from_slice(owner) else {
        return false;
    };
    if signature.len() != 65 {
        return false;
    }
    let Ok(mut sig) = ecdsa::Signature::from_compact(&signature[..64]) else {
        return false;
    };
    // Wallets occasionally emit high-s encodings; accept them.
    sig.normalize_s();

    let mut prefixed = Vec::with_capacity(28 + message.len());
    prefixed.extend_from_slice(b"\x19Ethereum Signed Message:\n");
    prefixed.extend_from_slice(message.len().to_string().as_bytes());
    prefixed.extend_from_slice(message);
    let digest: [u8; 32] = Keccak256::digest(&prefixed).into();

    Secp256k1::verification_only()
        .verify_ecdsa(&Message::from_digest(digest), &sig, &key)
        .is_ok()
}

/// Aptos K-of-N: 32 Ed25519 key slots plus a threshold byte in the owner;
/// packed signatures plus a big-endian signer bitmap in the signature.
fn verify_multi_aptos(owner: &[u8], message: &[u8], signature: &[u8]) -> bool {
    const KEY_SLOTS: usize = 32;
    if owner.len() != KEY_SLOTS * 32 + 1 || signature.len() != KEY_SLOTS * 64 + 4 {
        return false;
    }
    let threshold = owner[KEY_SLOTS * 32] as usize;
    if threshold == 0 || threshold > KEY_SLOTS {
        return false;
    }
    let bitmap = &signature[KEY_SLOTS * 64..];

    let mut verified = 0usize;
    let mut slot = 0usize;
    for key_index in 0..KEY_SLOTS {
        let bit = bitmap[key_index / 8] & (0x80 >> (key_index % 8));
        if bit == 0 {
            continue;
        }
        let key = &owner[key_index * 32..(key_index + 1) * 32];
        let sig = &signature[slot * 64..(slot + 1) * 64];
        slot += 1;
        if !verify_ed25519(key, message, sig) {
            return false;
        }
        verified += 1;
    }
    verified >= threshold
}
