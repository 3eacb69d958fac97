//! Receipt signing.

use anchorage_primitives::{Receipt, SignedReceipt};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::{
    deep_hash::{DeepHashChunk, DeepHashDigest, deep_hash},
    verify::verify_rsa,
    wallet::{Wallet, WalletError},
};

/// Deep-hash payload for the current receipt format.
///
/// Field order is part of the signature: service tag, version, id, deadline
/// height, timestamp, then the v0.2 additions (data caches, fast-finality
/// indexes, assessed winc).
pub fn receipt_signing_payload(receipt: &Receipt) -> DeepHashDigest {
    let id = receipt.id.to_string();
    let deadline = receipt.deadline_height.to_string();
    let timestamp = receipt.timestamp.to_string();
    let winc = receipt.winc.to_string();
    let caches: Vec<DeepHashChunk<'_>> = receipt
        .data_caches
        .iter()
        .map(|cache| DeepHashChunk::Blob(cache.as_bytes()))
        .collect();
    let indexes: Vec<DeepHashChunk<'_>> = receipt
        .fast_finality_indexes
        .iter()
        .map(|index| DeepHashChunk::Blob(index.as_bytes()))
        .collect();

    deep_hash(&DeepHashChunk::List(vec![
        DeepHashChunk::Blob(b"Bundlr"),
        DeepHashChunk::Blob(receipt.version.as_bytes()),
        DeepHashChunk::Blob(id.as_bytes()),
        DeepHashChunk::Blob(deadline.as_bytes()),
        DeepHashChunk::Blob(timestamp.as_bytes()),
        DeepHashChunk::List(caches),
        DeepHashChunk::List(indexes),
        DeepHashChunk::Blob(winc.as_bytes()),
    ]))
}

/// Deep-hash payload of pre-0.2 receipts, which stopped at the timestamp.
/// Kept for verifying receipts issued before the format switch.
pub fn legacy_receipt_signing_payload(receipt: &Receipt) -> DeepHashDigest {
    let id = receipt.id.to_string();
    let deadline = receipt.deadline_height.to_string();
    let timestamp = receipt.timestamp.to_string();
    deep_hash(&DeepHashChunk::List(vec![
        DeepHashChunk::Blob(b"Bundlr"),
        DeepHashChunk::Blob(receipt.version.as_bytes()),
        DeepHashChunk::Blob(id.as_bytes()),
        DeepHashChunk::Blob(deadline.as_bytes()),
        DeepHashChunk::Blob(timestamp.as_bytes()),
    ]))
}

/// Signs `receipt` with the service wallet.
pub fn sign_receipt(wallet: &Wallet, receipt: Receipt) -> Result<SignedReceipt, WalletError> {
    let digest = receipt_signing_payload(&receipt);
    let signature = wallet.sign_deep_hash(&digest)?;
    Ok(SignedReceipt {
        receipt,
        public: wallet.public_modulus().to_owned(),
        signature: URL_SAFE_NO_PAD.encode(signature),
    })
}

/// Verifies a signed receipt against the modulus it carries.
pub fn verify_receipt(signed: &SignedReceipt) -> bool {
    let (Ok(modulus), Ok(signature)) = (
        URL_SAFE_NO_PAD.decode(&signed.public),
        URL_SAFE_NO_PAD.decode(&signed.signature),
    ) else {
        return false;
    };
    let digest = receipt_signing_payload(&signed.receipt);
    verify_rsa(&modulus, &digest, &signature)
}

#[cfg(test)]
mod tests {
    use anchorage_primitives::{DataItemId, RECEIPT_VERSION, Winston};

    use super::*;

    fn sample_receipt() -> Receipt {
        Receipt {
            id: DataItemId::from_signature(&[1u8; 64]),
            timestamp: 1_700_001_234_567,
            deadline_height: 1_400_200,
            version: RECEIPT_VERSION.to_owned(),
            data_caches: vec!["arweave.net".to_owned()],
            fast_finality_indexes: vec!["node1.example".to_owned()],
            winc: Winston::from(117u64),
        }
    }

    fn test_wallet() -> Wallet {
        Wallet::from_key(rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
    }

    #[test]
    fn sign_then_verify() {
        let wallet = test_wallet();
        let signed = sign_receipt(&wallet, sample_receipt()).unwrap();
        assert!(verify_receipt(&signed));
    }

    #[test]
    fn any_field_change_breaks_the_signature() {
        let wallet = test_wallet();
        let signed = sign_receipt(&wallet, sample_receipt()).unwrap();

        let mut touched = signed.clone();
        touched.receipt.timestamp += 1;
        assert!(!verify_receipt(&touched));

        let mut touched = signed.clone();
        touched.receipt.winc = Winston::from(118u64);
        assert!(!verify_receipt(&touched));

        let mut touched = signed;
        touched.receipt.data_caches.push("other.example".to_owned());
        assert!(!verify_receipt(&touched));
    }

    #[test]
    fn legacy_payload_differs_from_current() {
        let receipt = sample_receipt();
        assert_ne!(
            receipt_signing_payload(&receipt),
            legacy_receipt_signing_payload(&receipt)
        );
    }
}
