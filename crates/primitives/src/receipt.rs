//! Receipt records.
//!
//! A receipt is the service's signed promise to anchor a data item on the
//! permanent-storage network before `deadline_height`. Signing itself lives
//! in the crypto crate; this module only fixes the field set and its JSON
//! shape.

use serde::{Deserialize, Serialize};

use crate::{id::DataItemId, units::Winston};

/// Receipt format version emitted by this service.
pub const RECEIPT_VERSION: &str = "0.2.0";

/// The unsigned receipt body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: DataItemId,
    /// Unix milliseconds at which the upload was accepted.
    pub timestamp: u64,
    /// Block height by which the item must be anchored.
    pub deadline_height: u64,
    pub version: String,
    /// Gateways that already hold the raw bytes.
    pub data_caches: Vec<String>,
    /// Indexers that were optically notified ahead of bundling.
    pub fast_finality_indexes: Vec<String>,
    /// Price assessed for the upload.
    pub winc: Winston,
}

/// A receipt plus the service wallet's public modulus and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedReceipt {
    #[serde(flatten)]
    pub receipt: Receipt,
    /// base64url modulus of the signing wallet.
    pub public: String,
    /// base64url RSA-PSS signature over the receipt deep hash.
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_receipt_json_is_flat() {
        let receipt = SignedReceipt {
            receipt: Receipt {
                id: DataItemId::from_signature(&[1u8; 64]),
                timestamp: 1_700_000_000_000,
                deadline_height: 1_400_200,
                version: RECEIPT_VERSION.to_owned(),
                data_caches: vec!["arweave.net".to_owned()],
                fast_finality_indexes: vec![],
                winc: Winston::from(491u64),
            },
            public: "bW9kdWx1cw".to_owned(),
            signature: "c2ln".to_owned(),
        };
        let json = serde_json::to_value(&receipt).unwrap();
        assert!(json.get("id").is_some());
        assert!(json.get("deadlineHeight").is_some());
        assert!(json.get("receipt").is_none(), "must flatten");
        assert_eq!(json["winc"], "491");
        let back: SignedReceipt = serde_json::from_value(json).unwrap();
        assert_eq!(back, receipt);
    }
}
