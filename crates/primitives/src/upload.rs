//! Upload bookkeeping records.

use serde::{Deserialize, Serialize};

use crate::{NativeAddress, id::DataItemId, signature::SignatureType, units::{ByteCount, Winston}};

/// Premium handling classes an upload can be assessed under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PremiumFeatureType {
    #[default]
    Default,
    /// Items the optical bridge announces ahead of bundling.
    OpticalPost,
}

/// The record created on first byte received and destroyed once a signed
/// receipt is emitted or quarantine completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightUpload {
    pub data_item_id: DataItemId,
    pub owner_native_address: NativeAddress,
    pub signature_type: SignatureType,
    pub payload_content_type: String,
    /// Byte offset at which the payload starts inside the raw item.
    pub payload_data_start: ByteCount,
    pub byte_count: ByteCount,
    pub premium_feature_type: PremiumFeatureType,
    /// Unix milliseconds of the first received byte.
    pub uploaded_timestamp: u64,
    pub deadline_height: u64,
    pub assessed_winc_price: Winston,
}

/// Why a multipart upload ended up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MultipartFailure {
    Underfunded,
    Invalid,
    ApprovalFailed,
    RevokeFailed,
}

/// Server-side record of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    /// Server-generated UUID handed to the client.
    pub upload_id: String,
    /// Object-store key the parts are assembled under.
    pub upload_key: String,
    /// Expected chunk size; grows if a larger chunk arrives.
    pub chunk_size: ByteCount,
    /// The object store's own id for the open multipart upload; cleared
    /// once assembly completes.
    pub store_upload_id: Option<String>,
    pub failed_reason: Option<MultipartFailure>,
    /// Known once assembly + validation has run.
    pub data_item_id: Option<DataItemId>,
    /// Object-store etag of the completed assembly.
    pub etag: Option<String>,
}

impl MultipartUpload {
    /// True once finalize got far enough that re-running it must reuse the
    /// recorded identity rather than re-assemble.
    pub fn is_finalized(&self) -> bool {
        self.data_item_id.is_some() && self.etag.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_failure_serializes_screaming() {
        let json = serde_json::to_string(&MultipartFailure::ApprovalFailed).unwrap();
        assert_eq!(json, "\"APPROVAL_FAILED\"");
    }

    #[test]
    fn finalized_requires_both_id_and_etag() {
        let mut upload = MultipartUpload {
            upload_id: "u".into(),
            upload_key: "k".into(),
            chunk_size: ByteCount(25_000_000),
            store_upload_id: Some("mpu-1".into()),
            failed_reason: None,
            data_item_id: None,
            etag: None,
        };
        assert!(!upload.is_finalized());
        upload.data_item_id = Some(DataItemId::from_signature(b"sig"));
        assert!(!upload.is_finalized());
        upload.etag = Some("etag".into());
        assert!(upload.is_finalized());
    }
}
