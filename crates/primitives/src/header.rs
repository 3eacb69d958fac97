//! The decoded header of a data item.

use bytes::Bytes;

use crate::{
    NativeAddress,
    id::DataItemId,
    signature::SignatureType,
    tags::{Tag, TagCodecError, decode_tags, tag_value},
    units::ByteCount,
};

/// Everything that precedes the payload, in decoded form.
///
/// Holds the raw `tags_bytes` blob rather than decoded tags: the blob is
/// what the deep hash covers, and the decode is deferred until the tag
/// count has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataItemHeader {
    pub signature_type: SignatureType,
    pub signature: Bytes,
    pub owner: Bytes,
    pub target: Option<[u8; 32]>,
    pub anchor: Option<[u8; 32]>,
    pub num_tags: u64,
    pub tags_bytes: Bytes,
}

impl DataItemHeader {
    /// The data-item id (SHA-256 over the raw signature).
    pub fn id(&self) -> DataItemId {
        DataItemId::from_signature(&self.signature)
    }

    /// The uploader's scheme-native address.
    pub fn owner_address(&self) -> NativeAddress {
        NativeAddress::derive(self.signature_type, &self.owner)
    }

    /// Decodes the tag blob and checks it against the declared count.
    pub fn tags(&self) -> Result<Vec<Tag>, TagCodecError> {
        let tags = decode_tags(&self.tags_bytes)?;
        if tags.len() as u64 != self.num_tags {
            return Err(TagCodecError::CountMismatch {
                declared: self.num_tags,
                decoded: tags.len(),
            });
        }
        Ok(tags)
    }

    /// Payload content type: the `Content-Type` tag, or the octet-stream
    /// default when absent or undecodable.
    pub fn payload_content_type(&self) -> String {
        decode_tags(&self.tags_bytes)
            .ok()
            .and_then(|tags| tag_value(&tags, "Content-Type").map(str::to_owned))
            .unwrap_or_else(|| "application/octet-stream".to_owned())
    }

    /// Total encoded length of the header fields, i.e. the payload offset.
    pub fn encoded_len(&self) -> ByteCount {
        let target = if self.target.is_some() { 33 } else { 1 };
        let anchor = if self.anchor.is_some() { 33 } else { 1 };
        ByteCount::from(
            2 + self.signature.len()
                + self.owner.len()
                + target
                + anchor
                + 8
                + 8
                + self.tags_bytes.len(),
        )
    }

    /// Re-encodes the header fields in wire order.
    ///
    /// The fan-out uses this to replay the header bytes ahead of the payload
    /// stream so that sinks persist the item exactly as received.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len().as_usize());
        out.extend_from_slice(&self.signature_type.as_u16().to_le_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.owner);
        match &self.target {
            Some(target) => {
                out.push(crate::FIELD_PRESENT);
                out.extend_from_slice(target);
            }
            None => out.push(crate::FIELD_ABSENT),
        }
        match &self.anchor {
            Some(anchor) => {
                out.push(crate::FIELD_PRESENT);
                out.extend_from_slice(anchor);
            }
            None => out.push(crate::FIELD_ABSENT),
        }
        out.extend_from_slice(&self.num_tags.to_le_bytes());
        out.extend_from_slice(&(self.tags_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.tags_bytes);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::encode_tags;

    fn sample_header() -> DataItemHeader {
        let tags = vec![Tag::new("Content-Type", "text/plain")];
        let tags_bytes = Bytes::from(encode_tags(&tags));
        DataItemHeader {
            signature_type: SignatureType::Ed25519,
            signature: Bytes::from(vec![3u8; 64]),
            owner: Bytes::from(vec![5u8; 32]),
            target: Some([9u8; 32]),
            anchor: None,
            num_tags: 1,
            tags_bytes,
        }
    }

    #[test]
    fn encoded_len_matches_wire_bytes() {
        let header = sample_header();
        assert_eq!(
            header.encoded_len().as_usize(),
            header.to_wire_bytes().len()
        );
    }

    #[test]
    fn tag_count_mismatch_is_an_error() {
        let mut header = sample_header();
        header.num_tags = 7;
        assert!(header.tags().is_err());
    }

    #[test]
    fn content_type_defaults_to_octet_stream() {
        let mut header = sample_header();
        header.tags_bytes = Bytes::new();
        header.num_tags = 0;
        assert_eq!(header.payload_content_type(), "application/octet-stream");
    }
}
