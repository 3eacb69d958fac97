//! Tag blob codec.
//!
//! Tags travel as the Avro binary encoding of one fixed schema: an array of
//! `{name: bytes, value: bytes}` records. Longs are zigzag varints; arrays
//! are block-encoded (a count, the items, a zero terminator; a negative
//! count flags a block byte-size prefix). We encode the single-block form
//! every mainstream writer emits and decode the general block form.

use serde::{Deserialize, Serialize};

/// One name/value pair attached to a data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Decoding rejected the blob.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagCodecError {
    #[error("tag blob ended inside a varint")]
    TruncatedVarint,
    #[error("tag blob ended inside a byte string (wanted {wanted} more bytes)")]
    TruncatedBytes { wanted: usize },
    #[error("tag blob continues after its array terminator")]
    TrailingBytes,
    #[error("tag count overflows")]
    CountOverflow,
    #[error("declared tag count {declared} does not match {decoded} decoded tags")]
    CountMismatch { declared: u64, decoded: usize },
    #[error("tag name or value is not valid UTF-8")]
    NotUtf8,
}

/// Encodes tags into the wire blob. Empty input encodes to an empty blob.
pub fn encode_tags(tags: &[Tag]) -> Vec<u8> {
    if tags.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(tags.len() * 16);
    write_long(&mut out, tags.len() as i64);
    for tag in tags {
        write_bytes(&mut out, tag.name.as_bytes());
        write_bytes(&mut out, tag.value.as_bytes());
    }
    write_long(&mut out, 0);
    out
}

/// Decodes the wire blob. An empty blob decodes to no tags.
pub fn decode_tags(blob: &[u8]) -> Result<Vec<Tag>, TagCodecError> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    let mut cursor = Cursor { blob, pos: 0 };
    let mut tags = Vec::new();
    loop {
        let count = cursor.read_long()?;
        if count == 0 {
            break;
        }
        let count = if count < 0 {
            // Negative count: a block byte-size follows; we don't need it to
            // walk the items sequentially.
            let _block_size = cursor.read_long()?;
            count.checked_neg().ok_or(TagCodecError::CountOverflow)?
        } else {
            count
        };
        let count = usize::try_from(count).map_err(|_| TagCodecError::CountOverflow)?;
        for _ in 0..count {
            let name = cursor.read_byte_string()?;
            let value = cursor.read_byte_string()?;
            tags.push(Tag { name, value });
        }
    }
    if cursor.pos != blob.len() {
        return Err(TagCodecError::TrailingBytes);
    }
    Ok(tags)
}

fn write_long(out: &mut Vec<u8>, value: i64) {
    // Zigzag, then base-128 varint, low groups first.
    let mut encoded = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (encoded & 0x7f) as u8;
        encoded >>= 7;
        if encoded == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    write_long(out, data.len() as i64);
    out.extend_from_slice(data);
}

struct Cursor<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn read_long(&mut self) -> Result<i64, TagCodecError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .blob
                .get(self.pos)
                .ok_or(TagCodecError::TruncatedVarint)?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(TagCodecError::CountOverflow);
            }
        }
        Ok(((value >> 1) as i64) ^ -((value & 1) as i64))
    }

    fn read_byte_string(&mut self) -> Result<String, TagCodecError> {
        let len = self.read_long()?;
        let len = usize::try_from(len).map_err(|_| TagCodecError::CountOverflow)?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.blob.len())
            .ok_or(TagCodecError::TruncatedBytes {
                wanted: len.saturating_sub(self.blob.len() - self.pos),
            })?;
        let raw = &self.blob[self.pos..end];
        self.pos = end;
        String::from_utf8(raw.to_vec()).map_err(|_| TagCodecError::NotUtf8)
    }
}

/// Finds the value of the first tag whose name matches, case-insensitively.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.name.eq_ignore_ascii_case(name))
        .map(|tag| tag.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_decodes_to_no_tags() {
        assert_eq!(decode_tags(&[]).unwrap(), vec![]);
        assert_eq!(encode_tags(&[]), Vec::<u8>::new());
    }

    #[test]
    fn round_trip() {
        let tags = vec![
            Tag::new("Content-Type", "text/plain"),
            Tag::new("App-Name", "anchorage"),
            Tag::new("", ""),
        ];
        let blob = encode_tags(&tags);
        assert_eq!(decode_tags(&blob).unwrap(), tags);
    }

    #[test]
    fn known_encoding() {
        // One tag {"a": "b"}: count 1 (zigzag 0x02), len 1 + 'a',
        // len 1 + 'b', terminator 0x00.
        let blob = encode_tags(&[Tag::new("a", "b")]);
        assert_eq!(blob, vec![0x02, 0x02, b'a', 0x02, b'b', 0x00]);
    }

    #[test]
    fn decodes_negative_block_counts() {
        // A writer may emit a negative count followed by the block byte size.
        let mut blob = Vec::new();
        write_long(&mut blob, -1);
        write_long(&mut blob, 4); // block size, ignored
        write_bytes(&mut blob, b"a");
        write_bytes(&mut blob, b"b");
        write_long(&mut blob, 0);
        assert_eq!(decode_tags(&blob).unwrap(), vec![Tag::new("a", "b")]);
    }

    #[test]
    fn rejects_truncation() {
        let blob = encode_tags(&[Tag::new("name", "value")]);
        for cut in 1..blob.len() {
            assert!(decode_tags(&blob[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut blob = encode_tags(&[Tag::new("a", "b")]);
        blob.push(0xff);
        assert_eq!(decode_tags(&blob), Err(TagCodecError::TrailingBytes));
    }

    #[test]
    fn tag_value_is_case_insensitive() {
        let tags = vec![Tag::new("Content-Type", "image/png")];
        assert_eq!(tag_value(&tags, "content-type"), Some("image/png"));
        assert_eq!(tag_value(&tags, "missing"), None);
    }
}
