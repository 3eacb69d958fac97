//! Recursive SHA-384 deep hash.
//!
//! Every node is reduced under a type tag and its decimal length:
//!
//! - blob: `H( H("blob" ‖ len) ‖ H(bytes) )`
//! - list: start from `H("list" ‖ count)` and fold each child's reduction
//!   into the accumulator with `H(acc ‖ child)`
//!
//! Payloads too large to hold are reduced incrementally through
//! [`StreamedBlob`], which feeds the same construction chunk by chunk.

use sha2::{Digest, Sha384};

/// A 48-byte deep-hash digest.
pub type DeepHashDigest = [u8; 48];

/// One node of the deep-hash tree.
#[derive(Debug, Clone)]
pub enum DeepHashChunk<'a> {
    /// Raw bytes, reduced in one shot.
    Blob(&'a [u8]),
    /// A blob whose reduction was computed elsewhere (streamed payloads).
    Reduced(DeepHashDigest),
    /// An ordered list of children.
    List(Vec<DeepHashChunk<'a>>),
}

/// Reduces a tree to its 48-byte digest.
pub fn deep_hash(chunk: &DeepHashChunk<'_>) -> DeepHashDigest {
    match chunk {
        DeepHashChunk::Blob(bytes) => reduce_blob_digest(sha384(bytes), bytes.len() as u64),
        DeepHashChunk::Reduced(digest) => *digest,
        DeepHashChunk::List(children) => {
            let tag = list_tag(children.len() as u64);
            let mut acc = sha384(&tag);
            for child in children {
                let child_digest = deep_hash(child);
                let mut pair = [0u8; 96];
                pair[..48].copy_from_slice(&acc);
                pair[48..].copy_from_slice(&child_digest);
                acc = sha384(&pair);
            }
            acc
        }
    }
}

/// Incremental reduction of one blob of unknown-ahead-of-time length.
#[derive(Debug, Clone)]
pub struct StreamedBlob {
    hasher: Sha384,
    len: u64,
}

impl Default for StreamedBlob {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamedBlob {
    pub fn new() -> Self {
        Self {
            hasher: Sha384::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finishes the blob, yielding the digest a `Blob` of the same bytes
    /// would have produced.
    pub fn finalize(self) -> DeepHashDigest {
        let content = self.hasher.finalize().into();
        reduce_blob_digest(content, self.len)
    }
}

fn reduce_blob_digest(content_hash: DeepHashDigest, len: u64) -> DeepHashDigest {
    let mut tag = Vec::with_capacity(24);
    tag.extend_from_slice(b"blob");
    tag.extend_from_slice(len.to_string().as_bytes());
    let mut pair = [0u8; 96];
    pair[..48].copy_from_slice(&sha384(&tag));
    pair[48..].copy_from_slice(&content_hash);
    sha384(&pair)
}

fn list_tag(count: u64) -> Vec<u8> {
    let mut tag = Vec::with_capacity(24);
    tag.extend_from_slice(b"list");
    tag.extend_from_slice(count.to_string().as_bytes());
    tag
}

fn sha384(bytes: &[u8]) -> DeepHashDigest {
    Sha384::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamed_blob_matches_whole_blob() {
        let data = (0u16..4096).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let whole = deep_hash(&DeepHashChunk::Blob(&data));

        for chunk_size in [1usize, 7, 64, 1000, 4096] {
            let mut streamed = StreamedBlob::new();
            for chunk in data.chunks(chunk_size) {
                streamed.update(chunk);
            }
            assert_eq!(streamed.finalize(), whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn empty_blob_and_empty_stream_agree() {
        let whole = deep_hash(&DeepHashChunk::Blob(&[]));
        assert_eq!(StreamedBlob::new().finalize(), whole);
    }

    #[test]
    fn reduced_node_is_transparent_inside_lists() {
        let payload = b"payload bytes";
        let direct = deep_hash(&DeepHashChunk::List(vec![
            DeepHashChunk::Blob(b"dataitem"),
            DeepHashChunk::Blob(payload),
        ]));
        let mut streamed = StreamedBlob::new();
        streamed.update(payload);
        let via_reduced = deep_hash(&DeepHashChunk::List(vec![
            DeepHashChunk::Blob(b"dataitem"),
            DeepHashChunk::Reduced(streamed.finalize()),
        ]));
        assert_eq!(direct, via_reduced);
    }

    #[test]
    fn list_order_matters() {
        let a = deep_hash(&DeepHashChunk::List(vec![
            DeepHashChunk::Blob(b"a"),
            DeepHashChunk::Blob(b"b"),
        ]));
        let b = deep_hash(&DeepHashChunk::List(vec![
            DeepHashChunk::Blob(b"b"),
            DeepHashChunk::Blob(b"a"),
        ]));
        assert_ne!(a, b);
    }

    #[test]
    fn blob_and_single_element_list_differ() {
        let blob = deep_hash(&DeepHashChunk::Blob(b"x"));
        let list = deep_hash(&DeepHashChunk::List(vec![DeepHashChunk::Blob(b"x")]));
        assert_ne!(blob, list);
    }
}
