//! Typed parse events and the collector that reassembles a header from them.

use anchorage_primitives::{DataItemHeader, SignatureType};
use bytes::Bytes;

/// One event from the streaming parser, in strict wire order.
///
/// Every header variant fires exactly once per item; `Payload` fires zero or
/// more times for the body bytes (exactly once, empty, for a zero-length
/// payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    SignatureType(SignatureType),
    Signature(Bytes),
    Owner(Bytes),
    /// `None` when the wire flag was 0.
    Target(Option<[u8; 32]>),
    /// `None` when the wire flag was 0.
    Anchor(Option<[u8; 32]>),
    NumTags(u64),
    /// Declared length of the encoded tag blob.
    NumTagsBytes(u64),
    TagsBytes(Bytes),
    Payload(Bytes),
}

impl ParseEvent {
    /// True for the events that make up the header prefix.
    pub fn is_header(&self) -> bool {
        !matches!(self, Self::Payload(_))
    }
}

/// Accumulates header events into a [`DataItemHeader`].
///
/// Consumers that want the whole header before touching payload bytes feed
/// events through [`accept`](Self::accept) until it returns a header.
#[derive(Debug, Default)]
pub struct HeaderCollector {
    signature_type: Option<SignatureType>,
    signature: Option<Bytes>,
    owner: Option<Bytes>,
    target: Option<Option<[u8; 32]>>,
    anchor: Option<Option<[u8; 32]>>,
    num_tags: Option<u64>,
}

impl HeaderCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingests one event; returns the completed header on `TagsBytes`.
    ///
    /// Relies on the parser's ordering guarantee; a `Payload` event before
    /// the header completed would indicate a parser bug and is ignored.
    pub fn accept(&mut self, event: &ParseEvent) -> Option<DataItemHeader> {
        match event {
            ParseEvent::SignatureType(ty) => self.signature_type = Some(*ty),
            ParseEvent::Signature(bytes) => self.signature = Some(bytes.clone()),
            ParseEvent::Owner(bytes) => self.owner = Some(bytes.clone()),
            ParseEvent::Target(target) => self.target = Some(*target),
            ParseEvent::Anchor(anchor) => self.anchor = Some(*anchor),
            ParseEvent::NumTags(count) => self.num_tags = Some(*count),
            ParseEvent::NumTagsBytes(_) => {}
            ParseEvent::TagsBytes(bytes) => {
                return Some(DataItemHeader {
                    signature_type: self.signature_type?,
                    signature: self.signature.take()?,
                    owner: self.owner.take()?,
                    target: self.target?,
                    anchor: self.anchor?,
                    num_tags: self.num_tags?,
                    tags_bytes: bytes.clone(),
                });
            }
            ParseEvent::Payload(_) => {}
        }
        None
    }
}
