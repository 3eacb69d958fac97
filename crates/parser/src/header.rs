//! Incremental header parser.
//!
//! Synchronous core of the streaming parser: bytes go in chunk by chunk,
//! typed events come out in wire order. Chunk boundaries may fall anywhere;
//! the ring buffer absorbs splits. The async driver in [`crate::stream`]
//! owns timing, backpressure and the payload hand-off.

use anchorage_primitives::{MAX_TAG_BYTES, SignatureConfig, SignatureType};
use bytes::Bytes;

use crate::{ParseError, ParseEvent, circular::CircularBuffer};

/// Size of the ring: the largest single header field (the tag blob cap).
const RING_CAPACITY: usize = MAX_TAG_BYTES as usize;

/// Which field the parser wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SignatureType,
    Signature(SignatureConfig),
    Owner(SignatureConfig),
    TargetFlag,
    Target,
    AnchorFlag,
    Anchor,
    NumTags,
    NumTagsBytes,
    TagsBytes { len: usize },
    Payload,
}

impl State {
    /// Exact byte length of the pending field.
    fn needed(&self) -> usize {
        match self {
            Self::SignatureType => 2,
            Self::Signature(config) => config.signature_len,
            Self::Owner(config) => config.owner_len,
            Self::TargetFlag | Self::AnchorFlag => 1,
            Self::Target | Self::Anchor => 32,
            Self::NumTags | Self::NumTagsBytes => 8,
            Self::TagsBytes { len } => *len,
            Self::Payload => 0,
        }
    }

    fn field_name(&self) -> &'static str {
        match self {
            Self::SignatureType => "signatureType",
            Self::Signature(_) => "signature",
            Self::Owner(_) => "owner",
            Self::TargetFlag => "targetFlag",
            Self::Target => "target",
            Self::AnchorFlag => "anchorFlag",
            Self::Anchor => "anchor",
            Self::NumTags => "numTags",
            Self::NumTagsBytes => "numTagsBytes",
            Self::TagsBytes { .. } => "tagsBytes",
            Self::Payload => "payload",
        }
    }
}

/// Chunk-at-a-time header parser.
#[derive(Debug)]
pub struct HeaderParser {
    ring: CircularBuffer,
    state: State,
    num_tags: u64,
    /// Sticky: once set, further input is refused with the same error.
    error: Option<ParseError>,
    /// Header bytes consumed so far; the payload offset once complete.
    consumed: u64,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderParser {
    pub fn new() -> Self {
        Self {
            ring: CircularBuffer::with_capacity(RING_CAPACITY),
            state: State::SignatureType,
            num_tags: 0,
            error: None,
            consumed: 0,
        }
    }

    /// True once every header field has been emitted.
    pub fn header_complete(&self) -> bool {
        self.state == State::Payload
    }

    /// Bytes consumed by the header; meaningful once
    /// [`header_complete`](Self::header_complete) returns true.
    pub fn payload_data_start(&self) -> u64 {
        self.consumed
    }

    /// Feeds one inbound chunk, returning the events it completed.
    ///
    /// Once the header is done, the chunk remainder comes back as a single
    /// `Payload` event with no copying.
    pub fn push(&mut self, mut chunk: Bytes) -> Result<Vec<ParseEvent>, ParseError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let mut events = Vec::new();
        loop {
            if self.state == State::Payload {
                if !chunk.is_empty() {
                    events.push(ParseEvent::Payload(chunk));
                }
                return Ok(events);
            }

            let needed = self.state.needed();
            let Some(field) = self.take(&mut chunk, needed) else {
                // Chunk drained without completing the field; the partial
                // bytes sit in the ring for the next push.
                return Ok(events);
            };
            match self.advance(field) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(error) => {
                    self.error = Some(error.clone());
                    return Err(error);
                }
            }
        }
    }

    /// Signals end of input. Errors if the header is still incomplete.
    pub fn finish(&self) -> Result<(), ParseError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if !self.header_complete() {
            return Err(ParseError::TruncatedHeader {
                field: self.state.field_name(),
            });
        }
        Ok(())
    }

    /// Takes exactly `needed` bytes from `chunk` (and the ring), or buffers
    /// what is available and returns `None`.
    fn take(&mut self, chunk: &mut Bytes, needed: usize) -> Option<Bytes> {
        if needed == 0 {
            return Some(Bytes::new());
        }
        // Fast path: the chunk alone satisfies the field, no copy.
        if self.ring.is_empty() && chunk.len() >= needed {
            self.consumed += needed as u64;
            return Some(chunk.split_to(needed));
        }
        // Slow path: spill into the ring until the field is whole.
        let want_buffered = needed - self.ring.used_capacity();
        let absorb = want_buffered.min(chunk.len());
        let written = self.ring.write_from(&chunk[..absorb]);
        let _ = chunk.split_to(written);
        if self.ring.used_capacity() >= needed {
            self.consumed += needed as u64;
            return Some(Bytes::from(self.ring.shift(needed)));
        }
        None
    }

    /// Interprets one completed field and steps the state machine.
    ///
    /// A present target/anchor flag completes a field without emitting: the
    /// typed event carries the 32-byte body, which is still pending.
    fn advance(&mut self, field: Bytes) -> Result<Option<ParseEvent>, ParseError> {
        let event = match self.state {
            State::SignatureType => {
                let wire = u16::from_le_bytes([field[0], field[1]]);
                let signature_type = SignatureType::from_wire(wire)?;
                self.state = State::Signature(signature_type.config());
                Some(ParseEvent::SignatureType(signature_type))
            }
            State::Signature(config) => {
                self.state = State::Owner(config);
                Some(ParseEvent::Signature(field))
            }
            State::Owner(_) => {
                self.state = State::TargetFlag;
                Some(ParseEvent::Owner(field))
            }
            State::TargetFlag => match field[0] {
                anchorage_primitives::FIELD_ABSENT => {
                    self.state = State::AnchorFlag;
                    Some(ParseEvent::Target(None))
                }
                anchorage_primitives::FIELD_PRESENT => {
                    self.state = State::Target;
                    None
                }
                value => return Err(ParseError::InvalidPresenceByte { value }),
            },
            State::Target => {
                let mut target = [0u8; 32];
                target.copy_from_slice(&field);
                self.state = State::AnchorFlag;
                Some(ParseEvent::Target(Some(target)))
            }
            State::AnchorFlag => match field[0] {
                anchorage_primitives::FIELD_ABSENT => {
                    self.state = State::NumTags;
                    Some(ParseEvent::Anchor(None))
                }
                anchorage_primitives::FIELD_PRESENT => {
                    self.state = State::Anchor;
                    None
                }
                value => return Err(ParseError::InvalidPresenceByte { value }),
            },
            State::Anchor => {
                let mut anchor = [0u8; 32];
                anchor.copy_from_slice(&field);
                self.state = State::NumTags;
                Some(ParseEvent::Anchor(Some(anchor)))
            }
            State::NumTags => {
                self.num_tags = u64::from_le_bytes(field[..8].try_into().expect("8-byte field"));
                self.state = State::NumTagsBytes;
                Some(ParseEvent::NumTags(self.num_tags))
            }
            State::NumTagsBytes => {
                let declared = u64::from_le_bytes(field[..8].try_into().expect("8-byte field"));
                if declared > MAX_TAG_BYTES {
                    return Err(ParseError::TagsTooLarge {
                        declared,
                        max: MAX_TAG_BYTES,
                    });
                }
                self.state = State::TagsBytes {
                    len: declared as usize,
                };
                Some(ParseEvent::NumTagsBytes(declared))
            }
            State::TagsBytes { .. } => {
                self.state = State::Payload;
                Some(ParseEvent::TagsBytes(field))
            }
            State::Payload => unreachable!("payload handled before advance"),
        };
        Ok(event)
    }
}
