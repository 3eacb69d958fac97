//! Streaming decomposition of data-item envelopes.
//!
//! The wire format is a fixed field sequence (signature type, signature,
//! owner, optional target/anchor, tag counts, tag blob) followed by an
//! opaque payload of inferred length. This crate turns an arbitrary
//! chunking of those bytes into typed events, buffering at most one header
//! field at a time; payload bytes pass through untouched.

pub mod circular;
pub mod error;
pub mod events;
pub mod header;
pub mod inline;
pub mod stream;

pub use circular::CircularBuffer;
pub use error::ParseError;
pub use events::{HeaderCollector, ParseEvent};
pub use header::HeaderParser;
pub use inline::{InlineDataItem, parse_data_item, parse_header_prefix};
pub use stream::{ParseSummary, ParserOptions, event_channel, parse_stream};
