//! Buffered parsing for items already held in memory.
//!
//! Small uploads (at or under the inline threshold) and multipart header
//! re-parses skip the event machinery and read the envelope from a fixed
//! buffer in one call.

use anchorage_primitives::{ByteCount, DataItemHeader};
use bytes::Bytes;

use crate::{HeaderCollector, HeaderParser, ParseError};

/// A data item decoded from a complete in-memory buffer.
#[derive(Debug, Clone)]
pub struct InlineDataItem {
    pub header: DataItemHeader,
    pub payload: Bytes,
    pub payload_data_start: ByteCount,
}

/// Parses a whole item from `raw`.
///
/// The buffer must contain the complete envelope; a short buffer is a
/// truncated-header error exactly as it would be on the wire.
pub fn parse_data_item(raw: Bytes) -> Result<InlineDataItem, ParseError> {
    let mut parser = HeaderParser::new();
    let mut collector = HeaderCollector::new();
    let mut header = None;
    let mut payload = Bytes::new();

    for event in parser.push(raw)? {
        if let crate::ParseEvent::Payload(chunk) = event {
            payload = chunk;
        } else if let Some(parsed) = collector.accept(&event) {
            header = Some(parsed);
        }
    }
    parser.finish()?;
    let header = header.expect("finish succeeded, header is complete");
    Ok(InlineDataItem {
        header,
        payload,
        payload_data_start: ByteCount(parser.payload_data_start()),
    })
}

/// Parses only the header fields from the front of a buffer.
///
/// Used when re-reading persisted artifacts whose payload is not wanted.
pub fn parse_header_prefix(raw: &[u8]) -> Result<(DataItemHeader, ByteCount), ParseError> {
    let item = parse_data_item(Bytes::copy_from_slice(raw))?;
    Ok((item.header, item.payload_data_start))
}
