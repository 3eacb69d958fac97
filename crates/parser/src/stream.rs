//! Async driver: inbound byte stream in, event channel out.

use std::time::Duration;

use anchorage_primitives::{ByteCount, DataItemHeader};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::{HeaderCollector, HeaderParser, ParseError, ParseEvent};

/// Tuning for one parse run.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    /// Bound on the event channel. With typical 64 KiB body chunks the
    /// default keeps roughly 5 MiB of payload in flight before the source
    /// is held back.
    pub channel_capacity: usize,
    /// Inter-chunk stall threshold. Stalls are logged, never fatal; hard
    /// timeouts belong to the calling state machine.
    pub stall_warning: Duration,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 80,
            stall_warning: Duration::from_secs(3),
        }
    }
}

/// What a completed parse run learned about the item.
#[derive(Debug, Clone)]
pub struct ParseSummary {
    pub header: DataItemHeader,
    pub payload_size: ByteCount,
    /// Offset of the first payload byte within the raw item.
    pub payload_data_start: ByteCount,
}

/// Creates the event channel a parse run writes into.
pub fn event_channel(
    options: &ParserOptions,
) -> (
    mpsc::Sender<Result<ParseEvent, ParseError>>,
    mpsc::Receiver<Result<ParseEvent, ParseError>>,
) {
    mpsc::channel(options.channel_capacity)
}

/// Drives `source` through the header parser, forwarding every event into
/// `events`.
///
/// Error behavior is sticky and symmetric: a parse or source error is sent
/// down the channel once, the rest of the source is dropped, and the same
/// error is returned. Receiver drop stops the run quietly, like any consumer
/// that has lost interest.
pub async fn parse_stream<S>(
    mut source: S,
    events: mpsc::Sender<Result<ParseEvent, ParseError>>,
    options: ParserOptions,
) -> Result<ParseSummary, ParseError>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    let mut parser = HeaderParser::new();
    let mut collector = HeaderCollector::new();
    let mut header: Option<DataItemHeader> = None;
    let mut payload_size: u64 = 0;
    let mut saw_payload = false;

    loop {
        let next = next_chunk(&mut source, options.stall_warning).await;
        let chunk = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(io_error)) => {
                let error = ParseError::Source {
                    message: io_error.to_string(),
                };
                let _ = events.send(Err(error.clone())).await;
                return Err(error);
            }
            None => break,
        };

        let emitted = match parser.push(chunk) {
            Ok(emitted) => emitted,
            Err(error) => {
                let _ = events.send(Err(error.clone())).await;
                return Err(error);
            }
        };
        for event in emitted {
            if let ParseEvent::Payload(chunk) = &event {
                payload_size += chunk.len() as u64;
                saw_payload = true;
            } else if let Some(parsed) = collector.accept(&event) {
                header = Some(parsed);
            }
            if events.send(Ok(event)).await.is_err() {
                tracing::debug!("parse event receiver dropped; abandoning stream");
                return Err(ParseError::Source {
                    message: "event receiver dropped".to_owned(),
                });
            }
        }
    }

    if let Err(error) = parser.finish() {
        let _ = events.send(Err(error.clone())).await;
        return Err(error);
    }
    // Zero-payload items still get one (empty) payload event so consumers
    // can tell a successful parse from a truncated one.
    if !saw_payload && events.send(Ok(ParseEvent::Payload(Bytes::new()))).await.is_err() {
        return Err(ParseError::Source {
            message: "event receiver dropped".to_owned(),
        });
    }

    let header = header.expect("header complete implies collector yielded");
    Ok(ParseSummary {
        header,
        payload_size: ByteCount(payload_size),
        payload_data_start: ByteCount(parser.payload_data_start()),
    })
}

/// Pulls the next chunk, logging every `stall_warning` interval it overruns.
async fn next_chunk<S>(source: &mut S, stall_warning: Duration) -> Option<Result<Bytes, std::io::Error>>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    let mut stalled_for = Duration::ZERO;
    loop {
        match tokio::time::timeout(stall_warning, source.next()).await {
            Ok(item) => return item,
            Err(_) => {
                stalled_for += stall_warning;
                tracing::warn!(?stalled_for, "inbound stream stalled between chunks");
            }
        }
    }
}
