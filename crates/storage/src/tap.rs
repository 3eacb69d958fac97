//! Multi-sink fan-out.
//!
//! One inbound stream, N sinks. Each chunk is written to every live sink
//! before the next chunk is pulled, so the slowest sink paces the source —
//! the await is the backpressure. Cache-grade sinks that fail are dropped
//! and the upload continues; a durable sink failure aborts everything.

use bytes::Bytes;
use futures::{Stream, StreamExt, future::join_all};

use crate::sink::{ByteSink, SinkError, SinkReport};

/// Fan-out outcome.
#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("no durable sink enlisted")]
    NoDurableSink,
    #[error("durable sink `{label}` failed")]
    SinkFailed {
        label: &'static str,
        #[source]
        source: SinkError,
    },
    #[error("upload stream failed")]
    SourceFailed {
        #[source]
        source: SinkError,
    },
}

/// Tees `source` into every sink.
///
/// On success returns one report per surviving sink (dropped cache sinks are
/// absent). On any error every remaining sink is aborted so partial
/// artifacts never outlive the request.
pub async fn tap_stream<S>(
    mut source: S,
    sinks: Vec<Box<dyn ByteSink>>,
) -> Result<Vec<SinkReport>, TapError>
where
    S: Stream<Item = Result<Bytes, SinkError>> + Unpin,
{
    if !sinks.iter().any(|sink| sink.is_durable()) {
        abort_all(sinks).await;
        return Err(TapError::NoDurableSink);
    }
    let mut live: Vec<Box<dyn ByteSink>> = sinks;

    while let Some(chunk) = source.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(source) => {
                abort_all(live).await;
                return Err(TapError::SourceFailed { source });
            }
        };

        let writes = join_all(live.iter_mut().map(|sink| {
            let chunk = chunk.clone();
            async move { sink.write(chunk).await }
        }))
        .await;

        let mut fatal: Option<(&'static str, SinkError)> = None;
        let mut dropped: Vec<usize> = Vec::new();
        for (index, result) in writes.into_iter().enumerate() {
            let Err(error) = result else { continue };
            if live[index].is_durable() {
                // First durable error wins.
                fatal.get_or_insert((live[index].label(), error));
            } else {
                tracing::warn!(
                    sink = live[index].label(),
                    %error,
                    "cache sink dropped mid-upload"
                );
                metrics::counter!("cache_sink_dropped_total").increment(1);
                dropped.push(index);
            }
        }
        if let Some((label, source)) = fatal {
            abort_all(live).await;
            return Err(TapError::SinkFailed { label, source });
        }
        for index in dropped.into_iter().rev() {
            live.swap_remove(index).abort().await;
        }
    }

    let mut reports = Vec::with_capacity(live.len());
    let mut pending = live.into_iter();
    while let Some(sink) = pending.next() {
        let label = sink.label();
        let durable = sink.is_durable();
        match sink.finish().await {
            Ok(report) => reports.push(report),
            Err(source) if durable => {
                // Sinks not yet committed are torn down with the failure.
                abort_all(pending.collect()).await;
                return Err(TapError::SinkFailed { label, source });
            }
            Err(error) => {
                tracing::warn!(sink = label, %error, "cache sink failed to finish");
                metrics::counter!("cache_sink_dropped_total").increment(1);
            }
        }
    }
    Ok(reports)
}

async fn abort_all(sinks: Vec<Box<dyn ByteSink>>) {
    join_all(sinks.into_iter().map(|sink| sink.abort())).await;
}
