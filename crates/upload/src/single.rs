//! Single-shot upload state machine.
//!
//! Received → ParsedHeader → BalancePreChecked → TagsParsed →
//! StreamingToSinks → BalanceReserved → Signed → Enqueued → Receipt, with a
//! compensating branch (refund, quarantine, cache cleanup) at every failure
//! point past the first persisted byte.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anchorage_crypto::{
    StreamedBlob, data_item_signing_payload, sign_receipt, verify_data_item_blocking,
};
use anchorage_parser::{
    HeaderCollector, ParseError, ParseEvent, ParserOptions, event_channel, parse_data_item,
    parse_stream,
};
use anchorage_primitives::{
    ByteCount, DataItemHeader, DataItemId, NativeAddress, Receipt, RECEIPT_VERSION, SignedReceipt,
    Tag, tags::tag_value,
};
use anchorage_storage::{
    ByteSink, CacheSink, InlineKvSink, ObjectSink, SinkError, TapError, raw_data_item_key,
    tap_stream,
};
use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    context::UploadContext,
    error::UploadError,
    payment::{BalanceReservation, PaymentError},
    queue::Job,
};

/// One inbound `POST /tx` request.
pub struct SingleUploadRequest<S> {
    pub body: S,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    /// Addresses from `x-paid-by`, in preference order.
    pub paid_by: Vec<NativeAddress>,
}

/// Drives one upload from raw body to signed receipt.
pub async fn handle_single_upload<S>(
    ctx: &UploadContext,
    request: SingleUploadRequest<S>,
) -> Result<SignedReceipt, UploadError>
where
    S: futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static,
{
    // -- Received: declared-value checks, before reading a byte.
    if let Some(length) = request.content_length
        && length > ctx.config.max_data_item_bytes.as_u64()
    {
        return Err(UploadError::TooLarge {
            limit: ctx.config.max_data_item_bytes,
        });
    }
    if let Some(content_type) = &request.content_type
        && content_type != "application/octet-stream"
    {
        return Err(UploadError::InvalidContentType {
            got: content_type.clone(),
        });
    }

    let inline = request
        .content_length
        .is_some_and(|length| length <= ctx.config.inline_threshold_bytes.as_u64());

    let (header, payload) = if inline {
        acquire_inline(ctx, request.body, request.content_length.unwrap_or(0)).await?
    } else {
        acquire_streaming(request.body).await?
    };

    // -- ParsedHeader.
    let id = header.id();
    let owner = header.owner_address();

    if !ctx.in_flight.try_claim(id) {
        return Err(UploadError::DataItemExists);
    }
    let outcome = process_claimed(ctx, header, payload, &request.paid_by, request.content_length)
        .await;
    ctx.in_flight.release(&id);
    if let Err(error) = &outcome {
        metrics::counter!("uploads_rejected_total", "status" => error.status_code().to_string())
            .increment(1);
        tracing::info!(%id, %owner, %error, "upload rejected");
    }
    outcome
}

/// Payload bytes on their way to the sinks.
enum PayloadSource {
    /// The whole payload, already in memory.
    Inline(Bytes),
    /// Live payload events plus the parse task to join at the end.
    Streaming {
        events: mpsc::Receiver<Result<ParseEvent, ParseError>>,
        parse_task: tokio::task::JoinHandle<
            Result<anchorage_parser::ParseSummary, ParseError>,
        >,
    },
}

/// Inline acquisition: buffer the body, parse from the fixed buffer.
async fn acquire_inline<S>(
    ctx: &UploadContext,
    mut body: S,
    declared: u64,
) -> Result<(DataItemHeader, PayloadSource), UploadError>
where
    S: futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static,
{
    let cap = ctx.config.inline_threshold_bytes.as_u64();
    let mut buffer = Vec::with_capacity(declared as usize);
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| UploadError::unavailable(format!("read body: {e}")))?;
        buffer.extend_from_slice(&chunk);
        if buffer.len() as u64 > cap {
            // The client lied about content-length; treat as an ordinary
            // stream that happens to be fully buffered.
            break;
        }
    }
    // Drain anything left if the declared length was wrong.
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| UploadError::unavailable(format!("read body: {e}")))?;
        buffer.extend_from_slice(&chunk);
        if buffer.len() as u64 > ctx.config.max_data_item_bytes.as_u64() {
            return Err(UploadError::TooLarge {
                limit: ctx.config.max_data_item_bytes,
            });
        }
    }
    let item = parse_data_item(Bytes::from(buffer)).map_err(map_parse_error)?;
    Ok((item.header, PayloadSource::Inline(item.payload)))
}

/// Streaming acquisition: spawn the parser, wait for the header events.
async fn acquire_streaming<S>(body: S) -> Result<(DataItemHeader, PayloadSource), UploadError>
where
    S: futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Unpin + 'static,
{
    let options = ParserOptions::default();
    let (tx, mut rx) = event_channel(&options);
    let parse_task = tokio::spawn(parse_stream(body, tx, options));

    let mut collector = HeaderCollector::new();
    loop {
        let Some(event) = rx.recv().await else {
            // Channel closed without a complete header: surface the parse
            // task's error.
            let error = match parse_task.await {
                Ok(Err(parse_error)) => map_parse_error(parse_error),
                Ok(Ok(_)) => UploadError::invalid("stream ended before the header completed"),
                Err(join_error) => UploadError::unavailable(join_error),
            };
            return Err(error);
        };
        match event {
            Ok(event) => {
                if let Some(header) = collector.accept(&event) {
                    return Ok((
                        header,
                        PayloadSource::Streaming {
                            events: rx,
                            parse_task,
                        },
                    ));
                }
            }
            Err(parse_error) => {
                parse_task.abort();
                return Err(map_parse_error(parse_error));
            }
        }
    }
}

/// Everything past the dedupe claim. The caller owns claim release.
async fn process_claimed(
    ctx: &UploadContext,
    header: DataItemHeader,
    payload: PayloadSource,
    paid_by: &[NativeAddress],
    declared_length: Option<u64>,
) -> Result<SignedReceipt, UploadError> {
    let id = header.id();
    let owner = header.owner_address();

    if ctx
        .db
        .get_data_item(&id)
        .await
        .map_err(UploadError::unavailable)?
        .is_some()
    {
        return Err(UploadError::DataItemExists);
    }

    // -- BalancePreChecked: nothing is persisted yet, so failure here needs
    // no compensation beyond the claim.
    let estimated = ByteCount(declared_length.unwrap_or(0));
    if !ctx.config.skip_balance_checks {
        match ctx.payment.check_balance(&owner, paid_by, estimated).await {
            Ok(()) => {}
            Err(PaymentError::Insufficient) => return Err(UploadError::InsufficientBalance),
            Err(PaymentError::Unreachable { message }) => {
                return Err(UploadError::unavailable(message));
            }
        }
    }

    // -- TagsParsed: the blob must decode and match its declared count.
    let tags = header.tags().map_err(UploadError::invalid)?;

    // Spam guard: a known-bad declared length from an unknown uploader.
    if declared_length == Some(ctx.config.spammer_content_length.as_u64())
        && !ctx.config.allowlisted_addresses.contains(&owner)
    {
        return Err(UploadError::SpamPattern);
    }

    // -- StreamingToSinks.
    let (payload_digest, payload_size) = stream_to_sinks(ctx, &header, payload).await?;
    let byte_count = header.encoded_len() + payload_size;

    if byte_count > ctx.config.max_data_item_bytes {
        return Err(fail(
            ctx,
            &id,
            UploadError::TooLarge {
                limit: ctx.config.max_data_item_bytes,
            },
            None,
        )
        .await);
    }

    let message = data_item_signing_payload(&header, payload_digest);
    if !verify_data_item_blocking(header.clone(), message).await {
        return Err(fail(ctx, &id, UploadError::invalid("signature does not verify"), None).await);
    }

    if ctx.config.blocklisted_addresses.contains(&owner) {
        return Err(fail(ctx, &id, UploadError::Blocklisted, None).await);
    }

    let content_type = header.payload_content_type();
    let payload_data_start = header.encoded_len();
    if let Err(error) = ctx
        .fs_store
        .write_metadata(&id, &content_type, payload_data_start)
        .await
    {
        // The raw fs artifact (if any) is a backup; its metadata failing is
        // not worth the upload.
        tracing::warn!(%id, %error, "failed to write fs metadata");
    }

    let validated = ValidatedItem {
        header,
        tags,
        byte_count,
        payload_data_start,
        content_type,
    };
    let signed = issue_receipt(ctx, &validated, paid_by).await?;
    metrics::counter!("uploads_accepted_total").increment(1);
    Ok(signed)
}

/// A fully verified item whose bytes are durably stored under the raw key.
pub(crate) struct ValidatedItem {
    pub header: DataItemHeader,
    pub tags: Vec<Tag>,
    pub byte_count: ByteCount,
    pub payload_data_start: ByteCount,
    pub content_type: String,
}

/// The receipt tail shared by both state machines: reserve → sign →
/// head-check → enqueue → record. Failures past the reservation refund it.
pub(crate) async fn issue_receipt(
    ctx: &UploadContext,
    item: &ValidatedItem,
    paid_by: &[NativeAddress],
) -> Result<SignedReceipt, UploadError> {
    let id = item.header.id();
    let owner = item.header.owner_address();

    // -- BalanceReserved.
    let reservation = match reserve(ctx, &owner, paid_by, item.byte_count).await {
        Ok(reservation) => reservation,
        Err(error) => return Err(fail(ctx, &id, error, None).await),
    };

    // -- Signed.
    let deadline_height = match ctx.gateway.current_block_height().await {
        Ok(height) => height + ctx.config.deadline_height_increment,
        Err(error) => {
            return Err(fail(ctx, &id, UploadError::unavailable(error), Some(&reservation)).await);
        }
    };
    let receipt = Receipt {
        id,
        timestamp: now_millis(),
        deadline_height,
        version: RECEIPT_VERSION.to_owned(),
        data_caches: ctx.config.data_caches.clone(),
        fast_finality_indexes: ctx.config.fast_finality_indexes.clone(),
        winc: reservation.assessed_winc,
    };
    let signed = match sign_receipt(&ctx.wallet, receipt) {
        Ok(signed) => signed,
        Err(error) => {
            return Err(fail(ctx, &id, UploadError::unavailable(error), Some(&reservation)).await);
        }
    };

    // The raw object must actually be there before we promise anything.
    match ctx.object_store.head(&raw_data_item_key(&id)).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(fail(
                ctx,
                &id,
                UploadError::unavailable("raw object missing after upload"),
                Some(&reservation),
            )
            .await);
        }
        Err(error) => {
            return Err(fail(ctx, &id, UploadError::unavailable(error), Some(&reservation)).await);
        }
    }

    // -- Enqueued.
    if let Err(error) = ctx.queue.enqueue(Job::NewDataItem { id }).await {
        return Err(fail(ctx, &id, UploadError::unavailable(error), Some(&reservation)).await);
    }
    enqueue_soft_jobs(ctx, &id, &item.tags).await;

    // -- Recorded.
    let record = crate::db::NewDataItemRecord {
        data_item_id: id,
        owner_native_address: owner,
        signature_type: item.header.signature_type,
        byte_count: item.byte_count,
        payload_content_type: item.content_type.clone(),
        payload_data_start: item.payload_data_start,
        premium_feature_type: Default::default(),
        uploaded_timestamp: signed.receipt.timestamp,
        deadline_height,
        assessed_winc_price: reservation.assessed_winc,
    };
    if let Err(error) = ctx.db.insert_new_data_item(record).await {
        return Err(fail(ctx, &id, UploadError::unavailable(error), Some(&reservation)).await);
    }

    Ok(signed)
}

/// Fan the raw item out to the planned sinks while hashing the payload.
async fn stream_to_sinks(
    ctx: &UploadContext,
    header: &DataItemHeader,
    payload: PayloadSource,
) -> Result<(anchorage_crypto::DeepHashDigest, ByteCount), UploadError> {
    let id = header.id();
    let header_bytes = Bytes::from(header.to_wire_bytes());
    let small = matches!(&payload, PayloadSource::Inline(_));

    let mut sinks: Vec<Box<dyn ByteSink>> = Vec::new();
    sinks.push(Box::new(ObjectSink::new(
        ctx.object_store.clone(),
        raw_data_item_key(&id),
    )));
    match ctx.fs_store.begin_raw_write(&id).await {
        Ok(sink) => sinks.push(Box::new(sink)),
        Err(error) => {
            tracing::warn!(%id, %error, "fs backup unavailable for this upload");
            metrics::counter!("fs_sink_unavailable_total").increment(1);
        }
    }
    if small {
        let limit = ctx.config.inline_threshold_bytes.as_usize() * 2;
        sinks.push(Box::new(CacheSink::new(ctx.payload_cache.clone(), id, limit)));
        sinks.push(Box::new(InlineKvSink::new(
            ctx.kv_rows.clone(),
            ctx.kv_breaker.clone(),
            id,
            header.payload_content_type(),
            header.encoded_len(),
            limit,
        )));
    }

    let hasher = Arc::new(Mutex::new(StreamedBlob::new()));
    let seen = Arc::new(AtomicU64::new(0));
    let exceeded = Arc::new(AtomicBool::new(false));
    let cap = ctx
        .config
        .max_data_item_bytes
        .saturating_sub(header.encoded_len())
        .as_u64();

    let guard = {
        let hasher = hasher.clone();
        let seen = seen.clone();
        let exceeded = exceeded.clone();
        move |chunk: Bytes| {
            let so_far = seen.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            if so_far > cap {
                exceeded.store(true, Ordering::Relaxed);
                return Err(SinkError::Source {
                    message: "size limit exceeded".into(),
                });
            }
            hasher.lock().update(&chunk);
            Ok(chunk)
        }
    };

    let (stream, parse_task): (BoxStream<'_, Result<Bytes, SinkError>>, _) = match payload {
        PayloadSource::Inline(payload) => {
            let chunks = vec![Ok(header_bytes), guard(payload)];
            (Box::pin(futures::stream::iter(chunks)), None)
        }
        PayloadSource::Streaming { events, parse_task } => {
            let payload_stream = futures::stream::unfold(events, |mut events| async move {
                events.recv().await.map(|item| (item, events))
            })
            .map(move |item| match item {
                Ok(ParseEvent::Payload(chunk)) => guard(chunk),
                Ok(_) => Ok(Bytes::new()),
                Err(error) => Err(SinkError::Source {
                    message: error.to_string(),
                }),
            });
            let full = futures::stream::iter(vec![Ok(header_bytes)]).chain(payload_stream);
            (Box::pin(full), Some(parse_task))
        }
    };

    let tapped = tap_stream(stream, sinks).await;

    // Settle the parse task first so stream-level failures carry parser
    // detail when there is any.
    if let Some(parse_task) = parse_task
        && let Ok(Err(parse_error)) = parse_task.await
        && tapped.is_ok()
    {
        // Parser failed after the sinks saw a clean EOF; should not happen,
        // but never emit a receipt over it.
        return Err(fail(ctx, &id, map_parse_error(parse_error), None).await);
    }

    match tapped {
        Ok(_reports) => {
            let digest = Arc::try_unwrap(hasher)
                .map(|mutex| mutex.into_inner())
                .unwrap_or_else(|shared| shared.lock().clone())
                .finalize();
            Ok((digest, ByteCount(seen.load(Ordering::Relaxed))))
        }
        Err(TapError::NoDurableSink) => {
            Err(fail(ctx, &id, UploadError::unavailable("no durable sink available"), None).await)
        }
        Err(TapError::SinkFailed { label, source }) => Err(fail(
            ctx,
            &id,
            UploadError::unavailable(format!("sink {label} failed: {source}")),
            None,
        )
        .await),
        Err(TapError::SourceFailed { source }) => {
            let error = if exceeded.load(Ordering::Relaxed) {
                UploadError::TooLarge {
                    limit: ctx.config.max_data_item_bytes,
                }
            } else {
                UploadError::unavailable(format!("upload stream failed: {source}"))
            };
            // Sinks were destroyed by the tap; quarantine covers whatever
            // was already committed (normally nothing).
            Err(fail(ctx, &id, error, None).await)
        }
    }
}

async fn reserve(
    ctx: &UploadContext,
    owner: &NativeAddress,
    paid_by: &[NativeAddress],
    byte_count: ByteCount,
) -> Result<BalanceReservation, UploadError> {
    if ctx.config.skip_balance_checks {
        return Ok(BalanceReservation {
            paying_address: owner.clone(),
            owner: owner.clone(),
            assessed_winc: anchorage_primitives::Winston::ZERO,
        });
    }
    // Paid-by approvals run before the reservation. A payer the client
    // named but cannot use fails the upload; silently billing the owner
    // instead would surprise both parties.
    let mut approved = Vec::with_capacity(paid_by.len());
    for payer in paid_by {
        match ctx.payment.check_approval(payer, owner).await {
            Ok(true) => approved.push(payer.clone()),
            Ok(false) => {
                tracing::info!(%payer, %owner, "paid-by address not approved");
                return Err(UploadError::ApprovalFailed);
            }
            Err(error) => {
                tracing::warn!(%payer, %owner, %error, "approval check failed");
                return Err(UploadError::ApprovalFailed);
            }
        }
    }
    match ctx
        .payment
        .reserve_balance(owner, &approved, byte_count)
        .await
    {
        Ok(reservation) => Ok(reservation),
        Err(PaymentError::Insufficient) => Err(UploadError::InsufficientBalance),
        Err(PaymentError::Unreachable { message }) => Err(UploadError::unavailable(message)),
    }
}

/// Best-effort enqueues: failures are counted, never fatal.
async fn enqueue_soft_jobs(ctx: &UploadContext, id: &DataItemId, tags: &[Tag]) {
    if ctx.config.optical_bridging_enabled
        && let Err(error) = ctx.queue.enqueue(Job::OpticalPost { id: *id }).await
    {
        tracing::warn!(%id, %error, "optical enqueue failed");
        metrics::counter!("soft_enqueue_failures_total", "job" => "optical").increment(1);
    }
    let is_bdi = tag_value(tags, "Bundle-Format").is_some();
    if is_bdi && let Err(error) = ctx.queue.enqueue(Job::UnbundleBdi { id: *id }).await {
        tracing::warn!(%id, %error, "unbundle enqueue failed");
        metrics::counter!("soft_enqueue_failures_total", "job" => "unbundle-bdi").increment(1);
    }
}

/// The compensating branch.
///
/// Refunds any reservation, revokes a consumed paid-by approval,
/// quarantines persisted artifacts, and clears the caches. Returns the
/// error it was given so call sites read as `return Err(fail(...).await)` —
/// unless the revocation itself fails, which supersedes the original error
/// (the upload failed *and* the payer's grant is still burned).
pub(crate) async fn fail(
    ctx: &UploadContext,
    id: &DataItemId,
    error: UploadError,
    reservation: Option<&BalanceReservation>,
) -> UploadError {
    let mut error = error;
    if let Some(reservation) = reservation {
        if !reservation.assessed_winc.is_zero() {
            match ctx
                .payment
                .refund_balance(&reservation.paying_address, reservation.assessed_winc)
                .await
            {
                Ok(()) => metrics::counter!("refunds_total").increment(1),
                Err(refund_error) => {
                    tracing::error!(%id, %refund_error, "refund failed; balance is off until reconciliation");
                    metrics::counter!("refund_failures_total").increment(1);
                }
            }
        }
        if reservation.used_paid_by() {
            match ctx
                .payment
                .revoke_approval(&reservation.paying_address, &reservation.owner)
                .await
            {
                Ok(()) => metrics::counter!("approval_revocations_total").increment(1),
                Err(revoke_error) => {
                    tracing::error!(
                        %id,
                        payer = %reservation.paying_address,
                        %error,
                        %revoke_error,
                        "approval revocation failed"
                    );
                    metrics::counter!("revoke_failures_total").increment(1);
                    error = UploadError::RevokeFailed;
                }
            }
        }
    }
    quarantine(ctx, id).await;
    ctx.payload_cache.invalidate(id);
    error
}

/// Rename-based soft delete of everything persisted for `id`.
pub(crate) async fn quarantine(ctx: &UploadContext, id: &DataItemId) {
    if let Err(error) = ctx.fs_store.quarantine(id).await {
        tracing::warn!(%id, %error, "fs quarantine failed");
    }
    let raw_key = raw_data_item_key(id);
    match ctx.object_store.head(&raw_key).await {
        Ok(Some(_)) => {
            let quarantine_key = format!("quarantine_{raw_key}");
            if let Err(error) = ctx.object_store.rename(&raw_key, &quarantine_key).await {
                tracing::warn!(%id, %error, "object quarantine failed");
            }
        }
        Ok(None) => {}
        Err(error) => tracing::warn!(%id, %error, "object quarantine probe failed"),
    }
    if let Err(error) = ctx.kv_rows.delete_inline(id).await {
        tracing::warn!(%id, %error, "inline row cleanup failed");
    }
}

fn map_parse_error(error: ParseError) -> UploadError {
    if error.is_client_fault() {
        UploadError::invalid(error)
    } else {
        UploadError::unavailable(error)
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
