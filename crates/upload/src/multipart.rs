//! Multipart (resumable) upload state machine.
//!
//! Three endpoints: create, post-chunk-at-offset, finalize. Chunks may
//! arrive out of order; a chunk's part number is a pure function of its
//! offset. Finalize is idempotent: it picks up from whichever of its three
//! recovery points a previous attempt reached.

use std::time::Duration;

use anchorage_parser::{
    HeaderCollector, ParseEvent, ParserOptions, event_channel, parse_header_prefix, parse_stream,
};
use anchorage_primitives::{
    ByteCount, DataItemId, MultipartFailure, MultipartUpload, NativeAddress, Receipt,
    RECEIPT_VERSION, SignedReceipt,
};
use anchorage_crypto::{
    StreamedBlob, data_item_signing_payload, sign_receipt, verify_data_item_blocking,
};
use anchorage_storage::{PartEtag, multipart_key, raw_data_item_key};
use bytes::Bytes;
use uuid::Uuid;

use crate::{
    context::UploadContext,
    error::UploadError,
    queue::Job,
    single::{ValidatedItem, issue_receipt},
    status::MultipartUploadStatus,
};

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
/// Largest accepted chunk size.
pub const MAX_CHUNK_SIZE: u64 = 500 * 1024 * 1024;
/// Chunk size used when the client does not pick one.
pub const DEFAULT_CHUNK_SIZE: u64 = 25_000_000;
/// The object store's cap on part numbers.
pub const MAX_PART_NUMBER: i64 = 10_000;

/// Largest possible header: worst-case field lengths plus the tag cap.
const MAX_HEADER_BYTES: u64 = 2 + 2052 + 1025 + 33 + 33 + 16 + 4096;

/// Settle time after create, covering read-replica lag before the client's
/// first part lookup.
const CREATE_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Response body for create.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MultipartCreated {
    pub id: String,
    pub min: u64,
    pub max: u64,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
}

/// What finalize produced.
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// Validation ran inline; here is the receipt.
    Receipt(Box<SignedReceipt>),
    /// Assembly is done; validation continues in the background (202).
    Accepted { upload_id: String },
}

/// `POST /chunks/:token` — create a resumable upload.
pub async fn create_multipart_upload(
    ctx: &UploadContext,
    chunk_size: Option<u64>,
) -> Result<MultipartCreated, UploadError> {
    let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(UploadError::InvalidChunk {
            reason: format!(
                "chunkSize must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes"
            ),
        });
    }

    let upload_id = Uuid::new_v4().to_string();
    let upload_key = Uuid::new_v4().to_string();
    let store_upload_id = ctx
        .object_store
        .create_multipart(&multipart_key(&upload_key))
        .await
        .map_err(UploadError::unavailable)?;

    let record = MultipartUpload {
        upload_id: upload_id.clone(),
        upload_key,
        chunk_size: ByteCount(chunk_size),
        store_upload_id: Some(store_upload_id),
        failed_reason: None,
        data_item_id: None,
        etag: None,
    };
    ctx.db
        .insert_multipart(record)
        .await
        .map_err(UploadError::unavailable)?;

    // Give replicas a moment before the client starts posting parts.
    tokio::time::sleep(CREATE_SETTLE_DELAY).await;

    Ok(MultipartCreated {
        id: upload_id,
        min: MIN_CHUNK_SIZE,
        max: MAX_CHUNK_SIZE,
        chunk_size,
    })
}

/// `POST /chunks/:token/:uploadId/:offset` — store one chunk.
pub async fn post_chunk(
    ctx: &UploadContext,
    upload_id: &str,
    offset: u64,
    body: Bytes,
) -> Result<(), UploadError> {
    if body.is_empty() {
        return Err(UploadError::InvalidChunk {
            reason: "chunk body must not be empty".into(),
        });
    }
    let mut upload = load_upload(ctx, upload_id).await?;
    if let Some(reason) = upload.failed_reason {
        return Err(failure_error(reason));
    }
    let Some(store_upload_id) = upload.store_upload_id.clone() else {
        return Err(UploadError::InvalidChunk {
            reason: "upload is already finalized".into(),
        });
    };

    // A client that starts sending bigger chunks moves the expected size up;
    // part numbering from then on uses the larger stride.
    if body.len() as u64 > upload.chunk_size.as_u64() {
        let grown = ByteCount(body.len() as u64);
        ctx.db
            .update_multipart_chunk_size(upload_id, grown)
            .await
            .map_err(UploadError::unavailable)?;
        upload.chunk_size = grown;
    }
    let chunk_size = upload.chunk_size.as_u64();

    if offset % chunk_size != 0 {
        return Err(UploadError::InvalidChunk {
            reason: format!("offset {offset} is not a multiple of the {chunk_size}-byte chunk size"),
        });
    }
    let part_number = (offset / chunk_size) as i64 + 1;
    if part_number > MAX_PART_NUMBER {
        return Err(UploadError::InvalidChunk {
            reason: format!("part number {part_number} exceeds the {MAX_PART_NUMBER} cap"),
        });
    }

    ctx.object_store
        .upload_part(
            &multipart_key(&upload.upload_key),
            &store_upload_id,
            part_number as i32,
            body,
        )
        .await
        .map_err(UploadError::unavailable)?;
    Ok(())
}

/// `GET /chunks/:token/:uploadId` — parts and settings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MultipartInfo {
    pub id: String,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    pub chunks: Vec<(i32, String)>,
    #[serde(rename = "failedReason", skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<MultipartFailure>,
}

pub async fn multipart_info(
    ctx: &UploadContext,
    upload_id: &str,
) -> Result<MultipartInfo, UploadError> {
    let upload = load_upload(ctx, upload_id).await?;
    let chunks = match &upload.store_upload_id {
        Some(store_upload_id) => ctx
            .object_store
            .list_parts(&multipart_key(&upload.upload_key), store_upload_id)
            .await
            .map_err(UploadError::unavailable)?
            .into_iter()
            .map(|part| (part.part_number, part.etag))
            .collect(),
        None => Vec::new(),
    };
    Ok(MultipartInfo {
        id: upload.upload_id,
        chunk_size: upload.chunk_size.as_u64(),
        chunks,
        failed_reason: upload.failed_reason,
    })
}

/// `GET /chunks/:token/:uploadId/status`.
pub async fn multipart_status(
    ctx: &UploadContext,
    upload_id: &str,
) -> Result<MultipartUploadStatus, UploadError> {
    let upload = load_upload(ctx, upload_id).await?;
    if let Some(reason) = upload.failed_reason {
        return Ok(MultipartUploadStatus::Failed { reason });
    }
    if let Some(id) = upload.data_item_id {
        let recorded = ctx
            .db
            .get_data_item(&id)
            .await
            .map_err(UploadError::unavailable)?
            .is_some();
        return Ok(if recorded {
            MultipartUploadStatus::Finalized
        } else {
            MultipartUploadStatus::Finalizing
        });
    }
    // Assembly closed but not yet validated (async validation in flight).
    if upload.etag.is_some() {
        return Ok(MultipartUploadStatus::Validating);
    }
    Ok(MultipartUploadStatus::Assembling)
}

/// `POST /chunks/:token/:uploadId/-1` — finalize.
///
/// Recovery points, in order:
/// 1. assembly not yet validated → complete + stream-validate;
/// 2. validated but the raw artifact still lives under the staging key →
///    move it into the data-item prefix;
/// 3. artifact in place but no database row → issue the receipt.
///
/// A finalize that already ran to completion reconstructs the identical
/// receipt from the recorded row (zero-salt PSS is deterministic).
pub async fn finalize_multipart_upload(
    ctx: &UploadContext,
    upload_id: &str,
    paid_by: &[NativeAddress],
    async_validation: bool,
) -> Result<FinalizeOutcome, UploadError> {
    let upload = load_upload(ctx, upload_id).await?;
    if let Some(reason) = upload.failed_reason {
        return Err(failure_error(reason));
    }

    if async_validation && !upload.is_finalized() {
        let etag = assemble(ctx, &upload).await?;
        ctx.db
            .record_multipart_assembly(upload_id, &etag)
            .await
            .map_err(UploadError::unavailable)?;
        ctx.queue
            .enqueue(Job::FinalizeMultipart {
                upload_id: upload_id.to_owned(),
            })
            .await
            .map_err(UploadError::unavailable)?;
        return Ok(FinalizeOutcome::Accepted {
            upload_id: upload_id.to_owned(),
        });
    }

    // Entry point 1: assemble and validate.
    let upload = if upload.is_finalized() {
        upload
    } else {
        let etag = assemble(ctx, &upload).await?;
        ctx.db
            .record_multipart_assembly(upload_id, &etag)
            .await
            .map_err(UploadError::unavailable)?;
        let data_item_id = validate_assembled(ctx, upload_id, &upload).await?;
        ctx.db
            .finalize_multipart(upload_id, data_item_id, &etag)
            .await
            .map_err(UploadError::unavailable)?;
        load_upload(ctx, upload_id).await?
    };

    let data_item_id = upload
        .data_item_id
        .ok_or_else(|| UploadError::unavailable("finalized upload lost its data item id"))?;
    let raw_key = raw_data_item_key(&data_item_id);

    // Entry point 2: move the artifact into the data-item prefix.
    let raw_size = match ctx
        .object_store
        .head(&raw_key)
        .await
        .map_err(UploadError::unavailable)?
    {
        Some(size) => size,
        None => {
            let staging = multipart_key(&upload.upload_key);
            let Some(size) = ctx
                .object_store
                .head(&staging)
                .await
                .map_err(UploadError::unavailable)?
            else {
                return Err(UploadError::unavailable(
                    "assembled artifact missing from both prefixes",
                ));
            };
            ctx.object_store
                .rename(&staging, &raw_key)
                .await
                .map_err(UploadError::unavailable)?;
            size
        }
    };

    // Entry point 3: the receipt tail, unless it already ran.
    if let Some(record) = ctx
        .db
        .get_data_item(&data_item_id)
        .await
        .map_err(UploadError::unavailable)?
    {
        let receipt = Receipt {
            id: record.data_item_id,
            timestamp: record.uploaded_timestamp,
            deadline_height: record.deadline_height,
            version: RECEIPT_VERSION.to_owned(),
            data_caches: ctx.config.data_caches.clone(),
            fast_finality_indexes: ctx.config.fast_finality_indexes.clone(),
            winc: record.assessed_winc_price,
        };
        let signed = sign_receipt(&ctx.wallet, receipt).map_err(UploadError::unavailable)?;
        return Ok(FinalizeOutcome::Receipt(Box::new(signed)));
    }

    let prefix = ctx
        .object_store
        .get_prefix(&raw_key, MAX_HEADER_BYTES)
        .await
        .map_err(UploadError::unavailable)?
        .ok_or_else(|| UploadError::unavailable("raw artifact disappeared mid-finalize"))?;
    let (header, payload_data_start) = parse_header_prefix(&prefix).map_err(UploadError::invalid)?;
    let tags = header.tags().map_err(UploadError::invalid)?;
    let content_type = header.payload_content_type();

    let validated = ValidatedItem {
        header,
        tags,
        byte_count: raw_size,
        payload_data_start,
        content_type,
    };
    let signed = match issue_receipt(ctx, &validated, paid_by).await {
        Ok(signed) => signed,
        Err(error) => {
            if let Some(reason) = failure_reason(&error)
                && let Err(db_error) = ctx.db.fail_multipart(upload_id, reason).await
            {
                tracing::warn!(upload_id, %db_error, "failed to record multipart failure");
            }
            return Err(error);
        }
    };
    metrics::counter!("multipart_finalized_total").increment(1);
    Ok(FinalizeOutcome::Receipt(Box::new(signed)))
}

/// Completes the object-store assembly, returning its etag. Idempotent on
/// the store side: an already-completed upload just reports its etag via
/// the recorded value.
async fn assemble(ctx: &UploadContext, upload: &MultipartUpload) -> Result<String, UploadError> {
    if let Some(etag) = &upload.etag {
        return Ok(etag.clone());
    }
    let Some(store_upload_id) = &upload.store_upload_id else {
        return Err(UploadError::unavailable("upload has no open assembly"));
    };
    let key = multipart_key(&upload.upload_key);
    let mut parts = ctx
        .object_store
        .list_parts(&key, store_upload_id)
        .await
        .map_err(UploadError::unavailable)?;
    if parts.is_empty() {
        return Err(UploadError::InvalidChunk {
            reason: "no chunks were uploaded".into(),
        });
    }
    parts.sort_by_key(|part: &PartEtag| part.part_number);
    ctx.object_store
        .complete_multipart(&key, store_upload_id, parts)
        .await
        .map_err(UploadError::unavailable)
}

/// Streams the assembled object through the parser and verifier.
async fn validate_assembled(
    ctx: &UploadContext,
    upload_id: &str,
    upload: &MultipartUpload,
) -> Result<DataItemId, UploadError> {
    let key = multipart_key(&upload.upload_key);
    let source = ctx
        .object_store
        .get_stream(&key)
        .await
        .map_err(UploadError::unavailable)?
        .ok_or_else(|| UploadError::unavailable("assembled object missing"))?;

    let options = ParserOptions::default();
    let (tx, mut rx) = event_channel(&options);
    let parse_task = tokio::spawn(parse_stream(source, tx, options));

    let mut collector = HeaderCollector::new();
    let mut header = None;
    let mut hasher = StreamedBlob::new();
    let mut total_payload: u64 = 0;
    while let Some(event) = rx.recv().await {
        match event {
            Ok(ParseEvent::Payload(chunk)) => {
                hasher.update(&chunk);
                total_payload += chunk.len() as u64;
            }
            Ok(event) => {
                if let Some(parsed) = collector.accept(&event) {
                    header = Some(parsed);
                }
            }
            Err(_) => break,
        }
    }
    let invalid = |reason: String| mark_invalid(ctx, upload_id, upload, reason);

    match parse_task.await {
        Ok(Ok(_)) => {}
        Ok(Err(parse_error)) if parse_error.is_client_fault() => {
            return Err(invalid(parse_error.to_string()).await);
        }
        Ok(Err(parse_error)) => return Err(UploadError::unavailable(parse_error)),
        Err(join_error) => return Err(UploadError::unavailable(join_error)),
    }
    let header = header.ok_or_else(|| UploadError::unavailable("parse finished without header"))?;

    let byte_count = header.encoded_len() + ByteCount(total_payload);
    if byte_count > ctx.config.max_data_item_bytes {
        return Err(invalid(format!(
            "assembled item of {byte_count} bytes exceeds the {} byte limit",
            ctx.config.max_data_item_bytes
        ))
        .await);
    }
    if let Err(tag_error) = header.tags() {
        return Err(invalid(tag_error.to_string()).await);
    }

    let message = data_item_signing_payload(&header, hasher.finalize());
    if !verify_data_item_blocking(header.clone(), message).await {
        return Err(invalid("signature does not verify".to_owned()).await);
    }
    if ctx
        .config
        .blocklisted_addresses
        .contains(&header.owner_address())
    {
        return Err(invalid("owner is blocklisted".to_owned()).await);
    }

    Ok(header.id())
}

/// Marks the upload failed-INVALID and quarantines the assembled artifact.
async fn mark_invalid(
    ctx: &UploadContext,
    upload_id: &str,
    upload: &MultipartUpload,
    reason: String,
) -> UploadError {
    if let Err(db_error) = ctx
        .db
        .fail_multipart(upload_id, MultipartFailure::Invalid)
        .await
    {
        tracing::warn!(upload_id, %db_error, "failed to record multipart failure");
    }
    let staging = multipart_key(&upload.upload_key);
    let quarantine_key = format!("quarantine_{staging}");
    if let Err(store_error) = ctx.object_store.rename(&staging, &quarantine_key).await {
        tracing::warn!(upload_id, %store_error, "failed to quarantine assembled artifact");
    }
    metrics::counter!("multipart_invalid_total").increment(1);
    UploadError::InvalidDataItem { reason }
}

async fn load_upload(ctx: &UploadContext, upload_id: &str) -> Result<MultipartUpload, UploadError> {
    ctx.db
        .get_multipart(upload_id)
        .await
        .map_err(UploadError::unavailable)?
        .ok_or(UploadError::NotFound)
}

/// Maps a receipt-tail error to the reason recorded on the upload, for the
/// errors that have one.
fn failure_reason(error: &UploadError) -> Option<MultipartFailure> {
    match error {
        UploadError::InsufficientBalance => Some(MultipartFailure::Underfunded),
        UploadError::ApprovalFailed => Some(MultipartFailure::ApprovalFailed),
        UploadError::RevokeFailed => Some(MultipartFailure::RevokeFailed),
        _ => None,
    }
}

/// The error a recorded failure reports on later requests.
fn failure_error(reason: MultipartFailure) -> UploadError {
    match reason {
        MultipartFailure::Underfunded => UploadError::InsufficientBalance,
        MultipartFailure::Invalid => UploadError::InvalidDataItem {
            reason: "upload previously failed validation".into(),
        },
        MultipartFailure::ApprovalFailed => UploadError::ApprovalFailed,
        MultipartFailure::RevokeFailed => UploadError::RevokeFailed,
    }
}
