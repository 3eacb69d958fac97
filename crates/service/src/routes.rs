//! HTTP surface.
//!
//! Routing and status mapping only; every decision of substance lives in
//! the upload state machines.

use std::sync::Arc;

use anchorage_primitives::{DataItemId, NativeAddress};
use anchorage_upload::{
    FinalizeOutcome, SingleUploadRequest, UploadContext, UploadError, create_multipart_upload,
    finalize_multipart_upload, handle_single_upload, multipart_info, multipart_status, post_chunk,
};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{StreamExt as _, TryStreamExt as _};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<UploadContext>,
    pub metrics: PrometheusHandle,
}

/// Assembles the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tx", post(post_tx))
        .route("/tx/{token}", post(post_tx_token))
        .route("/tx/{id}/status", get(get_tx_status))
        .route("/chunks/{token}", post(post_create_multipart))
        .route("/chunks/{token}/{upload_id}", get(get_multipart_info))
        .route(
            "/chunks/{token}/{upload_id}/status",
            get(get_multipart_status),
        )
        .route(
            "/chunks/{token}/{upload_id}/{offset}",
            post(post_multipart_chunk),
        )
        .route("/metrics", get(get_metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn paid_by_addresses(headers: &HeaderMap) -> Vec<NativeAddress> {
    headers
        .get("x-paid-by")
        .and_then(|value| value.to_str().ok())
        .map(|joined| {
            joined
                .split(',')
                .map(str::trim)
                .filter(|address| !address.is_empty())
                .map(NativeAddress::from_rendered)
                .collect()
        })
        .unwrap_or_default()
}

fn upload_request(
    headers: &HeaderMap,
    body: Body,
) -> SingleUploadRequest<
    futures::stream::BoxStream<'static, Result<bytes::Bytes, std::io::Error>>,
> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let body = body
        .into_data_stream()
        .map_err(std::io::Error::other)
        .boxed();
    SingleUploadRequest {
        body,
        content_length,
        content_type,
        paid_by: paid_by_addresses(headers),
    }
}

async fn post_tx(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    run_single_upload(state, headers, body).await
}

async fn post_tx_token(
    State(state): State<AppState>,
    Path(_token): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    run_single_upload(state, headers, body).await
}

async fn run_single_upload(state: AppState, headers: HeaderMap, body: Body) -> Response {
    let request = upload_request(&headers, body);
    match handle_single_upload(&state.ctx, request).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_tx_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<DataItemId>() else {
        return error_response(UploadError::NotFound);
    };
    match state
        .ctx
        .status_cache
        .data_item_status(&state.ctx.db, &id)
        .await
    {
        Ok(Some(status)) => (StatusCode::OK, Json(status)).into_response(),
        Ok(None) => error_response(UploadError::NotFound),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    #[serde(rename = "chunkSize")]
    chunk_size: Option<u64>,
}

async fn post_create_multipart(
    State(state): State<AppState>,
    Path(_token): Path<String>,
    Query(query): Query<CreateQuery>,
) -> Response {
    match create_multipart_upload(&state.ctx, query.chunk_size).await {
        Ok(created) => (StatusCode::OK, Json(created)).into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_multipart_info(
    State(state): State<AppState>,
    Path((_token, upload_id)): Path<(String, String)>,
) -> Response {
    match multipart_info(&state.ctx, &upload_id).await {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_multipart_status(
    State(state): State<AppState>,
    Path((_token, upload_id)): Path<(String, String)>,
) -> Response {
    match multipart_status(&state.ctx, &upload_id).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Debug, Deserialize)]
struct FinalizeQuery {
    #[serde(rename = "asyncValidation")]
    async_validation: Option<bool>,
}

async fn post_multipart_chunk(
    State(state): State<AppState>,
    Path((_token, upload_id, offset)): Path<(String, String, i64)>,
    Query(finalize): Query<FinalizeQuery>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    // Offset -1 is the finalize sentinel.
    if offset == -1 {
        let paid_by = paid_by_addresses(&headers);
        let async_validation = finalize.async_validation.unwrap_or(false);
        return match finalize_multipart_upload(&state.ctx, &upload_id, &paid_by, async_validation)
            .await
        {
            Ok(FinalizeOutcome::Receipt(receipt)) => {
                (StatusCode::OK, Json(*receipt)).into_response()
            }
            Ok(FinalizeOutcome::Accepted { upload_id }) => (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "id": upload_id })),
            )
                .into_response(),
            Err(error) => error_response(error),
        };
    }
    if offset < 0 {
        return error_response(UploadError::InvalidChunk {
            reason: format!("offset {offset} is not valid"),
        });
    }

    // Chunk posts must declare a positive length.
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if declared.is_none_or(|length| length == 0) {
        return error_response(UploadError::InvalidChunk {
            reason: "a positive Content-Length is required".into(),
        });
    }

    let collected = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(error) => {
            return error_response(UploadError::InvalidChunk {
                reason: format!("failed to read chunk body: {error}"),
            });
        }
    };
    match post_chunk(&state.ctx, &upload_id, offset as u64, collected).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => error_response(error),
    }
}

async fn get_metrics(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

fn error_response(error: UploadError) -> Response {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        metrics::counter!("request_failures_total").increment(1);
    }
    (status, Json(serde_json::json!({ "error": error.to_string() }))).into_response()
}
