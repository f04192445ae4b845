use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::core::error::AppError;
use crate::features::uploads::access::Actor;
use crate::features::uploads::dtos::{
    CancelUploadDto, ChunkReceiptDto, ChunkUploadFormDto, CleanupReportDto, CompleteUploadDto,
    InitiateUploadDto, StoredFileDto, UploadSessionDto, UploadStatusDto,
};
use crate::features::uploads::services::UploadService;
use crate::shared::types::ApiResponse;

/// Initiate a chunked upload session
///
/// Declares the file's metadata up front. The response carries the
/// `upload_id` all later chunk and control requests refer to, and the
/// session's fixed expiry.
#[utoipa::path(
    post,
    path = "/api/uploads",
    tag = "uploads",
    request_body = InitiateUploadDto,
    responses(
        (status = 201, description = "Upload session created", body = ApiResponse<UploadSessionDto>),
        (status = 400, description = "Invalid metadata or disallowed file type"),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Not allowed to upload to the declared associations")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn initiate_upload(
    actor: Actor,
    State(service): State<Arc<UploadService>>,
    Json(dto): Json<InitiateUploadDto>,
) -> Result<(StatusCode, Json<ApiResponse<UploadSessionDto>>), AppError> {
    let session = service.initiate(dto, &actor).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            Some(session),
            Some("Upload session created".to_string()),
            None,
        )),
    ))
}

/// Upload one chunk
///
/// Accepts multipart/form-data with a single `chunk` field holding the raw
/// bytes. Chunks may arrive in any order and may be retransmitted; an
/// identical retransmission succeeds without rewriting anything.
#[utoipa::path(
    post,
    path = "/api/uploads/{upload_id}/chunks/{chunk_index}",
    tag = "uploads",
    params(
        ("upload_id" = Uuid, Path, description = "Upload session id"),
        ("chunk_index" = i32, Path, description = "1-based chunk index")
    ),
    request_body(
        content = ChunkUploadFormDto,
        content_type = "multipart/form-data",
        description = "Form with a single `chunk` field carrying the chunk bytes",
    ),
    responses(
        (status = 200, description = "Chunk accepted", body = ApiResponse<ChunkReceiptDto>),
        (status = 400, description = "Missing chunk data, empty chunk, or index out of range"),
        (status = 404, description = "Upload session not found"),
        (status = 408, description = "Chunk write timed out"),
        (status = 409, description = "Session already completed, or chunk locked by another request"),
        (status = 410, description = "Upload session expired"),
        (status = 413, description = "Chunk exceeds the configured maximum")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn upload_chunk(
    _actor: Actor,
    State(service): State<Arc<UploadService>>,
    Path((upload_id, chunk_index)): Path<(Uuid, i32)>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<ChunkReceiptDto>>, AppError> {
    let mut chunk_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        debug!("Failed to read multipart field: {}", e);
        AppError::BadRequest(format!("Failed to read multipart data: {}", e))
    })? {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "chunk" => {
                let data = field.bytes().await.map_err(|e| {
                    debug!("Failed to read chunk bytes: {}", e);
                    AppError::BadRequest(format!("Failed to read chunk data: {}", e))
                })?;
                chunk_data = Some(data.to_vec());
            }
            _ => {
                debug!("Ignoring unknown field: {}", field_name);
            }
        }
    }

    let chunk_data =
        chunk_data.ok_or_else(|| AppError::BadRequest("Chunk field is required".to_string()))?;

    let receipt = service
        .accept_chunk(upload_id, chunk_index, &chunk_data)
        .await?;

    Ok(Json(ApiResponse::success(Some(receipt), None, None)))
}

/// Get upload progress
///
/// Reports the chunk set verified against disk, the missing indices a
/// client should retry, and the completion state.
#[utoipa::path(
    get,
    path = "/api/uploads/{upload_id}/status",
    tag = "uploads",
    params(
        ("upload_id" = Uuid, Path, description = "Upload session id")
    ),
    responses(
        (status = 200, description = "Current upload status", body = ApiResponse<UploadStatusDto>),
        (status = 404, description = "Upload session not found")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn upload_status(
    _actor: Actor,
    State(service): State<Arc<UploadService>>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<ApiResponse<UploadStatusDto>>, AppError> {
    let status = service.status(upload_id).await?;
    Ok(Json(ApiResponse::success(Some(status), None, None)))
}

/// Re-derive missing chunks from disk
///
/// Like the status query, but persists the corrected chunk set when the
/// database and the disk disagree. Meant for a client recovering after an
/// interrupted transfer.
#[utoipa::path(
    post,
    path = "/api/uploads/{upload_id}/retry",
    tag = "uploads",
    params(
        ("upload_id" = Uuid, Path, description = "Upload session id")
    ),
    responses(
        (status = 200, description = "Reconciled upload status", body = ApiResponse<UploadStatusDto>),
        (status = 404, description = "Upload session not found"),
        (status = 409, description = "Session already completed")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn retry_missing_chunks(
    _actor: Actor,
    State(service): State<Arc<UploadService>>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<ApiResponse<UploadStatusDto>>, AppError> {
    let status = service.retry_missing(upload_id).await?;
    Ok(Json(ApiResponse::success(
        Some(status),
        Some("Upload state reconciled".to_string()),
        None,
    )))
}

/// Merge all chunks into the final file
///
/// Fails with the missing chunk list if any chunk is absent from disk, and
/// with a checksum error if the merged bytes do not match the declared
/// SHA-256. Repeating the call after success returns the same file id.
#[utoipa::path(
    post,
    path = "/api/uploads/{upload_id}/complete",
    tag = "uploads",
    params(
        ("upload_id" = Uuid, Path, description = "Upload session id")
    ),
    responses(
        (status = 200, description = "Upload merged into its final file", body = ApiResponse<CompleteUploadDto>),
        (status = 403, description = "Not allowed to complete this upload"),
        (status = 404, description = "Upload session not found"),
        (status = 409, description = "Chunks missing, retry before completing"),
        (status = 410, description = "Upload session expired"),
        (status = 422, description = "Merged file does not match the declared checksum")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn complete_upload(
    actor: Actor,
    State(service): State<Arc<UploadService>>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<ApiResponse<CompleteUploadDto>>, AppError> {
    let result = service.complete(upload_id, &actor).await?;
    let message = result.message.clone();
    Ok(Json(ApiResponse::success(Some(result), Some(message), None)))
}

/// Cancel an upload and discard its chunks
#[utoipa::path(
    delete,
    path = "/api/uploads/{upload_id}",
    tag = "uploads",
    params(
        ("upload_id" = Uuid, Path, description = "Upload session id")
    ),
    responses(
        (status = 200, description = "Upload cancelled", body = ApiResponse<CancelUploadDto>),
        (status = 404, description = "Upload session not found"),
        (status = 409, description = "Session already completed")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn cancel_upload(
    _actor: Actor,
    State(service): State<Arc<UploadService>>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<ApiResponse<CancelUploadDto>>, AppError> {
    let result = service.cancel(upload_id).await?;
    Ok(Json(ApiResponse::success(Some(result), None, None)))
}

/// Sweep expired upload sessions
///
/// Removes expired, incomplete sessions and their temp chunks. The same
/// sweep also runs on the background interval; this endpoint triggers it on
/// demand.
#[utoipa::path(
    post,
    path = "/api/uploads/cleanup",
    tag = "uploads",
    responses(
        (status = 200, description = "Sweep report", body = ApiResponse<CleanupReportDto>),
        (status = 401, description = "Authentication required")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn cleanup_expired_uploads(
    _actor: Actor,
    State(service): State<Arc<UploadService>>,
) -> Result<Json<ApiResponse<CleanupReportDto>>, AppError> {
    let report = service.cleanup_expired().await?;
    let message = report.message.clone();
    Ok(Json(ApiResponse::success(Some(report), Some(message), None)))
}

/// Look up a finished file record
#[utoipa::path(
    get,
    path = "/api/files/{file_id}",
    tag = "files",
    params(
        ("file_id" = Uuid, Path, description = "Final file id returned by completion")
    ),
    responses(
        (status = 200, description = "File record", body = ApiResponse<StoredFileDto>),
        (status = 404, description = "File not found")
    ),
    security(
        ("actor_headers" = [])
    )
)]
pub async fn get_file(
    _actor: Actor,
    State(service): State<Arc<UploadService>>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<ApiResponse<StoredFileDto>>, AppError> {
    let file = service.get_file(file_id).await?;
    Ok(Json(ApiResponse::success(Some(file), None, None)))
}
