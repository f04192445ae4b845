use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::core::error::{AppError, Result};
use crate::shared::constants::{ALLOWED_EXTENSIONS, DENIED_MIME_TYPES};
use crate::shared::validation::file_extension;

/// Storage category of an uploaded file. Chooses the subdirectory a
/// finished file lands in; inferred from the MIME type when the client
/// does not declare one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    #[default]
    Document,
    Image,
    Video,
}

impl FileCategory {
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            FileCategory::Image
        } else if mime_type.starts_with("video/") {
            FileCategory::Video
        } else {
            FileCategory::Document
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileCategory::Document => "document",
            FileCategory::Image => "image",
            FileCategory::Video => "video",
        }
    }
}

/// Validate a candidate filename and MIME type before any bytes are
/// accepted. Applied at session initiation; the merge path derives its
/// destination from the same validated extension.
pub fn validate_filename(filename: &str, mime_type: &str) -> Result<()> {
    if filename.trim().is_empty() {
        return Err(AppError::Validation("Filename is required".to_string()));
    }

    let ext = file_extension(filename)
        .ok_or_else(|| AppError::Validation("Filename must have an extension".to_string()))?;

    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(AppError::Validation(format!(
            "File extension '{}' is not allowed",
            ext
        )));
    }

    if DENIED_MIME_TYPES.contains(&mime_type.to_ascii_lowercase().as_str()) {
        return Err(AppError::Validation(format!(
            "MIME type '{}' is not allowed",
            mime_type
        )));
    }

    Ok(())
}

/// Request DTO for initiating a chunked upload session
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct InitiateUploadDto {
    /// Original filename
    #[validate(length(min = 1, message = "filename is required"))]
    pub filename: String,
    /// Total number of chunks the client will send
    #[validate(range(min = 1, message = "total_chunks must be positive"))]
    pub total_chunks: i32,
    /// Size of each chunk in bytes
    #[validate(range(min = 1, message = "chunk_size must be positive"))]
    pub chunk_size: i64,
    /// Total file size in bytes
    #[validate(range(min = 1, message = "total_size must be positive"))]
    pub total_size: i64,
    /// SHA-256 checksum of the whole file, verified at merge time
    pub file_checksum: Option<String>,
    pub mime_type: Option<String>,
    pub category: Option<FileCategory>,
    pub project_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
    pub description: Option<String>,
}

/// Chunk upload request body for OpenAPI documentation.
/// The actual handler uses axum's Multipart extractor directly.
#[derive(Debug, ToSchema)]
#[allow(dead_code)]
pub struct ChunkUploadFormDto {
    /// Raw chunk bytes
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    pub chunk: String,
}

/// Response DTO for a newly initiated upload session
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadSessionDto {
    pub upload_id: Uuid,
    pub expires_at: DateTime<Utc>,
    /// Chunk indices already received (empty on a fresh session)
    pub uploaded_chunks: Vec<i32>,
}

/// Response DTO for a single accepted chunk
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChunkReceiptDto {
    pub chunk_index: i32,
    pub received: bool,
    /// Progress in percent, 0.0 to 100.0
    pub upload_progress: f64,
    pub uploaded_chunks: Vec<i32>,
}

/// Response DTO for status and retry-missing queries
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadStatusDto {
    pub upload_id: Uuid,
    pub filename: String,
    pub total_chunks: i32,
    pub uploaded_chunks: Vec<i32>,
    /// Chunks not yet present on disk, for client retry
    pub missing_chunks: Vec<i32>,
    /// Progress in percent, 0.0 to 100.0
    pub progress: f64,
    pub is_completed: bool,
    pub final_file_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Response DTO for a completed (merged) upload
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CompleteUploadDto {
    pub upload_id: Uuid,
    pub final_file_id: Uuid,
    pub message: String,
}

/// Response DTO for upload cancellation
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelUploadDto {
    pub message: String,
}

/// Response DTO for the expiry reaper sweep
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CleanupReportDto {
    pub message: String,
    pub uploads_removed: i64,
    pub total_uploads_expired: i64,
    pub space_freed_bytes: i64,
    pub space_freed_mb: f64,
}

/// Response DTO for the terminal file record
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StoredFileDto {
    pub id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub size: i64,
    pub mime_type: String,
    pub category: String,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}
