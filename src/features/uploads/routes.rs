use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::features::uploads::handlers::{
    cancel_upload, cleanup_expired_uploads, complete_upload, get_file, initiate_upload,
    retry_missing_chunks, upload_chunk, upload_status,
};
use crate::features::uploads::services::UploadService;

/// Create routes for the uploads feature
pub fn routes(service: Arc<UploadService>, max_chunk_size: i64) -> Router {
    Router::new()
        .route("/api/uploads", post(initiate_upload))
        .route(
            "/api/uploads/{upload_id}/chunks/{chunk_index}",
            // Allow body size up to the chunk cap plus multipart overhead
            post(upload_chunk)
                .layer(DefaultBodyLimit::max(max_chunk_size as usize + 64 * 1024)),
        )
        .route("/api/uploads/{upload_id}/status", get(upload_status))
        .route("/api/uploads/{upload_id}/retry", post(retry_missing_chunks))
        .route("/api/uploads/{upload_id}/complete", post(complete_upload))
        .route("/api/uploads/{upload_id}", delete(cancel_upload))
        .route("/api/uploads/cleanup", post(cleanup_expired_uploads))
        .route("/api/files/{file_id}", get(get_file))
        .with_state(service)
}
