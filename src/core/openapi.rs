use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::features::uploads::access::Actor;
use crate::features::uploads::{dtos as uploads_dtos, handlers as uploads_handlers};
use crate::shared::types::{ApiResponse, Meta};

#[derive(OpenApi)]
#[openapi(
    paths(
        // Uploads
        uploads_handlers::initiate_upload,
        uploads_handlers::upload_chunk,
        uploads_handlers::upload_status,
        uploads_handlers::retry_missing_chunks,
        uploads_handlers::complete_upload,
        uploads_handlers::cancel_upload,
        uploads_handlers::cleanup_expired_uploads,
        // Files
        uploads_handlers::get_file,
    ),
    components(
        schemas(
            // Shared
            Meta,
            Actor,
            // Uploads
            uploads_dtos::FileCategory,
            uploads_dtos::InitiateUploadDto,
            uploads_dtos::ChunkUploadFormDto,
            uploads_dtos::UploadSessionDto,
            uploads_dtos::ChunkReceiptDto,
            uploads_dtos::UploadStatusDto,
            uploads_dtos::CompleteUploadDto,
            uploads_dtos::CancelUploadDto,
            uploads_dtos::CleanupReportDto,
            uploads_dtos::StoredFileDto,
            ApiResponse<uploads_dtos::UploadSessionDto>,
            ApiResponse<uploads_dtos::ChunkReceiptDto>,
            ApiResponse<uploads_dtos::UploadStatusDto>,
            ApiResponse<uploads_dtos::CompleteUploadDto>,
            ApiResponse<uploads_dtos::CancelUploadDto>,
            ApiResponse<uploads_dtos::CleanupReportDto>,
            ApiResponse<uploads_dtos::StoredFileDto>,
        )
    ),
    tags(
        (name = "uploads", description = "Resumable chunked upload sessions"),
        (name = "files", description = "Finished file records"),
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Worksite API",
        version = "0.1.0",
        description = "Resumable chunked upload API for Worksite",
    )
)]
pub struct ApiDoc;

/// Adds the actor-header security scheme to the OpenAPI spec
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "actor_headers",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-Actor-Id"))),
            );
        }
    }
}

/// Modifier to override OpenAPI info from config
pub struct SwaggerInfoModifier {
    pub title: String,
    pub version: String,
    pub description: String,
}

impl Modify for SwaggerInfoModifier {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.info.title = self.title.clone();
        openapi.info.version = self.version.clone();
        openapi.info.description = Some(self.description.clone());
    }
}
