use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Logical file record, created exactly once per successfully merged upload.
#[derive(Debug, Clone, FromRow)]
pub struct StoredFile {
    pub id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub path: String,
    pub size: i64,
    pub mime_type: String,
    pub category: String,
    pub checksum: Option<String>,
    pub project_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
    pub description: Option<String>,
    pub uploaded_by: Uuid,
    pub created_at: DateTime<Utc>,
}
