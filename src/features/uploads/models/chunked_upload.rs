use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Database model for one chunked upload session.
///
/// `uploaded_chunks` is the persisted cache of durably accepted 1-based
/// chunk indices, serialized as a sorted comma-separated list. Disk is the
/// ground truth; this column is reconciled against the temp directory
/// before any state-changing decision.
#[derive(Debug, Clone, FromRow)]
pub struct ChunkedUpload {
    pub upload_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub category: String,
    pub total_chunks: i32,
    pub chunk_size: i64,
    pub total_size: i64,
    pub file_checksum: Option<String>,
    pub project_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
    pub description: Option<String>,
    pub uploaded_by: Uuid,
    pub uploaded_chunks: String,
    pub is_completed: bool,
    pub final_file_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChunkedUpload {
    /// Parse the persisted chunk list, sorted and deduplicated.
    pub fn received_chunks(&self) -> Vec<i32> {
        parse_chunk_list(&self.uploaded_chunks)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Indices of `{1..total_chunks}` absent from `present`.
    /// `present` must be sorted.
    pub fn missing_from(&self, present: &[i32]) -> Vec<i32> {
        (1..=self.total_chunks)
            .filter(|i| present.binary_search(i).is_err())
            .collect()
    }
}

pub fn parse_chunk_list(raw: &str) -> Vec<i32> {
    let mut chunks: Vec<i32> = raw
        .split(',')
        .filter_map(|s| s.trim().parse::<i32>().ok())
        .collect();
    chunks.sort_unstable();
    chunks.dedup();
    chunks
}

pub fn serialize_chunk_list(chunks: &[i32]) -> String {
    let mut sorted = chunks.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    sorted
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Upload progress as a percentage, rounded to two decimals.
pub fn progress_percent(uploaded: usize, total: i32) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let pct = uploaded as f64 / total as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(total_chunks: i32, uploaded: &str) -> ChunkedUpload {
        let now = Utc::now();
        ChunkedUpload {
            upload_id: Uuid::new_v4(),
            filename: "plan.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            category: "document".to_string(),
            total_chunks,
            chunk_size: 1024,
            total_size: 1024 * total_chunks as i64,
            file_checksum: None,
            project_id: None,
            client_id: None,
            stage_id: None,
            description: None,
            uploaded_by: Uuid::new_v4(),
            uploaded_chunks: uploaded.to_string(),
            is_completed: false,
            final_file_id: None,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::hours(24),
        }
    }

    #[test]
    fn test_parse_chunk_list_sorts_and_dedupes() {
        assert_eq!(parse_chunk_list("3,1,2,2"), vec![1, 2, 3]);
        assert_eq!(parse_chunk_list(""), Vec::<i32>::new());
        assert_eq!(parse_chunk_list("5, 4 ,junk,4"), vec![4, 5]);
    }

    #[test]
    fn test_serialize_chunk_list_round_trip() {
        assert_eq!(serialize_chunk_list(&[3, 1, 2, 1]), "1,2,3");
        assert_eq!(serialize_chunk_list(&[]), "");
        assert_eq!(parse_chunk_list(&serialize_chunk_list(&[7, 2])), vec![2, 7]);
    }

    #[test]
    fn test_missing_from() {
        let upload = sample(5, "1,3,5");
        assert_eq!(upload.missing_from(&[1, 3, 5]), vec![2, 4]);
        assert_eq!(upload.missing_from(&[1, 2, 3, 4, 5]), Vec::<i32>::new());
    }

    #[test]
    fn test_is_expired() {
        let mut upload = sample(1, "");
        assert!(!upload.is_expired(Utc::now()));
        upload.expires_at = Utc::now() - Duration::seconds(1);
        assert!(upload.is_expired(Utc::now()));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 3), 0.0);
        assert_eq!(progress_percent(1, 3), 33.33);
        assert_eq!(progress_percent(3, 3), 100.0);
        assert_eq!(progress_percent(0, 0), 0.0);
    }
}
