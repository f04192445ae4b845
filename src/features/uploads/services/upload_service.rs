use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use sqlx::SqlitePool;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::core::config::UploadConfig;
use crate::core::error::{AppError, Result};
use crate::features::uploads::access::{AccessPolicy, Actor, OwnershipRefs};
use crate::features::uploads::dtos::{
    validate_filename, CancelUploadDto, ChunkReceiptDto, CleanupReportDto, CompleteUploadDto,
    FileCategory, InitiateUploadDto, StoredFileDto, UploadSessionDto, UploadStatusDto,
};
use crate::features::uploads::models::{
    progress_percent, serialize_chunk_list, ChunkedUpload, StoredFile,
};
use crate::modules::storage::LocalStore;
use crate::shared::constants::DEFAULT_MIME_TYPE;
use crate::shared::validation::sanitize_filename;

/// Outcome of one chunk-accept attempt inside the retry loop.
enum AcceptAttempt {
    Done(ChunkReceiptDto),
    /// The optimistic `uploaded_chunks` update lost a race; reload and retry.
    Conflict,
}

/// Service for resumable chunked uploads.
///
/// Owns the per-upload state machine: initiate, repeated chunk accepts in
/// any order, status/retry reconciliation against disk, merge on explicit
/// completion, cancellation, and expiry reaping. The database row caches
/// what was received; the temp directory on disk is the ground truth and
/// the two are reconciled before every state-changing decision.
pub struct UploadService {
    pool: SqlitePool,
    store: Arc<LocalStore>,
    policy: Arc<dyn AccessPolicy>,
    config: UploadConfig,
}

impl UploadService {
    pub fn new(
        pool: SqlitePool,
        store: Arc<LocalStore>,
        policy: Arc<dyn AccessPolicy>,
        config: UploadConfig,
    ) -> Self {
        Self {
            pool,
            store,
            policy,
            config,
        }
    }

    /// Create a new upload session.
    ///
    /// Validates declared metadata against the guard and the configured
    /// caps, delegates the permission check, creates the temp chunk
    /// directory, and persists the session with a fixed expiry. A failed
    /// insert removes the directory it just created.
    pub async fn initiate(
        &self,
        dto: InitiateUploadDto,
        actor: &Actor,
    ) -> Result<UploadSessionDto> {
        dto.validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        let mime_type = dto
            .mime_type
            .clone()
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());

        validate_filename(&dto.filename, &mime_type)?;

        if dto.total_chunks > self.config.max_total_chunks {
            return Err(AppError::Validation(format!(
                "total_chunks exceeds the maximum of {}",
                self.config.max_total_chunks
            )));
        }
        if dto.chunk_size > self.config.max_chunk_size {
            return Err(AppError::Validation(format!(
                "chunk_size exceeds the maximum of {} bytes",
                self.config.max_chunk_size
            )));
        }
        if dto.total_size > self.config.max_file_size {
            return Err(AppError::Validation(format!(
                "total_size exceeds the maximum of {} bytes",
                self.config.max_file_size
            )));
        }

        let refs = OwnershipRefs {
            project_id: dto.project_id,
            client_id: dto.client_id,
            stage_id: dto.stage_id,
        };
        self.policy.check_access(&refs, actor).await?;

        let filename = sanitize_filename(&dto.filename);
        let category = dto
            .category
            .unwrap_or_else(|| FileCategory::from_mime(&mime_type));

        let upload_id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now + ChronoDuration::seconds(self.config.session_ttl_secs);

        self.store.create_temp_dir(upload_id).await?;

        let insert = sqlx::query(
            r#"
            INSERT INTO chunked_uploads
                (upload_id, filename, mime_type, category, total_chunks, chunk_size,
                 total_size, file_checksum, project_id, client_id, stage_id, description,
                 uploaded_by, uploaded_chunks, is_completed, final_file_id,
                 created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, '', 0, NULL, ?, ?, ?)
            "#,
        )
        .bind(upload_id)
        .bind(&filename)
        .bind(&mime_type)
        .bind(category.as_str())
        .bind(dto.total_chunks)
        .bind(dto.chunk_size)
        .bind(dto.total_size)
        .bind(&dto.file_checksum)
        .bind(dto.project_id)
        .bind(dto.client_id)
        .bind(dto.stage_id)
        .bind(&dto.description)
        .bind(actor.id)
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = insert {
            if let Err(cleanup) = self.store.remove_temp_dir(upload_id).await {
                warn!(%upload_id, "Failed to clean up temp dir after insert failure: {}", cleanup);
            }
            return Err(e.into());
        }

        info!(
            %upload_id,
            filename = %filename,
            total_chunks = dto.total_chunks,
            "Upload session initiated"
        );

        Ok(UploadSessionDto {
            upload_id,
            expires_at,
            uploaded_chunks: vec![],
        })
    }

    /// Accept one chunk, in any order, tolerating retransmits.
    ///
    /// Transient failures (lock contention, optimistic update conflicts)
    /// are retried internally with exponential backoff and jitter before
    /// surfacing.
    pub async fn accept_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: i32,
        data: &[u8],
    ) -> Result<ChunkReceiptDto> {
        let session = self.find_session(upload_id).await?;

        if session.is_completed {
            return Err(AppError::InvalidState(format!(
                "Upload {} is already completed",
                upload_id
            )));
        }
        if session.is_expired(Utc::now()) {
            return Err(AppError::Expired(format!(
                "Upload {} expired at {}",
                upload_id, session.expires_at
            )));
        }
        if chunk_index < 1 || chunk_index > session.total_chunks {
            return Err(AppError::InvalidIndex(format!(
                "Chunk index {} is outside 1..={}",
                chunk_index, session.total_chunks
            )));
        }
        if data.is_empty() {
            return Err(AppError::EmptyChunk(format!(
                "Chunk {} contains no data",
                chunk_index
            )));
        }
        if data.len() as i64 > self.config.max_chunk_size {
            return Err(AppError::ChunkTooLarge(format!(
                "Chunk {} is {} bytes, maximum is {}",
                chunk_index,
                data.len(),
                self.config.max_chunk_size
            )));
        }

        // Cheap duplicate-submission path: already durably accepted
        let received = session.received_chunks();
        if received.binary_search(&chunk_index).is_ok() {
            debug!(%upload_id, chunk_index, "Duplicate chunk submission, returning success");
            return Ok(ChunkReceiptDto {
                chunk_index,
                received: true,
                upload_progress: progress_percent(received.len(), session.total_chunks),
                uploaded_chunks: received,
            });
        }

        let mut last_was_lock_contention = false;
        for attempt in 0..self.config.max_write_attempts {
            if attempt > 0 {
                let backoff = self.config.retry_base_delay_ms << (attempt - 1);
                let jitter = rand::thread_rng().gen_range(0..=self.config.retry_base_delay_ms);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }

            match self.try_accept_chunk(upload_id, chunk_index, data).await {
                Ok(AcceptAttempt::Done(receipt)) => return Ok(receipt),
                Ok(AcceptAttempt::Conflict) => {
                    debug!(%upload_id, chunk_index, attempt, "Optimistic chunk update conflict");
                    last_was_lock_contention = false;
                }
                Err(AppError::Busy(msg)) => {
                    debug!(%upload_id, chunk_index, attempt, "Chunk lock contention");
                    last_was_lock_contention = true;
                    if attempt + 1 == self.config.max_write_attempts {
                        return Err(AppError::Busy(msg));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if last_was_lock_contention {
            Err(AppError::Busy(format!(
                "Chunk {} of upload {} is still locked after {} attempts",
                chunk_index, upload_id, self.config.max_write_attempts
            )))
        } else {
            Err(AppError::Internal(format!(
                "Failed to record chunk {} of upload {} after {} attempts",
                chunk_index, upload_id, self.config.max_write_attempts
            )))
        }
    }

    async fn try_accept_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: i32,
        data: &[u8],
    ) -> Result<AcceptAttempt> {
        let _lock = self.store.acquire_chunk_lock(upload_id, chunk_index).await?;

        let write = self.store.write_chunk(upload_id, chunk_index, data);
        let timeout = Duration::from_secs(self.config.chunk_write_timeout_secs);
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                self.store.discard_chunk_tmp(upload_id, chunk_index).await;
                return Err(AppError::Timeout(format!(
                    "Writing chunk {} exceeded {}s",
                    chunk_index, self.config.chunk_write_timeout_secs
                )));
            }
        }

        // Disk write is durable; now fold the index into the cached set.
        // The guarded update detects concurrent writers of other chunks.
        let session = self.find_session(upload_id).await?;
        if session.is_completed {
            return Err(AppError::InvalidState(format!(
                "Upload {} completed while chunk {} was in flight",
                upload_id, chunk_index
            )));
        }

        let mut chunks = session.received_chunks();
        if chunks.binary_search(&chunk_index).is_err() {
            chunks.push(chunk_index);
            chunks.sort_unstable();
        }
        let serialized = serialize_chunk_list(&chunks);
        let now = Utc::now();

        let updated = sqlx::query(
            r#"
            UPDATE chunked_uploads
            SET uploaded_chunks = ?, updated_at = ?
            WHERE upload_id = ? AND uploaded_chunks = ? AND is_completed = 0
            "#,
        )
        .bind(&serialized)
        .bind(now)
        .bind(upload_id)
        .bind(&session.uploaded_chunks)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(AcceptAttempt::Conflict);
        }

        debug!(%upload_id, chunk_index, uploaded = chunks.len(), "Chunk accepted");

        Ok(AcceptAttempt::Done(ChunkReceiptDto {
            chunk_index,
            received: true,
            upload_progress: progress_percent(chunks.len(), session.total_chunks),
            uploaded_chunks: chunks,
        }))
    }

    /// Report progress from the intersection of the DB-claimed and
    /// disk-verified chunk sets. Read-only; never trusts the DB alone.
    pub async fn status(&self, upload_id: Uuid) -> Result<UploadStatusDto> {
        let session = self.find_session(upload_id).await?;

        if session.is_completed {
            let all: Vec<i32> = (1..=session.total_chunks).collect();
            return Ok(Self::status_dto(&session, all));
        }

        let verified = self.reconcile(&session).await;
        Ok(Self::status_dto(&session, verified))
    }

    /// Same reconciliation as `status`, but persists the corrected chunk
    /// set when disk and DB disagree so later reads are cheap.
    pub async fn retry_missing(&self, upload_id: Uuid) -> Result<UploadStatusDto> {
        let session = self.find_session(upload_id).await?;

        if session.is_completed {
            return Err(AppError::InvalidState(format!(
                "Upload {} is already completed",
                upload_id
            )));
        }

        let verified = self.reconcile(&session).await;
        self.persist_correction(&session, &verified).await?;

        Ok(Self::status_dto(&session, verified))
    }

    /// Merge all chunks into the final file.
    ///
    /// Idempotent: a completed session returns its existing result without
    /// re-merging. An incomplete chunk set persists the correction and
    /// fails recoverably; a checksum mismatch discards the staging output
    /// and leaves the session retriable. The file row and the completion
    /// flag commit in one transaction before the staging file is renamed
    /// into place.
    pub async fn complete(&self, upload_id: Uuid, actor: &Actor) -> Result<CompleteUploadDto> {
        let session = self.find_session(upload_id).await?;

        if session.is_completed {
            let final_file_id = session.final_file_id.ok_or_else(|| {
                AppError::Internal(format!(
                    "Completed upload {} has no final file id",
                    upload_id
                ))
            })?;
            return Ok(CompleteUploadDto {
                upload_id,
                final_file_id,
                message: "Upload already completed".to_string(),
            });
        }

        let refs = OwnershipRefs {
            project_id: session.project_id,
            client_id: session.client_id,
            stage_id: session.stage_id,
        };
        self.policy.check_access(&refs, actor).await?;

        if session.is_expired(Utc::now()) {
            return Err(AppError::Expired(format!(
                "Upload {} expired at {}",
                upload_id, session.expires_at
            )));
        }

        let verified = self.reconcile(&session).await;
        let missing = session.missing_from(&verified);
        if !missing.is_empty() {
            self.persist_correction(&session, &verified).await?;
            return Err(AppError::IncompleteUpload { missing });
        }

        let category = match session.category.as_str() {
            "image" => FileCategory::Image,
            "video" => FileCategory::Video,
            _ => FileCategory::Document,
        };
        let dest = self
            .store
            .resolve_destination(category, &session.filename)
            .await?;
        let staging = LocalStore::staging_path(&dest.path);

        let (merged_size, computed_checksum) = self
            .store
            .merge_chunks(upload_id, session.total_chunks, &staging)
            .await?;

        if let Some(declared) = session
            .file_checksum
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            if !declared.eq_ignore_ascii_case(&computed_checksum) {
                let _ = fs::remove_file(&staging).await;
                return Err(AppError::ChecksumMismatch(format!(
                    "Declared checksum {} does not match merged file {}",
                    declared, computed_checksum
                )));
            }
        }

        let final_file_id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO stored_files
                (id, original_name, stored_name, path, size, mime_type, category,
                 checksum, project_id, client_id, stage_id, description, uploaded_by,
                 created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(final_file_id)
        .bind(&session.filename)
        .bind(&dest.stored_name)
        .bind(dest.path.to_string_lossy().to_string())
        .bind(merged_size)
        .bind(&session.mime_type)
        .bind(&session.category)
        .bind(&computed_checksum)
        .bind(session.project_id)
        .bind(session.client_id)
        .bind(session.stage_id)
        .bind(&session.description)
        .bind(session.uploaded_by)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query(
            r#"
            UPDATE chunked_uploads
            SET is_completed = 1, final_file_id = ?, updated_at = ?
            WHERE upload_id = ? AND is_completed = 0
            "#,
        )
        .bind(final_file_id)
        .bind(now)
        .bind(upload_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // A concurrent completion won; defer to its result
            tx.rollback().await?;
            let _ = fs::remove_file(&staging).await;
            let session = self.find_session(upload_id).await?;
            let final_file_id = session.final_file_id.ok_or_else(|| {
                AppError::Internal(format!(
                    "Upload {} lost a completion race but has no final file id",
                    upload_id
                ))
            })?;
            return Ok(CompleteUploadDto {
                upload_id,
                final_file_id,
                message: "Upload already completed".to_string(),
            });
        }

        tx.commit().await?;

        if let Err(e) = fs::rename(&staging, &dest.path).await {
            // Committed but not yet visible; the staging file still holds
            // the merged bytes for manual recovery.
            tracing::error!(
                %upload_id,
                staging = %staging.display(),
                "Failed to move merged file into place: {}",
                e
            );
            return Err(AppError::Storage(format!(
                "Failed to finalize merged file: {}",
                e
            )));
        }

        if let Err(e) = self.store.remove_temp_dir(upload_id).await {
            warn!(%upload_id, "Failed to remove temp chunk dir after merge: {}", e);
        }

        info!(
            %upload_id,
            %final_file_id,
            size = merged_size,
            path = %dest.path.display(),
            "Upload merged and completed"
        );

        Ok(CompleteUploadDto {
            upload_id,
            final_file_id,
            message: "Upload completed successfully".to_string(),
        })
    }

    /// Cancel an incomplete upload. Chunk cleanup is best-effort; the row
    /// deletion is authoritative.
    pub async fn cancel(&self, upload_id: Uuid) -> Result<CancelUploadDto> {
        let session = self.find_session(upload_id).await?;

        if session.is_completed {
            return Err(AppError::InvalidState(format!(
                "Upload {} is already completed and cannot be cancelled",
                upload_id
            )));
        }

        if let Err(e) = self.store.remove_temp_dir(upload_id).await {
            warn!(%upload_id, "Failed to remove temp chunks on cancel: {}", e);
        }

        sqlx::query("DELETE FROM chunked_uploads WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&self.pool)
            .await?;

        info!(%upload_id, "Upload cancelled");

        Ok(CancelUploadDto {
            message: "Upload cancelled".to_string(),
        })
    }

    /// Reap expired, incomplete sessions: delete their temp chunks and
    /// rows, reporting the space reclaimed. One failing session is logged
    /// and skipped, never fatal to the sweep. Completed sessions are never
    /// touched.
    pub async fn cleanup_expired(&self) -> Result<CleanupReportDto> {
        let now = Utc::now();

        let sessions = sqlx::query_as::<_, ChunkedUpload>(
            "SELECT * FROM chunked_uploads WHERE is_completed = 0",
        )
        .fetch_all(&self.pool)
        .await?;

        let expired: Vec<&ChunkedUpload> =
            sessions.iter().filter(|s| s.is_expired(now)).collect();

        let total_expired = expired.len() as i64;
        let mut removed = 0i64;
        let mut freed_bytes = 0i64;

        for session in expired {
            let freed = match self.store.remove_temp_dir(session.upload_id).await {
                Ok(freed) => freed,
                Err(e) => {
                    warn!(upload_id = %session.upload_id, "Skipping expired upload, temp cleanup failed: {}", e);
                    continue;
                }
            };

            if let Err(e) = sqlx::query("DELETE FROM chunked_uploads WHERE upload_id = ?")
                .bind(session.upload_id)
                .execute(&self.pool)
                .await
            {
                warn!(upload_id = %session.upload_id, "Failed to delete expired session row: {}", e);
                continue;
            }

            freed_bytes += freed as i64;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, freed_bytes, "Expired upload sweep finished");
        }

        let space_freed_mb =
            (freed_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;

        Ok(CleanupReportDto {
            message: format!("Removed {} expired uploads", removed),
            uploads_removed: removed,
            total_uploads_expired: total_expired,
            space_freed_bytes: freed_bytes,
            space_freed_mb,
        })
    }

    /// Look up the terminal file record of a completed upload.
    pub async fn get_file(&self, file_id: Uuid) -> Result<StoredFileDto> {
        let file =
            sqlx::query_as::<_, StoredFile>("SELECT * FROM stored_files WHERE id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("File {} not found", file_id)))?;

        Ok(StoredFileDto {
            id: file.id,
            original_name: file.original_name,
            stored_name: file.stored_name,
            size: file.size,
            mime_type: file.mime_type,
            category: file.category,
            checksum: file.checksum,
            created_at: file.created_at,
        })
    }

    async fn find_session(&self, upload_id: Uuid) -> Result<ChunkedUpload> {
        sqlx::query_as::<_, ChunkedUpload>(
            "SELECT * FROM chunked_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Upload session {} not found", upload_id)))
    }

    /// Intersect the DB-claimed set with what is actually on disk.
    async fn reconcile(&self, session: &ChunkedUpload) -> Vec<i32> {
        let on_disk = self
            .store
            .verify_chunks_on_disk(session.upload_id, session.total_chunks)
            .await;

        session
            .received_chunks()
            .into_iter()
            .filter(|i| on_disk.binary_search(i).is_ok())
            .collect()
    }

    /// Persist a reconciled chunk set when it differs from the cached one.
    /// Guarded against concurrent chunk accepts; losing the race just means
    /// the next reconciliation corrects again.
    async fn persist_correction(&self, session: &ChunkedUpload, verified: &[i32]) -> Result<()> {
        let serialized = serialize_chunk_list(verified);
        if serialized == session.uploaded_chunks {
            return Ok(());
        }

        let updated = sqlx::query(
            r#"
            UPDATE chunked_uploads
            SET uploaded_chunks = ?, updated_at = ?
            WHERE upload_id = ? AND uploaded_chunks = ? AND is_completed = 0
            "#,
        )
        .bind(&serialized)
        .bind(Utc::now())
        .bind(session.upload_id)
        .bind(&session.uploaded_chunks)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            debug!(upload_id = %session.upload_id, "Chunk set changed during reconciliation, skipping correction");
        }

        Ok(())
    }

    fn status_dto(session: &ChunkedUpload, uploaded: Vec<i32>) -> UploadStatusDto {
        let missing = session.missing_from(&uploaded);
        UploadStatusDto {
            upload_id: session.upload_id,
            filename: session.filename.clone(),
            total_chunks: session.total_chunks,
            progress: progress_percent(uploaded.len(), session.total_chunks),
            uploaded_chunks: uploaded,
            missing_chunks: missing,
            is_completed: session.is_completed,
            final_file_id: session.final_file_id,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::path::Path;
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    use crate::features::uploads::access::PermitAll;

    struct TestCtx {
        service: UploadService,
        pool: SqlitePool,
        store: Arc<LocalStore>,
        _root: TempDir,
    }

    fn test_config(root: &TempDir) -> UploadConfig {
        UploadConfig {
            upload_dir: root.path().join("uploads"),
            temp_dir: root.path().join("tmp_chunks"),
            max_file_size: 1024 * 1024,
            max_chunk_size: 1024,
            max_total_chunks: 100,
            session_ttl_secs: 3600,
            lock_stale_secs: 30,
            chunk_write_timeout_secs: 5,
            max_write_attempts: 3,
            retry_base_delay_ms: 1,
            cleanup_interval_secs: 0,
        }
    }

    async fn setup() -> TestCtx {
        setup_with_policy(Arc::new(PermitAll)).await
    }

    async fn setup_with_policy(policy: Arc<dyn AccessPolicy>) -> TestCtx {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);

        // In-memory SQLite needs a single connection to stay one database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let store = Arc::new(
            LocalStore::new(
                config.upload_dir.clone(),
                config.temp_dir.clone(),
                Duration::from_secs(config.lock_stale_secs),
            )
            .await
            .unwrap(),
        );

        let service = UploadService::new(pool.clone(), store.clone(), policy, config);

        TestCtx {
            service,
            pool,
            store,
            _root: root,
        }
    }

    fn actor() -> Actor {
        Actor {
            id: Uuid::new_v4(),
            roles: vec![],
        }
    }

    fn initiate_dto(total_chunks: i32, file_checksum: Option<String>) -> InitiateUploadDto {
        InitiateUploadDto {
            filename: "site plan.pdf".to_string(),
            total_chunks,
            chunk_size: 512,
            total_size: 512 * total_chunks as i64,
            file_checksum,
            mime_type: Some("application/pdf".to_string()),
            category: None,
            project_id: None,
            client_id: None,
            stage_id: None,
            description: None,
        }
    }

    async fn force_expired(pool: &SqlitePool, upload_id: Uuid) {
        sqlx::query("UPDATE chunked_uploads SET expires_at = ? WHERE upload_id = ?")
            .bind(Utc::now() - ChronoDuration::hours(1))
            .bind(upload_id)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn stored_file(pool: &SqlitePool, id: Uuid) -> StoredFile {
        sqlx::query_as::<_, StoredFile>("SELECT * FROM stored_files WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    struct DenyAll;

    #[async_trait]
    impl AccessPolicy for DenyAll {
        async fn check_access(&self, _refs: &OwnershipRefs, _actor: &Actor) -> Result<()> {
            Err(AppError::Forbidden("no access to the declared project".to_string()))
        }
    }

    #[tokio::test]
    async fn test_out_of_order_upload_and_complete() {
        let ctx = setup().await;
        let actor = actor();

        let checksum = hex::encode(Sha256::digest(b"AAAABBBBCCCC"));
        let session = ctx
            .service
            .initiate(initiate_dto(3, Some(checksum.clone())), &actor)
            .await
            .unwrap();

        for (index, data) in [(2, b"BBBB"), (1, b"AAAA"), (3, b"CCCC")] {
            let receipt = ctx
                .service
                .accept_chunk(session.upload_id, index, data)
                .await
                .unwrap();
            assert!(receipt.received);
        }

        let status = ctx.service.status(session.upload_id).await.unwrap();
        assert_eq!(status.uploaded_chunks, vec![1, 2, 3]);
        assert!(status.missing_chunks.is_empty());
        assert_eq!(status.progress, 100.0);

        let done = ctx.service.complete(session.upload_id, &actor).await.unwrap();
        let file = stored_file(&ctx.pool, done.final_file_id).await;

        assert_eq!(file.original_name, "site plan.pdf");
        assert_eq!(file.size, 12);
        assert_eq!(file.checksum.as_deref(), Some(checksum.as_str()));
        assert_eq!(std::fs::read(&file.path).unwrap(), b"AAAABBBBCCCC");

        // Temp chunks are gone after a successful merge
        assert!(!ctx.store.temp_dir(session.upload_id).exists());
    }

    #[tokio::test]
    async fn test_duplicate_chunk_submission_is_idempotent() {
        let ctx = setup().await;
        let session = ctx
            .service
            .initiate(initiate_dto(2, None), &actor())
            .await
            .unwrap();

        let first = ctx
            .service
            .accept_chunk(session.upload_id, 1, b"same bytes")
            .await
            .unwrap();
        let second = ctx
            .service
            .accept_chunk(session.upload_id, 1, b"same bytes")
            .await
            .unwrap();

        assert_eq!(first.uploaded_chunks, second.uploaded_chunks);
        assert_eq!(second.upload_progress, 50.0);
    }

    #[tokio::test]
    async fn test_status_reconciles_against_disk() {
        let ctx = setup().await;
        let actor = actor();
        let session = ctx
            .service
            .initiate(initiate_dto(3, None), &actor)
            .await
            .unwrap();

        for index in 1..=3 {
            ctx.service
                .accept_chunk(session.upload_id, index, b"data")
                .await
                .unwrap();
        }

        // Simulate a lost chunk file behind the DB's back
        std::fs::remove_file(ctx.store.chunk_path(session.upload_id, 2)).unwrap();

        let status = ctx.service.status(session.upload_id).await.unwrap();
        assert_eq!(status.uploaded_chunks, vec![1, 3]);
        assert_eq!(status.missing_chunks, vec![2]);

        // Completion refuses and reports the same missing set
        let err = ctx.service.complete(session.upload_id, &actor).await.unwrap_err();
        match err {
            AppError::IncompleteUpload { missing } => assert_eq!(missing, vec![2]),
            other => panic!("expected IncompleteUpload, got {:?}", other),
        }

        // retry_missing persists the corrected set
        let retried = ctx.service.retry_missing(session.upload_id).await.unwrap();
        assert_eq!(retried.missing_chunks, vec![2]);
        let reloaded = ctx.service.find_session(session.upload_id).await.unwrap();
        assert_eq!(reloaded.received_chunks(), vec![1, 3]);

        // Re-sending the lost chunk makes the upload completable again
        ctx.service
            .accept_chunk(session.upload_id, 2, b"data")
            .await
            .unwrap();
        assert!(ctx.service.complete(session.upload_id, &actor).await.is_ok());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_session_retriable() {
        let ctx = setup().await;
        let actor = actor();
        let session = ctx
            .service
            .initiate(initiate_dto(1, Some("0".repeat(64))), &actor)
            .await
            .unwrap();

        ctx.service
            .accept_chunk(session.upload_id, 1, b"payload")
            .await
            .unwrap();

        let err = ctx.service.complete(session.upload_id, &actor).await.unwrap_err();
        assert!(matches!(err, AppError::ChecksumMismatch(_)));

        // No file record, no completion, chunks still on disk
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stored_files")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        let status = ctx.service.status(session.upload_id).await.unwrap();
        assert!(!status.is_completed);
        assert_eq!(status.uploaded_chunks, vec![1]);

        // Nothing leaked into the destination directory
        let doc_dir = ctx._root.path().join("uploads").join("document");
        let leftovers = std::fs::read_dir(&doc_dir)
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let ctx = setup().await;
        let actor = actor();
        let session = ctx
            .service
            .initiate(initiate_dto(1, None), &actor)
            .await
            .unwrap();

        ctx.service
            .accept_chunk(session.upload_id, 1, b"once")
            .await
            .unwrap();

        let first = ctx.service.complete(session.upload_id, &actor).await.unwrap();
        let second = ctx.service.complete(session.upload_id, &actor).await.unwrap();

        assert_eq!(first.final_file_id, second.final_file_id);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stored_files")
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_accept_chunk_rejects_bad_input() {
        let ctx = setup().await;
        let session = ctx
            .service
            .initiate(initiate_dto(3, None), &actor())
            .await
            .unwrap();

        let err = ctx
            .service
            .accept_chunk(session.upload_id, 0, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidIndex(_)));

        let err = ctx
            .service
            .accept_chunk(session.upload_id, 4, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidIndex(_)));

        let err = ctx
            .service
            .accept_chunk(session.upload_id, 1, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EmptyChunk(_)));

        let too_big = vec![0u8; 2048];
        let err = ctx
            .service
            .accept_chunk(session.upload_id, 1, &too_big)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ChunkTooLarge(_)));

        let err = ctx
            .service
            .accept_chunk(Uuid::new_v4(), 1, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_completed_session_rejects_chunks_and_cancel() {
        let ctx = setup().await;
        let actor = actor();
        let session = ctx
            .service
            .initiate(initiate_dto(1, None), &actor)
            .await
            .unwrap();

        ctx.service
            .accept_chunk(session.upload_id, 1, b"done")
            .await
            .unwrap();
        ctx.service.complete(session.upload_id, &actor).await.unwrap();

        let err = ctx
            .service
            .accept_chunk(session.upload_id, 1, b"late")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let err = ctx.service.cancel(session.upload_id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));

        let err = ctx.service.retry_missing(session.upload_id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_expired_session_rejects_chunks_and_completion() {
        let ctx = setup().await;
        let actor = actor();
        let session = ctx
            .service
            .initiate(initiate_dto(1, None), &actor)
            .await
            .unwrap();

        ctx.service
            .accept_chunk(session.upload_id, 1, b"in time")
            .await
            .unwrap();
        force_expired(&ctx.pool, session.upload_id).await;

        let err = ctx
            .service
            .accept_chunk(session.upload_id, 1, b"too late")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));

        let err = ctx.service.complete(session.upload_id, &actor).await.unwrap_err();
        assert!(matches!(err, AppError::Expired(_)));

        // Status stays a plain read on an expired session
        assert!(ctx.service.status(session.upload_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_incomplete_sessions() {
        let ctx = setup().await;
        let actor = actor();

        let expired = ctx
            .service
            .initiate(initiate_dto(2, None), &actor)
            .await
            .unwrap();
        ctx.service
            .accept_chunk(expired.upload_id, 1, &[7u8; 300])
            .await
            .unwrap();
        force_expired(&ctx.pool, expired.upload_id).await;

        let live = ctx
            .service
            .initiate(initiate_dto(1, None), &actor)
            .await
            .unwrap();

        let finished = ctx
            .service
            .initiate(initiate_dto(1, None), &actor)
            .await
            .unwrap();
        ctx.service
            .accept_chunk(finished.upload_id, 1, b"kept")
            .await
            .unwrap();
        let done = ctx.service.complete(finished.upload_id, &actor).await.unwrap();
        force_expired(&ctx.pool, finished.upload_id).await;

        let report = ctx.service.cleanup_expired().await.unwrap();
        assert_eq!(report.uploads_removed, 1);
        assert_eq!(report.total_uploads_expired, 1);
        assert_eq!(report.space_freed_bytes, 300);

        let err = ctx.service.status(expired.upload_id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!ctx.store.temp_dir(expired.upload_id).exists());

        // Live and completed sessions are untouched
        assert!(ctx.service.status(live.upload_id).await.is_ok());
        assert!(ctx.service.get_file(done.final_file_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_removes_session_and_chunks() {
        let ctx = setup().await;
        let session = ctx
            .service
            .initiate(initiate_dto(2, None), &actor())
            .await
            .unwrap();
        ctx.service
            .accept_chunk(session.upload_id, 1, b"half")
            .await
            .unwrap();

        ctx.service.cancel(session.upload_id).await.unwrap();

        let err = ctx.service.status(session.upload_id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!ctx.store.temp_dir(session.upload_id).exists());
    }

    #[tokio::test]
    async fn test_initiate_enforces_guard_and_caps() {
        let ctx = setup().await;
        let actor = actor();

        let mut dto = initiate_dto(1, None);
        dto.filename = "malware.exe".to_string();
        assert!(matches!(
            ctx.service.initiate(dto, &actor).await.unwrap_err(),
            AppError::Validation(_)
        ));

        let mut dto = initiate_dto(1, None);
        dto.mime_type = Some("application/x-sh".to_string());
        assert!(matches!(
            ctx.service.initiate(dto, &actor).await.unwrap_err(),
            AppError::Validation(_)
        ));

        let mut dto = initiate_dto(1, None);
        dto.total_chunks = 101;
        assert!(matches!(
            ctx.service.initiate(dto, &actor).await.unwrap_err(),
            AppError::Validation(_)
        ));

        let mut dto = initiate_dto(1, None);
        dto.chunk_size = 2048;
        assert!(matches!(
            ctx.service.initiate(dto, &actor).await.unwrap_err(),
            AppError::Validation(_)
        ));

        let mut dto = initiate_dto(1, None);
        dto.total_size = 2 * 1024 * 1024;
        assert!(matches!(
            ctx.service.initiate(dto, &actor).await.unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_initiate_denied_by_policy() {
        let ctx = setup_with_policy(Arc::new(DenyAll)).await;

        let err = ctx
            .service
            .initiate(initiate_dto(1, None), &actor())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_traversal_filename_is_sanitized() {
        let ctx = setup().await;
        let actor = actor();

        let mut dto = initiate_dto(1, None);
        dto.filename = "../../../etc/passwd.pdf".to_string();
        let session = ctx.service.initiate(dto, &actor).await.unwrap();

        ctx.service
            .accept_chunk(session.upload_id, 1, b"contained")
            .await
            .unwrap();
        let done = ctx.service.complete(session.upload_id, &actor).await.unwrap();

        let file = stored_file(&ctx.pool, done.final_file_id).await;
        let upload_root = ctx._root.path().join("uploads").canonicalize().unwrap();
        assert!(Path::new(&file.path).starts_with(&upload_root));
        assert_eq!(file.original_name, "passwd.pdf");
    }

    #[tokio::test]
    async fn test_get_file_not_found() {
        let ctx = setup().await;
        let err = ctx.service.get_file(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
