use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{AppError, Result};
use crate::features::uploads::dtos::FileCategory;
use crate::shared::constants::{CHUNK_LOCK_SUFFIX, CHUNK_TMP_SUFFIX};
use crate::shared::validation::file_extension;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Local-disk store for chunk staging and finished files.
///
/// Finished files live under `upload_root/<category>/`; in-flight chunks
/// live in one temp directory per upload under `temp_root`, with files
/// named by zero-padded 1-based chunk index. Every resolved destination is
/// checked to be a real descendant of the upload root.
pub struct LocalStore {
    upload_root: PathBuf,
    temp_root: PathBuf,
    lock_stale: Duration,
}

/// Destination of a finished file inside the upload root.
#[derive(Debug, Clone)]
pub struct ResolvedDestination {
    pub stored_name: String,
    pub path: PathBuf,
}

/// Advisory lock over one (upload, chunk index). Removing the lock file on
/// drop releases it; a crashed holder leaves a file that is reclaimed once
/// it is older than the staleness threshold.
pub struct ChunkLock {
    path: PathBuf,
}

impl Drop for ChunkLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl LocalStore {
    pub async fn new(
        upload_root: impl Into<PathBuf>,
        temp_root: impl Into<PathBuf>,
        lock_stale: Duration,
    ) -> Result<Self> {
        let upload_root = upload_root.into();
        let temp_root = temp_root.into();

        fs::create_dir_all(&upload_root).await.map_err(|e| {
            AppError::Storage(format!("Failed to create upload root: {}", e))
        })?;
        fs::create_dir_all(&temp_root).await.map_err(|e| {
            AppError::Storage(format!("Failed to create temp chunk root: {}", e))
        })?;

        // Canonical roots anchor all later containment checks
        let upload_root = fs::canonicalize(&upload_root)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to resolve upload root: {}", e)))?;
        let temp_root = fs::canonicalize(&temp_root)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to resolve temp root: {}", e)))?;

        Ok(Self {
            upload_root,
            temp_root,
            lock_stale,
        })
    }

    pub fn temp_dir(&self, upload_id: Uuid) -> PathBuf {
        self.temp_root.join(upload_id.to_string())
    }

    pub fn chunk_path(&self, upload_id: Uuid, index: i32) -> PathBuf {
        self.temp_dir(upload_id).join(format!("{:06}", index))
    }

    fn lock_path(&self, upload_id: Uuid, index: i32) -> PathBuf {
        self.temp_dir(upload_id)
            .join(format!("{:06}{}", index, CHUNK_LOCK_SUFFIX))
    }

    fn tmp_path(&self, upload_id: Uuid, index: i32) -> PathBuf {
        self.temp_dir(upload_id)
            .join(format!("{:06}{}", index, CHUNK_TMP_SUFFIX))
    }

    pub async fn create_temp_dir(&self, upload_id: Uuid) -> Result<PathBuf> {
        let dir = self.temp_dir(upload_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to create temp chunk dir: {}", e)))?;
        Ok(dir)
    }

    /// Acquire the advisory lock for one (upload, index).
    ///
    /// A lock file younger than the staleness threshold means another
    /// writer is active and the call fails with `Busy`; an older one is
    /// treated as left behind by a crashed writer and reclaimed.
    pub async fn acquire_chunk_lock(&self, upload_id: Uuid, index: i32) -> Result<ChunkLock> {
        let path = self.lock_path(upload_id, index);

        for attempt in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(ChunkLock { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let stale = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                        Ok(modified) => modified
                            .elapsed()
                            .map(|age| age >= self.lock_stale)
                            .unwrap_or(false),
                        // Lock vanished between open and stat; retry the create
                        Err(_) => true,
                    };

                    if !stale || attempt > 0 {
                        return Err(AppError::Busy(format!(
                            "Chunk {} of upload {} is being written by another request",
                            index, upload_id
                        )));
                    }

                    debug!(%upload_id, index, "Reclaiming stale chunk lock");
                    let _ = fs::remove_file(&path).await;
                }
                Err(e) => {
                    return Err(AppError::Storage(format!(
                        "Failed to create chunk lock: {}",
                        e
                    )))
                }
            }
        }

        Err(AppError::Busy(format!(
            "Chunk {} of upload {} is being written by another request",
            index, upload_id
        )))
    }

    /// Write one chunk under the caller-held lock and return its SHA-256.
    ///
    /// The bytes go to a temporary file first, then move into place with an
    /// atomic rename. An identically-hashed chunk already on disk makes the
    /// write a no-op; differing content is replaced (last-write-wins).
    pub async fn write_chunk(&self, upload_id: Uuid, index: i32, data: &[u8]) -> Result<String> {
        let tmp = self.tmp_path(upload_id, index);
        let dest = self.chunk_path(upload_id, index);

        let incoming_hash = hex::encode(Sha256::digest(data));

        if let Some(existing_hash) = self.hash_existing(&dest).await {
            if existing_hash == incoming_hash {
                debug!(%upload_id, index, "Identical chunk already on disk, skipping write");
                return Ok(incoming_hash);
            }
        }

        let write_result: std::io::Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = fs::remove_file(&tmp).await;
            return Err(AppError::Storage(format!(
                "Failed to write chunk {}: {}",
                index, e
            )));
        }

        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(AppError::Storage(format!(
                "Failed to move chunk {} into place: {}",
                index, e
            )));
        }

        Ok(incoming_hash)
    }

    /// Drop a partial temp file left behind by an aborted chunk write.
    pub async fn discard_chunk_tmp(&self, upload_id: Uuid, index: i32) {
        let _ = fs::remove_file(self.tmp_path(upload_id, index)).await;
    }

    async fn hash_existing(&self, path: &Path) -> Option<String> {
        let mut file = fs::File::open(path).await.ok()?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).await.ok()?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Some(hex::encode(hasher.finalize()))
    }

    /// Re-derive the actually present chunk set from disk.
    ///
    /// Existence with non-zero size is the ground truth; unreadable or
    /// empty files count as absent. Returns sorted 1-based indices.
    pub async fn verify_chunks_on_disk(&self, upload_id: Uuid, total_chunks: i32) -> Vec<i32> {
        let mut present = Vec::new();
        for index in 1..=total_chunks {
            let path = self.chunk_path(upload_id, index);
            if let Ok(meta) = fs::metadata(&path).await {
                if meta.is_file() && meta.len() > 0 {
                    present.push(index);
                }
            }
        }
        present
    }

    /// Resolve the destination for a finished file.
    ///
    /// Generates a collision-free stored name (random token plus the
    /// validated extension of `sanitized_name`) inside the category
    /// directory and asserts the result is a real descendant of the upload
    /// root and not a pre-existing symlink.
    pub async fn resolve_destination(
        &self,
        category: FileCategory,
        sanitized_name: &str,
    ) -> Result<ResolvedDestination> {
        let dir = self.upload_root.join(category.as_str());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to create category dir: {}", e)))?;

        let canonical_dir = fs::canonicalize(&dir)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to resolve category dir: {}", e)))?;
        if !canonical_dir.starts_with(&self.upload_root) {
            return Err(AppError::Storage(
                "Resolved path escapes the upload root".to_string(),
            ));
        }

        let ext = file_extension(sanitized_name).unwrap_or_default();
        let stored_name = format!("{}{}", Uuid::new_v4(), ext);
        let path = canonical_dir.join(&stored_name);

        match fs::symlink_metadata(&path).await {
            Ok(_) => {
                return Err(AppError::Storage(format!(
                    "Destination '{}' already exists",
                    stored_name
                )))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::Storage(format!(
                    "Failed to inspect destination: {}",
                    e
                )))
            }
        }

        Ok(ResolvedDestination { stored_name, path })
    }

    /// Staging path for a merge in progress, next to the final destination
    /// so the finishing rename stays atomic.
    pub fn staging_path(dest: &Path) -> PathBuf {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        dest.with_file_name(format!(".{}.part", name))
    }

    /// Stream all chunks in ascending index order into `staging`, hashing
    /// while copying. Returns the byte count and hex SHA-256 of the merged
    /// output. The staging file is removed on any failure.
    pub async fn merge_chunks(
        &self,
        upload_id: Uuid,
        total_chunks: i32,
        staging: &Path,
    ) -> Result<(i64, String)> {
        let result = self.merge_chunks_inner(upload_id, total_chunks, staging).await;
        if result.is_err() {
            let _ = fs::remove_file(staging).await;
        }
        result
    }

    async fn merge_chunks_inner(
        &self,
        upload_id: Uuid,
        total_chunks: i32,
        staging: &Path,
    ) -> Result<(i64, String)> {
        let mut out = fs::File::create(staging)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to create merge staging: {}", e)))?;

        let mut hasher = Sha256::new();
        let mut total_bytes = 0i64;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        for index in 1..=total_chunks {
            let path = self.chunk_path(upload_id, index);
            let mut chunk = fs::File::open(&path).await.map_err(|e| {
                AppError::Storage(format!("Failed to open chunk {}: {}", index, e))
            })?;

            loop {
                let n = chunk.read(&mut buf).await.map_err(|e| {
                    AppError::Storage(format!("Failed to read chunk {}: {}", index, e))
                })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                out.write_all(&buf[..n]).await.map_err(|e| {
                    AppError::Storage(format!("Failed to write merged output: {}", e))
                })?;
                total_bytes += n as i64;
            }
        }

        out.flush()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to flush merged output: {}", e)))?;
        out.sync_all()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to sync merged output: {}", e)))?;

        Ok((total_bytes, hex::encode(hasher.finalize())))
    }

    /// Delete an upload's temp directory, returning the bytes reclaimed.
    /// A missing directory frees nothing and is not an error.
    pub async fn remove_temp_dir(&self, upload_id: Uuid) -> Result<u64> {
        let dir = self.temp_dir(upload_id);

        let mut freed = 0u64;
        match fs::read_dir(&dir).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if let Ok(meta) = entry.metadata().await {
                        if meta.is_file() {
                            freed += meta.len();
                        }
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                warn!(%upload_id, "Failed to measure temp dir before delete: {}", e);
            }
        }

        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to remove temp chunk dir: {}", e)))?;

        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::validation::sanitize_filename;
    use tempfile::TempDir;

    async fn test_store(root: &TempDir, lock_stale: Duration) -> LocalStore {
        LocalStore::new(
            root.path().join("uploads"),
            root.path().join("tmp_chunks"),
            lock_stale,
        )
        .await
        .expect("store")
    }

    #[tokio::test]
    async fn test_write_chunk_and_verify() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root, Duration::from_secs(30)).await;
        let upload_id = Uuid::new_v4();
        store.create_temp_dir(upload_id).await.unwrap();

        store.write_chunk(upload_id, 1, b"first").await.unwrap();
        store.write_chunk(upload_id, 3, b"third").await.unwrap();

        assert_eq!(store.verify_chunks_on_disk(upload_id, 3).await, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_zero_length_chunk_counts_as_absent() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root, Duration::from_secs(30)).await;
        let upload_id = Uuid::new_v4();
        store.create_temp_dir(upload_id).await.unwrap();

        store.write_chunk(upload_id, 1, b"data").await.unwrap();
        fs::write(store.chunk_path(upload_id, 2), b"").await.unwrap();

        assert_eq!(store.verify_chunks_on_disk(upload_id, 2).await, vec![1]);
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_noop_and_differing_replaces() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root, Duration::from_secs(30)).await;
        let upload_id = Uuid::new_v4();
        store.create_temp_dir(upload_id).await.unwrap();

        let h1 = store.write_chunk(upload_id, 1, b"content").await.unwrap();
        let h2 = store.write_chunk(upload_id, 1, b"content").await.unwrap();
        assert_eq!(h1, h2);

        let h3 = store.write_chunk(upload_id, 1, b"changed").await.unwrap();
        assert_ne!(h1, h3);
        let on_disk = fs::read(store.chunk_path(upload_id, 1)).await.unwrap();
        assert_eq!(on_disk, b"changed");
    }

    #[tokio::test]
    async fn test_chunk_lock_contention_and_stale_reclaim() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root, Duration::from_secs(30)).await;
        let upload_id = Uuid::new_v4();
        store.create_temp_dir(upload_id).await.unwrap();

        let lock = store.acquire_chunk_lock(upload_id, 1).await.unwrap();
        let second = store.acquire_chunk_lock(upload_id, 1).await;
        assert!(matches!(second, Err(AppError::Busy(_))));
        drop(lock);

        // With a zero staleness threshold any leftover lock is reclaimable
        let store = test_store(&root, Duration::ZERO).await;
        let _abandoned = store.acquire_chunk_lock(upload_id, 2).await.unwrap();
        std::mem::forget(_abandoned);
        let reclaimed = store.acquire_chunk_lock(upload_id, 2).await;
        assert!(reclaimed.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_destination_stays_under_root() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root, Duration::from_secs(30)).await;

        let name = sanitize_filename("../../../../etc/evil.pdf");
        let dest = store
            .resolve_destination(FileCategory::Document, &name)
            .await
            .unwrap();

        assert!(dest.path.starts_with(root.path().join("uploads").canonicalize().unwrap()));
        assert!(dest.stored_name.ends_with(".pdf"));
        assert_ne!(dest.stored_name, name);
    }

    #[tokio::test]
    async fn test_merge_chunks_in_order() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root, Duration::from_secs(30)).await;
        let upload_id = Uuid::new_v4();
        store.create_temp_dir(upload_id).await.unwrap();

        // Written out of order, merged in index order
        store.write_chunk(upload_id, 2, b"BBBB").await.unwrap();
        store.write_chunk(upload_id, 1, b"AAAA").await.unwrap();
        store.write_chunk(upload_id, 3, b"CCCC").await.unwrap();

        let staging = root.path().join("merged.part");
        let (bytes, hash) = store.merge_chunks(upload_id, 3, &staging).await.unwrap();

        assert_eq!(bytes, 12);
        assert_eq!(fs::read(&staging).await.unwrap(), b"AAAABBBBCCCC");
        assert_eq!(hash, hex::encode(Sha256::digest(b"AAAABBBBCCCC")));
    }

    #[tokio::test]
    async fn test_remove_temp_dir_reports_freed_bytes() {
        let root = TempDir::new().unwrap();
        let store = test_store(&root, Duration::from_secs(30)).await;
        let upload_id = Uuid::new_v4();
        store.create_temp_dir(upload_id).await.unwrap();

        store.write_chunk(upload_id, 1, &[0u8; 1000]).await.unwrap();
        store.write_chunk(upload_id, 2, &[0u8; 500]).await.unwrap();

        let freed = store.remove_temp_dir(upload_id).await.unwrap();
        assert_eq!(freed, 1500);
        assert_eq!(store.remove_temp_dir(upload_id).await.unwrap(), 0);
    }
}
