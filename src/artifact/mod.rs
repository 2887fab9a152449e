//! Artifact storage subsystem.
//!
//! Persists generated files (screenshots, videos, logs, reports) through a
//! provider-agnostic interface, with gzip compression, signed time-limited
//! URLs, and scheduled retention cleanup.

pub mod cleanup;
pub mod provider;
pub mod sign;

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ArtifactSection, EngineConfig};
use crate::error::EngineError;
use crate::model::{ExecutionFile, FileType};
use crate::storage::ExecutionRepo;
use provider::{LocalFsProvider, S3Provider, StorageProvider};

/// Descriptor for a file about to be stored.
#[derive(Debug, Clone)]
pub struct ArtifactMeta {
    pub execution_id: Uuid,
    pub detail_id: Option<i64>,
    pub file_name: String,
    pub file_type: FileType,
    /// Overrides the type's default MIME when set.
    pub mime_type: Option<String>,
}

/// Provider-agnostic artifact store with compression and retention.
pub struct ArtifactStore {
    provider: Arc<dyn StorageProvider>,
    repo: ExecutionRepo,
    config: ArtifactSection,
}

impl ArtifactStore {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        repo: ExecutionRepo,
        config: ArtifactSection,
    ) -> Self {
        Self {
            provider,
            repo,
            config,
        }
    }

    /// Select and construct the configured provider.
    pub fn from_config(config: &EngineConfig, repo: ExecutionRepo) -> Result<Self, EngineError> {
        let provider: Arc<dyn StorageProvider> = match config.artifacts.provider.as_str() {
            "local" => Arc::new(LocalFsProvider::new(
                &config.artifacts.base_path,
                &config.artifacts.public_base_url,
                &config.artifacts.signing_secret,
            )),
            "s3" => Arc::new(S3Provider::new(&config.s3)?),
            other => {
                return Err(EngineError::ArtifactStore(format!(
                    "unknown artifact provider: {other}"
                )))
            }
        };
        Ok(Self::new(provider, repo, config.artifacts.clone()))
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    // -- operations ---------------------------------------------------------

    /// Persist `bytes` and record an [`ExecutionFile`] row.
    ///
    /// Log artifacts are always compressed; other types are compressed above
    /// the configured size threshold.
    pub async fn store(&self, bytes: &[u8], meta: ArtifactMeta) -> Result<ExecutionFile, EngineError> {
        let original_size = bytes.len() as u64;
        let compress = meta.file_type == FileType::Log
            || original_size > self.config.compress_threshold_bytes;

        let payload;
        let stored: &[u8] = if compress {
            payload = gzip(bytes)?;
            &payload
        } else {
            bytes
        };

        let now = Utc::now();
        let storage_key = self.storage_key(&meta, now);
        self.provider.put(&storage_key, stored).await?;

        let expires_at = self
            .config
            .retention_days(meta.file_type)
            .map(|days| now + chrono::Duration::days(days));

        let file = ExecutionFile {
            id: Uuid::new_v4(),
            execution_id: meta.execution_id,
            detail_id: meta.detail_id,
            file_name: meta.file_name,
            storage_key,
            file_type: meta.file_type,
            mime_type: meta
                .mime_type
                .unwrap_or_else(|| meta.file_type.mime_type().to_string()),
            size_bytes: stored.len() as u64,
            compressed: compress,
            original_size_bytes: compress.then_some(original_size),
            expires_at,
            created_at: now,
        };
        self.repo
            .insert_file(&file)
            .map_err(|e| EngineError::ArtifactStore(e.to_string()))?;

        debug!(
            id = %file.id,
            key = %file.storage_key,
            compressed = compress,
            provider = self.provider.name(),
            "artifact stored"
        );
        Ok(file)
    }

    /// Read a file from disk and store it.
    pub async fn store_path(
        &self,
        path: &Path,
        meta: ArtifactMeta,
    ) -> Result<ExecutionFile, EngineError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::ArtifactStore(format!("read {}: {e}", path.display())))?;
        self.store(&bytes, meta).await
    }

    /// Fetch artifact content, transparently decompressing.
    pub async fn retrieve(&self, id: Uuid) -> Result<Vec<u8>, EngineError> {
        let file = self.require(id)?;
        let bytes = self.provider.get(&file.storage_key).await?;
        if file.compressed {
            gunzip(&bytes)
        } else {
            Ok(bytes)
        }
    }

    /// Time-limited download URL. The lifetime defaults per artifact type
    /// (longer for failure evidence) unless `ttl` overrides it.
    pub fn signed_url(&self, id: Uuid, ttl: Option<Duration>) -> Result<String, EngineError> {
        let file = self.require(id)?;
        let ttl =
            ttl.unwrap_or_else(|| Duration::from_secs(self.config.url_ttl_secs(file.file_type)));
        self.provider.signed_url(&file.storage_key, ttl)
    }

    /// Delete the stored object and its record.
    pub async fn delete(&self, id: Uuid) -> Result<(), EngineError> {
        let file = self.require(id)?;
        self.delete_stored(&file).await
    }

    /// Delete by row, used by the cleanup sweeps. Object deletion is
    /// idempotent at the provider; the row delete makes the whole operation
    /// safe to re-run.
    pub async fn delete_stored(&self, file: &ExecutionFile) -> Result<(), EngineError> {
        self.provider.delete(&file.storage_key).await?;
        self.repo
            .delete_file(file.id)
            .map_err(|e| EngineError::ArtifactStore(e.to_string()))?;
        Ok(())
    }

    fn require(&self, id: Uuid) -> Result<ExecutionFile, EngineError> {
        self.repo
            .find_file(id)
            .map_err(|e| EngineError::ArtifactStore(e.to_string()))?
            .ok_or_else(|| EngineError::NotFound(format!("artifact {id}")))
    }

    /// `executions/{yyyy}/{mm}/{dd}/{executionId}/{fileType}-{timestamp}-{random}{ext}`
    fn storage_key(&self, meta: &ArtifactMeta, now: chrono::DateTime<Utc>) -> String {
        let ext = Path::new(&meta.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let random: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        format!(
            "executions/{:04}/{:02}/{:02}/{}/{}-{}-{}{}",
            now.year(),
            now.month(),
            now.day(),
            meta.execution_id,
            meta.file_type,
            now.timestamp_millis(),
            random,
            ext
        )
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| EngineError::ArtifactStore(format!("compress: {e}")))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| EngineError::ArtifactStore(format!("decompress: {e}")))?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Browser, Execution};

    fn store_in(dir: &Path) -> (ArtifactStore, ExecutionRepo, Uuid) {
        let pool = crate::storage::open_pool(dir.join("t.db").to_str().unwrap()).unwrap();
        let repo = ExecutionRepo::new(pool);
        let execution =
            Execution::new("t", "https://example.test", Browser::Chromium, "//", "ci");
        repo.insert(&execution).unwrap();

        let mut cfg = EngineConfig::default();
        cfg.artifacts.base_path = dir.join("artifacts").to_str().unwrap().to_string();
        let store = ArtifactStore::from_config(&cfg, repo.clone()).unwrap();
        (store, repo, execution.id)
    }

    fn meta(execution_id: Uuid, file_name: &str, file_type: FileType) -> ArtifactMeta {
        ArtifactMeta {
            execution_id,
            detail_id: None,
            file_name: file_name.to_string(),
            file_type,
            mime_type: None,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _repo, eid) = store_in(dir.path());

        let file = store
            .store(b"pixels", meta(eid, "shot.png", FileType::Screenshot))
            .await
            .unwrap();
        assert!(!file.compressed);
        assert_eq!(store.retrieve(file.id).await.unwrap(), b"pixels");
    }

    #[tokio::test]
    async fn test_logs_always_compressed_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _repo, eid) = store_in(dir.path());

        let content = "line\n".repeat(100);
        let file = store
            .store(content.as_bytes(), meta(eid, "console.log", FileType::Log))
            .await
            .unwrap();
        assert!(file.compressed);
        assert_eq!(file.original_size_bytes, Some(content.len() as u64));
        assert!(file.size_bytes < content.len() as u64);
        // Retrieval decompresses back to byte-identical content.
        assert_eq!(store.retrieve(file.id).await.unwrap(), content.as_bytes());
    }

    #[tokio::test]
    async fn test_large_files_compressed_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _repo, eid) = store_in(dir.path());

        let big = vec![0u8; 600 * 1024];
        let file = store
            .store(&big, meta(eid, "trace.zip", FileType::Trace))
            .await
            .unwrap();
        assert!(file.compressed);
        assert_eq!(store.retrieve(file.id).await.unwrap(), big);
    }

    #[tokio::test]
    async fn test_storage_key_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _repo, eid) = store_in(dir.path());

        let file = store
            .store(b"x", meta(eid, "shot.png", FileType::Screenshot))
            .await
            .unwrap();
        let now = Utc::now();
        let prefix = format!(
            "executions/{:04}/{:02}/{:02}/{}/screenshot-",
            now.year(),
            now.month(),
            now.day(),
            eid
        );
        assert!(file.storage_key.starts_with(&prefix), "{}", file.storage_key);
        assert!(file.storage_key.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_expiration_from_retention_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _repo, eid) = store_in(dir.path());

        let file = store
            .store(b"l", meta(eid, "c.log", FileType::Log))
            .await
            .unwrap();
        let expires = file.expires_at.unwrap();
        let expected = Utc::now() + chrono::Duration::days(3);
        assert!((expires - expected).num_seconds().abs() < 60);
    }

    #[tokio::test]
    async fn test_delete_removes_object_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let (store, repo, eid) = store_in(dir.path());

        let file = store
            .store(b"x", meta(eid, "shot.png", FileType::Screenshot))
            .await
            .unwrap();
        store.delete(file.id).await.unwrap();
        assert!(repo.find_file(file.id).unwrap().is_none());
        assert!(matches!(
            store.retrieve(file.id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_signed_url_uses_type_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _repo, eid) = store_in(dir.path());

        let file = store
            .store(b"x", meta(eid, "shot.png", FileType::Screenshot))
            .await
            .unwrap();
        let url = store.signed_url(file.id, None).unwrap();
        let expires: i64 = url
            .split("expires=")
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();
        let expected = Utc::now().timestamp() + 24 * 3600;
        assert!((expires - expected).abs() < 60);
    }
}
