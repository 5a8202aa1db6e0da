//! Upload Coordinator
//!
//! Drives one upload call through the decision tree:
//!
//! 1. A declared hash that already has a stored, reachable blob completes
//!    immediately as a duplicate ("instant upload"); nothing is read or written.
//! 2. Without a session id the payload is a whole file: spool and finalize it.
//! 3. Otherwise the payload is one chunk of a session. Non-final chunks are
//!    stored and acknowledged; the final chunk is stored, the session merged,
//!    finalized and its chunk files removed.
//!
//! Also serves downloads and storage-tree listings.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::UploadConfig;
use crate::db::{FileRecord, MetadataRepository};

use super::chunk_store::{extension_of, validate_session_id, ChunkStore};
use super::content_store::{content_type_for, normalize_relative_path, ContentAddressStore};
use super::folders;
use super::janitor::TempJanitor;
use super::merge::MergeEngine;
use super::types::{
    DownloadRequest, DownloadResult, FinalizeOutcome, FinalizeRequest, UploadError,
    UploadFolder, UploadRequest, UploadResult,
};

#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    chunk_store: ChunkStore,
    merge_engine: MergeEngine,
    content_store: ContentAddressStore,
}

impl UploadCoordinator {
    pub fn new(chunk_store: ChunkStore, content_store: ContentAddressStore) -> Self {
        let merge_engine = MergeEngine::new(chunk_store.clone());
        Self {
            inner: Arc::new(CoordinatorInner {
                chunk_store,
                merge_engine,
                content_store,
            }),
        }
    }

    /// Wire the components from configuration
    pub fn from_config(config: &UploadConfig, repository: Arc<dyn MetadataRepository>) -> Self {
        let chunk_store =
            ChunkStore::with_buffer_size(config.temp_root.clone(), config.copy_buffer_bytes);
        let content_store = ContentAddressStore::with_buffer_size(
            config.storage_root.clone(),
            repository,
            config.copy_buffer_bytes,
        );
        Self::new(chunk_store, content_store)
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    pub fn content_store(&self) -> &ContentAddressStore {
        &self.inner.content_store
    }

    /// Janitor over this coordinator's temp root
    pub fn janitor(&self) -> TempJanitor {
        TempJanitor::new(self.inner.chunk_store.temp_root().to_path_buf())
    }

    // ========================================================================
    // Upload
    // ========================================================================

    pub async fn submit(&self, request: UploadRequest) -> Result<UploadResult, UploadError> {
        if let Some(result) = self.try_instant(&request).await? {
            return Ok(result);
        }

        match request.session().map(str::to_string) {
            None => self.submit_single(request).await,
            Some(session_id) => self.submit_chunk(&session_id, request).await,
        }
    }

    async fn try_instant(&self, request: &UploadRequest) -> Result<Option<UploadResult>, UploadError> {
        let Some(hash) = request.declared() else {
            return Ok(None);
        };
        let Some(existing) = self.inner.content_store.find_by_hash(hash).await? else {
            return Ok(None);
        };

        if !self.inner.content_store.blob_exists(&existing).await? {
            tracing::warn!(
                id = %existing.id,
                content_hash = %existing.content_hash,
                "Stored blob missing, continuing with full upload"
            );
            return Ok(None);
        }

        tracing::info!(
            id = %existing.id,
            content_hash = %existing.content_hash,
            file_name = %request.file_name,
            "Instant upload, content already stored"
        );

        Ok(Some(UploadResult::stored(existing.id, true, request.chunk)))
    }

    async fn submit_single(&self, request: UploadRequest) -> Result<UploadResult, UploadError> {
        validate_file_name(&request.file_name)?;
        let UploadRequest {
            chunk,
            declared_hash,
            file_name,
            relative_path,
            charset,
            source,
            ..
        } = request;
        let source = source.ok_or(UploadError::MissingPayload)?;

        let temp_path = self
            .inner
            .chunk_store
            .spool(&extension_of(&file_name), source)
            .await?;

        let outcome = self
            .finalize(temp_path, file_name, declared_hash, charset, relative_path)
            .await?;

        Ok(UploadResult::stored(outcome.record.id, outcome.duplicate, chunk))
    }

    async fn submit_chunk(
        &self,
        session_id: &str,
        request: UploadRequest,
    ) -> Result<UploadResult, UploadError> {
        validate_session_id(session_id)?;
        validate_file_name(&request.file_name)?;
        if request.chunks == 0 {
            return Err(UploadError::Validation(
                "chunk count must be at least 1".to_string(),
            ));
        }
        if request.chunk >= request.chunks {
            return Err(UploadError::Validation(format!(
                "chunk index {} out of range for {} chunks",
                request.chunk, request.chunks
            )));
        }

        let UploadRequest {
            chunk,
            chunks,
            declared_hash,
            file_name,
            relative_path,
            charset,
            source,
            ..
        } = request;
        let source = source.ok_or(UploadError::MissingPayload)?;
        let ext = extension_of(&file_name);

        self.inner
            .chunk_store
            .put(session_id, chunk, &ext, source)
            .await?;

        if chunk + 1 < chunks {
            tracing::debug!(
                session_id = %session_id,
                chunk_index = chunk,
                chunks = chunks,
                "Chunk received"
            );
            return Ok(UploadResult::progress(chunk));
        }

        let merged = self
            .inner
            .merge_engine
            .merge(session_id, chunks, &ext)
            .await?;

        let outcome = self
            .finalize(merged, file_name, declared_hash, charset, relative_path)
            .await?;

        if let Err(e) = self
            .inner
            .chunk_store
            .delete_all(session_id, chunks, &ext)
            .await
        {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to remove session chunks");
        }

        tracing::info!(
            session_id = %session_id,
            id = %outcome.record.id,
            duplicate = outcome.duplicate,
            "Chunked upload complete"
        );

        Ok(UploadResult::stored(outcome.record.id, outcome.duplicate, chunk))
    }

    async fn finalize(
        &self,
        temp_path: PathBuf,
        file_name: String,
        declared_hash: Option<String>,
        charset: Option<String>,
        relative_path: Option<String>,
    ) -> Result<FinalizeOutcome, UploadError> {
        let content_type = content_type_for(&file_name, charset.as_deref());
        self.inner
            .content_store
            .finalize(FinalizeRequest {
                temp_path,
                display_name: file_name,
                declared_hash: declared_hash.filter(|h| !h.is_empty()),
                content_type,
                relative_path,
            })
            .await
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Open a stored file by id. `file_name` overrides the recorded name.
    pub async fn download(
        &self,
        id: &str,
        file_name: Option<&str>,
    ) -> Result<DownloadResult, UploadError> {
        let record: FileRecord = self
            .inner
            .content_store
            .repository()
            .find_by_id(id)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("file {}", id)))?;

        let path = self.inner.content_store.resolve(&record.relative_path)?;
        let (content, length) = open_blob(&path, id).await?;

        let file_name = file_name
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or(record.name);

        Ok(DownloadResult {
            content,
            length,
            content_type: record.content_type,
            file_name,
        })
    }

    /// Open a stored file by its storage-relative path
    pub async fn download_by_path(
        &self,
        request: DownloadRequest,
    ) -> Result<DownloadResult, UploadError> {
        let relative = normalize_relative_path(&request.relative_path)?;
        let path = self.inner.content_store.resolve(&relative)?;
        let (content, length) = open_blob(&path, &relative).await?;

        let file_name = match request.file_name.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => relative
                .rsplit('/')
                .next()
                .unwrap_or(relative.as_str())
                .to_string(),
        };

        Ok(DownloadResult {
            content,
            length,
            content_type: content_type_for(&file_name, None),
            file_name,
        })
    }

    // ========================================================================
    // Listing
    // ========================================================================

    pub async fn list_folders(&self) -> Result<Vec<UploadFolder>, UploadError> {
        folders::list_folders(self.inner.content_store.storage_root()).await
    }

    pub async fn list_folder_files(&self, folder: &str) -> Result<Vec<String>, UploadError> {
        folders::list_folder_files(self.inner.content_store.storage_root(), folder).await
    }
}

fn validate_file_name(file_name: &str) -> Result<(), UploadError> {
    if file_name.trim().is_empty() {
        return Err(UploadError::Validation("file name is required".to_string()));
    }
    Ok(())
}

async fn open_blob(path: &std::path::Path, what: &str) -> Result<(tokio::fs::File, u64), UploadError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(UploadError::NotFound(format!("stored content for {}", what)))
        }
        Err(e) => return Err(e.into()),
    };
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Err(UploadError::NotFound(format!("stored content for {}", what)));
    }
    Ok((file, metadata.len()))
}
