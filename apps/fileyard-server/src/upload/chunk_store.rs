//! Chunk Store
//!
//! Temporary storage for uploaded chunks before assembly.
//! Chunk files are named deterministically from (session, index, extension)
//! so a resubmitted chunk replaces the earlier one in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use super::io::{copy_to_file, move_file, remove_if_exists, staging_path};
use super::types::{ByteSource, UploadError, DEFAULT_COPY_BUFFER_SIZE, MAX_SESSION_ID_LEN};

// ============================================================================
// Chunk Store
// ============================================================================

/// Filesystem store for chunk payloads, keyed by (session, index)
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Directory holding chunk, merged and spooled files
    temp_root: PathBuf,

    /// Buffer size for streaming writes
    buffer_size: usize,
}

impl ChunkStore {
    /// Create a store rooted at `temp_root`
    pub fn new(temp_root: PathBuf) -> Self {
        Self::with_buffer_size(temp_root, DEFAULT_COPY_BUFFER_SIZE)
    }

    /// Create with a custom streaming buffer size
    pub fn with_buffer_size(temp_root: PathBuf, buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                temp_root,
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.inner.temp_root
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// `{tempRoot}/{sessionId}_PART_{index}{ext}`
    pub fn chunk_path(&self, session_id: &str, index: u32, ext: &str) -> PathBuf {
        self.inner
            .temp_root
            .join(format!("{}{}{}{}", session_id, CHUNK_MARKER, index, ext))
    }

    /// `{tempRoot}/{sessionId}{ext}`
    pub fn merged_path(&self, session_id: &str, ext: &str) -> PathBuf {
        self.inner.temp_root.join(format!("{}{}", session_id, ext))
    }

    /// Store a chunk, replacing any earlier chunk at the same index.
    ///
    /// The new bytes become visible at the chunk path in a single rename, so a
    /// concurrent merge never observes a half-written chunk.
    pub async fn put(
        &self,
        session_id: &str,
        index: u32,
        ext: &str,
        source: ByteSource,
    ) -> Result<u64, UploadError> {
        validate_session_id(session_id)?;
        let dest = self.chunk_path(session_id, index, ext);
        let size = self.write_atomic(&dest, source).await?;

        tracing::debug!(
            session_id = %session_id,
            chunk_index = index,
            size = size,
            "Stored chunk"
        );

        Ok(size)
    }

    /// Path of a stored chunk
    pub async fn get(&self, session_id: &str, index: u32, ext: &str) -> Result<PathBuf, UploadError> {
        let path = self.chunk_path(session_id, index, ext);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(UploadError::MissingChunk {
                session_id: session_id.to_string(),
                index,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(UploadError::MissingChunk {
                session_id: session_id.to_string(),
                index,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete chunks `0..chunks` of a session. Returns how many existed.
    pub async fn delete_all(&self, session_id: &str, chunks: u32, ext: &str) -> Result<usize, UploadError> {
        let mut count = 0;
        for index in 0..chunks {
            if remove_if_exists(&self.chunk_path(session_id, index, ext)).await? {
                count += 1;
            }
        }

        tracing::debug!(session_id = %session_id, count = count, "Deleted session chunks");

        Ok(count)
    }

    /// Spool a whole single-shot payload to `{tempRoot}/{uuid}{ext}`
    pub async fn spool(&self, ext: &str, source: ByteSource) -> Result<PathBuf, UploadError> {
        let dest = self
            .inner
            .temp_root
            .join(format!("{}{}", Uuid::new_v4().simple(), ext));
        self.write_atomic(&dest, source).await?;
        Ok(dest)
    }

    async fn write_atomic(&self, dest: &Path, source: ByteSource) -> Result<u64, UploadError> {
        tokio::fs::create_dir_all(&self.inner.temp_root).await?;

        let staging = staging_path(dest);
        let written = match source {
            ByteSource::File(path) => {
                move_file(&path, dest, self.inner.buffer_size).await?;
                return Ok(tokio::fs::metadata(dest).await?.len());
            }
            ByteSource::Bytes(bytes) => tokio::fs::write(&staging, &bytes)
                .await
                .map(|()| bytes.len() as u64),
            ByteSource::Reader(reader) => {
                copy_to_file(reader, &staging, self.inner.buffer_size).await
            }
        };

        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
        };

        if let Err(e) = tokio::fs::rename(&staging, dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        Ok(written)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Separates session id and index in chunk file names
const CHUNK_MARKER: &str = "_PART_";

/// Session ids become file names, so only `[A-Za-z0-9_-]` is accepted
pub fn validate_session_id(session_id: &str) -> Result<(), UploadError> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(UploadError::Validation(format!(
            "session id must be 1-{} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(UploadError::Validation(format!(
            "session id contains invalid characters: {}",
            session_id
        )));
    }
    // Would collide with another session's chunk names
    if session_id.contains(CHUNK_MARKER) {
        return Err(UploadError::Validation(format!(
            "session id must not contain {}: {}",
            CHUNK_MARKER, session_id
        )));
    }
    Ok(())
}

/// Extension of `file_name` including the leading dot, or empty.
/// Extensions that are not short and alphanumeric are dropped.
pub fn extension_of(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match base.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 16
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext)
        }
        _ => String::new(),
    }
}

// ============================================================================
// Tests
// ============================================================================
