//! Merge Engine
//!
//! Assembles a session's chunk files, in index order, into one temporary file.
//! Chunks are copied through a fixed-size buffer, so memory use does not grow
//! with chunk or file size.

use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

use super::chunk_store::ChunkStore;
use super::io::discard;
use super::types::UploadError;

/// Concatenates chunk files into the session's merged file
#[derive(Clone)]
pub struct MergeEngine {
    chunk_store: ChunkStore,
}

impl MergeEngine {
    pub fn new(chunk_store: ChunkStore) -> Self {
        Self { chunk_store }
    }

    /// Merge chunks `0..chunk_count` into `{tempRoot}/{sessionId}{ext}`.
    ///
    /// Fails with `MissingChunk` if any index is absent; the partial merged
    /// file is removed in that case.
    pub async fn merge(
        &self,
        session_id: &str,
        chunk_count: u32,
        ext: &str,
    ) -> Result<PathBuf, UploadError> {
        let dest = self.chunk_store.merged_path(session_id, ext);

        tracing::info!(
            session_id = %session_id,
            chunks = chunk_count,
            "Assembling file from chunks"
        );

        match self.copy_chunks(session_id, chunk_count, ext, &dest).await {
            Ok(size) => {
                tracing::debug!(
                    session_id = %session_id,
                    size = size,
                    path = %dest.display(),
                    "Chunks merged"
                );
                Ok(dest)
            }
            Err(e) => {
                discard(&dest).await;
                Err(e)
            }
        }
    }

    async fn copy_chunks(
        &self,
        session_id: &str,
        chunk_count: u32,
        ext: &str,
        dest: &std::path::Path,
    ) -> Result<u64, UploadError> {
        let buffer_size = self.chunk_store.buffer_size();
        let mut writer = BufWriter::with_capacity(buffer_size, File::create(dest).await?);
        let mut total = 0u64;

        for index in 0..chunk_count {
            let chunk_path = self.chunk_store.get(session_id, index, ext).await?;
            let chunk = match File::open(&chunk_path).await {
                Ok(file) => file,
                // Swept or replaced between the existence check and open
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(UploadError::MissingChunk {
                        session_id: session_id.to_string(),
                        index,
                    })
                }
                Err(e) => return Err(e.into()),
            };
            let mut reader = BufReader::with_capacity(buffer_size, chunk);
            total += tokio::io::copy_buf(&mut reader, &mut writer).await?;
        }

        writer.flush().await?;
        Ok(total)
    }
}
