//! Upload types for chunked ingestion and content-addressed storage

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use axum::body::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::db::FileRecord;

// ============================================================================
// Constants
// ============================================================================

/// Default buffer used for streaming copies and hashing: 64KB
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Temporary chunk files older than this are reclaimed by the janitor
pub const DEFAULT_TEMP_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Longest accepted client session identifier
pub const MAX_SESSION_ID_LEN: usize = 128;

// ============================================================================
// Byte Sources
// ============================================================================

/// Where the bytes of an upload come from
pub enum ByteSource {
    /// Bytes already received and spooled to a file (moved, not copied, when possible)
    File(PathBuf),

    /// Payload held in memory
    Bytes(Bytes),

    /// Payload still being read from a stream
    Reader(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(data))
    }
}

impl From<&'static [u8]> for ByteSource {
    fn from(data: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(data))
    }
}

// ============================================================================
// Upload Request / Result
// ============================================================================

/// One upload call: single-shot, one chunk of a session, or a bare hash probe
#[derive(Debug)]
pub struct UploadRequest {
    /// Client-chosen session token. `None` (or empty) means single-shot.
    pub session_id: Option<String>,

    /// 0-based chunk index
    pub chunk: u32,

    /// Total chunk count for the session
    pub chunks: u32,

    /// Content hash declared by the client (hex, any case)
    pub declared_hash: Option<String>,

    /// Original file name, used for display and the stored extension
    pub file_name: String,

    /// Explicit storage-relative path overriding the sharded layout
    pub relative_path: Option<String>,

    /// Character set hint for textual content
    pub charset: Option<String>,

    /// Attached payload
    pub source: Option<ByteSource>,
}

impl UploadRequest {
    /// Single-shot upload of a whole file
    pub fn single(file_name: impl Into<String>, source: impl Into<ByteSource>) -> Self {
        Self {
            session_id: None,
            chunk: 0,
            chunks: 1,
            declared_hash: None,
            file_name: file_name.into(),
            relative_path: None,
            charset: None,
            source: Some(source.into()),
        }
    }

    /// One chunk of a chunked session
    pub fn chunk(
        session_id: impl Into<String>,
        chunk: u32,
        chunks: u32,
        file_name: impl Into<String>,
        source: impl Into<ByteSource>,
    ) -> Self {
        Self {
            session_id: Some(session_id.into()),
            chunk,
            chunks,
            declared_hash: None,
            file_name: file_name.into(),
            relative_path: None,
            charset: None,
            source: Some(source.into()),
        }
    }

    /// Hash-only probe with no payload attached
    pub fn probe(declared_hash: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            session_id: None,
            chunk: 0,
            chunks: 1,
            declared_hash: Some(declared_hash.into()),
            file_name: file_name.into(),
            relative_path: None,
            charset: None,
            source: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.declared_hash = Some(hash.into());
        self
    }

    pub fn with_relative_path(mut self, path: impl Into<String>) -> Self {
        self.relative_path = Some(path.into());
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    /// Session token, with empty strings treated as absent
    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }

    /// Declared hash, with empty strings treated as absent
    pub fn declared(&self) -> Option<&str> {
        self.declared_hash.as_deref().filter(|h| !h.is_empty())
    }
}

/// Response to an upload call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    /// Stored file id; absent while a chunked session is still in progress
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Whether the content was already stored
    pub duplicate: bool,

    /// Echoed chunk index
    pub chunk: u32,
}

impl UploadResult {
    /// Acknowledgement for a stored, non-final chunk
    pub fn progress(chunk: u32) -> Self {
        Self {
            id: None,
            duplicate: false,
            chunk,
        }
    }

    pub fn stored(id: String, duplicate: bool, chunk: u32) -> Self {
        Self {
            id: Some(id),
            duplicate,
            chunk,
        }
    }
}

// ============================================================================
// Finalize Types
// ============================================================================

/// Input to content-addressed finalization
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    /// Temporary file holding the complete content; consumed by finalize
    pub temp_path: PathBuf,

    /// Display name recorded on a new record
    pub display_name: String,

    /// Hash declared by the client, verified against the computed one
    pub declared_hash: Option<String>,

    /// Content type recorded on a new record
    pub content_type: String,

    /// Explicit storage-relative path
    pub relative_path: Option<String>,
}

/// Result of finalization
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub record: FileRecord,
    pub duplicate: bool,
}

// ============================================================================
// Download Types
// ============================================================================

/// Download by storage reference instead of id
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Name presented to the client; defaults to the last path segment
    pub file_name: Option<String>,

    /// Storage-relative path of the blob
    pub relative_path: String,
}

/// An opened stored file
#[derive(Debug)]
pub struct DownloadResult {
    pub content: tokio::fs::File,
    pub length: u64,
    pub content_type: String,
    pub file_name: String,
}

// ============================================================================
// Folder Listing
// ============================================================================

/// A directory under the storage root. Ids are assigned per listing call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFolder {
    pub id: usize,
    pub name: String,
    pub full_name: String,
    pub level: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<usize>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid upload request: {0}")]
    Validation(String),

    #[error("Upload payload missing")]
    MissingPayload,

    #[error("Missing chunk {index} for session {session_id}")]
    MissingChunk { session_id: String, index: u32 },

    #[error("IO failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: String, computed: String },

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] sqlx::Error),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::MissingPayload => StatusCode::BAD_REQUEST,
            Self::MissingChunk { .. } => StatusCode::CONFLICT,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Metadata(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::MissingPayload => "MISSING_PAYLOAD",
            Self::MissingChunk { .. } => "MISSING_CHUNK",
            Self::Io(_) => "IO_FAILURE",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Metadata(_) => "METADATA_ERROR",
        }
    }

    /// Whether this is a payload, chunk, or disk failure
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            Self::MissingPayload | Self::MissingChunk { .. } | Self::Io(_)
        )
    }
}
