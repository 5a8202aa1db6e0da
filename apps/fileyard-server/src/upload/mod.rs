//! Chunked Upload Module
//!
//! Resumable file ingestion with content-addressed deduplication:
//! - Whole-file or chunked uploads keyed by a client session id
//! - Chunk resubmission overwrites in place, merge follows index order
//! - SHA-256 content hashing in one streaming pass
//! - At most one stored blob per content hash, with repair of records whose
//!   blob has gone missing
//!
//! Upload Flow:
//! 1. A declared hash that is already stored completes immediately
//! 2. Single-shot payloads are spooled to the temp root and finalized
//! 3. Chunks are stored as `{session}_PART_{index}{ext}` until the final one
//!    arrives, then merged, finalized and removed
//! 4. The janitor reclaims temp files of abandoned sessions

pub mod chunk_store;
pub mod content_store;
pub mod coordinator;
pub mod folders;
pub mod hash_lock;
mod io;
pub mod janitor;
pub mod merge;
pub mod types;

pub use chunk_store::{extension_of, validate_session_id, ChunkStore};
pub use content_store::{compute_hash, content_type_for, hash_file, ContentAddressStore};
pub use coordinator::UploadCoordinator;
pub use hash_lock::HashLocks;
pub use janitor::TempJanitor;
pub use merge::MergeEngine;
pub use types::*;
