//! Content Address Store
//!
//! Hashes finished uploads, deduplicates them against existing records and
//! places new blobs under `{storageRoot}/{yyyyMM}/{ddHH}/{id}{ext}`.
//!
//! A record is not taken as proof that its blob exists: every dedup hit stats
//! the blob, and a missing one is re-materialized from the incoming upload
//! with the record repointed in place (same id, same hash).

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::{FileRecord, MetadataRepository};

use super::chunk_store::extension_of;
use super::hash_lock::HashLocks;
use super::io::{discard, is_file, move_file, place_file};
use super::types::{FinalizeOutcome, FinalizeRequest, UploadError, DEFAULT_COPY_BUFFER_SIZE};

// ============================================================================
// Content Address Store
// ============================================================================

#[derive(Clone)]
pub struct ContentAddressStore {
    inner: Arc<ContentAddressStoreInner>,
}

struct ContentAddressStoreInner {
    /// Root of long-term blob storage
    storage_root: PathBuf,

    /// File metadata
    repository: Arc<dyn MetadataRepository>,

    /// Serializes finalize per content hash
    locks: HashLocks,

    /// Buffer size for hashing and cross-device moves
    buffer_size: usize,
}

impl ContentAddressStore {
    pub fn new(storage_root: PathBuf, repository: Arc<dyn MetadataRepository>) -> Self {
        Self::with_buffer_size(storage_root, repository, DEFAULT_COPY_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        storage_root: PathBuf,
        repository: Arc<dyn MetadataRepository>,
        buffer_size: usize,
    ) -> Self {
        Self {
            inner: Arc::new(ContentAddressStoreInner {
                storage_root,
                repository,
                locks: HashLocks::new(),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.inner.storage_root
    }

    pub fn repository(&self) -> &Arc<dyn MetadataRepository> {
        &self.inner.repository
    }

    /// Existing record for a content hash (any case)
    pub async fn find_by_hash(&self, hash: &str) -> Result<Option<FileRecord>, UploadError> {
        self.inner
            .repository
            .find_by_hash(&hash.to_ascii_uppercase())
            .await
    }

    /// Whether the record's blob is present on disk
    pub async fn blob_exists(&self, record: &FileRecord) -> Result<bool, UploadError> {
        let path = self.resolve(&record.relative_path)?;
        Ok(is_file(&path).await?)
    }

    /// Absolute path for a storage-relative path, rejecting escapes from the root
    pub fn resolve(&self, relative_path: &str) -> Result<PathBuf, UploadError> {
        let normalized = normalize_relative_path(relative_path)?;
        Ok(normalized
            .split('/')
            .fold(self.inner.storage_root.clone(), |path, segment| {
                path.join(segment)
            }))
    }

    /// Hash the temp file, then store it as a new blob, drop it as a duplicate,
    /// or use it to repair a record whose blob has gone missing.
    ///
    /// The temp file is always consumed: moved into storage or discarded.
    pub async fn finalize(&self, request: FinalizeRequest) -> Result<FinalizeOutcome, UploadError> {
        let relative_override = match request.relative_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => match normalize_relative_path(path) {
                Ok(normalized) => Some(normalized),
                Err(e) => {
                    discard(&request.temp_path).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let computed = match hash_file(&request.temp_path, self.inner.buffer_size).await {
            Ok(hash) => hash,
            Err(e) => {
                discard(&request.temp_path).await;
                return Err(e.into());
            }
        };

        if let Some(declared) = request.declared_hash.as_deref().filter(|h| !h.is_empty()) {
            if !declared.eq_ignore_ascii_case(&computed) {
                tracing::warn!(
                    declared = %declared,
                    computed = %computed,
                    file_name = %request.display_name,
                    "Declared content hash does not match upload"
                );
                discard(&request.temp_path).await;
                return Err(UploadError::ChecksumMismatch {
                    declared: declared.to_string(),
                    computed,
                });
            }
        }

        let _guard = self.inner.locks.acquire(&computed).await;

        let result = match self.inner.repository.find_by_hash(&computed).await {
            Ok(None) => {
                self.store_new(&request, &computed, relative_override)
                    .await
            }
            Ok(Some(existing)) => match self.blob_exists(&existing).await {
                Ok(true) => {
                    discard(&request.temp_path).await;
                    tracing::info!(
                        id = %existing.id,
                        content_hash = %computed,
                        file_name = %request.display_name,
                        "Duplicate content, reusing stored blob"
                    );
                    Ok(FinalizeOutcome {
                        record: existing,
                        duplicate: true,
                    })
                }
                Ok(false) => self.repair(&request, existing, relative_override).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if result.is_err() {
            discard(&request.temp_path).await;
        }
        result
    }

    async fn store_new(
        &self,
        request: &FinalizeRequest,
        content_hash: &str,
        relative_override: Option<String>,
    ) -> Result<FinalizeOutcome, UploadError> {
        let id = Uuid::new_v4().simple().to_string();
        let created_at = Utc::now();
        let explicit = relative_override.is_some();
        let relative_path = relative_override
            .unwrap_or_else(|| shard_path(created_at, &id, &extension_of(&request.display_name)));
        let dest = self
            .place(&request.temp_path, &relative_path, explicit, content_hash)
            .await?;

        let record = FileRecord {
            id,
            name: request.display_name.clone(),
            relative_path,
            content_hash: content_hash.to_string(),
            content_type: request.content_type.clone(),
            created_at,
        };

        if let Err(e) = self.inner.repository.insert(&record).await {
            // Keep storage free of blobs no record points at
            discard(&dest).await;
            return Err(e);
        }

        tracing::info!(
            id = %record.id,
            content_hash = %record.content_hash,
            path = %record.relative_path,
            file_name = %record.name,
            "Stored new file"
        );

        Ok(FinalizeOutcome {
            record,
            duplicate: false,
        })
    }

    async fn repair(
        &self,
        request: &FinalizeRequest,
        mut existing: FileRecord,
        relative_override: Option<String>,
    ) -> Result<FinalizeOutcome, UploadError> {
        let explicit = relative_override.is_some();
        let relative_path = relative_override.unwrap_or_else(|| {
            shard_path(Utc::now(), &existing.id, &extension_of(&existing.name))
        });
        let dest = self
            .place(&request.temp_path, &relative_path, explicit, &existing.content_hash)
            .await?;

        if let Err(e) = self
            .inner
            .repository
            .update_path_by_hash(&existing.content_hash, &relative_path)
            .await
        {
            discard(&dest).await;
            return Err(e);
        }

        tracing::warn!(
            id = %existing.id,
            content_hash = %existing.content_hash,
            missing_path = %existing.relative_path,
            new_path = %relative_path,
            "Stored blob was missing, restored from upload"
        );

        existing.relative_path = relative_path;
        Ok(FinalizeOutcome {
            record: existing,
            duplicate: true,
        })
    }

    /// Move the temp file to `relative_path` and return the blob's absolute path.
    ///
    /// Generated paths embed a fresh id and are moved into directly. Explicit
    /// paths must not belong to a record of other content, and an existing file
    /// there is never replaced.
    async fn place(
        &self,
        temp_path: &Path,
        relative_path: &str,
        explicit: bool,
        content_hash: &str,
    ) -> Result<PathBuf, UploadError> {
        let dest = self.resolve(relative_path)?;

        if !explicit {
            move_file(temp_path, &dest, self.inner.buffer_size).await?;
            return Ok(dest);
        }

        if let Some(holder) = self.inner.repository.find_by_path(relative_path).await? {
            if holder.content_hash != content_hash {
                return Err(path_in_use(relative_path, Some(&holder.id)));
            }
        }

        match place_file(temp_path, &dest, self.inner.buffer_size).await {
            Ok(()) => Ok(dest),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(path_in_use(relative_path, None))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn path_in_use(relative_path: &str, holder: Option<&str>) -> UploadError {
    tracing::warn!(path = %relative_path, holder = ?holder, "Storage path already in use");
    UploadError::Validation(format!("storage path already in use: {}", relative_path))
}

// ============================================================================
// Helpers
// ============================================================================

/// Uppercase hex SHA-256 of a file, read in one streaming pass on a blocking thread
pub async fn hash_file(path: &Path, buffer_size: usize) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; buffer_size.max(1)];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode_upper(hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Uppercase hex SHA-256 of in-memory data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode_upper(hasher.finalize())
}

/// `{yyyyMM}/{ddHH}/{id}{ext}` for the given timestamp
pub fn shard_path(at: DateTime<Utc>, id: &str, ext: &str) -> String {
    format!("{}/{}/{}{}", at.format("%Y%m"), at.format("%d%H"), id, ext)
}

/// Normalize a client-supplied storage path to `/`-separated relative form.
/// Absolute paths, `..` segments and empty paths are rejected.
pub fn normalize_relative_path(raw: &str) -> Result<String, UploadError> {
    let unified = raw.replace('\\', "/");
    let mut segments = Vec::new();

    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(UploadError::Validation(format!(
                    "path escapes storage root: {}",
                    raw
                )))
            }
            s if s.contains(':') => {
                return Err(UploadError::Validation(format!(
                    "path must be relative: {}",
                    raw
                )))
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(UploadError::Validation("path is empty".to_string()));
    }

    Ok(segments.join("/"))
}

/// Content type from the file name, with a charset parameter for textual types
pub fn content_type_for(file_name: &str, charset: Option<&str>) -> String {
    let mime = mime_guess::from_path(file_name).first_or_octet_stream();
    let textual = mime.type_() == mime_guess::mime::TEXT
        || matches!(
            mime.subtype().as_str(),
            "json" | "xml" | "javascript"
        );

    match charset.map(str::trim).filter(|c| !c.is_empty()) {
        Some(charset) if textual => format!("{}; charset={}", mime.essence_str(), charset),
        _ => mime.essence_str().to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory_pool, SqliteFileRepository};
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        temp_root: PathBuf,
        repo: SqliteFileRepository,
        store: ContentAddressStore,
    }

    async fn setup() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let temp_root = tmp.path().join("tmp");
        std::fs::create_dir_all(&temp_root).unwrap();
        let repo = SqliteFileRepository::new(memory_pool().await);
        let store = ContentAddressStore::new(tmp.path().join("files"), Arc::new(repo.clone()));
        Fixture {
            _tmp: tmp,
            temp_root,
            repo,
            store,
        }
    }

    impl Fixture {
        fn temp_file(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.temp_root.join(name);
            std::fs::write(&path, data).unwrap();
            path
        }

        fn request(&self, temp_path: PathBuf, name: &str) -> FinalizeRequest {
            FinalizeRequest {
                temp_path,
                display_name: name.to_string(),
                declared_hash: None,
                content_type: content_type_for(name, None),
                relative_path: None,
            }
        }

        fn blob_count(&self) -> usize {
            count_files(self.store.storage_root())
        }
    }

    fn count_files(dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .map(|e| {
                let path = e.path();
                if path.is_dir() {
                    count_files(&path)
                } else {
                    1
                }
            })
            .sum()
    }

    #[test]
    fn test_compute_hash() {
        assert_eq!(
            compute_hash(b"abc"),
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD"
        );
    }

    #[test]
    fn test_shard_path() {
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 9, 15, 0).unwrap();
        assert_eq!(shard_path(at, "abc", ".txt"), "202403/0709/abc.txt");
        assert_eq!(shard_path(at, "abc", ""), "202403/0709/abc");
    }

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_relative_path("\\a\\b\\c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_relative_path("/a//./b.txt").unwrap(), "a/b.txt");
        assert!(normalize_relative_path("../etc/passwd").is_err());
        assert!(normalize_relative_path("a/../../b").is_err());
        assert!(normalize_relative_path("C:/windows").is_err());
        assert!(normalize_relative_path("//").is_err());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("x.txt", None), "text/plain");
        assert_eq!(content_type_for("x.txt", Some("gbk")), "text/plain; charset=gbk");
        assert_eq!(content_type_for("x.json", Some("utf-8")), "application/json; charset=utf-8");
        assert_eq!(content_type_for("x.png", Some("utf-8")), "image/png");
        assert_eq!(content_type_for("noext", None), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_hash_file_matches_in_memory_hash() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path, 7).await.unwrap(), compute_hash(&data));
    }

    #[tokio::test]
    async fn test_store_new_blob() {
        let fx = setup().await;
        let temp = fx.temp_file("up.tmp", b"hello");

        let outcome = fx.store.finalize(fx.request(temp.clone(), "hello.txt")).await.unwrap();

        assert!(!outcome.duplicate);
        assert!(!temp.exists());
        let record = outcome.record;
        assert_eq!(record.id.len(), 32);
        assert_eq!(record.content_hash, compute_hash(b"hello"));
        assert_eq!(record.content_type, "text/plain");
        assert!(record.relative_path.ends_with(&format!("/{}.txt", record.id)));
        assert_eq!(record.relative_path.split('/').count(), 3);

        let blob = fx.store.resolve(&record.relative_path).unwrap();
        assert_eq!(std::fs::read(blob).unwrap(), b"hello");
        assert_eq!(
            fx.repo.find_by_id(&record.id).await.unwrap().unwrap().relative_path,
            record.relative_path
        );
    }

    #[tokio::test]
    async fn test_duplicate_discards_temp() {
        let fx = setup().await;
        let first = fx
            .store
            .finalize(fx.request(fx.temp_file("a", b"same"), "a.txt"))
            .await
            .unwrap();

        let temp = fx.temp_file("b", b"same");
        let second = fx.store.finalize(fx.request(temp.clone(), "b.bin")).await.unwrap();

        assert!(second.duplicate);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.name, "a.txt");
        assert!(!temp.exists());
        assert_eq!(fx.blob_count(), 1);
        assert_eq!(fx.repo.count_by_hash(&first.record.content_hash).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_no_state() {
        let fx = setup().await;
        let temp = fx.temp_file("a", b"actual bytes");
        let mut request = fx.request(temp.clone(), "a.txt");
        request.declared_hash = Some(compute_hash(b"other bytes"));

        let result = fx.store.finalize(request).await;

        assert!(matches!(result, Err(UploadError::ChecksumMismatch { .. })));
        assert!(!temp.exists());
        assert_eq!(fx.blob_count(), 0);
        assert!(fx
            .repo
            .find_by_hash(&compute_hash(b"actual bytes"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_declared_hash_is_case_insensitive() {
        let fx = setup().await;
        let mut request = fx.request(fx.temp_file("a", b"abc"), "a.txt");
        request.declared_hash = Some(compute_hash(b"abc").to_lowercase());

        let outcome = fx.store.finalize(request).await.unwrap();
        assert_eq!(outcome.record.content_hash, compute_hash(b"abc"));
    }

    #[tokio::test]
    async fn test_missing_blob_is_repaired() {
        let fx = setup().await;
        let first = fx
            .store
            .finalize(fx.request(fx.temp_file("a", b"precious"), "a.txt"))
            .await
            .unwrap()
            .record;

        let old_blob = fx.store.resolve(&first.relative_path).unwrap();
        std::fs::remove_file(&old_blob).unwrap();
        assert!(!fx.store.blob_exists(&first).await.unwrap());

        let healed = fx
            .store
            .finalize(fx.request(fx.temp_file("b", b"precious"), "b.txt"))
            .await
            .unwrap();

        assert!(healed.duplicate);
        assert_eq!(healed.record.id, first.id);
        assert_eq!(healed.record.content_hash, first.content_hash);
        assert!(fx.store.blob_exists(&healed.record).await.unwrap());

        let stored = fx.repo.find_by_id(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.relative_path, healed.record.relative_path);
        assert_eq!(
            std::fs::read(fx.store.resolve(&stored.relative_path).unwrap()).unwrap(),
            b"precious"
        );
        assert_eq!(fx.repo.count_by_hash(&first.content_hash).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_relative_path_override() {
        let fx = setup().await;
        let mut request = fx.request(fx.temp_file("a", b"pinned"), "a.txt");
        request.relative_path = Some("\\docs\\pinned.txt".to_string());

        let outcome = fx.store.finalize(request).await.unwrap();

        assert_eq!(outcome.record.relative_path, "docs/pinned.txt");
        assert_eq!(
            std::fs::read(fx.store.storage_root().join("docs").join("pinned.txt")).unwrap(),
            b"pinned"
        );
    }

    #[tokio::test]
    async fn test_override_path_taken_by_other_content() {
        let fx = setup().await;
        let mut first = fx.request(fx.temp_file("a", b"AAAA"), "x.txt");
        first.relative_path = Some("docs/x.txt".to_string());
        let first = fx.store.finalize(first).await.unwrap().record;

        let temp = fx.temp_file("b", b"BBBB");
        let mut second = fx.request(temp.clone(), "x.txt");
        second.relative_path = Some("docs/x.txt".to_string());
        let result = fx.store.finalize(second).await;

        assert!(matches!(result, Err(UploadError::Validation(_))));
        assert!(!temp.exists());
        assert_eq!(
            std::fs::read(fx.store.resolve(&first.relative_path).unwrap()).unwrap(),
            b"AAAA"
        );
        assert!(fx.repo.find_by_hash(&compute_hash(b"BBBB")).await.unwrap().is_none());
        assert_eq!(fx.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_override_path_of_record_with_missing_blob() {
        let fx = setup().await;
        let mut first = fx.request(fx.temp_file("a", b"AAAA"), "x.txt");
        first.relative_path = Some("docs/x.txt".to_string());
        let first = fx.store.finalize(first).await.unwrap().record;
        std::fs::remove_file(fx.store.resolve(&first.relative_path).unwrap()).unwrap();

        // Another record still points there, so other content may not take it
        let mut second = fx.request(fx.temp_file("b", b"BBBB"), "x.txt");
        second.relative_path = Some("docs/x.txt".to_string());
        assert!(matches!(
            fx.store.finalize(second).await,
            Err(UploadError::Validation(_))
        ));

        // The record's own content may restore it in place
        let mut again = fx.request(fx.temp_file("c", b"AAAA"), "x.txt");
        again.relative_path = Some("docs/x.txt".to_string());
        let healed = fx.store.finalize(again).await.unwrap();
        assert!(healed.duplicate);
        assert_eq!(healed.record.id, first.id);
        assert_eq!(
            std::fs::read(fx.store.resolve("docs/x.txt").unwrap()).unwrap(),
            b"AAAA"
        );
    }

    #[tokio::test]
    async fn test_override_path_occupied_by_unrecorded_file() {
        let fx = setup().await;
        let stray = fx.store.storage_root().join("docs").join("x.txt");
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, b"stray").unwrap();

        let mut request = fx.request(fx.temp_file("a", b"AAAA"), "x.txt");
        request.relative_path = Some("docs/x.txt".to_string());

        assert!(matches!(
            fx.store.finalize(request).await,
            Err(UploadError::Validation(_))
        ));
        assert_eq!(std::fs::read(&stray).unwrap(), b"stray");
        assert!(fx.repo.find_by_hash(&compute_hash(b"AAAA")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_escaping_override_rejected() {
        let fx = setup().await;
        let temp = fx.temp_file("a", b"x");
        let mut request = fx.request(temp.clone(), "a.txt");
        request.relative_path = Some("../outside.txt".to_string());

        let result = fx.store.finalize(request).await;

        assert!(matches!(result, Err(UploadError::Validation(_))));
        assert!(!temp.exists());
        assert_eq!(fx.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_identical_finalize_stores_one_blob() {
        let fx = setup().await;

        let requests: Vec<_> = (0..8)
            .map(|i| fx.request(fx.temp_file(&format!("t{}", i), b"racing content"), "r.txt"))
            .collect();

        let outcomes = futures::future::join_all(requests.into_iter().map(|request| {
            let store = fx.store.clone();
            async move { store.finalize(request).await }
        }))
        .await;

        let outcomes: Vec<_> = outcomes.into_iter().map(Result::unwrap).collect();
        let fresh = outcomes.iter().filter(|o| !o.duplicate).count();
        assert_eq!(fresh, 1);
        assert!(outcomes.iter().all(|o| o.record.id == outcomes[0].record.id));
        assert_eq!(fx.blob_count(), 1);
        assert_eq!(
            fx.repo.count_by_hash(&compute_hash(b"racing content")).await.unwrap(),
            1
        );
    }
}
