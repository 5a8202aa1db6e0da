//! Bounded-buffer file helpers shared by the upload components

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use uuid::Uuid;

/// Hidden sibling path used to stage a write before renaming it into place
pub(crate) fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Stream `reader` into a newly created `dest`, never holding more than
/// `buffer_size` bytes in memory. Returns the number of bytes written.
pub(crate) async fn copy_to_file<R>(reader: R, dest: &Path, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    copy_into(reader, File::create(dest).await?, buffer_size).await
}

async fn copy_into<R>(reader: R, file: File, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut writer = BufWriter::with_capacity(buffer_size, file);
    let mut reader = BufReader::with_capacity(buffer_size, reader);

    let written = tokio::io::copy_buf(&mut reader, &mut writer).await?;
    writer.flush().await?;

    Ok(written)
}

/// Move `src` to `dest`, creating parent directories. Falls back to a staged
/// copy when a plain rename is not possible (e.g. across filesystems).
pub(crate) async fn move_file(src: &Path, dest: &Path, buffer_size: usize) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(e),
        Err(e) => {
            tracing::debug!(
                src = %src.display(),
                dest = %dest.display(),
                error = %e,
                "Rename failed, falling back to copy"
            );

            let staging = staging_path(dest);
            let source = File::open(src).await?;
            if let Err(e) = copy_to_file(source, &staging, buffer_size).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
            if let Err(e) = tokio::fs::rename(&staging, dest).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
            tokio::fs::remove_file(src).await
        }
    }
}

/// Move `src` to `dest` only if `dest` does not exist yet. Fails with
/// `AlreadyExists` when it does, leaving both files untouched.
pub(crate) async fn place_file(src: &Path, dest: &Path, buffer_size: usize) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // A hard link claims the name atomically and never replaces an existing file
    match tokio::fs::hard_link(src, dest).await {
        Ok(()) => {
            discard(src).await;
            return Ok(());
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::AlreadyExists | io::ErrorKind::NotFound) => {
            return Err(e)
        }
        Err(e) => {
            tracing::debug!(
                src = %src.display(),
                dest = %dest.display(),
                error = %e,
                "Hard link failed, falling back to exclusive copy"
            );
        }
    }

    let source = File::open(src).await?;
    let target = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await?;
    if let Err(e) = copy_into(source, target, buffer_size).await {
        discard(dest).await;
        return Err(e);
    }
    discard(src).await;
    Ok(())
}

/// Remove a file, treating "already gone" as success. Returns whether a file was removed.
pub(crate) async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Best-effort removal of a temporary file; failures are only logged
pub(crate) async fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to discard temporary file");
    }
}

/// Whether `path` is an existing regular file
pub(crate) async fn is_file(path: &Path) -> io::Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
