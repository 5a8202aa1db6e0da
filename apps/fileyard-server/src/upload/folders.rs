//! Directory listing over the storage root

use std::path::{Path, PathBuf};

use super::content_store::normalize_relative_path;
use super::types::{UploadError, UploadFolder};

/// All directories under `root`, depth-first in name order.
/// Ids start at 1 for each call; top-level folders have level 1 and no parent.
pub async fn list_folders(root: &Path) -> Result<Vec<UploadFolder>, UploadError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<UploadFolder>, UploadError> {
        let mut folders = Vec::new();
        if root.is_dir() {
            walk(&root, "", 1, None, &mut folders)?;
        }
        Ok(folders)
    })
    .await
    .map_err(|e| UploadError::Io(std::io::Error::other(e)))?
}

/// Names of the regular files directly inside `folder`, sorted
pub async fn list_folder_files(root: &Path, folder: &str) -> Result<Vec<String>, UploadError> {
    let relative = normalize_relative_path(folder)?;
    let dir = relative
        .split('/')
        .fold(root.to_path_buf(), |path, segment| path.join(segment));

    tokio::task::spawn_blocking(move || -> Result<Vec<String>, UploadError> {
        if !dir.is_dir() {
            return Err(UploadError::NotFound(format!("folder {}", relative)));
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    })
    .await
    .map_err(|e| UploadError::Io(std::io::Error::other(e)))?
}

fn walk(
    dir: &Path,
    prefix: &str,
    level: usize,
    parent_id: Option<usize>,
    out: &mut Vec<UploadFolder>,
) -> std::io::Result<()> {
    let mut children: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            children.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, path) in children {
        let full_name = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };
        let id = out.len() + 1;
        out.push(UploadFolder {
            id,
            name,
            full_name: full_name.clone(),
            level,
            parent_id,
        });
        walk(&path, &full_name, level + 1, Some(id), out)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("202401").join("0112")).unwrap();
        std::fs::create_dir_all(root.join("202401").join("0209")).unwrap();
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("202401").join("0112").join("b.txt"), b"b").unwrap();
        std::fs::write(root.join("202401").join("0112").join("a.txt"), b"a").unwrap();
        std::fs::write(root.join("top.txt"), b"t").unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_list_folders_depth_first() {
        let tmp = tree();
        let folders = list_folders(tmp.path()).await.unwrap();

        let summary: Vec<_> = folders
            .iter()
            .map(|f| (f.id, f.full_name.as_str(), f.level, f.parent_id))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "202401", 1, None),
                (2, "202401/0112", 2, Some(1)),
                (3, "202401/0209", 2, Some(1)),
                (4, "docs", 1, None),
            ]
        );
        assert_eq!(folders[1].name, "0112");
    }

    #[tokio::test]
    async fn test_list_folders_missing_root() {
        let tmp = TempDir::new().unwrap();
        assert!(list_folders(&tmp.path().join("absent")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_folder_files() {
        let tmp = tree();

        let files = list_folder_files(tmp.path(), "202401/0112").await.unwrap();
        assert_eq!(files, vec!["a.txt".to_string(), "b.txt".to_string()]);

        assert!(list_folder_files(tmp.path(), "202401").await.unwrap().is_empty());
        assert!(matches!(
            list_folder_files(tmp.path(), "nope").await,
            Err(UploadError::NotFound(_))
        ));
        assert!(matches!(
            list_folder_files(tmp.path(), "../..").await,
            Err(UploadError::Validation(_))
        ));
    }
}
