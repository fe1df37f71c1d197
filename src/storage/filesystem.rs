use super::{ObjectStore, StoredObject};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;

/// A directory used as an object store: a mounted volume for remote
/// destinations, or the local backup directory for retention.
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(base: &Path, path_prefix: &str) -> Self {
        let prefix = path_prefix.trim_matches('/');
        let root = if prefix.is_empty() {
            base.to_path_buf()
        } else {
            base.join(prefix)
        };
        Self { root }
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(BackupError::Storage(format!("invalid object name '{}'", name)));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ObjectStore for FilesystemStore {
    fn id(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    async fn put(&self, name: &str, source: &Path) -> Result<()> {
        let dest = self.path_of(name)?;
        fs::create_dir_all(&self.root).await?;

        let mut tmp_name = OsString::from(dest.as_os_str());
        tmp_name.push(".uploading");
        let tmp = PathBuf::from(tmp_name);

        if let Err(e) = fs::copy(source, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(BackupError::Storage(format!(
                "copy to {} failed: {}",
                dest.display(),
                e
            )));
        }
        fs::File::open(&tmp).await?.sync_all().await?;
        fs::rename(&tmp, &dest).await?;
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path_of(name)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            objects.push(StoredObject {
                name,
                size: meta.len(),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path_of(name)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_stat_list_delete() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("src.backup");
        std::fs::write(&source, b"0123456789").unwrap();

        let store = FilesystemStore::new(&dir.path().join("remote"), "prod/");
        store.put("backup_appdb_1.backup", &source).await.unwrap();
        store.put("other.txt", &source).await.unwrap();

        assert_eq!(store.stat("backup_appdb_1.backup").await.unwrap(), Some(10));
        assert_eq!(store.stat("missing").await.unwrap(), None);

        let listed = store.list("backup_").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "backup_appdb_1.backup");
        assert!(listed[0].last_modified.is_some());
        assert!(dir.path().join("remote/prod/backup_appdb_1.backup").exists());

        store.delete("backup_appdb_1.backup").await.unwrap();
        store.delete("backup_appdb_1.backup").await.unwrap();
        assert!(store.list("backup_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(dir.path(), "");
        assert!(store.delete("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_list_of_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let store = FilesystemStore::new(&dir.path().join("nope"), "");
        assert!(store.list("").await.unwrap().is_empty());
    }
}
