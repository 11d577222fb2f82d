use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{StorageBackend, StorageError, validate_identifier};

const RECORD_EXTENSION: &str = "json";

/// One JSON file per record: `<data_dir>/<category>/<identifier>.json`.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn category_dir(&self, category: &str) -> Result<PathBuf, StorageError> {
        validate_identifier(category)?;
        Ok(self.data_dir.join(category))
    }

    fn record_path(&self, category: &str, identifier: &str) -> Result<PathBuf, StorageError> {
        validate_identifier(identifier)?;
        Ok(self
            .category_dir(category)?
            .join(format!("{}.{}", identifier, RECORD_EXTENSION)))
    }
}

#[async_trait]
impl StorageBackend for FileStore {
    async fn store(
        &self,
        category: &str,
        identifier: &str,
        blob: String,
    ) -> Result<(), StorageError> {
        let path = self.record_path(category, identifier)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a crash mid-write never leaves a torn record
        let tmp_path = path.with_extension(format!("{}.tmp", RECORD_EXTENSION));
        tokio::fs::write(&tmp_path, blob).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!("Stored {}/{}", category, identifier);
        Ok(())
    }

    async fn load(&self, category: &str, identifier: &str) -> Result<Option<String>, StorageError> {
        let path = self.record_path(category, identifier)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, category: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.category_dir(category)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut identifiers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                identifiers.push(stem.to_string());
            }
        }
        identifiers.sort();
        Ok(identifiers)
    }

    async fn delete(&self, category: &str, identifier: &str) -> Result<(), StorageError> {
        let path = self.record_path(category, identifier)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted {}/{}", category, identifier);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_list_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let files = FileStore::new(tmp.path());

        files.store("InstanceConfig", "b", "{}".into()).await.unwrap();
        files.store("InstanceConfig", "a", "{}".into()).await.unwrap();
        // Stray files in the category directory are not records
        std::fs::write(tmp.path().join("InstanceConfig/notes.txt"), "x").unwrap();

        assert_eq!(files.list("InstanceConfig").await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            files.load("InstanceConfig", "a").await.unwrap().as_deref(),
            Some("{}")
        );

        files.delete("InstanceConfig", "a").await.unwrap();
        assert_eq!(files.list("InstanceConfig").await.unwrap(), vec!["b"]);
        // Deleting twice is fine
        files.delete("InstanceConfig", "a").await.unwrap();
    }

    #[tokio::test]
    async fn missing_category_lists_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let files = FileStore::new(tmp.path());
        assert!(files.list("Nothing").await.unwrap().is_empty());
        assert!(files.load("Nothing", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overwrite_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let files = FileStore::new(tmp.path());
        files.store("C", "id", "1".into()).await.unwrap();
        files.store("C", "id", "2".into()).await.unwrap();

        assert_eq!(files.load("C", "id").await.unwrap().as_deref(), Some("2"));
        let names: Vec<_> = std::fs::read_dir(tmp.path().join("C"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["id.json"]);
    }

    #[tokio::test]
    async fn irregular_identifiers_touch_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("store");
        let files = FileStore::new(&root);

        for bad in ["../evil", "a/b", "a\\b"] {
            assert!(matches!(
                files.store("InstanceConfig", bad, "{}".into()).await,
                Err(StorageError::IrregularIdentifier(_))
            ));
            assert!(matches!(
                files.load("InstanceConfig", bad).await,
                Err(StorageError::IrregularIdentifier(_))
            ));
            assert!(matches!(
                files.delete("InstanceConfig", bad).await,
                Err(StorageError::IrregularIdentifier(_))
            ));
        }
        assert!(matches!(
            files.list("../etc").await,
            Err(StorageError::IrregularIdentifier(_))
        ));
        assert!(!root.exists());
    }
}
