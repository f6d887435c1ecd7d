//! A directory on the local filesystem, used as an `ObjectStore` backend.
//! Stands in for a bucket/blob endpoint in deployments that don't need one —
//! most of the test suite, and any single-machine backup target.

use super::{ObjectMeta, ObjectStore};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::PathBuf;

pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(LocalFsStore { root })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(anyhow::anyhow!("invalid object name: {name}").into());
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(name)?;
        let tmp = path.with_extension("tmp-upload");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::BackendPermanent(format!("{name} not found"))
            } else {
                CoreError::BackendTransient(e.to_string())
            }
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::BackendTransient(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| CoreError::BackendTransient(e.to_string()))?;
        while let Some(entry) = rd.next_entry().await.map_err(|e| CoreError::BackendTransient(e.to_string()))? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(".tmp-upload") {
                continue;
            }
            let meta = entry.metadata().await.map_err(|e| CoreError::BackendTransient(e.to_string()))?;
            if meta.is_file() {
                out.push(ObjectMeta { name: file_name, size: meta.len() });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path()).unwrap();

        store.put("v1", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("v1").await.unwrap(), b"hello");

        let listing = store.list().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "v1");

        store.delete("v1").await.unwrap();
        assert!(store.get("v1").await.is_err());
    }

    #[tokio::test]
    async fn delete_missing_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path()).unwrap();
        store.delete("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path()).unwrap();
        assert!(store.put("../escape", b"x".to_vec()).await.is_err());
    }
}
