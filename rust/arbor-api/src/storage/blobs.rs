//! Filesystem-backed blob store.
//!
//! The ingestion pipeline consumes the [`BlobStore`] contract; this is
//! the default implementation, mapping keys to files under a data
//! directory. Production deployments substitute an object-store client
//! behind the same trait.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::llm::BlobStore;

/// Blob store reading from a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        // Keys must stay inside the root.
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            anyhow::bail!("invalid blob key: {key}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(key)?;
        let bytes = tokio::fs::read(&path).await?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_blob_under_root() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("doc.txt"), b"hello")
            .await
            .unwrap();

        let store = FsBlobStore::new(dir.path());
        let bytes = store.get("doc.txt").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
