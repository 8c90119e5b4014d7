use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob '{0}' not found")]
    NotFound(String),
    #[error("invalid blob name '{0}'")]
    InvalidName(String),
    #[error("blob storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// The upload container.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, name: &str, body: &[u8]) -> Result<(), BlobError>;
    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError>;
}

/// A container backed by a local directory.
pub struct FsContainer {
    root: PathBuf,
    container: String,
}

impl FsContainer {
    pub fn new(root: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            root: root.into(),
            container: container.to_string(),
        }
    }

    /// Map an object name (optionally prefixed with `<container>/`) to a file
    /// inside the root. Names that escape the root are rejected.
    fn path_of(&self, name: &str) -> Result<PathBuf, BlobError> {
        let prefix = format!("{}/", self.container);
        let relative = name.strip_prefix(&prefix).unwrap_or(name);
        let rel = Path::new(relative);
        let clean = !relative.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(BlobError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsContainer {
    async fn put(&self, name: &str, body: &[u8]) -> Result<(), BlobError> {
        let path = self.path_of(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        info!(name = %name, bytes = body.len(), "Blob stored");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_of(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_with_container_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContainer::new(dir.path(), "fileuploads");

        store.put("INV-1.pdf", b"%PDF-1.7").await.unwrap();

        assert_eq!(store.get("fileuploads/INV-1.pdf").await.unwrap(), b"%PDF-1.7");
        assert_eq!(store.get("INV-1.pdf").await.unwrap(), b"%PDF-1.7");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContainer::new(dir.path(), "fileuploads");
        assert!(matches!(
            store.get("nope.pdf").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn names_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContainer::new(dir.path(), "fileuploads");
        for bad in ["../etc/passwd", "/abs.pdf", "", "a/../../b.pdf"] {
            assert!(
                matches!(store.get(bad).await, Err(BlobError::InvalidName(_))),
                "{bad} should be rejected"
            );
        }
    }
}
