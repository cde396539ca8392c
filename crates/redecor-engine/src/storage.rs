use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Binary blob storage addressed by URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn store(&self, bytes: &[u8], content_type: &str) -> Result<String>;
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Content-addressed store on the local filesystem. Objects are named by the
/// SHA-256 of their bytes, so storing the same bytes twice yields one file.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, digest: &str, content_type: &str) -> PathBuf {
        self.root
            .join(&digest[..2])
            .join(format!("{digest}.{}", extension_for(content_type)))
    }

    fn path_from_url(&self, url: &str) -> Result<PathBuf> {
        let Some(raw) = url.strip_prefix("file://") else {
            bail!("unsupported object url: {url}");
        };
        let path = PathBuf::from(raw);
        let escapes = path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            bail!("object url {url} is outside {}", self.root.display());
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FileStore {
    async fn store(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        let digest = hex::encode(Sha256::digest(bytes));
        let path = self.object_path(&digest, content_type);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, bytes)
                .await
                .with_context(|| format!("failed writing {}", path.display()))?;
        }
        Ok(format!("file://{}", path.display()))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let path = self.path_from_url(url)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed reading {}", path.display()))
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.trim().to_ascii_lowercase().as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "application/json" => "json",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::{FileStore, ObjectStore};

    #[tokio::test]
    async fn store_then_fetch_by_url() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FileStore::new(temp.path().join("objects"));

        let url = store.store(b"png bytes", "image/png").await?;
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(".png"));
        assert_eq!(store.fetch(&url).await?, b"png bytes".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn identical_bytes_share_an_address() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FileStore::new(temp.path());
        let first = store.store(b"same", "image/png").await?;
        let second = store.store(b"same", "image/png").await?;
        let other = store.store(b"different", "image/png").await?;
        assert_eq!(first, second);
        assert_ne!(first, other);
        Ok(())
    }

    #[tokio::test]
    async fn foreign_urls_are_refused() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FileStore::new(temp.path().join("objects"));
        assert!(store.fetch("https://example.com/a.png").await.is_err());
        assert!(store.fetch("file:///etc/passwd").await.is_err());
        Ok(())
    }
}
