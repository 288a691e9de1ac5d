use crate::util::digest::{compute_digest, Digest};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Per-requester file store. Every access key gets a directory under the
/// configured root; uploads land there and submissions reference them by
/// bare filename.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reject anything that could escape its directory.
    pub fn sanitize(name: &str) -> Result<&str> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            anyhow::bail!("invalid file name: {:?}", name);
        }
        Ok(name)
    }

    fn key_dir(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(Self::sanitize(key)?))
    }

    /// Ensure the requester's directory exists and return the manifest of
    /// known files and their digests.
    pub async fn open(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let dir = self.key_dir(key)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let mut manifest = BTreeMap::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let data = fs::read(entry.path()).await?;
            manifest.insert(name, compute_digest(&data).hash);
        }

        Ok(manifest)
    }

    pub async fn upload(&self, key: &str, filename: &str, bytes: &[u8]) -> Result<Digest> {
        let dir = self.key_dir(key)?;
        fs::create_dir_all(&dir).await?;
        let path = dir.join(Self::sanitize(filename)?);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!(key, filename, bytes = bytes.len(), "file uploaded");
        Ok(compute_digest(bytes))
    }

    /// Absolute path of a previously uploaded file.
    pub fn resolve(&self, key: &str, filename: &str) -> Result<PathBuf> {
        Ok(self.key_dir(key)?.join(Self::sanitize(filename)?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
