#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::{RagError, Result};

/// Byte-level key/value persistence keyed by relative paths.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// `Ok(None)` when nothing has been written at `path` yet
    async fn read_resource(&self, path: &str) -> Result<Option<Vec<u8>>>;

    async fn write_resource(&self, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Resources stored as files under a root directory
#[derive(Debug, Clone)]
pub struct FileResourceStore {
    root: PathBuf,
}

impl FileResourceStore {
    #[inline]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a resource path to a file under the root, refusing anything that
    /// would escape it
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });

        if path.trim().is_empty() || escapes {
            return Err(RagError::Storage(format!(
                "Invalid resource path: {:?}",
                path
            )));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ResourceStore for FileResourceStore {
    #[inline]
    async fn read_resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file = self.resolve(path)?;

        match tokio::fs::read(&file).await {
            Ok(bytes) => {
                debug!("Read {} bytes from {}", bytes.len(), file.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Resource {} does not exist", file.display());
                Ok(None)
            }
            Err(e) => Err(RagError::Storage(format!(
                "Failed to read {}: {}",
                file.display(),
                e
            ))),
        }
    }

    #[inline]
    async fn write_resource(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let file = self.resolve(path)?;

        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RagError::Storage(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut tmp_name = file.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = file.with_file_name(tmp_name);

        tokio::fs::write(&tmp, bytes).await.map_err(|e| {
            RagError::Storage(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &file).await.map_err(|e| {
            RagError::Storage(format!(
                "Failed to move {} into place: {}",
                file.display(),
                e
            ))
        })?;

        debug!("Wrote {} bytes to {}", bytes.len(), file.display());
        Ok(())
    }
}

/// Process-local resources, lost when dropped
#[derive(Debug, Default)]
pub struct MemoryResourceStore {
    resources: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryResourceStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    #[inline]
    async fn read_resource(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let resources = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(resources.get(path).cloned())
    }

    #[inline]
    async fn write_resource(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let mut resources = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        resources.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}
