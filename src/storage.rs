//! Local disk storage rooted at a directory.
//!
//! Callers address files by paths relative to the root; absolute paths never
//! leak into persisted records.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use tracing::debug;

use crate::util::move_file;

#[derive(Debug, Clone)]
pub struct Disk {
    root: PathBuf,
}

impl Disk {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a relative path under the root, dropping any component that
    /// would escape it
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        let mut path = self.root.clone();
        for component in rel.as_ref().components() {
            if let Component::Normal(part) = component {
                path.push(part);
            }
        }
        path
    }

    pub async fn exists(&self, rel: impl AsRef<Path>) -> bool {
        tokio::fs::try_exists(self.path(rel)).await.unwrap_or(false)
    }

    pub async fn make_directory(&self, rel: impl AsRef<Path>) -> io::Result<PathBuf> {
        let path = self.path(rel);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    pub async fn put(&self, rel: impl AsRef<Path>, contents: &[u8]) -> io::Result<PathBuf> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        debug!(path = ?path, bytes = contents.len(), "Stored file");
        Ok(path)
    }

    /// Moves an outside file into the storage, replacing whatever was there
    pub async fn move_into(&self, src: &Path, rel: impl AsRef<Path>) -> io::Result<PathBuf> {
        let dest = self.path(rel);
        if src != dest {
            move_file(src, &dest).await?;
        }
        Ok(dest)
    }

    pub async fn delete_directory(&self, rel: impl AsRef<Path>) -> io::Result<()> {
        let path = self.path(rel);
        match tokio::fs::remove_dir_all(&path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
