//! Local filesystem backend rooted at an absolute directory.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

use crate::fs::backend::{ByteStream, FileRecord, StorageBackend, WriteMetadata};

/// Storage backend addressing a local directory tree.
///
/// All relative paths are resolved against `root`. Symlinks are followed:
/// a link to a file is scanned as that file, a broken link is skipped with a
/// warning. The choice is deterministic within a run.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a forward-slash relative path against the root, rejecting
    /// traversal outside the tree.
    fn full_path(&self, relative: &str) -> Result<PathBuf> {
        let mut full = self.root.clone();
        for part in relative.split('/') {
            match part {
                "" | "." => {}
                ".." => bail!("path escapes sync root: {}", relative),
                _ => full.push(part),
            }
        }
        Ok(full)
    }

    fn to_relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        parts.join("/")
    }

    fn record_for(&self, path: &Path, meta: &std::fs::Metadata) -> FileRecord {
        FileRecord {
            relative_path: self.to_relative(path),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok().map(system_time_to_utc),
            is_dir: meta.is_dir(),
            permissions: permission_bits(meta),
            hash: None,
        }
    }

    fn walk(&self, dir: &Path, out: &mut Vec<FileRecord>) -> Result<()> {
        let read_dir = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read directory {}", dir.display()))?;

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();
            // std::fs::metadata follows symlinks; a dangling link is skipped.
            let meta = match std::fs::metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };

            out.push(self.record_for(&path, &meta));
            if meta.is_dir() {
                self.walk(&path, out)?;
            }
        }
        Ok(())
    }
}

fn system_time_to_utc(t: std::time::SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn list(&self, prefix: &str) -> Result<Vec<FileRecord>> {
        let start = self.full_path(prefix)?;
        let root = self.root.clone();
        let this = LocalBackend { root };

        let mut records = tokio::task::spawn_blocking(move || -> Result<Vec<FileRecord>> {
            let mut out = Vec::new();
            if start.exists() {
                this.walk(&start, &mut out)?;
            }
            Ok(out)
        })
        .await
        .context("scan task panicked")??;

        records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(records)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileRecord>> {
        let full = self.full_path(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(Some(self.record_for(&full, &meta))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to stat {}", full.display()))
            }
        }
    }

    async fn read(&self, path: &str) -> Result<ByteStream> {
        let full = self.full_path(path)?;
        let file = tokio::fs::File::open(&full)
            .await
            .with_context(|| format!("failed to open {}", full.display()))?;
        Ok(Box::new(file))
    }

    async fn write(
        &self,
        path: &str,
        mut data: ByteStream,
        expected_size: u64,
        meta: &WriteMetadata,
    ) -> Result<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let mut file = tokio::fs::File::create(&full)
            .await
            .with_context(|| format!("failed to create {}", full.display()))?;
        let written = tokio::io::copy(&mut data, &mut file)
            .await
            .with_context(|| format!("failed to write {}", full.display()))?;
        file.sync_all().await.ok();
        drop(file);

        if written != expected_size {
            bail!(
                "short write for {}: expected {} bytes, wrote {}",
                path,
                expected_size,
                written
            );
        }

        #[cfg(unix)]
        if let Some(mode) = meta.permissions {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))
                .with_context(|| format!("failed to set permissions on {}", full.display()))?;
        }

        if let Some(modified) = meta.modified {
            let mtime = filetime::FileTime::from_unix_time(
                modified.timestamp(),
                modified.timestamp_subsec_nanos(),
            );
            filetime::set_file_mtime(&full, mtime)
                .with_context(|| format!("failed to set mtime on {}", full.display()))?;
        }

        Ok(())
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .with_context(|| format!("failed to create directory {}", full.display()))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .with_context(|| format!("failed to stat {}", full.display()))?;
        if meta.is_dir() {
            // Non-recursive on purpose: non-empty failure is caller policy.
            tokio::fs::remove_dir(&full)
                .await
                .with_context(|| format!("failed to delete directory {}", full.display()))?;
        } else {
            tokio::fs::remove_file(&full)
                .await
                .with_context(|| format!("failed to delete {}", full.display()))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_rejects_traversal() {
        let backend = LocalBackend::new("/tmp/sync-root");
        assert!(backend.full_path("a/../../etc/passwd").is_err());
        assert_eq!(
            backend.full_path("a/b.txt").unwrap(),
            PathBuf::from("/tmp/sync-root/a/b.txt")
        );
    }

    #[test]
    fn to_relative_uses_forward_slashes() {
        let backend = LocalBackend::new("/tmp/sync-root");
        let rel = backend.to_relative(Path::new("/tmp/sync-root/dir/file.txt"));
        assert_eq!(rel, "dir/file.txt");
    }
}
