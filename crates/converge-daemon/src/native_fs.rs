//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use converge_core::clock::Millis;
use converge_core::entity::FileData;
use converge_core::filter::{PathFilter, validate_sync_path};
use converge_core::fs::{FileTimes, FsError, LocalFs, LocalNode, Result};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::trace;

/// Native filesystem rooted at a vault directory.
pub struct NativeFs {
    base_path: PathBuf,
    filter: PathFilter,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self::with_filter(base_path, PathFilter::new())
    }

    pub fn with_filter(base_path: PathBuf, filter: PathFilter) -> Self {
        Self { base_path, filter }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn filter(&self) -> &PathFilter {
        &self.filter
    }

    /// Absolute path for a vault-relative one; refuses anything that would
    /// resolve outside `base_path`.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        validate_sync_path(path).map_err(|_| FsError::OutsideVault(path.to_string()))?;
        let relative = Path::new(path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(FsError::OutsideVault(path.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    /// Vault-relative path with `/` separators, if `full` lies inside the vault.
    pub fn relative_path(&self, full: &Path) -> Option<String> {
        let relative = full.strip_prefix(&self.base_path).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

fn map_io(path: &str, err: std::io::Error) -> FsError {
    match err.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{path}: {err}")),
    }
}

pub(crate) fn to_millis(time: SystemTime) -> Millis {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl LocalFs for NativeFs {
    async fn stat_path(&self, path: &str) -> Result<LocalNode> {
        if self.filter.is_excluded(path) {
            return Ok(LocalNode::Excluded);
        }
        let full_path = self.full_path(path)?;
        let metadata = match fs::metadata(&full_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LocalNode::Missing),
            Err(e) => return Err(map_io(path, e)),
        };
        if !metadata.is_file() {
            return Ok(LocalNode::Excluded);
        }

        let content = match fs::read(&full_path).await {
            Ok(content) => content,
            // Deleted between the stat and the read.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LocalNode::Missing),
            Err(e) => return Err(map_io(path, e)),
        };
        let modified_at = metadata.modified().map(to_millis).unwrap_or(0);
        let created_at = metadata.created().map(to_millis).unwrap_or(modified_at);

        Ok(LocalNode::Present(FileData::from_content(
            path,
            &content,
            created_at,
            modified_at,
        )))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path)?)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn write(&self, path: &str, content: &[u8], times: FileTimes) -> Result<()> {
        let full_path = self.full_path(path)?;

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_io(path, e))?;

        let modified = UNIX_EPOCH + Duration::from_millis(times.modified_at);
        let target = full_path.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&target)?
                .set_modified(modified)
        })
        .await
        .map_err(|e| FsError::Io(format!("{path}: {e}")))?
        .map_err(|e| map_io(path, e))?;

        trace!("wrote {} ({} bytes)", path, content.len());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(path, e))?;
        if metadata.is_dir() {
            return Err(FsError::IsDirectory(path.to_string()));
        }
        fs::remove_file(&full_path)
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| FsError::Io(format!("{}: {e}", dir.display())))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| FsError::Io(format!("{}: {e}", dir.display())))?
            {
                let full = entry.path();
                let Some(relative) = self.relative_path(&full) else {
                    continue;
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| map_io(&relative, e))?;

                if file_type.is_dir() {
                    // Hidden directories, `.sync` included, are never descended.
                    if !relative.split('/').any(|s| s.starts_with('.')) {
                        pending.push(full);
                    }
                } else if file_type.is_file() && !self.filter.is_excluded(&relative) {
                    files.push(relative);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}
