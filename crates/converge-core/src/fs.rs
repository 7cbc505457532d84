//! LocalFs trait: the host's view of the vault on disk.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in converge-daemon) - Uses tokio::fs

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

use crate::clock::Millis;
use crate::entity::FileData;
use crate::filter::PathFilter;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Path outside the vault: {0}")]
    OutsideVault(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// What a path looks like on disk right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalNode {
    Present(FileData),
    Missing,
    /// The path exists or could exist, but policy keeps it out of sync.
    Excluded,
}

/// Timestamps to apply when materializing a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub created_at: Millis,
    pub modified_at: Millis,
}

/// Platform-independent access to the local vault.
///
/// Paths are relative to the vault root and use `/` separators.
#[async_trait]
pub trait LocalFs: Send + Sync {
    /// Describe the current state of `path`, hashing its content if present.
    async fn stat_path(&self, path: &str) -> Result<LocalNode>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8], times: FileTimes) -> Result<()>;

    /// Delete a file. Deleting a missing file is `NotFound`.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Every non-excluded file in the vault.
    async fn list_files(&self) -> Result<Vec<String>>;
}

struct StoredFile {
    content: Vec<u8>,
    times: FileTimes,
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, StoredFile>>,
    filter: PathFilter,
    /// Paths whose read/write/delete fail with an IO error
    failing: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::with_filter(PathFilter::new())
    }

    pub fn with_filter(filter: PathFilter) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            filter,
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Place a file directly, as if the user had saved it at `modified_at`.
    pub fn put(&self, path: &str, content: &[u8], modified_at: Millis) {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        let created_at = files
            .get(&path)
            .map(|f| f.times.created_at)
            .unwrap_or(modified_at);
        files.insert(
            path,
            StoredFile {
                content: content.to_vec(),
                times: FileTimes {
                    created_at,
                    modified_at,
                },
            },
        );
    }

    /// Remove a file directly, as if the user had deleted it.
    pub fn remove(&self, path: &str) {
        let path = Self::normalize_path(path);
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&path);
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        let path = Self::normalize_path(path);
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
            .map(|f| f.content.clone())
    }

    pub fn times(&self, path: &str) -> Option<FileTimes> {
        let path = Self::normalize_path(path);
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
            .map(|f| f.times)
    }

    /// Make every operation on `path` fail, to exercise partial failure.
    pub fn fail_path(&self, path: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(Self::normalize_path(path));
    }

    fn check_failing(&self, path: &str) -> Result<()> {
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
        {
            return Err(FsError::Io(format!("injected failure for {path}")));
        }
        Ok(())
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalFs for InMemoryFs {
    async fn stat_path(&self, path: &str) -> Result<LocalNode> {
        let path = Self::normalize_path(path);
        if self.filter.is_excluded(&path) {
            return Ok(LocalNode::Excluded);
        }
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        Ok(match files.get(&path) {
            Some(file) => LocalNode::Present(FileData::from_content(
                &path,
                &file.content,
                file.times.created_at,
                file.times.modified_at,
            )),
            None => LocalNode::Missing,
        })
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        self.check_failing(&path)?;
        self.contents(&path).ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8], times: FileTimes) -> Result<()> {
        let path = Self::normalize_path(path);
        self.check_failing(&path)?;
        self.files.write().unwrap_or_else(|e| e.into_inner()).insert(
            path,
            StoredFile {
                content: content.to_vec(),
                times,
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        self.check_failing(&path)?;
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        match files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = files
            .keys()
            .filter(|p| !self.filter.is_excluded(p))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }
}

// Implement LocalFs for Arc<T> where T: LocalFs
// This allows tests to keep a handle on the filesystem the engine drives
#[async_trait]
impl<T: LocalFs + ?Sized> LocalFs for std::sync::Arc<T> {
    async fn stat_path(&self, path: &str) -> Result<LocalNode> {
        (**self).stat_path(path).await
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8], times: FileTimes) -> Result<()> {
        (**self).write(path, content, times).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        (**self).list_files().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();
        let times = FileTimes {
            created_at: 1,
            modified_at: 2,
        };

        fs.write("test.txt", b"hello world", times).await.unwrap();
        assert_eq!(fs.read("test.txt").await.unwrap(), b"hello world");
        assert_eq!(fs.times("test.txt"), Some(times));

        fs.delete("test.txt").await.unwrap();
        assert!(matches!(fs.read("test.txt").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.delete("test.txt").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stat_path_variants() {
        let fs = InMemoryFs::new();
        fs.put("notes/a.md", b"alpha", 10);
        fs.put(".obsidian/app.json", b"{}", 10);

        match fs.stat_path("notes/a.md").await.unwrap() {
            LocalNode::Present(data) => {
                assert_eq!(data.full_path, "notes/a.md");
                assert_eq!(data.size, 5);
                assert_eq!(data.modified_at, 10);
            }
            other => panic!("expected present file, got {other:?}"),
        }
        assert_eq!(fs.stat_path("notes/b.md").await.unwrap(), LocalNode::Missing);
        assert_eq!(
            fs.stat_path(".obsidian/app.json").await.unwrap(),
            LocalNode::Excluded
        );
    }

    #[tokio::test]
    async fn test_list_files_skips_excluded() {
        let fs = InMemoryFs::new();
        fs.put("b.md", b"b", 1);
        fs.put("a/c.md", b"c", 1);
        fs.put(".sync/state.json", b"{}", 1);

        assert_eq!(fs.list_files().await.unwrap(), vec!["a/c.md", "b.md"]);
    }

    #[tokio::test]
    async fn test_put_keeps_creation_time() {
        let fs = InMemoryFs::new();
        fs.put("a.md", b"one", 5);
        fs.put("a.md", b"two", 9);
        assert_eq!(
            fs.times("a.md"),
            Some(FileTimes {
                created_at: 5,
                modified_at: 9
            })
        );
    }

    #[tokio::test]
    async fn test_failing_path() {
        let fs = InMemoryFs::new();
        fs.put("a.md", b"one", 5);
        fs.fail_path("a.md");
        assert!(matches!(fs.read("a.md").await, Err(FsError::Io(_))));
    }
}
