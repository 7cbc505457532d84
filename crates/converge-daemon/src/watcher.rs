//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection. Each event
//! carries the time the change was observed: the file's mtime for writes and
//! the wall clock for deletions.

use anyhow::Result;
use converge_core::clock::{Clock, Millis, SystemClock};
use converge_core::filter::PathFilter;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::native_fs::to_millis;

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to vault root
    pub path: String,
    pub kind: FileEventKind,
    /// When the change happened, as far as the host can tell.
    pub observed_at: Millis,
}

/// Type of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    /// File was deleted
    Deleted,
}

/// File watcher that monitors the vault directory.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Track last seen mtime to filter spurious events (Docker volume bug workaround)
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

impl FileWatcher {
    /// Create a new file watcher for the vault.
    ///
    /// Uses 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new(vault_path: PathBuf, filter: PathFilter) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let vault_path_clone = vault_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        let Some(file_event) =
                            Self::process_event(&event.path, &vault_path_clone, &filter, &mtime_cache)
                        else {
                            continue;
                        };
                        if event_tx.send(file_event).is_err() {
                            // Receiver dropped
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn a raw changed path into a `FileEvent`, if it is one we sync.
    fn process_event(
        path: &Path,
        vault_path: &Path,
        filter: &PathFilter,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let relative = path.strip_prefix(vault_path).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        let relative = parts?.join("/");

        if filter.is_excluded(&relative) {
            return None;
        }

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let event = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => return None,
            Ok(metadata) => {
                let mtime = metadata.modified().ok()?;
                if cache.get(&relative) == Some(&mtime) {
                    // Mtime unchanged - spurious event, skip it
                    return None;
                }
                cache.insert(relative.clone(), mtime);
                FileEvent {
                    path: relative,
                    kind: FileEventKind::Modified,
                    observed_at: to_millis(mtime),
                }
            }
            Err(_) => {
                cache.remove(&relative);
                FileEvent {
                    path: relative,
                    kind: FileEventKind::Deleted,
                    observed_at: SystemClock.now_millis(),
                }
            }
        };

        debug!("File event: {:?} - {}", event.kind, event.path);
        Some(event)
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache() -> MtimeCache {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[test]
    fn test_modified_event_uses_mtime() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.md");
        std::fs::write(&file, b"a").unwrap();
        let mtime = std::fs::metadata(&file).unwrap().modified().unwrap();

        let event =
            FileWatcher::process_event(&file, dir.path(), &PathFilter::new(), &cache()).unwrap();
        assert_eq!(event.path, "a.md");
        assert_eq!(event.kind, FileEventKind::Modified);
        assert_eq!(event.observed_at, to_millis(mtime));
    }

    #[test]
    fn test_unchanged_mtime_is_filtered() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.md");
        std::fs::write(&file, b"a").unwrap();
        let cache = cache();
        let filter = PathFilter::new();

        assert!(FileWatcher::process_event(&file, dir.path(), &filter, &cache).is_some());
        assert!(FileWatcher::process_event(&file, dir.path(), &filter, &cache).is_none());
    }

    #[test]
    fn test_missing_file_is_deleted() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes/gone.md");
        let event =
            FileWatcher::process_event(&file, dir.path(), &PathFilter::new(), &cache()).unwrap();
        assert_eq!(event.path, "notes/gone.md");
        assert_eq!(event.kind, FileEventKind::Deleted);
    }

    #[test]
    fn test_excluded_paths_are_ignored() {
        let dir = TempDir::new().unwrap();
        let filter = PathFilter::new().exclude_prefix("private");
        for path in [".sync/state.json", ".obsidian/app.json", "private/x.md"] {
            let file = dir.path().join(path);
            assert!(FileWatcher::process_event(&file, dir.path(), &filter, &cache()).is_none());
        }
    }
}
