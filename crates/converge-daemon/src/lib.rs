//! converge-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod dir_remote;
pub mod native_fs;
pub mod persistence;
pub mod watcher;

// Re-export key types for convenience
pub use dir_remote::DirRemote;
pub use native_fs::NativeFs;
pub use persistence::{StateStorage, load_or_create_device_id};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
