//! converge-core: convergence engine for syncing a local vault with a remote
//! document store.
//!
//! This crate provides:
//! - The per-path `FileEntity` model and the `StateMap` that holds it
//! - Folding local observations and remote snapshots into a state map
//! - Deriving last-writer-wins actions and executing them under a quota
//! - Compressed payloads routed inline or through a blob store
//! - `LocalFs`, `RemoteStore` and `BlobStore` trait abstractions

pub mod actions;
pub mod clock;
pub mod config;
pub mod device_id;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod executor;
pub mod filter;
pub mod fold;
pub mod fs;
pub mod hash;
pub mod payload;
pub mod persist;
pub mod remote;

pub use actions::{Action, ActionKind};
pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use config::SyncConfig;
pub use device_id::{DeviceId, DeviceIdError};
pub use engine::{CycleReport, SyncEngine};
pub use entity::{FileData, FileEntity, Payload, Provenance, RemoteRecord, StateMap};
pub use error::{ErrorKind, SyncError};
pub use events::{CycleStats, EventBus, ProgressEvent, Subscription};
pub use executor::{BatchError, ExecutionReport, Executor};
pub use filter::{PathFilter, SYNC_DIR};
pub use fold::{RemoteSnapshot, TouchedPaths};
pub use fs::{FileTimes, FsError, InMemoryFs, LocalFs, LocalNode};
pub use hash::ContentHash;
pub use persist::{SchemaVersioning, StateCodec};
pub use remote::{
    BlobStore, InMemoryBlobStore, InMemoryRemote, RecordDraft, RemoteError, RemoteStore,
    TracedRemote,
};
