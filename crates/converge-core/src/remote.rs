//! Remote document store and blob store abstractions.
//!
//! Implementations:
//! - `InMemoryRemote` / `InMemoryBlobStore` - For testing
//! - `DirRemote` (in converge-daemon) - JSON documents and blobs in a shared directory
//!
//! `TracedRemote` wraps any implementation and logs every call.

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{Instrument, debug, debug_span};

use crate::clock::{Clock, Millis};
use crate::entity::{Payload, Provenance, RemoteRecord};
use crate::hash::ContentHash;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Path {path} already held by live record {remote_id}")]
    PathTaken { path: String, remote_id: String },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// A record as submitted by a device; the store assigns id and entry time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDraft {
    /// `None` creates a new record.
    pub remote_id: Option<String>,
    pub path: String,
    pub content_hash: ContentHash,
    pub size: u64,
    pub provenance: Provenance,
    pub payload: Payload,
}

/// Remote document store holding one record per synced file.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Records under `prefix` accepted strictly after `since`, oldest first.
    ///
    /// A store whose entry times are not monotonic may return older records
    /// as well. Refolding a known record changes nothing.
    async fn query(&self, prefix: &str, since: Millis) -> Result<Vec<RemoteRecord>>;

    /// Create or replace a record. Creating a record for a path that already
    /// has a live record fails with `PathTaken`.
    async fn upsert(&self, draft: RecordDraft) -> Result<RemoteRecord>;

    /// Set the tombstone flag. The record itself is never removed.
    async fn mark_deleted(&self, remote_id: &str, provenance: &Provenance) -> Result<RemoteRecord>;

    /// Feed of records as the store accepts them. Stores without push support
    /// return an empty stream and callers rely on `query`.
    fn subscribe(&self) -> BoxStream<'static, RemoteRecord> {
        stream::empty().boxed()
    }
}

/// Content-addressed-ish storage for payloads too large to inline.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String>;

    async fn download(&self, locator: &str) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for Arc<T> {
    async fn query(&self, prefix: &str, since: Millis) -> Result<Vec<RemoteRecord>> {
        (**self).query(prefix, since).await
    }

    async fn upsert(&self, draft: RecordDraft) -> Result<RemoteRecord> {
        (**self).upsert(draft).await
    }

    async fn mark_deleted(&self, remote_id: &str, provenance: &Provenance) -> Result<RemoteRecord> {
        (**self).mark_deleted(remote_id, provenance).await
    }

    fn subscribe(&self) -> BoxStream<'static, RemoteRecord> {
        (**self).subscribe()
    }
}

#[async_trait]
impl<T: BlobStore + ?Sized> BlobStore for Arc<T> {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String> {
        (**self).upload(bytes).await
    }

    async fn download(&self, locator: &str) -> Result<Vec<u8>> {
        (**self).download(locator).await
    }
}

/// Apply a draft to a record table. Shared by every store that keeps its
/// records keyed by remote id.
pub fn apply_draft(
    records: &HashMap<String, RemoteRecord>,
    draft: RecordDraft,
    entry_time: Millis,
) -> Result<RemoteRecord> {
    let remote_id = match draft.remote_id {
        Some(id) => {
            if !records.contains_key(&id) {
                return Err(RemoteError::NotFound(id));
            }
            id
        }
        None => {
            if let Some(live) = records.values().find(|r| r.path == draft.path && !r.deleted) {
                return Err(RemoteError::PathTaken {
                    path: draft.path,
                    remote_id: live.remote_id.clone(),
                });
            }
            uuid::Uuid::new_v4().to_string()
        }
    };

    Ok(RemoteRecord {
        remote_id,
        entry_time,
        content_hash: draft.content_hash,
        deleted: false,
        path: draft.path,
        size: draft.size,
        provenance: draft.provenance,
        payload: draft.payload,
    })
}

/// In-memory document store for testing. Clones share the same records.
#[derive(Clone)]
pub struct InMemoryRemote {
    records: Arc<Mutex<HashMap<String, RemoteRecord>>>,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<RemoteRecord>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRemote {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            clock: Arc::new(clock),
        }
    }

    /// Insert a record verbatim, as if another device had written it.
    pub fn seed(&self, record: RemoteRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.remote_id.clone(), record.clone());
        self.publish(record);
    }

    /// Current live-or-tombstoned record for `path`, newest first.
    pub fn record_for_path(&self, path: &str) -> Option<RemoteRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.path == path)
            .max_by_key(|r| r.entry_time)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make writes touching `path` fail, to exercise partial failure.
    pub fn fail_path(&self, path: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string());
    }

    fn check_failing(&self, path: &str) -> Result<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
        {
            return Err(RemoteError::Unavailable(format!("injected failure for {path}")));
        }
        Ok(())
    }

    fn publish(&self, record: RemoteRecord) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.unbounded_send(record.clone()).is_ok());
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn query(&self, prefix: &str, since: Millis) -> Result<Vec<RemoteRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<RemoteRecord> = records
            .values()
            .filter(|r| r.path.starts_with(prefix) && r.entry_time > since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.entry_time.cmp(&b.entry_time).then(a.path.cmp(&b.path)));
        Ok(matching)
    }

    async fn upsert(&self, draft: RecordDraft) -> Result<RemoteRecord> {
        self.check_failing(&draft.path)?;
        let record = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let record = apply_draft(&records, draft, self.clock.now_millis())?;
            records.insert(record.remote_id.clone(), record.clone());
            record
        };
        self.publish(record.clone());
        Ok(record)
    }

    async fn mark_deleted(&self, remote_id: &str, provenance: &Provenance) -> Result<RemoteRecord> {
        let record = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let record = records
                .get_mut(remote_id)
                .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
            self.check_failing(&record.path)?;
            record.deleted = true;
            record.entry_time = self.clock.now_millis();
            record.provenance = provenance.clone();
            record.clone()
        };
        self.publish(record.clone());
        Ok(record)
    }

    fn subscribe(&self) -> BoxStream<'static, RemoteRecord> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx.boxed()
    }
}

/// In-memory blob store for testing.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String> {
        let locator = uuid::Uuid::new_v4().to_string();
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(locator.clone(), bytes);
        Ok(locator)
    }

    async fn download(&self, locator: &str) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(locator)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(locator.to_string()))
    }
}

/// Logging interceptor around a store.
///
/// Every call runs inside a `remote` span and logs its outcome, so call
/// sites get tracing by composing `TracedRemote::new(store)`.
pub struct TracedRemote<R> {
    inner: R,
}

impl<R> TracedRemote<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

fn log_outcome<T>(op: &str, result: &Result<T>) {
    match result {
        Ok(_) => debug!("{} ok", op),
        Err(e) => debug!("{} failed: {}", op, e),
    }
}

#[async_trait]
impl<R: RemoteStore> RemoteStore for TracedRemote<R> {
    async fn query(&self, prefix: &str, since: Millis) -> Result<Vec<RemoteRecord>> {
        let result = self
            .inner
            .query(prefix, since)
            .instrument(debug_span!("remote", op = "query", prefix, since))
            .await;
        if let Ok(records) = &result {
            debug!("query returned {} record(s) since {}", records.len(), since);
        }
        log_outcome("query", &result);
        result
    }

    async fn upsert(&self, draft: RecordDraft) -> Result<RemoteRecord> {
        let span = debug_span!("remote", op = "upsert", path = %draft.path);
        let result = self.inner.upsert(draft).instrument(span).await;
        log_outcome("upsert", &result);
        result
    }

    async fn mark_deleted(&self, remote_id: &str, provenance: &Provenance) -> Result<RemoteRecord> {
        let result = self
            .inner
            .mark_deleted(remote_id, provenance)
            .instrument(debug_span!("remote", op = "mark_deleted", remote_id))
            .await;
        log_outcome("mark_deleted", &result);
        result
    }

    fn subscribe(&self) -> BoxStream<'static, RemoteRecord> {
        self.inner.subscribe()
    }
}

#[async_trait]
impl<R: BlobStore> BlobStore for TracedRemote<R> {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String> {
        let span = debug_span!("blob", op = "upload", size = bytes.len());
        let result = self.inner.upload(bytes).instrument(span).await;
        log_outcome("upload", &result);
        result
    }

    async fn download(&self, locator: &str) -> Result<Vec<u8>> {
        let result = self
            .inner
            .download(locator)
            .instrument(debug_span!("blob", op = "download", locator))
            .await;
        log_outcome("download", &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entity::fixtures::provenance;

    fn draft(path: &str, remote_id: Option<&str>) -> RecordDraft {
        RecordDraft {
            remote_id: remote_id.map(str::to_string),
            path: path.to_string(),
            content_hash: ContentHash::from_bytes(path.as_bytes()),
            size: 1,
            provenance: provenance(),
            payload: Payload::Inline(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn test_upsert_assigns_id_and_entry_time() {
        let clock = ManualClock::new(500);
        let remote = InMemoryRemote::new(clock.clone());

        let record = remote.upsert(draft("a.md", None)).await.unwrap();
        assert_eq!(record.entry_time, 500);
        assert!(!record.remote_id.is_empty());

        clock.advance(10);
        let updated = remote
            .upsert(draft("a.md", Some(record.remote_id.as_str())))
            .await
            .unwrap();
        assert_eq!(updated.remote_id, record.remote_id);
        assert_eq!(updated.entry_time, 510);
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn test_create_on_live_path_is_rejected() {
        let remote = InMemoryRemote::new(ManualClock::new(1));
        let first = remote.upsert(draft("a.md", None)).await.unwrap();

        match remote.upsert(draft("a.md", None)).await {
            Err(RemoteError::PathTaken { remote_id, .. }) => assert_eq!(remote_id, first.remote_id),
            other => panic!("expected PathTaken, got {other:?}"),
        }

        // A tombstoned path can be claimed again.
        remote.mark_deleted(&first.remote_id, &provenance()).await.unwrap();
        assert!(remote.upsert(draft("a.md", None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let remote = InMemoryRemote::new(ManualClock::new(1));
        assert!(matches!(
            remote.upsert(draft("a.md", Some("nope"))).await,
            Err(RemoteError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_query_filters_by_prefix_and_watermark() {
        let clock = ManualClock::new(100);
        let remote = InMemoryRemote::new(clock.clone());
        remote.upsert(draft("notes/a.md", None)).await.unwrap();
        clock.set(200);
        remote.upsert(draft("notes/b.md", None)).await.unwrap();
        remote.upsert(draft("other/c.md", None)).await.unwrap();

        let all = remote.query("notes/", 0).await.unwrap();
        assert_eq!(all.len(), 2);
        let newer = remote.query("notes/", 100).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].path, "notes/b.md");
    }

    #[tokio::test]
    async fn test_mark_deleted_keeps_record() {
        let clock = ManualClock::new(100);
        let remote = InMemoryRemote::new(clock.clone());
        let record = remote.upsert(draft("a.md", None)).await.unwrap();
        clock.set(300);

        let tombstone = remote.mark_deleted(&record.remote_id, &provenance()).await.unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.entry_time, 300);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote.record_for_path("a.md"), Some(tombstone));
    }

    #[tokio::test]
    async fn test_subscribe_receives_accepted_records() {
        let remote = InMemoryRemote::new(ManualClock::new(1));
        let mut feed = remote.subscribe();

        let record = remote.upsert(draft("a.md", None)).await.unwrap();
        assert_eq!(feed.next().await, Some(record));
    }

    #[tokio::test]
    async fn test_blob_round_trip_through_traced_wrapper() {
        let blobs = TracedRemote::new(InMemoryBlobStore::new());
        let locator = blobs.upload(vec![9; 64]).await.unwrap();
        assert_eq!(blobs.download(&locator).await.unwrap(), vec![9; 64]);
        assert!(matches!(
            blobs.download("missing").await,
            Err(RemoteError::NotFound(_))
        ));
        assert_eq!(blobs.inner().len(), 1);
    }
}
