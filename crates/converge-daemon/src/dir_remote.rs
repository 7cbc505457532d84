//! Directory-backed remote store.
//!
//! Records live as JSON files under `<root>/records/<remote_id>.json` and blobs
//! as raw files under `<root>/blobs/<locator>`. Several vaults pointing at the
//! same directory (a shared or synced folder) converge through it.
//!
//! Entry times come from each writer's own clock, and a synced folder can
//! deliver record files late, so `query` returns every record under the
//! prefix instead of cutting at `since`.

use async_trait::async_trait;
use converge_core::clock::{Clock, Millis};
use converge_core::entity::{Provenance, RemoteRecord};
use converge_core::remote::{BlobStore, RecordDraft, RemoteError, RemoteStore, Result, apply_draft};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct DirRemote {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    /// Serializes read-modify-write within this process.
    write_lock: Mutex<()>,
}

fn unavailable(context: &Path, err: std::io::Error) -> RemoteError {
    RemoteError::Unavailable(format!("{}: {err}", context.display()))
}

/// Ids and locators become file names, so they must be a single plain segment.
fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
    {
        return Err(RemoteError::Invalid(format!("bad identifier {name:?}")));
    }
    Ok(())
}

impl DirRemote {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = root.into();
        for dir in [root.join("records"), root.join("blobs")] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| unavailable(&dir, e))?;
        }
        Ok(Self {
            root,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, remote_id: &str) -> PathBuf {
        self.root.join("records").join(format!("{remote_id}.json"))
    }

    fn blob_path(&self, locator: &str) -> PathBuf {
        self.root.join("blobs").join(locator)
    }

    async fn load_all(&self) -> Result<HashMap<String, RemoteRecord>> {
        let dir = self.root.join("records");
        let mut entries = fs::read_dir(&dir).await.map_err(|e| unavailable(&dir, e))?;
        let mut records = HashMap::new();

        while let Some(entry) = entries.next_entry().await.map_err(|e| unavailable(&dir, e))? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Replaced by a concurrent writer's rename.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(unavailable(&path, e)),
            };
            match serde_json::from_slice::<RemoteRecord>(&bytes) {
                Ok(record) => {
                    records.insert(record.remote_id.clone(), record);
                }
                Err(e) => warn!("skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    async fn load(&self, remote_id: &str) -> Result<RemoteRecord> {
        check_name(remote_id)?;
        let path = self.record_path(remote_id);
        let bytes = fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => RemoteError::NotFound(remote_id.to_string()),
            _ => unavailable(&path, e),
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::Invalid(format!("{}: {e}", path.display())))
    }

    /// Write-then-rename so readers never see a partial record.
    async fn store(&self, record: &RemoteRecord) -> Result<()> {
        check_name(&record.remote_id)?;
        let path = self.record_path(&record.remote_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| RemoteError::Invalid(e.to_string()))?;
        fs::write(&tmp, bytes).await.map_err(|e| unavailable(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| unavailable(&path, e))?;
        Ok(())
    }

    fn now(&self) -> Millis {
        self.clock.now_millis()
    }

    /// Entry time for a write to `path`: the local clock, but always after
    /// every record already stored for that path.
    fn stamp(&self, records: &HashMap<String, RemoteRecord>, path: &str) -> Millis {
        records
            .values()
            .filter(|r| r.path == path)
            .map(|r| r.entry_time + 1)
            .fold(self.now(), Millis::max)
    }
}

#[async_trait]
impl RemoteStore for DirRemote {
    async fn query(&self, prefix: &str, _since: Millis) -> Result<Vec<RemoteRecord>> {
        let mut matching: Vec<RemoteRecord> = self
            .load_all()
            .await?
            .into_values()
            .filter(|r| r.path.starts_with(prefix))
            .collect();
        matching.sort_by(|a, b| a.entry_time.cmp(&b.entry_time).then(a.path.cmp(&b.path)));
        Ok(matching)
    }

    async fn upsert(&self, draft: RecordDraft) -> Result<RemoteRecord> {
        let _guard = self.write_lock.lock().await;
        let records = self.load_all().await?;
        let entry_time = self.stamp(&records, &draft.path);
        let record = apply_draft(&records, draft, entry_time)?;
        self.store(&record).await?;
        debug!("stored record {} for {}", record.remote_id, record.path);
        Ok(record)
    }

    async fn mark_deleted(&self, remote_id: &str, provenance: &Provenance) -> Result<RemoteRecord> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load(remote_id).await?;
        record.deleted = true;
        record.entry_time = self.now().max(record.entry_time + 1);
        record.provenance = provenance.clone();
        self.store(&record).await?;
        debug!("tombstoned record {} for {}", record.remote_id, record.path);
        Ok(record)
    }
}

#[async_trait]
impl BlobStore for DirRemote {
    async fn upload(&self, bytes: Vec<u8>) -> Result<String> {
        let locator = uuid::Uuid::new_v4().to_string();
        let path = self.blob_path(&locator);
        fs::write(&path, bytes).await.map_err(|e| unavailable(&path, e))?;
        Ok(locator)
    }

    async fn download(&self, locator: &str) -> Result<Vec<u8>> {
        check_name(locator)?;
        let path = self.blob_path(locator);
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => RemoteError::NotFound(locator.to_string()),
            _ => unavailable(&path, e),
        })
    }
}
