//! Cycle orchestration: fold, derive, execute, and remember the result.

use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::actions::{self, ActionKind};
use crate::clock::{Clock, Millis};
use crate::config::SyncConfig;
use crate::entity::{FileEntity, RemoteRecord, StateMap};
use crate::error::{Result, SyncError};
use crate::events::{CycleStats, EventBus, ProgressEvent};
use crate::executor::Executor;
use crate::filter::validate_sync_path;
use crate::fold::{self, RemoteSnapshot, TouchedPaths};
use crate::fs::{LocalFs, LocalNode};
use crate::remote::{BlobStore, RemoteStore};

/// What one cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub stats: CycleStats,
    /// Actions left over because of the quota.
    pub deferred: usize,
    /// Failed actions; their paths are retried next cycle.
    pub failures: Vec<(String, ActionKind, SyncError)>,
}

impl CycleReport {
    /// True when nothing was left undone.
    pub fn is_settled(&self) -> bool {
        self.deferred == 0 && self.failures.is_empty()
    }
}

/// Owns the state map and remote watermark of one device and runs cycles.
pub struct SyncEngine<F, R, B> {
    fs: F,
    remote: R,
    blobs: B,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    config: SyncConfig,
    state: StateMap,
    watermark: Millis,
    feed: Vec<RemoteRecord>,
    cycles: u64,
}

impl<F, R, B> SyncEngine<F, R, B>
where
    F: LocalFs,
    R: RemoteStore,
    B: BlobStore,
{
    pub fn new(fs: F, remote: R, blobs: B, clock: Arc<dyn Clock>, config: SyncConfig) -> Self {
        Self {
            fs,
            remote,
            blobs,
            clock,
            events: Arc::new(EventBus::new()),
            config,
            state: StateMap::new(),
            watermark: 0,
            feed: Vec::new(),
            cycles: 0,
        }
    }

    /// Resume from a previously persisted state map and watermark.
    pub fn with_state(mut self, state: StateMap, watermark: Millis) -> Self {
        self.state = state;
        self.watermark = watermark;
        self
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    /// Largest remote `entry_time` folded so far.
    pub fn watermark(&self) -> Millis {
        self.watermark
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Buffer a record from the remote change feed for the next cycle.
    ///
    /// Records outside the configured prefix are dropped.
    pub fn ingest_remote(&mut self, record: RemoteRecord) {
        if record.path.starts_with(&self.config.remote_prefix) {
            self.feed.push(record);
        }
    }

    /// Touched set for the first cycle after start.
    ///
    /// Covers every file on disk, observed at its modification time, plus
    /// every mapped path that claims a local copy, so files deleted while
    /// the host was down are noticed.
    pub async fn startup_touched(&self) -> Result<TouchedPaths> {
        let now = self.clock.now_millis();
        let mut touched = TouchedPaths::new();

        for path in self.fs.list_files().await? {
            match self.fs.stat_path(&path).await? {
                LocalNode::Present(file_data) => {
                    touched.insert(path, file_data.modified_at);
                }
                LocalNode::Missing => {
                    touched.insert(path, now);
                }
                LocalNode::Excluded => {}
            }
        }
        for entity in self.state.entities() {
            if matches!(
                entity,
                FileEntity::LocalOnly { .. } | FileEntity::LinkedFile { .. }
            ) {
                touched.entry(entity.path().to_string()).or_insert(now);
            }
        }

        debug!("startup touched set has {} path(s)", touched.len());
        Ok(touched)
    }

    /// Run one fold → derive → execute cycle.
    ///
    /// Failed actions do not fail the cycle: their entities stay in the map
    /// and are derived again next time. Errors from querying the remote or
    /// folding leave the map untouched.
    pub async fn run_cycle(&mut self, touched: &TouchedPaths) -> Result<CycleReport> {
        self.cycles += 1;
        let cycle_id = self.cycles;
        let span = info_span!("cycle", id = cycle_id);
        self.cycle(cycle_id, touched).instrument(span).await
    }

    async fn cycle(&mut self, cycle_id: u64, touched: &TouchedPaths) -> Result<CycleReport> {
        let started = self.clock.now_millis();
        self.events.emit(ProgressEvent::CycleStarted { cycle_id });

        let snapshot = self.snapshot().await?;
        let folded = fold::fold(self.state.clone(), touched, &snapshot, &self.fs).await?;
        let pending = actions::derive(&folded)?;

        self.feed.clear();
        if let Some(max) = snapshot.max_entry_time() {
            self.watermark = self.watermark.max(max);
        }

        let mut stats = CycleStats {
            cycle_id,
            pending: pending.len(),
            ..CycleStats::default()
        };
        let executor = Executor {
            fs: &self.fs,
            remote: &self.remote,
            blobs: &self.blobs,
            events: &self.events,
            clock: &*self.clock,
            config: &self.config,
        };

        let (report, failures) = match executor.execute(folded, pending, self.config.quota).await {
            Ok(report) => (report, Vec::new()),
            Err(batch) => {
                warn!("{}", batch);
                (batch.report, batch.failures)
            }
        };

        self.state = report.state;
        stats.dispatched = report.dispatched;
        stats.succeeded = report.applied;
        stats.failed = failures.len();
        stats.duration_ms = self.clock.now_millis().saturating_sub(started);

        if stats.pending > 0 {
            info!(
                "cycle {}: {} pending, {} applied, {} failed, {} deferred",
                cycle_id, stats.pending, stats.succeeded, stats.failed, report.deferred
            );
        } else {
            debug!("cycle {}: converged", cycle_id);
        }
        self.events.emit(ProgressEvent::CycleFinished {
            stats: stats.clone(),
        });

        Ok(CycleReport {
            stats,
            deferred: report.deferred,
            failures,
        })
    }

    /// Whether a remote record may be folded into this vault.
    fn accepts(&self, record: &RemoteRecord) -> bool {
        if let Err(e) = validate_sync_path(&record.path) {
            warn!("ignoring record {}: {}", record.remote_id, e);
            return false;
        }
        if self.config.filter.is_excluded(&record.path) {
            debug!("ignoring record {} for excluded {}", record.remote_id, record.path);
            return false;
        }
        true
    }

    /// Records newer than the watermark plus anything buffered from the feed.
    ///
    /// The query starts one millisecond before the watermark so records that
    /// share its timestamp are seen again; refolding them changes nothing.
    /// Records with unsafe or excluded paths are dropped.
    async fn snapshot(&self) -> Result<RemoteSnapshot> {
        let since = self.watermark.saturating_sub(1);
        let queried = self
            .remote
            .query(&self.config.remote_prefix, since)
            .await
            .map_err(SyncError::from)?;
        debug!(
            "queried {} record(s) since {}, {} buffered from feed",
            queried.len(),
            since,
            self.feed.len()
        );

        let mut records: Vec<RemoteRecord> = queried
            .into_iter()
            .chain(self.feed.iter().cloned())
            .filter(|record| self.accepts(record))
            .collect();
        records.sort_by(|a, b| a.entry_time.cmp(&b.entry_time));
        RemoteSnapshot::from_records(records)
    }
}
