//! Action executor: apply a cycle's actions under an admission quota.
//!
//! Actions are ordered oldest `local_time` first, the first `quota` are
//! admitted, and the admitted handlers run concurrently as cooperative
//! futures on the caller's task. Each handler returns the entity its path
//! should hold afterwards; successes are merged into the returned state map
//! even when siblings fail.

use futures::future::join_all;
use thiserror::Error;
use tracing::{Instrument, debug, info_span, warn};

use crate::actions::{Action, ActionKind};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::entity::{FileData, FileEntity, RemoteRecord, StateMap};
use crate::error::{ErrorKind, Result, SyncError};
use crate::events::{EventBus, ProgressEvent};
use crate::fs::{FileTimes, FsError, LocalFs};
use crate::payload;
use crate::remote::{BlobStore, RecordDraft, RemoteStore};

/// Outcome of a batch in which every admitted action succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// The input state with every successful result merged in.
    pub state: StateMap,
    /// Actions that completed successfully.
    pub applied: usize,
    /// Actions admitted under the quota.
    pub dispatched: usize,
    /// Eligible actions left for a later cycle.
    pub deferred: usize,
}

/// A batch with at least one failed action. Progress made by the other
/// actions is kept in `report`.
#[derive(Debug, Error)]
#[error("{} of {} action(s) failed; first: {error}", .failures.len(), .report.dispatched)]
pub struct BatchError {
    /// The first failure, in dispatch order.
    pub error: SyncError,
    /// Every failure as (path, kind, error).
    pub failures: Vec<(String, ActionKind, SyncError)>,
    pub report: ExecutionReport,
}

/// Order `actions` oldest first and split off the admitted head.
///
/// Ties on `local_time` are broken by path so the excluded tail is
/// deterministic.
pub fn admit(mut actions: Vec<Action>, quota: usize) -> (Vec<Action>, Vec<Action>) {
    actions.sort_by(|a, b| {
        a.local_time()
            .cmp(&b.local_time())
            .then_with(|| a.path.cmp(&b.path))
    });
    let deferred = actions.split_off(quota.min(actions.len()));
    (actions, deferred)
}

/// Borrowed view of the collaborators one batch needs.
pub struct Executor<'a, F: ?Sized, R: ?Sized, B: ?Sized> {
    pub fs: &'a F,
    pub remote: &'a R,
    pub blobs: &'a B,
    pub events: &'a EventBus,
    pub clock: &'a dyn Clock,
    pub config: &'a SyncConfig,
}

impl<F, R, B> Executor<'_, F, R, B>
where
    F: LocalFs + ?Sized,
    R: RemoteStore + ?Sized,
    B: BlobStore + ?Sized,
{
    /// Run up to `quota` of `actions` against `state`.
    pub async fn execute(
        &self,
        state: StateMap,
        actions: Vec<Action>,
        quota: usize,
    ) -> std::result::Result<ExecutionReport, BatchError> {
        let (admitted, deferred) = admit(actions, quota);
        if !deferred.is_empty() {
            debug!(
                "admitting {} action(s), deferring {} to a later cycle",
                admitted.len(),
                deferred.len()
            );
        }

        let results = join_all(admitted.iter().map(|action| {
            let span = info_span!("action", kind = %action.kind, path = %action.path);
            self.run(action).instrument(span)
        }))
        .await;

        let mut report = ExecutionReport {
            state,
            applied: 0,
            dispatched: admitted.len(),
            deferred: deferred.len(),
        };
        let mut failures = Vec::new();

        for (action, result) in admitted.iter().zip(results) {
            match result.and_then(|entity| report.state.insert(entity).map(|_| ())) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    let e = e.with_path(action.path.clone());
                    warn!("{} failed for {}: {}", action.kind, action.path, e);
                    failures.push((action.path.clone(), action.kind, e));
                }
            }
        }

        if failures.is_empty() {
            return Ok(report);
        }
        let error = failures[0].2.clone();
        Err(BatchError {
            error,
            failures,
            report,
        })
    }

    async fn run(&self, action: &Action) -> Result<FileEntity> {
        self.events.emit(ProgressEvent::EntryStarted {
            path: action.path.clone(),
            action: action.kind,
        });
        self.events.entry_progress(&action.path, 0.0);

        let entity = match action.kind {
            ActionKind::Upload | ActionKind::UpdateRemote => self.push(action).await?,
            ActionKind::UpdateLocal => self.pull(action).await?,
            ActionKind::DeleteLocal => self.delete_local(action).await?,
            ActionKind::MarkRemoteDeleted => self.mark_remote_deleted(action).await?,
        };

        self.events.entry_progress(&action.path, 1.0);
        debug!("{} -> {}", action.path, entity.kind_name());
        Ok(entity)
    }

    /// Read, compress, route, and upsert local content.
    async fn push(&self, action: &Action) -> Result<FileEntity> {
        let (file_data, local_time, remote_id) = match &action.entity {
            FileEntity::LocalOnly {
                file_data,
                local_time,
            } => (file_data, *local_time, None),
            FileEntity::LinkedFile {
                file_data,
                local_time,
                remote,
            } => (file_data, *local_time, Some(remote.remote_id.clone())),
            other => return Err(mismatch(action.kind, other)),
        };

        let content = self.fs.read(&action.path).await?;
        self.events.entry_progress(&action.path, 0.25);

        // Describe what is actually being sent, which may be newer than the stat.
        let file_data = FileData::from_content(
            &action.path,
            &content,
            file_data.created_at,
            file_data.modified_at,
        );
        let payload =
            payload::encode(&content, self.config.inline_threshold, self.blobs).await?;
        self.events.entry_progress(&action.path, 0.75);

        let record = self
            .remote
            .upsert(RecordDraft {
                remote_id,
                path: action.path.clone(),
                content_hash: file_data.content_hash.clone(),
                size: file_data.size,
                provenance: self.config.provenance.clone(),
                payload,
            })
            .await?;

        Ok(FileEntity::LinkedFile {
            file_data,
            local_time,
            remote: record,
        })
    }

    /// Download, decompress, verify, and write remote content.
    async fn pull(&self, action: &Action) -> Result<FileEntity> {
        let (local_time, remote, created_at) = match &action.entity {
            FileEntity::LinkedFile {
                file_data,
                local_time,
                remote,
            } => (*local_time, remote, file_data.created_at),
            FileEntity::RemoteOnly {
                local_time, remote, ..
            } => (*local_time, remote, remote.entry_time),
            other => return Err(mismatch(action.kind, other)),
        };

        let content = payload::decode(remote, self.blobs)
            .await
            .map_err(|e| SyncError::from(e).with_remote_id(remote.remote_id.clone()))?;
        self.events.entry_progress(&action.path, 0.5);

        // The write's mtime is the record's entry time, so the change event it
        // triggers never looks newer than the record it came from.
        let times = FileTimes {
            created_at,
            modified_at: remote.entry_time,
        };
        self.fs.write(&action.path, &content, times).await?;

        Ok(FileEntity::LinkedFile {
            file_data: FileData::from_content(
                &action.path,
                &content,
                times.created_at,
                times.modified_at,
            ),
            local_time: local_time.max(remote.entry_time),
            remote: remote.clone(),
        })
    }

    /// Remove the local copy and keep the tombstone as `RemoteOnly`.
    async fn delete_local(&self, action: &Action) -> Result<FileEntity> {
        let (local_time, remote) = match &action.entity {
            FileEntity::LinkedFile {
                local_time, remote, ..
            } => (*local_time, remote),
            other => return Err(mismatch(action.kind, other)),
        };

        match self.fs.delete(&action.path).await {
            Ok(()) => {}
            Err(FsError::NotFound(_)) => debug!("{} already gone locally", action.path),
            Err(e) => return Err(e.into()),
        }

        Ok(remote_only(
            &action.path,
            local_time.max(self.clock.now_millis()),
            remote.clone(),
        ))
    }

    /// Tombstone the remote record of a locally deleted file.
    async fn mark_remote_deleted(&self, action: &Action) -> Result<FileEntity> {
        let (local_time, remote) = match &action.entity {
            FileEntity::RemoteOnly {
                local_time, remote, ..
            } => (*local_time, remote),
            other => return Err(mismatch(action.kind, other)),
        };

        let record = self
            .remote
            .mark_deleted(&remote.remote_id, &self.config.provenance)
            .await
            .map_err(|e| SyncError::from(e).with_remote_id(remote.remote_id.clone()))?;

        Ok(remote_only(&action.path, local_time, record))
    }
}

fn remote_only(path: &str, local_time: u64, remote: RemoteRecord) -> FileEntity {
    FileEntity::RemoteOnly {
        path: path.to_string(),
        local_time,
        remote,
    }
}

fn mismatch(kind: ActionKind, entity: &FileEntity) -> SyncError {
    SyncError::new(
        ErrorKind::InvalidArgument,
        format!("{kind} cannot apply to {} entity", entity.kind_name()),
    )
    .with_path(entity.path())
}
