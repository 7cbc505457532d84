//! State folder: combine the previous state map with fresh local observations
//! and a remote snapshot.
//!
//! Folding happens in two steps. Step A stats every touched path and merges
//! the observation with the prior entity. Step B lays the remote snapshot over
//! the result. Both steps are per-path pure functions (`fold_local`,
//! `fold_remote`); only the stat calls do I/O, and those run concurrently.

use futures::future::try_join_all;
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

use crate::clock::Millis;
use crate::entity::{FileEntity, RemoteRecord, StateMap};
use crate::error::{ErrorKind, Result, SyncError};
use crate::filter::validate_sync_path;
use crate::fs::{LocalFs, LocalNode};

/// Paths observed locally this cycle, with the time each was observed.
pub type TouchedPaths = BTreeMap<String, Millis>;

/// At most one remote record per path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteSnapshot {
    records: BTreeMap<String, RemoteRecord>,
}

impl RemoteSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collapse a list of records into one per path.
    ///
    /// The latest `entry_time` wins. Two live records with different ids for
    /// the same path cannot be reconciled and fail with `AlreadyExists`.
    pub fn from_records(records: impl IntoIterator<Item = RemoteRecord>) -> Result<Self> {
        let mut snapshot = Self::new();
        for record in records {
            snapshot.push(record)?;
        }
        Ok(snapshot)
    }

    /// Build from a map keyed by path; every key must match its record's path.
    pub fn from_map(records: BTreeMap<String, RemoteRecord>) -> Result<Self> {
        if let Some((key, record)) = records.iter().find(|(key, r)| **key != r.path) {
            return Err(SyncError::internal(format!(
                "snapshot key {key} holds record for {}",
                record.path
            ))
            .with_path(key.clone())
            .with_remote_id(record.remote_id.clone()));
        }
        let mut snapshot = Self::new();
        for record in records.into_values() {
            snapshot.push(record)?;
        }
        Ok(snapshot)
    }

    /// Add one record, applying the same collapse rule as `from_records`.
    pub fn push(&mut self, record: RemoteRecord) -> Result<()> {
        if let Some(existing) = self.records.get(&record.path) {
            if existing.remote_id != record.remote_id && !existing.deleted && !record.deleted {
                return Err(SyncError::new(
                    ErrorKind::AlreadyExists,
                    format!(
                        "live records {} and {} both claim this path",
                        existing.remote_id, record.remote_id
                    ),
                )
                .with_path(record.path.clone())
                .with_remote_id(record.remote_id));
            }
            if existing.entry_time > record.entry_time {
                return Ok(());
            }
        }
        self.records.insert(record.path.clone(), record);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&RemoteRecord> {
        self.records.get(path)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Newest entry time in the snapshot, if any.
    pub fn max_entry_time(&self) -> Option<Millis> {
        self.records.values().map(|r| r.entry_time).max()
    }

    pub fn records(&self) -> impl Iterator<Item = &RemoteRecord> {
        self.records.values()
    }
}

/// Turn a stat result into the entity it implies on its own.
pub fn observe(path: &str, node: LocalNode, observed_at: Millis) -> FileEntity {
    match node {
        LocalNode::Present(file_data) => FileEntity::LocalOnly {
            file_data,
            local_time: observed_at,
        },
        LocalNode::Missing => FileEntity::LocalMissing {
            path: path.to_string(),
            local_time: observed_at,
        },
        LocalNode::Excluded => FileEntity::Invalid {
            path: path.to_string(),
        },
    }
}

fn transient_prior(prior: &FileEntity) -> SyncError {
    SyncError::internal(format!("state map holds transient {} entity", prior.kind_name()))
        .with_path(prior.path())
}

/// Merge one local observation into the prior entity for its path.
///
/// `observed` must come from [`observe`]. Returns `None` when the path should
/// drop out of the map.
pub fn fold_local(prior: Option<FileEntity>, observed: FileEntity) -> Result<Option<FileEntity>> {
    use FileEntity::*;

    let merged = match (prior, observed) {
        (Some(prior @ (LocalMissing { .. } | Invalid { .. })), _) => {
            return Err(transient_prior(&prior));
        }
        (_, observed @ (LinkedFile { .. } | RemoteOnly { .. })) => {
            return Err(SyncError::internal(format!(
                "{} is not a local observation",
                observed.kind_name()
            ))
            .with_path(observed.path()));
        }

        (None, observed @ LocalOnly { .. }) => Some(observed),
        (None, LocalMissing { .. } | Invalid { .. }) => None,

        (Some(LocalOnly { local_time: prior_time, .. }), LocalOnly { file_data, local_time }) => {
            Some(LocalOnly {
                file_data,
                local_time: prior_time.max(local_time),
            })
        }
        // Never linked, so there is nothing to reconcile.
        (Some(LocalOnly { .. }), LocalMissing { .. } | Invalid { .. }) => None,

        (
            Some(LinkedFile {
                local_time: prior_time,
                remote,
                ..
            }),
            LocalOnly { file_data, local_time },
        ) => Some(LinkedFile {
            file_data,
            local_time: prior_time.max(local_time),
            remote,
        }),
        (
            Some(LinkedFile {
                file_data,
                local_time: prior_time,
                remote,
            }),
            LocalMissing { local_time, .. },
        ) => Some(RemoteOnly {
            path: file_data.full_path,
            local_time: prior_time.max(local_time),
            remote,
        }),
        (
            Some(LinkedFile {
                file_data,
                local_time,
                remote,
            }),
            Invalid { .. },
        ) => Some(RemoteOnly {
            path: file_data.full_path,
            local_time,
            remote,
        }),

        (
            Some(RemoteOnly {
                local_time: prior_time,
                remote,
                ..
            }),
            LocalOnly { file_data, local_time },
        ) => Some(LinkedFile {
            file_data,
            local_time: prior_time.max(local_time),
            remote,
        }),
        (
            Some(RemoteOnly {
                path,
                local_time: prior_time,
                remote,
            }),
            LocalMissing { local_time, .. },
        ) => Some(RemoteOnly {
            path,
            local_time: prior_time.max(local_time),
            remote,
        }),
        (Some(prior @ RemoteOnly { .. }), Invalid { .. }) => Some(prior),
    };
    Ok(merged)
}

/// Lay a remote record over the entity Step A produced for its path.
///
/// A record older than the one already known for the path is ignored, so a
/// stale snapshot never rolls the map back.
pub fn fold_remote(prior: Option<FileEntity>, record: RemoteRecord) -> Result<FileEntity> {
    use FileEntity::*;

    let entity = match prior {
        None => RemoteOnly {
            path: record.path.clone(),
            local_time: record.entry_time,
            remote: record,
        },
        Some(prior @ (LocalMissing { .. } | Invalid { .. })) => {
            return Err(transient_prior(&prior));
        }
        Some(LocalOnly { file_data, local_time }) => LinkedFile {
            file_data,
            local_time,
            remote: record,
        },
        Some(LinkedFile {
            file_data,
            local_time,
            remote,
        }) => LinkedFile {
            file_data,
            local_time,
            remote: newer(remote, record),
        },
        Some(RemoteOnly {
            path,
            local_time,
            remote,
        }) => RemoteOnly {
            path,
            local_time,
            remote: newer(remote, record),
        },
    };
    Ok(entity)
}

fn newer(known: RemoteRecord, incoming: RemoteRecord) -> RemoteRecord {
    if incoming.entry_time < known.entry_time {
        trace!(
            "ignoring stale record {} for {} ({} < {})",
            incoming.remote_id, incoming.path, incoming.entry_time, known.entry_time
        );
        known
    } else {
        incoming
    }
}

/// Fold touched local paths and a remote snapshot into `previous`.
///
/// Records whose path fails [`validate_sync_path`] are skipped and never
/// enter the map.
pub async fn fold<F: LocalFs + ?Sized>(
    previous: StateMap,
    touched: &TouchedPaths,
    snapshot: &RemoteSnapshot,
    fs: &F,
) -> Result<StateMap> {
    let observations = try_join_all(touched.iter().map(|(path, observed_at)| async move {
        let node = fs
            .stat_path(path)
            .await
            .map_err(|e| SyncError::from(e).with_path(path.clone()))?;
        Ok::<_, SyncError>(observe(path, node, *observed_at))
    }))
    .await?;

    let mut state = previous;

    // Step A: local observations
    for observed in observations {
        let path = observed.path().to_string();
        let prior = state.remove(&path);
        match fold_local(prior, observed)? {
            Some(entity) => {
                trace!("local fold {}: {}", path, entity.kind_name());
                state.insert(entity)?;
            }
            None => debug!("dropping {} from state", path),
        }
    }

    // Step B: remote snapshot
    for record in snapshot.records() {
        if let Err(e) = validate_sync_path(&record.path) {
            warn!("skipping record {}: {}", record.remote_id, e);
            continue;
        }
        let prior = state.remove(&record.path);
        let entity = fold_remote(prior, record.clone())?;
        trace!("remote fold {}: {}", record.path, entity.kind_name());
        state.insert(entity)?;
    }

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FileData;
    use crate::entity::fixtures::{file_data, remote, tombstone};
    use crate::fs::InMemoryFs;

    fn touched(entries: &[(&str, Millis)]) -> TouchedPaths {
        entries.iter().map(|(p, t)| (p.to_string(), *t)).collect()
    }

    fn linked(path: &str, content: &[u8], local_time: Millis, entry_time: Millis) -> FileEntity {
        FileEntity::LinkedFile {
            file_data: file_data(path, content),
            local_time,
            remote: remote(path, content, entry_time),
        }
    }

    fn state_of(entities: Vec<FileEntity>) -> StateMap {
        let mut map = StateMap::new();
        for entity in entities {
            map.insert(entity).unwrap();
        }
        map
    }

    #[tokio::test]
    async fn test_new_local_file_becomes_local_only() {
        let fs = InMemoryFs::new();
        fs.put("a.md", b"H1 content", 1);

        let state = fold(
            StateMap::new(),
            &touched(&[("a.md", 100)]),
            &RemoteSnapshot::new(),
            &fs,
        )
        .await
        .unwrap();

        match state.get("a.md") {
            Some(FileEntity::LocalOnly { file_data, local_time }) => {
                assert_eq!(file_data.content_hash, FileData::from_content("a.md", b"H1 content", 1, 1).content_hash);
                assert_eq!(*local_time, 100);
            }
            other => panic!("expected LocalOnly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_untouched_paths_carry_over() {
        let fs = InMemoryFs::new();
        let prior = state_of(vec![linked("keep.md", b"k", 5, 5)]);

        let state = fold(prior.clone(), &TouchedPaths::new(), &RemoteSnapshot::new(), &fs)
            .await
            .unwrap();
        assert_eq!(state, prior);
    }

    #[tokio::test]
    async fn test_missing_and_excluded_without_prior_are_noops() {
        let fs = InMemoryFs::new();
        let state = fold(
            StateMap::new(),
            &touched(&[("gone.md", 10), (".hidden/x.md", 10)]),
            &RemoteSnapshot::new(),
            &fs,
        )
        .await
        .unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_local_only_removed_when_missing() {
        let fs = InMemoryFs::new();
        let prior = state_of(vec![FileEntity::LocalOnly {
            file_data: file_data("a.md", b"a"),
            local_time: 10,
        }]);
        let state = fold(prior, &touched(&[("a.md", 20)]), &RemoteSnapshot::new(), &fs)
            .await
            .unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_linked_file_deleted_locally_becomes_remote_only() {
        let fs = InMemoryFs::new();
        let prior = state_of(vec![linked("a.md", b"a", 50, 100)]);

        let state = fold(prior, &touched(&[("a.md", 200)]), &RemoteSnapshot::new(), &fs)
            .await
            .unwrap();

        match state.get("a.md") {
            Some(FileEntity::RemoteOnly { local_time, remote, .. }) => {
                assert_eq!(*local_time, 200);
                assert_eq!(remote.entry_time, 100);
            }
            other => panic!("expected RemoteOnly, got {other:?}"),
        }
    }

    #[test]
    fn test_fold_local_transition_table() {
        let present = |t| observe("a.md", LocalNode::Present(file_data("a.md", b"new")), t);
        let missing = |t| observe("a.md", LocalNode::Missing, t);
        let excluded = || observe("a.md", LocalNode::Excluded, 0);

        // LinkedFile + present keeps the remote and refreshes data
        let merged = fold_local(Some(linked("a.md", b"old", 10, 5)), present(20))
            .unwrap()
            .unwrap();
        assert!(matches!(
            &merged,
            FileEntity::LinkedFile { file_data, local_time: 20, remote }
                if file_data.content_hash == file_data_hash(b"new") && remote.entry_time == 5
        ));

        // LinkedFile + excluded keeps local_time
        let merged = fold_local(Some(linked("a.md", b"old", 10, 5)), excluded())
            .unwrap()
            .unwrap();
        assert!(matches!(merged, FileEntity::RemoteOnly { local_time: 10, .. }));

        // RemoteOnly + present attaches data
        let remote_only = FileEntity::RemoteOnly {
            path: "a.md".into(),
            local_time: 30,
            remote: remote("a.md", b"old", 30),
        };
        let merged = fold_local(Some(remote_only.clone()), present(40)).unwrap().unwrap();
        assert!(matches!(merged, FileEntity::LinkedFile { local_time: 40, .. }));

        // RemoteOnly + missing bumps local_time
        let merged = fold_local(Some(remote_only.clone()), missing(45)).unwrap().unwrap();
        assert!(matches!(merged, FileEntity::RemoteOnly { local_time: 45, .. }));

        // RemoteOnly + excluded is unchanged
        let merged = fold_local(Some(remote_only.clone()), excluded()).unwrap().unwrap();
        assert_eq!(merged, remote_only);

        // LocalOnly + excluded drops the path
        let local_only = FileEntity::LocalOnly {
            file_data: file_data("a.md", b"x"),
            local_time: 1,
        };
        assert_eq!(fold_local(Some(local_only), excluded()).unwrap(), None);
    }

    fn file_data_hash(content: &[u8]) -> crate::hash::ContentHash {
        crate::hash::ContentHash::from_bytes(content)
    }

    #[test]
    fn test_local_time_never_moves_backwards() {
        let merged = fold_local(
            Some(linked("a.md", b"a", 500, 100)),
            observe("a.md", LocalNode::Missing, 300),
        )
        .unwrap()
        .unwrap();
        assert_eq!(merged.local_time(), Some(500));
    }

    #[test]
    fn test_fold_local_rejects_transient_prior() {
        let prior = FileEntity::Invalid { path: "a.md".into() };
        let err = fold_local(Some(prior), observe("a.md", LocalNode::Missing, 1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn test_fold_remote_table() {
        let record = remote("a.md", b"r", 70);

        let merged = fold_remote(None, record.clone()).unwrap();
        assert_eq!(
            merged,
            FileEntity::RemoteOnly {
                path: "a.md".into(),
                local_time: 70,
                remote: record.clone()
            }
        );

        let local_only = FileEntity::LocalOnly {
            file_data: file_data("a.md", b"l"),
            local_time: 10,
        };
        let merged = fold_remote(Some(local_only), record.clone()).unwrap();
        assert!(matches!(merged, FileEntity::LinkedFile { local_time: 10, ref remote, .. } if *remote == record));
    }

    #[test]
    fn test_fold_remote_ignores_stale_record() {
        let prior = linked("a.md", b"a", 10, 200);
        let merged = fold_remote(Some(prior.clone()), remote("a.md", b"old", 100)).unwrap();
        assert_eq!(merged, prior);
    }

    #[tokio::test]
    async fn test_remote_silence_is_not_deletion() {
        let fs = InMemoryFs::new();
        fs.put("a.md", b"a", 1);
        let prior = state_of(vec![linked("a.md", b"a", 10, 10)]);
        let snapshot = RemoteSnapshot::from_records([remote("b.md", b"b", 20)]).unwrap();

        let state = fold(prior, &TouchedPaths::new(), &snapshot, &fs).await.unwrap();
        assert!(matches!(state.get("a.md"), Some(FileEntity::LinkedFile { .. })));
        assert!(matches!(state.get("b.md"), Some(FileEntity::RemoteOnly { .. })));
    }

    #[test]
    fn test_snapshot_collapses_to_latest_record() {
        let older = remote("a.md", b"1", 10);
        let newer = RemoteRecord {
            entry_time: 20,
            ..remote("a.md", b"2", 20)
        };
        let snapshot = RemoteSnapshot::from_records([newer.clone(), older]).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("a.md"), Some(&newer));
        assert_eq!(snapshot.max_entry_time(), Some(20));
    }

    #[test]
    fn test_snapshot_rejects_two_live_records_for_one_path() {
        let first = remote("a.md", b"1", 10);
        let second = RemoteRecord {
            remote_id: "other".into(),
            ..remote("a.md", b"2", 20)
        };
        let err = RemoteSnapshot::from_records([first, second]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
        assert_eq!(err.path.as_deref(), Some("a.md"));
    }

    #[test]
    fn test_snapshot_allows_recreate_after_tombstone() {
        let dead = RemoteRecord {
            remote_id: "old".into(),
            ..tombstone("a.md", 10)
        };
        let live = remote("a.md", b"again", 20);
        let snapshot = RemoteSnapshot::from_records([dead, live.clone()]).unwrap();
        assert_eq!(snapshot.get("a.md"), Some(&live));
    }

    #[test]
    fn test_snapshot_from_map_checks_keys() {
        let mut map = BTreeMap::new();
        map.insert("b.md".to_string(), remote("a.md", b"a", 1));
        let err = RemoteSnapshot::from_map(map).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_fold_never_produces_duplicate_paths() {
        let fs = InMemoryFs::new();
        fs.put("a.md", b"a", 1);
        fs.put("b.md", b"b", 1);
        let snapshot = RemoteSnapshot::from_records([
            remote("a.md", b"a", 5),
            remote("c.md", b"c", 5),
        ])
        .unwrap();

        let state = fold(
            StateMap::new(),
            &touched(&[("a.md", 2), ("b.md", 2), ("c.md", 2)]),
            &snapshot,
            &fs,
        )
        .await
        .unwrap();

        let paths: Vec<&str> = state.paths().collect();
        assert_eq!(paths, vec!["a.md", "b.md", "c.md"]);
        for entity in state.entities() {
            assert!(!entity.is_transient());
        }
    }

    #[tokio::test]
    async fn test_records_with_unsafe_paths_are_skipped() {
        let fs = InMemoryFs::new();
        let snapshot = RemoteSnapshot::from_records([
            remote("../escaped.md", b"x", 5),
            remote("/etc/passwd", b"x", 5),
            remote("notes/ok.md", b"ok", 5),
        ])
        .unwrap();

        let state = fold(StateMap::new(), &TouchedPaths::new(), &snapshot, &fs)
            .await
            .unwrap();
        let paths: Vec<&str> = state.paths().collect();
        assert_eq!(paths, vec!["notes/ok.md"]);
    }

    #[tokio::test]
    async fn test_old_records_fold_into_an_unknown_path() {
        let fs = InMemoryFs::new();
        let prior = state_of(vec![linked("a.md", b"a", 2_000, 2_000)]);
        // Written by a device whose clock runs behind everything already known.
        let snapshot = RemoteSnapshot::from_records([
            remote("a.md", b"a", 2_000),
            remote("b.md", b"b", 1_000),
        ])
        .unwrap();

        let state = fold(prior.clone(), &TouchedPaths::new(), &snapshot, &fs)
            .await
            .unwrap();
        assert_eq!(state.get("a.md"), prior.get("a.md"));
        assert!(matches!(
            state.get("b.md"),
            Some(FileEntity::RemoteOnly { local_time: 1_000, .. })
        ));
    }
}
