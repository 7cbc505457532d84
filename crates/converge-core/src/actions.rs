//! Action deriver: decide what each non-converged path needs.
//!
//! Conflicts are settled last-writer-wins by comparing the entity's
//! `local_time` with the remote record's `entry_time`. The two clocks belong
//! to different machines, so skew between them can pick the wrong winner.

use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use tracing::trace;

use crate::entity::{FileEntity, StateMap};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    /// Push a never-linked local file.
    Upload,
    /// Push newer local content over an existing record.
    UpdateRemote,
    /// Remove the local copy of a remotely deleted file.
    DeleteLocal,
    /// Tombstone the record of a locally deleted file.
    MarkRemoteDeleted,
    /// Write remote content locally.
    UpdateLocal,
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::Upload => "upload",
            ActionKind::UpdateRemote => "update-remote",
            ActionKind::DeleteLocal => "delete-local",
            ActionKind::MarkRemoteDeleted => "mark-remote-deleted",
            ActionKind::UpdateLocal => "update-local",
        };
        f.write_str(name)
    }
}

/// One unit of work, tagged with the entity it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub path: String,
    pub entity: FileEntity,
}

impl Action {
    /// Local time of the originating entity; the executor's ordering key.
    pub fn local_time(&self) -> u64 {
        self.entity.local_time().unwrap_or(0)
    }
}

/// The action one entity calls for, or `None` when it is converged.
pub fn action_for(entity: &FileEntity) -> Result<Option<ActionKind>> {
    let kind = match entity {
        FileEntity::LocalOnly { .. } => Some(ActionKind::Upload),

        FileEntity::LinkedFile { remote, .. } if remote.deleted => Some(ActionKind::DeleteLocal),
        FileEntity::LinkedFile {
            file_data,
            local_time,
            remote,
        } => {
            if file_data.content_hash == remote.content_hash {
                None
            } else if *local_time > remote.entry_time {
                Some(ActionKind::UpdateRemote)
            } else {
                Some(ActionKind::UpdateLocal)
            }
        }

        // Checked first so a settled tombstone is never marked again.
        FileEntity::RemoteOnly { remote, .. } if remote.deleted => None,
        FileEntity::RemoteOnly { local_time, remote, .. } if *local_time > remote.entry_time => {
            Some(ActionKind::MarkRemoteDeleted)
        }
        FileEntity::RemoteOnly { .. } => Some(ActionKind::UpdateLocal),

        FileEntity::LocalMissing { .. } | FileEntity::Invalid { .. } => {
            return Err(SyncError::internal(format!(
                "cannot derive an action from transient {} entity",
                entity.kind_name()
            ))
            .with_path(entity.path()));
        }
    };
    Ok(kind)
}

/// Walk the state map and emit one action per path that needs work.
pub fn derive(state: &StateMap) -> Result<Vec<Action>> {
    let mut actions = Vec::new();
    for entity in state.entities() {
        if let Some(kind) = action_for(entity)? {
            trace!("{} -> {}", entity.path(), kind);
            actions.push(Action {
                kind,
                path: entity.path().to_string(),
                entity: entity.clone(),
            });
        }
    }
    Ok(actions)
}
