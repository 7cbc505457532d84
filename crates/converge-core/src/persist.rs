//! Versioned JSON encoding of the state map and remote watermark.
//!
//! The schema version lives in an explicit `SchemaVersioning` value handed to
//! the codec, so hosts (and tests) can pin or widen the accepted versions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::clock::Millis;
use crate::entity::StateMap;
use crate::error::{ErrorKind, Result, SyncError};

/// Version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Which schema version is written and which are accepted on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersioning {
    current: u32,
    accepted: BTreeSet<u32>,
}

impl SchemaVersioning {
    /// Write `current` and accept only `current`.
    pub fn new(current: u32) -> Self {
        Self {
            current,
            accepted: BTreeSet::from([current]),
        }
    }

    /// Also accept `version` on read.
    pub fn accepting(mut self, version: u32) -> Self {
        self.accepted.insert(version);
        self
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn is_supported(&self, version: u32) -> bool {
        self.accepted.contains(&version)
    }

    fn check(&self, version: u32) -> Result<()> {
        if self.is_supported(version) {
            Ok(())
        } else {
            Err(SyncError::new(
                ErrorKind::InvalidArgument,
                format!(
                    "unsupported state schema version {version} (this build writes {})",
                    self.current
                ),
            ))
        }
    }
}

impl Default for SchemaVersioning {
    fn default() -> Self {
        Self::new(CURRENT_SCHEMA_VERSION)
    }
}

/// Decoded state file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub schema_version: u32,
    /// Largest remote `entry_time` folded so far.
    pub watermark: Millis,
    pub entities: StateMap,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedStateRef<'a> {
    schema_version: u32,
    watermark: Millis,
    entities: &'a StateMap,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Header {
    schema_version: u32,
}

pub struct StateCodec {
    versioning: SchemaVersioning,
}

impl StateCodec {
    pub fn new(versioning: SchemaVersioning) -> Self {
        Self { versioning }
    }

    pub fn versioning(&self) -> &SchemaVersioning {
        &self.versioning
    }

    pub fn encode(&self, entities: &StateMap, watermark: Millis) -> Result<Vec<u8>> {
        let doc = PersistedStateRef {
            schema_version: self.versioning.current(),
            watermark,
            entities,
        };
        serde_json::to_vec_pretty(&doc)
            .map_err(|e| SyncError::internal(format!("failed to encode state: {e}")))
    }

    /// Decode a state file, checking the version before the body is parsed.
    pub fn decode(&self, bytes: &[u8]) -> Result<PersistedState> {
        let header: Header = serde_json::from_slice(bytes).map_err(invalid)?;
        self.versioning.check(header.schema_version)?;

        let state: PersistedState = serde_json::from_slice(bytes).map_err(invalid)?;
        debug!(
            "decoded state v{}: {} entities, watermark {}",
            state.schema_version,
            state.entities.len(),
            state.watermark
        );
        Ok(state)
    }
}

impl Default for StateCodec {
    fn default() -> Self {
        Self::new(SchemaVersioning::default())
    }
}

fn invalid(err: serde_json::Error) -> SyncError {
    SyncError::new(ErrorKind::InvalidArgument, format!("malformed state file: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FileEntity;
    use crate::entity::fixtures::{file_data, remote, tombstone};

    fn sample_state() -> StateMap {
        let mut state = StateMap::new();
        state
            .insert(FileEntity::LocalOnly {
                file_data: file_data("new.md", b"fresh"),
                local_time: 10,
            })
            .unwrap();
        state
            .insert(FileEntity::LinkedFile {
                file_data: file_data("notes/a.md", b"same"),
                local_time: 20,
                remote: remote("notes/a.md", b"same", 30),
            })
            .unwrap();
        state
            .insert(FileEntity::RemoteOnly {
                path: "gone.md".into(),
                local_time: 40,
                remote: tombstone("gone.md", 50),
            })
            .unwrap();
        state
    }

    #[test]
    fn test_state_survives_encode_and_decode() {
        let codec = StateCodec::default();
        let state = sample_state();

        let bytes = codec.encode(&state, 50).unwrap();
        let decoded = codec.decode(&bytes).unwrap();

        assert_eq!(decoded.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(decoded.watermark, 50);
        assert_eq!(decoded.entities, state);
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let bytes = StateCodec::new(SchemaVersioning::new(2))
            .encode(&sample_state(), 0)
            .unwrap();

        let err = StateCodec::default().decode(&bytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(err.message.contains("version 2"));
    }

    #[test]
    fn test_accepting_older_version() {
        let old = StateCodec::new(SchemaVersioning::new(1))
            .encode(&sample_state(), 7)
            .unwrap();

        let codec = StateCodec::new(SchemaVersioning::new(2).accepting(1));
        assert_eq!(codec.decode(&old).unwrap().watermark, 7);
    }

    #[test]
    fn test_version_is_checked_before_body() {
        let codec = StateCodec::default();
        let err = codec
            .decode(br#"{"schemaVersion": 9, "entities": "not a map"}"#)
            .unwrap_err();
        assert!(err.message.contains("version 9"));
    }

    #[test]
    fn test_malformed_input() {
        let err = StateCodec::default().decode(b"{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_transient_entities_in_file_are_rejected() {
        let json = br#"{
            "schemaVersion": 1,
            "watermark": 0,
            "entities": { "a.md": { "kind": "invalid", "path": "a.md" } }
        }"#;
        let err = StateCodec::default().decode(json).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
