//! File entity model: what we currently believe about each path.
//!
//! `FileEntity` is a closed sum type. Three variants are persisted in the
//! `StateMap`; `LocalMissing` and `Invalid` only exist while local
//! observations are being folded and are rejected by the map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::Millis;
use crate::device_id::DeviceId;
use crate::error::{Result, SyncError};
use crate::hash::ContentHash;

/// Local view of a file's metadata and content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub full_path: String,
    pub created_at: Millis,
    pub modified_at: Millis,
    pub size: u64,
    /// File name without directory or extension.
    pub base_name: String,
    /// Extension without the leading dot; empty when there is none.
    pub extension: String,
    pub deleted: bool,
    pub content_hash: ContentHash,
}

impl FileData {
    /// Describe `content` stored at `path`.
    pub fn from_content(path: &str, content: &[u8], created_at: Millis, modified_at: Millis) -> Self {
        let (base_name, extension) = split_name(path);
        Self {
            full_path: path.to_string(),
            created_at,
            modified_at,
            size: content.len() as u64,
            base_name,
            extension,
            deleted: false,
            content_hash: ContentHash::from_bytes(content),
        }
    }
}

fn split_name(path: &str) -> (String, String) {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        // A leading dot (".gitignore") is part of the name, not an extension.
        Some(pos) if pos > 0 => (name[..pos].to_string(), name[pos + 1..].to_string()),
        _ => (name.to_string(), String::new()),
    }
}

/// Who wrote a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub device_id: DeviceId,
    pub user_id: String,
    pub vault_id: String,
    pub sync_config_id: String,
}

/// Where a record's compressed content lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Payload {
    /// Compressed bytes stored in the document itself.
    Inline(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Locator of compressed bytes in the blob store.
    BlobRef(String),
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// The document the remote store holds for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub remote_id: String,
    /// When the store accepted this record; the authority's logical clock.
    pub entry_time: Millis,
    pub content_hash: ContentHash,
    pub deleted: bool,
    pub path: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    pub provenance: Provenance,
    pub payload: Payload,
}

/// Per-path convergence state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FileEntity {
    /// Exists locally, never linked to a remote record.
    #[serde(rename_all = "camelCase")]
    LocalOnly { file_data: FileData, local_time: Millis },
    /// Exists on both sides; `file_data` is the local view, `remote` the last
    /// known remote record.
    #[serde(rename_all = "camelCase")]
    LinkedFile {
        file_data: FileData,
        local_time: Millis,
        remote: RemoteRecord,
    },
    /// No local file. `local_time` is the remote entry time when never seen
    /// locally, or the time a local deletion was detected.
    #[serde(rename_all = "camelCase")]
    RemoteOnly {
        path: String,
        local_time: Millis,
        remote: RemoteRecord,
    },
    /// Transient: a local deletion was just observed.
    #[serde(rename_all = "camelCase")]
    LocalMissing { path: String, local_time: Millis },
    /// Transient: the path is excluded by policy.
    Invalid { path: String },
}

impl FileEntity {
    pub fn path(&self) -> &str {
        match self {
            FileEntity::LocalOnly { file_data, .. } | FileEntity::LinkedFile { file_data, .. } => {
                &file_data.full_path
            }
            FileEntity::RemoteOnly { path, .. }
            | FileEntity::LocalMissing { path, .. }
            | FileEntity::Invalid { path } => path,
        }
    }

    /// The local authority's logical clock for this path. `Invalid` has none.
    pub fn local_time(&self) -> Option<Millis> {
        match self {
            FileEntity::LocalOnly { local_time, .. }
            | FileEntity::LinkedFile { local_time, .. }
            | FileEntity::RemoteOnly { local_time, .. }
            | FileEntity::LocalMissing { local_time, .. } => Some(*local_time),
            FileEntity::Invalid { .. } => None,
        }
    }

    pub fn remote(&self) -> Option<&RemoteRecord> {
        match self {
            FileEntity::LinkedFile { remote, .. } | FileEntity::RemoteOnly { remote, .. } => {
                Some(remote)
            }
            _ => None,
        }
    }

    pub fn file_data(&self) -> Option<&FileData> {
        match self {
            FileEntity::LocalOnly { file_data, .. } | FileEntity::LinkedFile { file_data, .. } => {
                Some(file_data)
            }
            _ => None,
        }
    }

    /// Whether this variant may only exist mid-fold.
    pub fn is_transient(&self) -> bool {
        matches!(self, FileEntity::LocalMissing { .. } | FileEntity::Invalid { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FileEntity::LocalOnly { .. } => "LocalOnly",
            FileEntity::LinkedFile { .. } => "LinkedFile",
            FileEntity::RemoteOnly { .. } => "RemoteOnly",
            FileEntity::LocalMissing { .. } => "LocalMissing",
            FileEntity::Invalid { .. } => "Invalid",
        }
    }
}

/// Path → entity map; the durable state of a vault.
///
/// Entities are keyed by their own path, so a path can never hold two
/// entities, and transient variants are refused on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, FileEntity>",
    into = "BTreeMap<String, FileEntity>"
)]
pub struct StateMap {
    entities: BTreeMap<String, FileEntity>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity under its own path, returning the one it replaced.
    pub fn insert(&mut self, entity: FileEntity) -> Result<Option<FileEntity>> {
        if entity.is_transient() {
            return Err(SyncError::internal(format!(
                "transient {} entity cannot be stored",
                entity.kind_name()
            ))
            .with_path(entity.path()));
        }
        Ok(self.entities.insert(entity.path().to_string(), entity))
    }

    pub fn get(&self, path: &str) -> Option<&FileEntity> {
        self.entities.get(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntity> {
        self.entities.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entities.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn entities(&self) -> impl Iterator<Item = &FileEntity> {
        self.entities.values()
    }
}

impl TryFrom<BTreeMap<String, FileEntity>> for StateMap {
    type Error = SyncError;

    fn try_from(entries: BTreeMap<String, FileEntity>) -> Result<Self> {
        let mut map = StateMap::new();
        for (key, entity) in entries {
            if key != entity.path() {
                return Err(SyncError::internal(format!(
                    "entity stored under {key} describes {}",
                    entity.path()
                ))
                .with_path(key));
            }
            map.insert(entity)?;
        }
        Ok(map)
    }
}

impl From<StateMap> for BTreeMap<String, FileEntity> {
    fn from(map: StateMap) -> Self {
        map.entities
    }
}

impl IntoIterator for StateMap {
    type Item = FileEntity;
    type IntoIter = std::collections::btree_map::IntoValues<String, FileEntity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_values()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn provenance() -> Provenance {
        Provenance {
            device_id: DeviceId::from(1u64),
            user_id: "user".into(),
            vault_id: "vault".into(),
            sync_config_id: "default".into(),
        }
    }

    pub fn file_data(path: &str, content: &[u8]) -> FileData {
        FileData::from_content(path, content, 1, 1)
    }

    pub fn remote(path: &str, content: &[u8], entry_time: Millis) -> RemoteRecord {
        RemoteRecord {
            remote_id: format!("r-{path}"),
            entry_time,
            content_hash: ContentHash::from_bytes(content),
            deleted: false,
            path: path.to_string(),
            size: content.len() as u64,
            provenance: provenance(),
            payload: Payload::Inline(Vec::new()),
        }
    }

    pub fn tombstone(path: &str, entry_time: Millis) -> RemoteRecord {
        RemoteRecord {
            deleted: true,
            ..remote(path, b"", entry_time)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_split_name() {
        let data = file_data("notes/daily/2024-01-01.md", b"x");
        assert_eq!(data.base_name, "2024-01-01");
        assert_eq!(data.extension, "md");

        let hidden = file_data(".gitignore", b"x");
        assert_eq!(hidden.base_name, ".gitignore");
        assert_eq!(hidden.extension, "");

        let archive = file_data("a/b.tar.gz", b"x");
        assert_eq!(archive.base_name, "b.tar");
        assert_eq!(archive.extension, "gz");
    }

    #[test]
    fn test_state_map_rejects_transient_entities() {
        let mut map = StateMap::new();
        let err = map
            .insert(FileEntity::LocalMissing {
                path: "a.md".into(),
                local_time: 5,
            })
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Internal);
        assert!(map.insert(FileEntity::Invalid { path: "b.md".into() }).is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn test_state_map_one_entity_per_path() {
        let mut map = StateMap::new();
        map.insert(FileEntity::LocalOnly {
            file_data: file_data("a.md", b"one"),
            local_time: 1,
        })
        .unwrap();
        let replaced = map
            .insert(FileEntity::RemoteOnly {
                path: "a.md".into(),
                local_time: 2,
                remote: remote("a.md", b"one", 2),
            })
            .unwrap();
        assert!(matches!(replaced, Some(FileEntity::LocalOnly { .. })));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_state_map_serde_preserves_variants() {
        let mut map = StateMap::new();
        map.insert(FileEntity::LocalOnly {
            file_data: file_data("a.md", b"a"),
            local_time: 10,
        })
        .unwrap();
        map.insert(FileEntity::LinkedFile {
            file_data: file_data("b.md", b"b"),
            local_time: 20,
            remote: RemoteRecord {
                payload: Payload::Inline(vec![0, 159, 255]),
                ..remote("b.md", b"b", 15)
            },
        })
        .unwrap();
        map.insert(FileEntity::RemoteOnly {
            path: "c.md".into(),
            local_time: 30,
            remote: RemoteRecord {
                payload: Payload::BlobRef("blob-1".into()),
                ..tombstone("c.md", 25)
            },
        })
        .unwrap();

        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("\"kind\":\"localOnly\""));
        assert!(json.contains("\"kind\":\"linkedFile\""));
        assert!(json.contains("\"kind\":\"remoteOnly\""));

        let parsed: StateMap = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn test_state_map_deserialize_rejects_transient_and_mismatched_keys() {
        let transient = r#"{"a.md":{"kind":"invalid","path":"a.md"}}"#;
        assert!(serde_json::from_str::<StateMap>(transient).is_err());

        let entity = FileEntity::LocalOnly {
            file_data: file_data("a.md", b"a"),
            local_time: 1,
        };
        let mut raw = BTreeMap::new();
        raw.insert("other.md".to_string(), entity);
        let json = serde_json::to_string(&raw).unwrap();
        assert!(serde_json::from_str::<StateMap>(&json).is_err());
    }
}
