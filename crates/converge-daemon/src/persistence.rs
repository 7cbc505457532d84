//! Persistence for engine state and device identity.
//!
//! The state map and remote watermark are stored in `.sync/state.json`, and
//! the device id in `.sync/device_id`, both within the vault directory.

use anyhow::{Context, Result};
use converge_core::clock::Millis;
use converge_core::device_id::DeviceId;
use converge_core::entity::StateMap;
use converge_core::filter::SYNC_DIR;
use converge_core::persist::{PersistedState, StateCodec};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Storage for the persisted state map.
pub struct StateStorage {
    path: PathBuf,
    codec: StateCodec,
}

impl StateStorage {
    /// Storage at `.sync/state.json` within the vault.
    pub fn new(vault_path: &Path, codec: StateCodec) -> Self {
        Self {
            path: vault_path.join(SYNC_DIR).join("state.json"),
            codec,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state, or `None` on first run.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let state = self
            .codec
            .decode(&bytes)
            .with_context(|| format!("decoding {}", self.path.display()))?;
        Ok(Some(state))
    }

    /// Save the state map and watermark, replacing the file atomically.
    pub fn save(&self, entities: &StateMap, watermark: Millis) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = self.codec.encode(entities, watermark)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Read the vault's device id, generating and saving one on first run.
pub fn load_or_create_device_id(vault_path: &Path) -> Result<DeviceId> {
    let path = vault_path.join(SYNC_DIR).join("device_id");
    if path.exists() {
        let text = fs::read_to_string(&path)?;
        let id = text
            .trim()
            .parse::<DeviceId>()
            .with_context(|| format!("parsing {}", path.display()))?;
        return Ok(id);
    }

    let id = DeviceId::generate();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, id.to_string())?;
    info!("Generated device ID: {}", id);
    Ok(id)
}
