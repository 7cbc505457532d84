//! Engine configuration.

use crate::device_id::DeviceId;
use crate::entity::Provenance;
use crate::filter::PathFilter;
use crate::payload::INLINE_THRESHOLD;

/// Default number of actions admitted per cycle.
pub const DEFAULT_QUOTA: usize = 50;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of actions executed in one cycle.
    pub quota: usize,
    /// Compressed payloads smaller than this many bytes are stored inline.
    pub inline_threshold: usize,
    /// Only remote records under this path prefix belong to this vault.
    pub remote_prefix: String,
    /// Remote records for excluded paths are never materialized.
    pub filter: PathFilter,
    /// Stamped on every record this device writes.
    pub provenance: Provenance,
}

impl SyncConfig {
    pub fn new(provenance: Provenance) -> Self {
        Self {
            quota: DEFAULT_QUOTA,
            inline_threshold: INLINE_THRESHOLD,
            remote_prefix: String::new(),
            filter: PathFilter::new(),
            provenance,
        }
    }

    /// Config for a device with default user, vault, and config ids.
    pub fn for_device(device_id: DeviceId) -> Self {
        Self::new(Provenance {
            device_id,
            user_id: "local".into(),
            vault_id: "default".into(),
            sync_config_id: "default".into(),
        })
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_remote_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.remote_prefix = prefix.into();
        self
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::for_device(DeviceId::generate())
    }
}
