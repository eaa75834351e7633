//! Stored API objects

use vigil_protocol::{GpuInfo, WatchSpec};
use vigil_smi::{GpuHandle, GpuSpec, GpuStats, GpuStatus, ObjKey};

/// One physical GPU; created at startup enumeration, never destroyed
pub struct GpuEntry {
    pub index: u32,
    pub handle: GpuHandle,
    pub key: ObjKey,
    pub spec: GpuSpec,
    pub status: GpuStatus,
}

impl GpuEntry {
    /// Assemble the full info view with freshly read counters
    pub fn to_info(&self, stats: GpuStats) -> GpuInfo {
        GpuInfo {
            key: self.key,
            spec: self.spec.clone(),
            status: self.status.clone(),
            stats,
        }
    }
}

/// One GPU watch group; created and deleted through the API engine
pub struct WatchEntry {
    pub spec: WatchSpec,
    /// streaming subscribers attached to this group; the group is deletable
    /// only at zero
    pub num_subscribers: u32,
}

impl WatchEntry {
    pub fn new(spec: WatchSpec) -> Self {
        Self {
            spec,
            num_subscribers: 0,
        }
    }
}
