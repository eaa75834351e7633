//! SMI backend abstraction for Vigil
//!
//! The agent core talks to GPU hardware exclusively through the
//! [`SmiBackend`] capability trait. Any implementation that can enumerate
//! devices, fill spec/status/stats, apply updates and resets, report
//! topology, deliver raw event batches and read watch attributes satisfies
//! the core; the in-tree [`MockSmi`] is one such implementation, the vendor
//! management library is another.

pub mod attrs;
pub mod events;
pub mod key;
pub mod mock;
pub mod types;

pub use attrs::{AttrValue, AttrValueType, WatchAttrId, MAX_WATCH_ATTR_STR};
pub use events::{EventCategory, EventId, EventSeverity, RawEvent, MAX_EVENT_STR};
pub use key::{gpu_idx_from_uuid, gpu_uuid, gpu_uuid_with_host, ObjKey};
pub use mock::MockSmi;
pub use types::*;

use vigil_error::SmiResult;

/// Maximum number of GPUs in a compute node
pub const MAX_GPU: usize = 16;

/// Capability surface of the system-management backend
///
/// Implementations must be safe to call from multiple threads; read paths
/// are invoked concurrently from RPC workers while monitors poll.
pub trait SmiBackend: Send + Sync {
    /// Enumerate devices; called once at startup
    fn discover(&self) -> SmiResult<Vec<DiscoveredGpu>>;

    /// Fill the configurable state of a device
    fn fill_spec(&self, handle: GpuHandle) -> SmiResult<GpuSpec>;

    /// Fill the operational state of a device
    fn fill_status(&self, handle: GpuHandle, gpu_id: u32) -> SmiResult<GpuStatus>;

    /// Fill the live counters of a device
    fn fill_stats(&self, handle: GpuHandle) -> SmiResult<GpuStats>;

    /// Reset the device
    fn reset(&self, handle: GpuHandle, reset_type: ResetType) -> SmiResult<()>;

    /// Apply the spec fields selected by `mask` (see [`types::upd`])
    fn update(&self, handle: GpuHandle, spec: &GpuSpec, mask: u64) -> SmiResult<()>;

    /// Fill per-peer topology of the device
    fn fill_topology(&self, handle: GpuHandle) -> SmiResult<DeviceTopology>;

    /// Current partition id of the device
    fn partition_id(&self, handle: GpuHandle) -> SmiResult<u32>;

    /// Retired VRAM pages of the device
    fn bad_pages(&self, handle: GpuHandle) -> SmiResult<Vec<BadPageRecord>>;

    /// Batch of events observed since the last call; may be empty
    fn event_poll(&self) -> Vec<RawEvent>;

    /// Typed value of one watchable attribute
    fn attr_read(&self, handle: GpuHandle, attr: WatchAttrId) -> SmiResult<AttrValue>;
}
