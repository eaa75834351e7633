//! GPU device data types
//!
//! Vendor-neutral spec/status/stats structures filled by an SMI backend.

use serde::{Deserialize, Serialize};

/// Opaque per-device handle assigned by the backend at discovery time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuHandle(pub u64);

/// One device reported by `SmiBackend::discover`
#[derive(Debug, Clone, Copy)]
pub struct DiscoveredGpu {
    pub handle: GpuHandle,
    /// hardware unique identifier, folded into the GPU uuid
    pub unique_id: u64,
}

/// Clock domains a GPU exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockType {
    System,
    Memory,
    Video,
    Data,
}

impl std::fmt::Display for ClockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockType::System => write!(f, "sclk"),
            ClockType::Memory => write!(f, "mclk"),
            ClockType::Video => write!(f, "vclk"),
            ClockType::Data => write!(f, "dclk"),
        }
    }
}

/// Performance level knob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfLevel {
    Auto,
    Low,
    High,
    Deterministic,
    Manual,
}

impl Default for PerfLevel {
    fn default() -> Self {
        PerfLevel::Auto
    }
}

/// Compute partition scheme of the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePartitionType {
    Spx,
    Dpx,
    Tpx,
    Qpx,
    Cpx,
}

impl Default for ComputePartitionType {
    fn default() -> Self {
        ComputePartitionType::Spx
    }
}

/// Requested frequency range for one clock domain (MHz)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockFreqRange {
    pub clock_type: ClockType,
    pub lo: u32,
    pub hi: u32,
}

/// Configurable state of a GPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuSpec {
    /// overdrive percentage, 0 disables overdrive
    pub overdrive_level: u32,
    pub perf_level: PerfLevel,
    /// per-clock-domain frequency ranges
    pub clock_freq: Vec<ClockFreqRange>,
    /// power cap in Watts
    pub power_cap: u64,
    pub compute_partition_type: ComputePartitionType,
}

impl Default for GpuSpec {
    fn default() -> Self {
        Self {
            overdrive_level: 0,
            perf_level: PerfLevel::Auto,
            clock_freq: Vec::new(),
            power_cap: 0,
            compute_partition_type: ComputePartitionType::Spx,
        }
    }
}

/// Field-select mask for `SmiBackend::update`
pub mod upd {
    pub const OVERDRIVE: u64 = 1 << 0;
    pub const PERF_LEVEL: u64 = 1 << 1;
    pub const CLOCK_FREQ: u64 = 1 << 2;
    pub const POWER_CAP: u64 = 1 << 3;
    pub const COMPUTE_PARTITION: u64 = 1 << 4;
}

/// One firmware component/version pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwVersion {
    pub firmware: String,
    pub version: String,
}

/// Observed state of one clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockStatus {
    pub clock_type: ClockType,
    /// current frequency in MHz
    pub frequency: u32,
    pub locked: bool,
    pub deep_sleep: bool,
}

/// PCIe slot form factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcieSlotType {
    Pcie,
    Oam,
    Cem,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcieStatus {
    pub pcie_bus_id: String,
    pub slot_type: PcieSlotType,
    /// negotiated lane count
    pub width: u32,
    pub max_width: u32,
    /// negotiated speed in GT/s
    pub speed: u32,
    pub max_speed: u32,
    /// measured bandwidth in MB/s
    pub bandwidth: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VramType {
    Hbm,
    Gddr6,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VramVendor {
    Hynix,
    Samsung,
    Micron,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramStatus {
    #[serde(rename = "type")]
    pub vram_type: VramType,
    pub vendor: VramVendor,
    /// size in MB
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XgmiErrorStatus {
    NoError,
    OneError,
    MultipleErrors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XgmiStatus {
    pub error_status: XgmiErrorStatus,
}

/// Operational state of a GPU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuStatus {
    /// linear index assigned at discovery
    pub index: u32,
    pub serial_num: String,
    pub card_series: String,
    pub card_model: String,
    pub card_vendor: String,
    pub card_sku: String,
    pub driver_version: String,
    pub vbios_part_number: String,
    pub vbios_version: String,
    pub firmware: Vec<FwVersion>,
    pub memory_vendor: String,
    pub clock_status: Vec<ClockStatus>,
    pub pcie_status: PcieStatus,
    pub vram_status: VramStatus,
    pub xgmi_status: XgmiStatus,
    pub partition_id: u32,
}

/// Usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuUsage {
    pub gfx_activity: u64,
    pub umc_activity: u64,
    pub mm_activity: u64,
}

/// VRAM accounting, all sizes in MB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramUsage {
    pub total_vram: u64,
    pub used_vram: u64,
    pub free_vram: u64,
    pub total_visible_vram: u64,
    pub used_visible_vram: u64,
    pub free_visible_vram: u64,
    pub total_gtt: u64,
    pub used_gtt: u64,
    pub free_gtt: u64,
}

/// Live counters of a GPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuStats {
    /// average package power in Watts
    pub avg_package_power: u64,
    /// instantaneous package power in Watts
    pub package_power: u64,
    pub usage: GpuUsage,
    pub vram_usage: VramUsage,
    /// energy consumed in micro-Joules
    pub energy_consumed: u64,
}

/// GPU reset flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetType {
    Asic,
    ComputePartition,
    PowerProfile,
}

/// Device link flavor in the topology graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoLinkType {
    Xgmi,
    Pcie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Gpu,
    Cpu,
}

/// One peer edge in the device topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTopology {
    pub peer: String,
    pub device_type: DeviceType,
    pub num_hops: u32,
    pub link_type: IoLinkType,
    pub link_weight: u64,
}

/// Topology of one device towards its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTopology {
    /// device name, e.g. "GPU3"
    pub device: String,
    pub peers: Vec<PeerTopology>,
}

/// Retirement state of a VRAM page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Reserved,
    Pending,
    Unreservable,
}

/// One retired/bad VRAM page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadPageRecord {
    pub page_address: u64,
    pub page_size: u64,
    pub page_status: PageStatus,
}
