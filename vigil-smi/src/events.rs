//! Asynchronous hardware events
//!
//! The backend reports raw events as `{handle, id, message}` tuples; the
//! event identifier set is closed and each id carries a fixed category and
//! severity.

use serde::{Deserialize, Serialize};

use crate::types::GpuHandle;

/// Maximum length of an event description
pub const MAX_EVENT_STR: usize = 128;

/// Closed set of hardware event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventId {
    /// VM page fault observed on the device
    VmPageFault,
    /// clock frequency decreased due to temperature rise
    ThermalThrottle,
    /// GPU reset about to happen
    GpuPreReset,
    /// GPU reset happened
    GpuPostReset,
    /// GPU command ring hang
    RingHang,
}

impl EventId {
    /// All known event ids, in identifier order
    pub const ALL: [EventId; 5] = [
        EventId::VmPageFault,
        EventId::ThermalThrottle,
        EventId::GpuPreReset,
        EventId::GpuPostReset,
        EventId::RingHang,
    ];

    pub fn category(&self) -> EventCategory {
        // no XGMI events in the current id set
        EventCategory::Other
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            EventId::VmPageFault => EventSeverity::Warn,
            EventId::ThermalThrottle => EventSeverity::Info,
            EventId::GpuPreReset => EventSeverity::Warn,
            EventId::GpuPostReset => EventSeverity::Info,
            EventId::RingHang => EventSeverity::Critical,
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventId::VmPageFault => "vm-page-fault",
            EventId::ThermalThrottle => "thermal-throttle",
            EventId::GpuPreReset => "gpu-pre-reset",
            EventId::GpuPostReset => "gpu-post-reset",
            EventId::RingHang => "ring-hang",
        };
        write!(f, "{}", s)
    }
}

/// Event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Xgmi,
    Other,
}

/// Event severities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Debug,
    Info,
    Warn,
    Critical,
}

/// One raw event as delivered by the backend poll
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub handle: GpuHandle,
    pub id: EventId,
    pub message: String,
}
