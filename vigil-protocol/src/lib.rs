use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use vigil_error::{ApiStatus, ErrorCode};
use vigil_smi::{
    AttrValue, BadPageRecord, ComputePartitionType, DeviceTopology, EventCategory, EventId,
    EventSeverity, GpuSpec, GpuStats, GpuStatus, ObjKey, PerfLevel, ResetType, WatchAttrId,
    MAX_GPU,
};

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for one protocol line (64KB; GPU inventories are fat)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum number of GPU watch objects
pub const MAX_GPU_WATCH: usize = 128;

/// Maximum number of keys accepted in one request
pub const MAX_KEYS_PER_REQUEST: usize = 128;

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Wall-clock timestamp carried on events and samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub secs: u64,
    pub nanos: u32,
}

impl TimeSpec {
    pub fn now() -> Self {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs(),
                nanos: d.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

/// Per-GPU configuration update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuUpdateSpec {
    pub key: ObjKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overdrive_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perf_level: Option<PerfLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_freq: Option<Vec<vigil_smi::ClockFreqRange>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_cap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_partition_type: Option<ComputePartitionType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuResetSpec {
    pub key: ObjKey,
    pub reset_type: ResetType,
}

/// GPU watch group specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchSpec {
    pub key: ObjKey,
    /// GPUs to be monitored
    pub gpus: Vec<ObjKey>,
    /// attributes to be monitored
    pub attrs: Vec<WatchAttrId>,
}

/// Event get/subscribe filter; empty lists match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub events: Vec<EventId>,
    #[serde(default)]
    pub gpus: Vec<ObjKey>,
}

/// Synthetic event generation request (debug hook)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventGenSpec {
    pub events: Vec<EventId>,
    pub gpus: Vec<ObjKey>,
}

/// Runtime trace level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl TraceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::Error => "error",
            TraceLevel::Warn => "warn",
            TraceLevel::Info => "info",
            TraceLevel::Debug => "debug",
            TraceLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for TraceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(TraceLevel::Error),
            "warn" => Ok(TraceLevel::Warn),
            "info" => Ok(TraceLevel::Info),
            "debug" => Ok(TraceLevel::Debug),
            "trace" => Ok(TraceLevel::Trace),
            other => Err(format!("unknown trace level {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    GpuGet { keys: Vec<ObjKey> },
    GpuUpdate { specs: Vec<GpuUpdateSpec> },
    GpuReset { spec: GpuResetSpec },
    GpuComputePartitionGet { keys: Vec<ObjKey> },
    GpuBadPageGet { keys: Vec<ObjKey> },
    TopologyGet,
    WatchCreate { specs: Vec<WatchSpec> },
    WatchDelete { keys: Vec<ObjKey> },
    WatchGet { keys: Vec<ObjKey> },
    WatchSubscribe { keys: Vec<ObjKey> },
    EventGet { filter: EventFilter },
    EventGen { spec: EventGenSpec },
    EventSubscribe { filter: EventFilter },
    TraceGet,
    TraceUpdate { level: TraceLevel },
    TraceFlush,
}

impl Request {
    /// Validate request shape before dispatch; deep validation happens in
    /// the API engine
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping
            | Request::Version
            | Request::TopologyGet
            | Request::TraceGet
            | Request::TraceFlush
            | Request::TraceUpdate { .. } => Ok(()),

            Request::GpuGet { keys }
            | Request::GpuComputePartitionGet { keys }
            | Request::GpuBadPageGet { keys } => validate_key_list(keys, true),

            Request::GpuUpdate { specs } => {
                if specs.is_empty() {
                    return Err("update requires at least one GPU spec".into());
                }
                for spec in specs {
                    validate_key(&spec.key)?;
                }
                Ok(())
            }

            Request::GpuReset { spec } => validate_key(&spec.key),

            Request::WatchCreate { specs } => {
                if specs.is_empty() {
                    return Err("create requires at least one watch spec".into());
                }
                if specs.len() > MAX_GPU_WATCH {
                    return Err(format!(
                        "too many watch specs: {} > {}",
                        specs.len(),
                        MAX_GPU_WATCH
                    ));
                }
                for spec in specs {
                    validate_watch_spec(spec)?;
                }
                Ok(())
            }

            Request::WatchDelete { keys }
            | Request::WatchGet { keys }
            | Request::WatchSubscribe { keys } => validate_key_list(keys, false),

            Request::EventGet { filter } | Request::EventSubscribe { filter } => {
                validate_key_list(&filter.gpus, true)
            }

            Request::EventGen { spec } => {
                if spec.events.is_empty() || spec.gpus.is_empty() {
                    return Err("event generation requires events and GPUs".into());
                }
                validate_key_list(&spec.gpus, false)
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::GpuGet { .. } => "GpuGet",
            Request::GpuUpdate { .. } => "GpuUpdate",
            Request::GpuReset { .. } => "GpuReset",
            Request::GpuComputePartitionGet { .. } => "GpuComputePartitionGet",
            Request::GpuBadPageGet { .. } => "GpuBadPageGet",
            Request::TopologyGet => "TopologyGet",
            Request::WatchCreate { .. } => "WatchCreate",
            Request::WatchDelete { .. } => "WatchDelete",
            Request::WatchGet { .. } => "WatchGet",
            Request::WatchSubscribe { .. } => "WatchSubscribe",
            Request::EventGet { .. } => "EventGet",
            Request::EventGen { .. } => "EventGen",
            Request::EventSubscribe { .. } => "EventSubscribe",
            Request::TraceGet => "TraceGet",
            Request::TraceUpdate { .. } => "TraceUpdate",
            Request::TraceFlush => "TraceFlush",
        }
    }

    /// Whether this request opens a stream instead of a unary reply
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Request::EventSubscribe { .. } | Request::WatchSubscribe { .. }
        )
    }
}

pub fn validate_key(key: &ObjKey) -> Result<(), String> {
    if !key.valid() {
        return Err("key must not be all zeroes".into());
    }
    Ok(())
}

pub fn validate_key_list(keys: &[ObjKey], allow_empty: bool) -> Result<(), String> {
    if keys.is_empty() && !allow_empty {
        return Err("at least one key required".into());
    }
    if keys.len() > MAX_KEYS_PER_REQUEST {
        return Err(format!(
            "too many keys: {} > {}",
            keys.len(),
            MAX_KEYS_PER_REQUEST
        ));
    }
    for key in keys {
        validate_key(key)?;
    }
    Ok(())
}

pub fn validate_watch_spec(spec: &WatchSpec) -> Result<(), String> {
    validate_key(&spec.key)?;
    if spec.gpus.is_empty() {
        return Err("watch requires at least one GPU".into());
    }
    if spec.gpus.len() > MAX_GPU {
        return Err(format!("too many GPUs: {} > {}", spec.gpus.len(), MAX_GPU));
    }
    if spec.attrs.is_empty() {
        return Err("watch requires at least one attribute".into());
    }
    for gpu in &spec.gpus {
        validate_key(gpu)?;
    }
    Ok(())
}

// ============================================================================
// Response side
// ============================================================================

/// Full information of one GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub key: ObjKey,
    pub spec: GpuSpec,
    pub status: GpuStatus,
    pub stats: GpuStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputePartitionInfo {
    pub key: ObjKey,
    pub partition_id: u32,
    pub compute_partition_type: ComputePartitionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadPageInfo {
    pub gpu: ObjKey,
    pub records: Vec<BadPageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyInfo {
    pub gpu: ObjKey,
    #[serde(flatten)]
    pub topology: DeviceTopology,
}

/// One sampled (GPU, attribute) value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchAttrSample {
    pub id: WatchAttrId,
    pub timestamp: TimeSpec,
    pub gpu: ObjKey,
    pub value: AttrValue,
    pub units: String,
}

/// All samples of one GPU within a watch group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuWatchAttrs {
    pub gpu: ObjKey,
    pub attrs: Vec<WatchAttrSample>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WatchStatus {
    pub num_subscribers: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchStats {
    pub gpus: Vec<GpuWatchAttrs>,
}

/// Watch group spec, operational status and latest samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchInfo {
    pub spec: WatchSpec,
    pub status: WatchStatus,
    pub stats: WatchStats,
}

/// One delivered hardware event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: EventId,
    pub category: EventCategory,
    pub severity: EventSeverity,
    pub timestamp: TimeSpec,
    pub gpu: ObjKey,
    pub message: String,
}

/// Response data; exactly the fields relevant to the request are set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpus: Option<Vec<GpuInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions: Option<Vec<ComputePartitionInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bad_pages: Option<Vec<BadPageInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<Vec<TopologyInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watches: Option<Vec<WatchInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<EventInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_level: Option<TraceLevel>,
}

impl ResponseData {
    pub fn none() -> Self {
        Self::default()
    }
    pub fn string(v: String) -> Self {
        Self {
            value: Some(v),
            ..Self::default()
        }
    }
    pub fn gpu_list(g: Vec<GpuInfo>) -> Self {
        Self {
            gpus: Some(g),
            ..Self::default()
        }
    }
    pub fn partition_list(p: Vec<ComputePartitionInfo>) -> Self {
        Self {
            partitions: Some(p),
            ..Self::default()
        }
    }
    pub fn bad_page_list(b: Vec<BadPageInfo>) -> Self {
        Self {
            bad_pages: Some(b),
            ..Self::default()
        }
    }
    pub fn topology_list(t: Vec<TopologyInfo>) -> Self {
        Self {
            topology: Some(t),
            ..Self::default()
        }
    }
    pub fn watch_list(w: Vec<WatchInfo>) -> Self {
        Self {
            watches: Some(w),
            ..Self::default()
        }
    }
    pub fn event_list(e: Vec<EventInfo>) -> Self {
        Self {
            events: Some(e),
            ..Self::default()
        }
    }
    pub fn trace(level: TraceLevel) -> Self {
        Self {
            trace_level: Some(level),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    pub status: ApiStatus,
    #[serde(default, skip_serializing_if = "error_code_is_none")]
    pub error_code: ErrorCode,
    #[serde(flatten)]
    pub data: ResponseData,
}

fn error_code_is_none(code: &ErrorCode) -> bool {
    *code == ErrorCode::None
}

impl ResponseEnvelope {
    pub fn ok(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            status: ApiStatus::Ok,
            error_code: ErrorCode::None,
            data,
        }
    }

    pub fn failure(id: u64, status: ApiStatus, error_code: ErrorCode) -> Self {
        Self {
            id,
            status,
            error_code,
            data: ResponseData::none(),
        }
    }
}

/// One streamed item on a subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stream", content = "item")]
pub enum StreamItem {
    Event(EventInfo),
    Watch(WatchInfo),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// ID of the subscribe request this stream belongs to
    pub id: u64,
    #[serde(flatten)]
    pub item: StreamItem,
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_smi::gpu_uuid_with_host;

    fn key(i: u8) -> ObjKey {
        gpu_uuid_with_host(0x01020304, i, 0x1000 + i as u64)
    }

    #[test]
    fn request_envelope_round_trip() {
        let req = RequestEnvelope::new(Request::GpuGet {
            keys: vec![key(0), key(1)],
        });
        let line = serde_json::to_string(&req).unwrap();
        let back: RequestEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(back.id, req.id);
        match back.request {
            Request::GpuGet { keys } => assert_eq!(keys.len(), 2),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn request_tag_format() {
        let line = serde_json::to_string(&RequestEnvelope::with_id(Request::TopologyGet, 7))
            .unwrap();
        assert!(line.contains("\"cmd\":\"TopologyGet\""));
        assert!(line.contains("\"id\":7"));
    }

    #[test]
    fn validate_rejects_zero_keys() {
        let req = Request::GpuReset {
            spec: GpuResetSpec {
                key: ObjKey::zero(),
                reset_type: ResetType::Asic,
            },
        };
        assert!(req.validate().is_err());

        let req = Request::WatchDelete { keys: vec![] };
        assert!(req.validate().is_err());

        let req = Request::GpuGet { keys: vec![] };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn validate_watch_spec_shape() {
        let mut spec = WatchSpec {
            key: key(9),
            gpus: vec![key(0)],
            attrs: vec![WatchAttrId::GpuClock],
        };
        assert!(validate_watch_spec(&spec).is_ok());

        spec.attrs.clear();
        assert!(validate_watch_spec(&spec).is_err());

        spec.attrs.push(WatchAttrId::GpuTemp);
        spec.gpus.clear();
        assert!(validate_watch_spec(&spec).is_err());
    }

    #[test]
    fn response_skips_empty_error_code() {
        let rsp = ResponseEnvelope::ok(3, ResponseData::string("pong".into()));
        let line = serde_json::to_string(&rsp).unwrap();
        assert!(!line.contains("error_code"));
        assert!(line.contains("\"value\":\"pong\""));

        let rsp = ResponseEnvelope::failure(4, ApiStatus::Err, ErrorCode::OverdriveOutOfRange);
        let line = serde_json::to_string(&rsp).unwrap();
        assert!(line.contains("\"error_code\":\"overdrive_out_of_range\""));
    }

    #[test]
    fn stream_envelope_round_trip() {
        let ev = EventInfo {
            id: EventId::ThermalThrottle,
            category: EventCategory::Other,
            severity: EventSeverity::Info,
            timestamp: TimeSpec::now(),
            gpu: key(2),
            message: "clock dropped".into(),
        };
        let env = StreamEnvelope {
            id: 11,
            item: StreamItem::Event(ev),
        };
        let line = serde_json::to_string(&env).unwrap();
        let back: StreamEnvelope = serde_json::from_str(&line).unwrap();
        match back.item {
            StreamItem::Event(e) => {
                assert_eq!(e.severity, EventSeverity::Info);
                assert_eq!(e.gpu, key(2));
            }
            _ => panic!("wrong stream item"),
        }
    }
}
