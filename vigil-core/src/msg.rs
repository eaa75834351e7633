//! Typed messages routed between control-plane workers

use std::sync::Arc;

use vigil_error::{ApiStatus, ErrorCode};
use vigil_protocol::{EventGenSpec, GpuResetSpec, GpuUpdateSpec, WatchSpec};
use vigil_smi::{EventId, GpuHandle, ObjKey};

use crate::subscriber::{EventClientCtx, WatchClientCtx};

/// Worker endpoints addressable on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointId {
    /// API engine, the single configuration writer
    Api,
    /// event monitor
    EventMonitor,
    /// watch monitor
    WatchMonitor,
    #[cfg(test)]
    TestA,
    #[cfg(test)]
    TestB,
}

/// Message identifiers; point-to-point requests and broadcast topics share
/// the namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgId {
    /// configuration request for the API engine
    ApiRequest,
    /// event subscription hand-off to the event monitor
    EventSubscribe,
    /// synthetic event generation (debug hook)
    EventGen,
    /// watch subscription hand-off to the watch monitor
    WatchSubscribe,
    /// broadcast: drain parked subscribers, the process is going down
    Shutdown,
    #[cfg(test)]
    TestTopic,
}

/// API operations accepted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOp {
    Create,
    Update,
    Delete,
}

/// Parameters of one API request
#[derive(Clone)]
pub enum ApiParams {
    GpuUpdate(GpuUpdateSpec),
    GpuReset(GpuResetSpec),
    WatchCreate(WatchSpec),
    WatchDelete(ObjKey),
    /// increment subscriber refcount of the listed watch groups
    WatchSubscriberAdd(Vec<ObjKey>),
    /// decrement subscriber refcount of the listed watch groups
    WatchSubscriberRelease(Vec<ObjKey>),
}

impl ApiParams {
    /// Operation class this parameter set belongs with
    fn expected_op(&self) -> ApiOp {
        match self {
            ApiParams::WatchCreate(_) => ApiOp::Create,
            ApiParams::WatchDelete(_) => ApiOp::Delete,
            ApiParams::GpuUpdate(_)
            | ApiParams::GpuReset(_)
            | ApiParams::WatchSubscriberAdd(_)
            | ApiParams::WatchSubscriberRelease(_) => ApiOp::Update,
        }
    }
}

/// One configuration request posted to the API engine
#[derive(Clone)]
pub struct ApiMsg {
    pub op: ApiOp,
    pub params: ApiParams,
}

impl ApiMsg {
    pub fn new(op: ApiOp, params: ApiParams) -> Self {
        Self { op, params }
    }

    /// Basic validation: the operation must match the parameter set and
    /// create/update must carry a spec, delete a key
    pub fn validate(&self) -> Result<(), String> {
        if self.op != self.params.expected_op() {
            return Err(format!("operation {:?} does not match parameters", self.op));
        }
        match &self.params {
            ApiParams::GpuUpdate(spec) => {
                if !spec.key.valid() {
                    return Err("GPU update requires a valid key".into());
                }
            }
            ApiParams::GpuReset(spec) => {
                if !spec.key.valid() {
                    return Err("GPU reset requires a valid key".into());
                }
            }
            ApiParams::WatchCreate(spec) => {
                vigil_protocol::validate_watch_spec(spec)?;
            }
            ApiParams::WatchDelete(key) => {
                if !key.valid() {
                    return Err("watch delete requires a valid key".into());
                }
            }
            ApiParams::WatchSubscriberAdd(keys) | ApiParams::WatchSubscriberRelease(keys) => {
                if keys.is_empty() {
                    return Err("subscriber task requires at least one key".into());
                }
            }
        }
        Ok(())
    }
}

/// Event subscription hand-off, frontend to event monitor
#[derive(Clone)]
pub struct EventSubscribeArgs {
    pub client: Arc<EventClientCtx>,
    pub events: Vec<EventId>,
    pub gpus: Vec<GpuHandle>,
}

/// Synthetic event generation request
#[derive(Clone)]
pub struct EventGenArgs {
    pub events: Vec<EventId>,
    pub gpus: Vec<GpuHandle>,
}

impl EventGenArgs {
    pub fn from_spec(spec: &EventGenSpec, gpus: Vec<GpuHandle>) -> Self {
        Self {
            events: spec.events.clone(),
            gpus,
        }
    }
}

/// Watch subscription hand-off, frontend to watch monitor
#[derive(Clone)]
pub struct WatchSubscribeArgs {
    pub client: Arc<WatchClientCtx>,
    pub watch_ids: Vec<ObjKey>,
}

/// Payloads that flow on the bus
#[derive(Clone)]
pub enum Payload {
    Api(ApiMsg),
    EventSubscribe(EventSubscribeArgs),
    EventGen(EventGenArgs),
    WatchSubscribe(WatchSubscribeArgs),
    /// reply carrying the API status and detail code
    Status(ApiStatus, ErrorCode),
    Shutdown,
    None,
}

impl Payload {
    pub fn ok() -> Self {
        Payload::Status(ApiStatus::Ok, ErrorCode::None)
    }

    /// Interpret this payload as a status reply
    pub fn as_status(&self) -> (ApiStatus, ErrorCode) {
        match self {
            Payload::Status(status, code) => (*status, *code),
            _ => (ApiStatus::Err, ErrorCode::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_smi::gpu_uuid_with_host;

    #[test]
    fn api_msg_validation_catches_op_mismatch() {
        let key = gpu_uuid_with_host(1, 0, 2);
        let msg = ApiMsg::new(ApiOp::Create, ApiParams::WatchDelete(key));
        assert!(msg.validate().is_err());

        let msg = ApiMsg::new(ApiOp::Delete, ApiParams::WatchDelete(key));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn api_msg_validation_requires_valid_keys() {
        let msg = ApiMsg::new(
            ApiOp::Update,
            ApiParams::GpuUpdate(GpuUpdateSpec {
                key: ObjKey::zero(),
                ..Default::default()
            }),
        );
        assert!(msg.validate().is_err());
    }
}
