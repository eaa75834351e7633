//! Frontend API
//!
//! The functions the RPC server calls into. Mutations are posted over the
//! bus to the API engine and awaited synchronously; reads go straight to
//! the stores and tolerate the mutation latch. Subscriptions register a
//! client context with the relevant monitor and then park the calling
//! thread until the monitor marks the context inactive.

use std::sync::Arc;

use tracing::{debug, info};
use vigil_error::{ApiError, ApiStatus, ErrorCode};
use vigil_protocol::{
    BadPageInfo, ComputePartitionInfo, EventFilter, EventGenSpec, EventInfo, GpuInfo,
    GpuResetSpec, GpuUpdateSpec, TopologyInfo, WatchInfo, WatchSpec, WatchStats, WatchStatus,
};
use vigil_smi::{EventId, GpuHandle, ObjKey};

use crate::msg::{
    ApiMsg, ApiOp, ApiParams, EndpointId, EventGenArgs, EventSubscribeArgs, MsgId, Payload,
    WatchSubscribeArgs,
};
use crate::store::WalkAction;
use crate::subscriber::{EventClientCtx, WatchClientCtx};
use crate::system::System;

/// Post one message to the API engine and await the result pair
fn post_api(sys: &System, msg: ApiMsg) -> (ApiStatus, ErrorCode) {
    match sys.bus().blocking_request(
        EndpointId::Api,
        MsgId::ApiRequest,
        Payload::Api(msg),
        sys.config().api_timeout,
    ) {
        Some(reply) => reply.as_status(),
        None => (ApiStatus::Err, ErrorCode::Unknown),
    }
}

/// Resolve GPU keys to backend handles; an empty key list means every GPU
fn resolve_gpu_handles(sys: &System, keys: &[ObjKey]) -> Result<Vec<GpuHandle>, ApiError> {
    if keys.is_empty() {
        let mut handles = Vec::new();
        sys.gpu_store().walk(|_, entry| {
            handles.push(entry.read().handle);
            WalkAction::Continue
        });
        return Ok(handles);
    }
    let mut handles = Vec::with_capacity(keys.len());
    for key in keys {
        match sys.gpu_store().find(key) {
            Some(entry) => handles.push(entry.read().handle),
            None => {
                debug!("request references unknown GPU {}", key);
                return Err(ApiError::invalid_arg());
            }
        }
    }
    Ok(handles)
}

/// Read one or all GPUs; latched entries report busy on keyed reads and are
/// skipped on walks
pub fn gpu_get(sys: &System, keys: &[ObjKey]) -> Result<Vec<GpuInfo>, ApiError> {
    let mut infos = Vec::new();
    if keys.is_empty() {
        let mut result = Ok(());
        sys.gpu_store().walk(|_, entry| {
            if entry.in_use() {
                return WalkAction::Continue;
            }
            let gpu = entry.read();
            match sys.smi().fill_stats(gpu.handle) {
                Ok(stats) => infos.push(gpu.to_info(stats)),
                Err(e) => {
                    result = Err(ApiError::from(e));
                    return WalkAction::Stop;
                }
            }
            WalkAction::Continue
        });
        result?;
    } else {
        for key in keys {
            let entry = sys.gpu_store().get(key)?;
            let gpu = entry.read();
            let stats = sys.smi().fill_stats(gpu.handle)?;
            infos.push(gpu.to_info(stats));
        }
    }
    Ok(infos)
}

pub fn gpu_update(sys: &System, specs: Vec<GpuUpdateSpec>) -> (ApiStatus, ErrorCode) {
    for spec in specs {
        let key = spec.key;
        let (status, code) = post_api(
            sys,
            ApiMsg::new(ApiOp::Update, ApiParams::GpuUpdate(spec)),
        );
        if !status.is_ok() {
            debug!("GPU {} update returned {}", key, status);
            return (status, code);
        }
    }
    (ApiStatus::Ok, ErrorCode::None)
}

pub fn gpu_reset(sys: &System, spec: GpuResetSpec) -> (ApiStatus, ErrorCode) {
    post_api(sys, ApiMsg::new(ApiOp::Update, ApiParams::GpuReset(spec)))
}

pub fn compute_partition_get(
    sys: &System,
    keys: &[ObjKey],
) -> Result<Vec<ComputePartitionInfo>, ApiError> {
    let selected = if keys.is_empty() {
        sys.gpu_store().keys()
    } else {
        keys.to_vec()
    };
    let mut infos = Vec::with_capacity(selected.len());
    for key in &selected {
        let entry = sys.gpu_store().get(key)?;
        let (handle, partition_type) = {
            let gpu = entry.read();
            (gpu.handle, gpu.spec.compute_partition_type)
        };
        let partition_id = sys.smi().partition_id(handle)?;
        infos.push(ComputePartitionInfo {
            key: *key,
            partition_id,
            compute_partition_type: partition_type,
        });
    }
    Ok(infos)
}

pub fn bad_page_get(sys: &System, keys: &[ObjKey]) -> Result<Vec<BadPageInfo>, ApiError> {
    let selected = if keys.is_empty() {
        sys.gpu_store().keys()
    } else {
        keys.to_vec()
    };
    let mut infos = Vec::with_capacity(selected.len());
    for key in &selected {
        let entry = sys.gpu_store().get(key)?;
        let handle = entry.read().handle;
        let records = sys.smi().bad_pages(handle)?;
        infos.push(BadPageInfo { gpu: *key, records });
    }
    Ok(infos)
}

pub fn topology_get(sys: &System) -> Result<Vec<TopologyInfo>, ApiError> {
    let mut infos = Vec::new();
    for key in sys.gpu_store().keys() {
        let entry = sys.gpu_store().get(&key)?;
        let handle = entry.read().handle;
        let topology = sys.smi().fill_topology(handle)?;
        infos.push(TopologyInfo { gpu: key, topology });
    }
    infos.sort_by_key(|i| i.gpu);
    Ok(infos)
}

pub fn watch_create(sys: &System, specs: Vec<WatchSpec>) -> (ApiStatus, ErrorCode) {
    for spec in specs {
        let key = spec.key;
        let (status, code) = post_api(
            sys,
            ApiMsg::new(ApiOp::Create, ApiParams::WatchCreate(spec)),
        );
        if !status.is_ok() {
            debug!("watch {} create returned {}", key, status);
            return (status, code);
        }
    }
    (ApiStatus::Ok, ErrorCode::None)
}

pub fn watch_delete(sys: &System, keys: &[ObjKey]) -> (ApiStatus, ErrorCode) {
    for key in keys {
        let (status, code) = post_api(
            sys,
            ApiMsg::new(ApiOp::Delete, ApiParams::WatchDelete(*key)),
        );
        if !status.is_ok() {
            return (status, code);
        }
        sys.sample_cache().remove(key);
    }
    (ApiStatus::Ok, ErrorCode::None)
}

/// Read one or all watch groups; stats come from the monitor's sample cache
pub fn watch_get(sys: &System, keys: &[ObjKey]) -> Result<Vec<WatchInfo>, ApiError> {
    let selected = if keys.is_empty() {
        sys.watch_store().keys()
    } else {
        keys.to_vec()
    };
    let mut infos = Vec::with_capacity(selected.len());
    for key in &selected {
        let entry = sys.watch_store().get(key)?;
        let (spec, num_subscribers) = {
            let watch = entry.read();
            (watch.spec.clone(), watch.num_subscribers)
        };
        infos.push(WatchInfo {
            spec,
            status: WatchStatus { num_subscribers },
            stats: sys.sample_cache().get(key).unwrap_or_else(WatchStats::default),
        });
    }
    Ok(infos)
}

pub fn event_get(sys: &System, filter: &EventFilter) -> Result<Vec<EventInfo>, ApiError> {
    Ok(sys.event_db().read_all(filter))
}

pub fn event_gen(sys: &System, spec: &EventGenSpec) -> (ApiStatus, ErrorCode) {
    let gpus = match resolve_gpu_handles(sys, &spec.gpus) {
        Ok(gpus) => gpus,
        Err(e) => return (e.status, e.code),
    };
    let args = EventGenArgs::from_spec(spec, gpus);
    match sys.bus().blocking_request(
        EndpointId::EventMonitor,
        MsgId::EventGen,
        Payload::EventGen(args),
        sys.config().api_timeout,
    ) {
        Some(reply) => reply.as_status(),
        None => (ApiStatus::Err, ErrorCode::Unknown),
    }
}

/// Subscribe to hardware events and park until the stream dies
///
/// The monitor takes co-ownership of the client context; this thread
/// returns once the context has been marked inactive and signalled.
pub fn event_subscribe(
    sys: &System,
    filter: &EventFilter,
    client: Arc<EventClientCtx>,
) -> Result<(), ApiError> {
    let gpus = resolve_gpu_handles(sys, &filter.gpus)?;
    let events = if filter.events.is_empty() {
        EventId::ALL.to_vec()
    } else {
        filter.events.clone()
    };
    let args = EventSubscribeArgs {
        client: client.clone(),
        events,
        gpus,
    };
    let reply = sys.bus().blocking_request(
        EndpointId::EventMonitor,
        MsgId::EventSubscribe,
        Payload::EventSubscribe(args),
        sys.config().api_timeout,
    );
    match reply {
        Some(p) if p.as_status().0.is_ok() => {}
        _ => return Err(ApiStatus::Err.into()),
    }
    info!("client {} event stream open", client.client());
    client.wait_inactive();
    info!("client {} event stream closed", client.client());
    Ok(())
}

/// Subscribe to watch groups and park until the stream dies
///
/// The subscriber refcount is incremented through the API engine after the
/// monitor accepted the registration, and released by the monitor's
/// dead-listener sweep.
pub fn watch_subscribe(
    sys: &System,
    keys: &[ObjKey],
    client: Arc<WatchClientCtx>,
) -> Result<(), ApiError> {
    if keys.is_empty() {
        return Err(ApiError::invalid_arg());
    }
    for key in keys {
        if sys.watch_store().get(key).is_err() {
            debug!("subscribe request references unknown watch {}", key);
            return Err(ApiError::invalid_arg());
        }
    }
    let args = WatchSubscribeArgs {
        client: client.clone(),
        watch_ids: keys.to_vec(),
    };
    let reply = sys.bus().blocking_request(
        EndpointId::WatchMonitor,
        MsgId::WatchSubscribe,
        Payload::WatchSubscribe(args),
        sys.config().api_timeout,
    );
    match reply {
        Some(p) if p.as_status().0.is_ok() => {}
        _ => return Err(ApiStatus::Err.into()),
    }
    let (status, _) = post_api(
        sys,
        ApiMsg::new(
            ApiOp::Update,
            ApiParams::WatchSubscriberAdd(keys.to_vec()),
        ),
    );
    if !status.is_ok() {
        debug!(
            "subscriber refcount task for {} failed: {}",
            client.client(),
            status
        );
    }
    info!("client {} watch stream open", client.client());
    client.wait_inactive();
    info!("client {} watch stream closed", client.client());
    Ok(())
}
