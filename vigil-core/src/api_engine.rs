//! API engine
//!
//! The single configuration writer. All mutations (GPU update, GPU reset,
//! watch create/delete, watch subscriber refcounts) arrive as bus requests
//! on the serialized Api endpoint, so no two are ever in flight together.
//! Each request is validated, the target entry located and latched, the
//! operation applied, and the result code released to the caller.
//!
//! Reads never pass through here; they go straight to the stores and
//! tolerate the latch.

use std::sync::Arc;

use tracing::{debug, warn};
use vigil_error::{ApiError, ApiStatus, ErrorCode};
use vigil_protocol::{GpuResetSpec, GpuUpdateSpec, WatchSpec};
use vigil_smi::{upd, ObjKey, SmiBackend};

use crate::bus::{Envelope, EnvelopeKind};
use crate::msg::{ApiMsg, ApiParams, Payload};
use crate::objects::{GpuEntry, WatchEntry};
use crate::store::{ObjStore, StoreEntry};
use crate::worker::{WorkerCtx, WorkerHandler, TimerId};

pub struct ApiEngine {
    smi: Arc<dyn SmiBackend>,
    gpu_store: Arc<ObjStore<GpuEntry>>,
    watch_store: Arc<ObjStore<WatchEntry>>,
}

impl ApiEngine {
    pub fn new(
        smi: Arc<dyn SmiBackend>,
        gpu_store: Arc<ObjStore<GpuEntry>>,
        watch_store: Arc<ObjStore<WatchEntry>>,
    ) -> Self {
        Self {
            smi,
            gpu_store,
            watch_store,
        }
    }

    /// Process one API message and produce the result code pair
    pub(crate) fn handle(&self, msg: &ApiMsg) -> (ApiStatus, ErrorCode) {
        if let Err(e) = msg.validate() {
            debug!("API request failed validation: {}", e);
            return (ApiStatus::InvalidArg, ErrorCode::None);
        }
        let result = match &msg.params {
            ApiParams::GpuUpdate(spec) => self.gpu_update(spec),
            ApiParams::GpuReset(spec) => self.gpu_reset(spec),
            ApiParams::WatchCreate(spec) => self.watch_create(spec),
            ApiParams::WatchDelete(key) => self.watch_delete(key),
            ApiParams::WatchSubscriberAdd(keys) => self.watch_subscribers_adjust(keys, 1),
            ApiParams::WatchSubscriberRelease(keys) => self.watch_subscribers_adjust(keys, -1),
        };
        match result {
            Ok(()) => (ApiStatus::Ok, ErrorCode::None),
            Err(e) => (e.status, e.code),
        }
    }

    fn gpu_update(&self, spec: &GpuUpdateSpec) -> Result<(), ApiError> {
        let entry = self.gpu_store.get(&spec.key)?;
        entry.latch();
        let result = self.apply_gpu_update(&entry, spec);
        entry.unlatch();
        if let Err(e) = &result {
            warn!("GPU {} update failed: {}", spec.key, e);
        }
        result
    }

    fn apply_gpu_update(
        &self,
        entry: &Arc<StoreEntry<GpuEntry>>,
        spec: &GpuUpdateSpec,
    ) -> Result<(), ApiError> {
        let (handle, mut merged) = {
            let gpu = entry.read();
            (gpu.handle, gpu.spec.clone())
        };
        let mut mask = 0u64;
        if let Some(v) = spec.overdrive_level {
            merged.overdrive_level = v;
            mask |= upd::OVERDRIVE;
        }
        if let Some(v) = spec.perf_level {
            merged.perf_level = v;
            mask |= upd::PERF_LEVEL;
        }
        if let Some(ranges) = &spec.clock_freq {
            merged.clock_freq = ranges.clone();
            mask |= upd::CLOCK_FREQ;
        }
        if let Some(v) = spec.power_cap {
            merged.power_cap = v;
            mask |= upd::POWER_CAP;
        }
        if let Some(v) = spec.compute_partition_type {
            merged.compute_partition_type = v;
            mask |= upd::COMPUTE_PARTITION;
        }
        if mask == 0 {
            // nothing selected, nothing to push to the device
            return Ok(());
        }
        self.smi.update(handle, &merged, mask)?;
        // commit only after the backend accepted the whole update
        entry.write().spec = merged;
        debug!("GPU {} updated (mask {:#x})", spec.key, mask);
        Ok(())
    }

    fn gpu_reset(&self, spec: &GpuResetSpec) -> Result<(), ApiError> {
        let entry = self.gpu_store.get(&spec.key)?;
        entry.latch();
        let handle = entry.read().handle;
        let result = self.smi.reset(handle, spec.reset_type).map_err(ApiError::from);
        entry.unlatch();
        match &result {
            Ok(()) => debug!("GPU {} reset ({:?})", spec.key, spec.reset_type),
            Err(e) => warn!("GPU {} reset failed: {}", spec.key, e),
        }
        result
    }

    fn watch_create(&self, spec: &WatchSpec) -> Result<(), ApiError> {
        // every referenced GPU must exist
        for gpu in &spec.gpus {
            if self.gpu_store.find(gpu).is_none() {
                warn!("watch {} references unknown GPU {}", spec.key, gpu);
                return Err(ApiError::invalid_arg());
            }
        }
        self.watch_store
            .insert(spec.key, WatchEntry::new(spec.clone()))?;
        debug!(
            "watch {} created ({} GPUs, {} attrs)",
            spec.key,
            spec.gpus.len(),
            spec.attrs.len()
        );
        Ok(())
    }

    fn watch_delete(&self, key: &ObjKey) -> Result<(), ApiError> {
        let entry = self.watch_store.get(key)?;
        if entry.read().num_subscribers > 0 {
            debug!(
                "watch {} has {} subscribers, delete refused",
                key,
                entry.read().num_subscribers
            );
            return Err(ApiError::in_use());
        }
        entry.latch();
        self.watch_store.remove(key);
        entry.unlatch();
        debug!("watch {} deleted", key);
        Ok(())
    }

    fn watch_subscribers_adjust(&self, keys: &[ObjKey], delta: i32) -> Result<(), ApiError> {
        for key in keys {
            match self.watch_store.find(key) {
                Some(entry) => {
                    let mut watch = entry.write();
                    if delta > 0 {
                        watch.num_subscribers += 1;
                    } else {
                        watch.num_subscribers = watch.num_subscribers.saturating_sub(1);
                    }
                    debug!(
                        "watch {} subscriber count now {}",
                        key, watch.num_subscribers
                    );
                }
                None => warn!("subscriber task references unknown watch {}", key),
            }
        }
        Ok(())
    }
}

impl WorkerHandler for ApiEngine {
    fn init(&mut self, ctx: &mut WorkerCtx<'_>) {
        debug!("API engine ready on {:?}", ctx.endpoint());
    }

    fn on_message(&mut self, ctx: &mut WorkerCtx<'_>, env: Envelope) {
        match env.kind {
            EnvelopeKind::Request { payload, token } => match payload {
                Payload::Api(msg) => {
                    let (status, code) = self.handle(&msg);
                    ctx.respond(token, Payload::Status(status, code));
                }
                _ => {
                    warn!("API engine received non-API payload");
                    ctx.respond(token, Payload::Status(ApiStatus::InvalidArg, ErrorCode::None));
                }
            },
            EnvelopeKind::Broadcast { token, .. } => ctx.broadcast_handled(token),
            _ => {}
        }
    }

    fn on_timer(&mut self, _ctx: &mut WorkerCtx<'_>, _timer: TimerId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::ApiOp;
    use vigil_smi::{gpu_uuid_with_host, GpuHandle, MockSmi, ResetType, WatchAttrId};

    fn engine_with_gpus(n: u32) -> (ApiEngine, Vec<ObjKey>) {
        let smi = Arc::new(MockSmi::new(n));
        let gpu_store = ObjStore::new();
        let watch_store = ObjStore::new();
        let mut keys = Vec::new();
        for i in 0..n {
            let key = gpu_uuid_with_host(0x01020304, i as u8, 0xc0de + i as u64);
            let handle = GpuHandle(i as u64);
            use vigil_smi::SmiBackend as _;
            gpu_store
                .insert(
                    key,
                    GpuEntry {
                        index: i,
                        handle,
                        key,
                        spec: smi.fill_spec(handle).unwrap(),
                        status: smi.fill_status(handle, i).unwrap(),
                    },
                )
                .unwrap();
            keys.push(key);
        }
        (ApiEngine::new(smi, gpu_store, watch_store), keys)
    }

    fn watch_spec(key: ObjKey, gpus: Vec<ObjKey>) -> WatchSpec {
        WatchSpec {
            key,
            gpus,
            attrs: vec![WatchAttrId::GpuClock, WatchAttrId::PowerUsage],
        }
    }

    #[test]
    fn gpu_update_commits_spec() {
        let (engine, keys) = engine_with_gpus(2);
        let msg = ApiMsg::new(
            ApiOp::Update,
            ApiParams::GpuUpdate(GpuUpdateSpec {
                key: keys[0],
                overdrive_level: Some(5),
                ..Default::default()
            }),
        );
        assert_eq!(engine.handle(&msg), (ApiStatus::Ok, ErrorCode::None));
        let entry = engine.gpu_store.get(&keys[0]).unwrap();
        assert_eq!(entry.read().spec.overdrive_level, 5);
    }

    #[test]
    fn gpu_update_failure_leaves_spec_untouched() {
        let (engine, keys) = engine_with_gpus(1);
        let before = engine.gpu_store.get(&keys[0]).unwrap().read().spec.clone();
        let msg = ApiMsg::new(
            ApiOp::Update,
            ApiParams::GpuUpdate(GpuUpdateSpec {
                key: keys[0],
                overdrive_level: Some(99),
                ..Default::default()
            }),
        );
        let (status, code) = engine.handle(&msg);
        assert_eq!(status, ApiStatus::Err);
        assert_eq!(code, ErrorCode::OverdriveOutOfRange);
        assert_eq!(engine.gpu_store.get(&keys[0]).unwrap().read().spec, before);
    }

    #[test]
    fn gpu_reset_of_unknown_key() {
        let (engine, _) = engine_with_gpus(1);
        let msg = ApiMsg::new(
            ApiOp::Update,
            ApiParams::GpuReset(GpuResetSpec {
                key: gpu_uuid_with_host(1, 9, 9),
                reset_type: ResetType::Asic,
            }),
        );
        assert_eq!(engine.handle(&msg).0, ApiStatus::NotFound);
    }

    #[test]
    fn gpu_reset_of_zero_key_is_invalid() {
        let (engine, _) = engine_with_gpus(1);
        let msg = ApiMsg::new(
            ApiOp::Update,
            ApiParams::GpuReset(GpuResetSpec {
                key: ObjKey::zero(),
                reset_type: ResetType::Asic,
            }),
        );
        assert_eq!(engine.handle(&msg).0, ApiStatus::InvalidArg);
    }

    #[test]
    fn watch_lifecycle() {
        let (engine, keys) = engine_with_gpus(2);
        let wkey = gpu_uuid_with_host(0x0a0b0c0d, 0, 0xbeef);
        let spec = watch_spec(wkey, vec![keys[0]]);

        let create = ApiMsg::new(ApiOp::Create, ApiParams::WatchCreate(spec.clone()));
        assert_eq!(engine.handle(&create).0, ApiStatus::Ok);
        assert_eq!(engine.handle(&create).0, ApiStatus::Exists);

        // subscriber refcount blocks delete
        let add = ApiMsg::new(ApiOp::Update, ApiParams::WatchSubscriberAdd(vec![wkey]));
        assert_eq!(engine.handle(&add).0, ApiStatus::Ok);
        let del = ApiMsg::new(ApiOp::Delete, ApiParams::WatchDelete(wkey));
        assert_eq!(engine.handle(&del).0, ApiStatus::InUse);

        let release = ApiMsg::new(
            ApiOp::Update,
            ApiParams::WatchSubscriberRelease(vec![wkey]),
        );
        assert_eq!(engine.handle(&release).0, ApiStatus::Ok);
        assert_eq!(engine.handle(&del).0, ApiStatus::Ok);
        assert_eq!(engine.handle(&del).0, ApiStatus::NotFound);
    }

    #[test]
    fn watch_create_rejects_unknown_gpu() {
        let (engine, _) = engine_with_gpus(1);
        let wkey = gpu_uuid_with_host(0x0a0b0c0d, 1, 0xbeef);
        let spec = watch_spec(wkey, vec![gpu_uuid_with_host(5, 5, 5)]);
        let create = ApiMsg::new(ApiOp::Create, ApiParams::WatchCreate(spec));
        assert_eq!(engine.handle(&create).0, ApiStatus::InvalidArg);
    }
}
