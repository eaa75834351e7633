//! Watch monitor
//!
//! Worker that periodically samples the configured attributes of every
//! watch group with live subscribers and pushes one message per group per
//! tick to each of them. The latest samples are also published to a shared
//! cache so the unary read path can report them.
//!
//! Subscriber refcounts live in the watch store and are mutated only by the
//! API engine; this monitor posts asynchronous release tasks when it
//! harvests dead listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use vigil_protocol::{
    GpuWatchAttrs, TimeSpec, WatchAttrSample, WatchInfo, WatchSpec, WatchStats, WatchStatus,
};
use vigil_smi::{ObjKey, SmiBackend};

use crate::bus::{Envelope, EnvelopeKind};
use crate::constants::timer;
use crate::msg::{ApiMsg, ApiOp, ApiParams, EndpointId, MsgId, Payload, WatchSubscribeArgs};
use crate::objects::{GpuEntry, WatchEntry};
use crate::store::ObjStore;
use crate::subscriber::WatchClientCtx;
use crate::worker::{TimerId, WorkerCtx, WorkerHandler};

/// Latest samples per watch group, written by the monitor each tick and
/// read by the unary get path
pub struct WatchSampleCache {
    cache: RwLock<HashMap<ObjKey, WatchStats>>,
}

impl WatchSampleCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, key: &ObjKey) -> Option<WatchStats> {
        self.cache.read().get(key).cloned()
    }

    fn put(&self, key: ObjKey, stats: WatchStats) {
        self.cache.write().insert(key, stats);
    }

    pub fn remove(&self, key: &ObjKey) {
        self.cache.write().remove(key);
    }
}

pub struct WatchMonitor {
    smi: Arc<dyn SmiBackend>,
    gpu_store: Arc<ObjStore<GpuEntry>>,
    watch_store: Arc<ObjStore<WatchEntry>>,
    cache: Arc<WatchSampleCache>,
    /// which clients follow each watch group
    subscribers: HashMap<ObjKey, Vec<Arc<WatchClientCtx>>>,
    interval: Duration,
}

impl WatchMonitor {
    pub fn new(
        smi: Arc<dyn SmiBackend>,
        gpu_store: Arc<ObjStore<GpuEntry>>,
        watch_store: Arc<ObjStore<WatchEntry>>,
        cache: Arc<WatchSampleCache>,
        interval: Duration,
    ) -> Self {
        Self {
            smi,
            gpu_store,
            watch_store,
            cache,
            subscribers: HashMap::new(),
            interval,
        }
    }

    /// Sample every (GPU, attribute) pair of one watch spec
    fn sample(&self, spec: &WatchSpec) -> WatchStats {
        let now = TimeSpec::now();
        let mut gpus = Vec::new();
        for gpu_key in &spec.gpus {
            let handle = match self.gpu_store.find(gpu_key) {
                Some(entry) => entry.read().handle,
                None => continue,
            };
            let mut attrs = Vec::new();
            for attr in &spec.attrs {
                match self.smi.attr_read(handle, *attr) {
                    Ok(value) => attrs.push(WatchAttrSample {
                        id: *attr,
                        timestamp: now,
                        gpu: *gpu_key,
                        value,
                        units: attr.units().to_string(),
                    }),
                    Err(e) => {
                        // log and continue, the next tick retries
                        debug!("attr read {:?} on GPU {} failed: {}", attr, gpu_key, e);
                    }
                }
            }
            gpus.push(GpuWatchAttrs {
                gpu: *gpu_key,
                attrs,
            });
        }
        WatchStats { gpus }
    }

    /// One sample tick over all watch groups with live subscribers
    fn tick(&mut self, ctx: &mut WorkerCtx<'_>) {
        let mut dead: Vec<Arc<WatchClientCtx>> = Vec::new();
        for (watch_key, subs) in &self.subscribers {
            if subs.is_empty() {
                continue;
            }
            let entry = match self.watch_store.find(watch_key) {
                Some(entry) if !entry.in_use() => entry,
                // mid-mutation or gone, catch up next tick
                _ => continue,
            };
            let (spec, num_subscribers) = {
                let watch = entry.read();
                (watch.spec.clone(), watch.num_subscribers)
            };
            let stats = self.sample(&spec);
            self.cache.put(*watch_key, stats.clone());
            let info = WatchInfo {
                spec,
                status: WatchStatus { num_subscribers },
                stats,
            };
            for sub in subs {
                if sub.write(&info).is_err() && !dead.iter().any(|c| Arc::ptr_eq(c, sub)) {
                    dead.push(sub.clone());
                }
            }
        }
        if !dead.is_empty() {
            self.cleanup_subscribers(ctx, dead);
        }
    }

    /// Remove dead clients from every group, release their refcounts
    /// through the API engine, then signal them
    fn cleanup_subscribers(&mut self, ctx: &mut WorkerCtx<'_>, dead: Vec<Arc<WatchClientCtx>>) {
        for client in dead {
            info!("harvesting dead watch subscriber {}", client.client());
            let mut released = Vec::new();
            for (watch_key, subs) in self.subscribers.iter_mut() {
                let before = subs.len();
                subs.retain(|c| !Arc::ptr_eq(c, &client));
                if subs.len() != before {
                    released.push(*watch_key);
                }
            }
            self.subscribers.retain(|_, subs| !subs.is_empty());
            if !released.is_empty() {
                let peer = client.client().to_string();
                ctx.request(
                    EndpointId::Api,
                    MsgId::ApiRequest,
                    Payload::Api(ApiMsg::new(
                        ApiOp::Update,
                        ApiParams::WatchSubscriberRelease(released),
                    )),
                    Duration::ZERO,
                    Box::new(move |reply| {
                        let ok = reply.map(|p| p.as_status().0.is_ok()).unwrap_or(false);
                        if !ok {
                            warn!("subscriber release for {} failed", peer);
                        }
                    }),
                );
            }
            client.mark_inactive();
        }
    }

    fn handle_subscribe(&mut self, args: WatchSubscribeArgs) {
        for watch_key in &args.watch_ids {
            let subs = self.subscribers.entry(*watch_key).or_default();
            if !subs.iter().any(|c| Arc::ptr_eq(c, &args.client)) {
                subs.push(args.client.clone());
            }
        }
        debug!(
            "client {} subscribed to {} watch groups",
            args.client.client(),
            args.watch_ids.len()
        );
    }

    /// Signal every subscriber and forget them; used at shutdown
    fn drain_subscribers(&mut self) {
        let mut drained: Vec<Arc<WatchClientCtx>> = Vec::new();
        for subs in self.subscribers.values_mut() {
            for ctx in subs.drain(..) {
                if !drained.iter().any(|c| Arc::ptr_eq(c, &ctx)) {
                    drained.push(ctx);
                }
            }
        }
        self.subscribers.clear();
        for ctx in drained {
            ctx.mark_inactive();
        }
    }
}

impl WorkerHandler for WatchMonitor {
    fn init(&mut self, ctx: &mut WorkerCtx<'_>) {
        ctx.subscribe(MsgId::Shutdown);
        ctx.arm_periodic(timer::WATCH_SAMPLE, self.interval, self.interval);
        info!("watch monitor started (sample every {:?})", self.interval);
    }

    fn on_message(&mut self, ctx: &mut WorkerCtx<'_>, env: Envelope) {
        match env.kind {
            EnvelopeKind::Request { payload, token } => {
                let reply = match payload {
                    Payload::WatchSubscribe(args) => {
                        self.handle_subscribe(args);
                        Payload::ok()
                    }
                    _ => {
                        warn!("watch monitor received unexpected payload");
                        Payload::Status(
                            vigil_error::ApiStatus::InvalidArg,
                            vigil_error::ErrorCode::None,
                        )
                    }
                };
                ctx.respond(token, reply);
            }
            EnvelopeKind::Broadcast { payload, token } => {
                if matches!(payload, Payload::Shutdown) {
                    self.drain_subscribers();
                }
                ctx.broadcast_handled(token);
            }
            _ => {}
        }
    }

    fn on_timer(&mut self, ctx: &mut WorkerCtx<'_>, timer_id: TimerId) {
        if timer_id == timer::WATCH_SAMPLE {
            self.tick(ctx);
        }
    }

    fn exit(&mut self, _ctx: &mut WorkerCtx<'_>) {
        self.drain_subscribers();
    }
}
