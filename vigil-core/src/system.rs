//! Process-wide system state
//!
//! One `System` value owns the bus, the object stores, the shared monitor
//! state and the worker threads. It is built once at startup and passed
//! explicitly to everything that needs it; there is no hidden module state.
//!
//! Startup order: discover GPUs, populate the store, start the API worker,
//! start the event monitor, start the watch monitor. The RPC frontend comes
//! up last, outside this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};
use vigil_error::AgentError;
use vigil_smi::{gpu_uuid, SmiBackend};

use crate::api_engine::ApiEngine;
use crate::bus::Bus;
use crate::constants::{
    API_REQUEST_TIMEOUT, EVENT_MONITOR_INTERVAL, EVENT_MONITOR_START_DELAY,
    WATCH_MONITOR_INTERVAL,
};
use crate::event_monitor::{EventDb, EventMonitor};
use crate::msg::{EndpointId, MsgId, Payload};
use crate::objects::{GpuEntry, WatchEntry};
use crate::store::ObjStore;
use crate::watch_monitor::{WatchMonitor, WatchSampleCache};
use crate::worker::{self, WorkerConfig, WorkerHandle};

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub event_start_delay: Duration,
    pub event_tick: Duration,
    pub watch_tick: Duration,
    pub api_timeout: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_start_delay: EVENT_MONITOR_START_DELAY,
            event_tick: EVENT_MONITOR_INTERVAL,
            watch_tick: WATCH_MONITOR_INTERVAL,
            api_timeout: API_REQUEST_TIMEOUT,
        }
    }
}

pub struct System {
    bus: Arc<Bus>,
    smi: Arc<dyn SmiBackend>,
    gpu_store: Arc<ObjStore<GpuEntry>>,
    watch_store: Arc<ObjStore<WatchEntry>>,
    event_db: Arc<EventDb>,
    sample_cache: Arc<WatchSampleCache>,
    cfg: SystemConfig,
    workers: Mutex<Vec<WorkerHandle>>,
    stopped: AtomicBool,
}

impl System {
    /// Bring the control plane up against the given backend
    pub fn start(smi: Arc<dyn SmiBackend>, cfg: SystemConfig) -> Result<Arc<Self>, AgentError> {
        let bus = Bus::new();
        let gpu_store: Arc<ObjStore<GpuEntry>> = ObjStore::new();
        let watch_store: Arc<ObjStore<WatchEntry>> = ObjStore::new();
        let event_db = EventDb::new();
        let sample_cache = WatchSampleCache::new();

        // discover and populate; one entry per physical GPU, forever
        let discovered = smi
            .discover()
            .map_err(|e| AgentError::Backend(format!("GPU discovery failed: {}", e)))?;
        for (idx, gpu) in discovered.iter().enumerate() {
            let key = gpu_uuid(idx as u8, gpu.unique_id);
            let spec = smi
                .fill_spec(gpu.handle)
                .map_err(|e| AgentError::Backend(e.to_string()))?;
            let status = smi
                .fill_status(gpu.handle, idx as u32)
                .map_err(|e| AgentError::Backend(e.to_string()))?;
            gpu_store
                .insert(
                    key,
                    GpuEntry {
                        index: idx as u32,
                        handle: gpu.handle,
                        key,
                        spec,
                        status,
                    },
                )
                .map_err(|e| AgentError::Backend(format!("duplicate GPU key {}: {}", key, e)))?;
            event_db.init_gpu(gpu.handle, key);
            info!("GPU {} discovered, key {}", idx, key);
        }
        info!("{} GPUs enumerated", discovered.len());

        let mut workers = Vec::new();
        workers.push(worker::spawn(
            WorkerConfig {
                name: "api",
                endpoint: EndpointId::Api,
                serialized: true,
            },
            bus.clone(),
            Box::new(ApiEngine::new(
                smi.clone(),
                gpu_store.clone(),
                watch_store.clone(),
            )),
        )?);
        workers.push(worker::spawn(
            WorkerConfig {
                name: "event-monitor",
                endpoint: EndpointId::EventMonitor,
                serialized: true,
            },
            bus.clone(),
            Box::new(EventMonitor::new(
                smi.clone(),
                event_db.clone(),
                cfg.event_start_delay,
                cfg.event_tick,
            )),
        )?);
        workers.push(worker::spawn(
            WorkerConfig {
                name: "watch-monitor",
                endpoint: EndpointId::WatchMonitor,
                serialized: true,
            },
            bus.clone(),
            Box::new(WatchMonitor::new(
                smi.clone(),
                gpu_store.clone(),
                watch_store.clone(),
                sample_cache.clone(),
                cfg.watch_tick,
            )),
        )?);

        Ok(Arc::new(Self {
            bus,
            smi,
            gpu_store,
            watch_store,
            event_db,
            sample_cache,
            cfg,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn smi(&self) -> &Arc<dyn SmiBackend> {
        &self.smi
    }

    pub fn gpu_store(&self) -> &Arc<ObjStore<GpuEntry>> {
        &self.gpu_store
    }

    pub fn watch_store(&self) -> &Arc<ObjStore<WatchEntry>> {
        &self.watch_store
    }

    pub fn event_db(&self) -> &Arc<EventDb> {
        &self.event_db
    }

    pub fn sample_cache(&self) -> &Arc<WatchSampleCache> {
        &self.sample_cache
    }

    pub fn config(&self) -> &SystemConfig {
        &self.cfg
    }

    pub fn gpu_count(&self) -> usize {
        self.gpu_store.len()
    }

    /// Tear the control plane down: drain parked subscribers through the
    /// monitors, then stop and join every worker
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("system shutting down");
        let drained = self.bus.broadcast(MsgId::Shutdown, Payload::Shutdown);
        if drained == 0 {
            warn!("no workers subscribed to shutdown drain");
        }
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            worker.stop();
        }
        workers.clear();
        info!("system stopped");
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}
