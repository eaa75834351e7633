//! Event monitor
//!
//! Worker that periodically polls the SMI backend for hardware events,
//! maintains the per-GPU event record map and fans each event out to every
//! subscribed client. Subscribe and generate requests arrive on its
//! serialized inbox, so they never interleave with a poll tick.
//!
//! Clients whose stream write fails are harvested after the delivery loop:
//! removed from every event record across all GPUs, marked inactive and
//! signalled, in that order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vigil_protocol::{EventFilter, EventInfo, TimeSpec};
use vigil_smi::{EventId, GpuHandle, ObjKey, RawEvent, SmiBackend};

use crate::bus::{Envelope, EnvelopeKind};
use crate::constants::timer;
use crate::msg::{EventGenArgs, EventSubscribeArgs, MsgId, Payload};
use crate::subscriber::EventClientCtx;
use crate::worker::{TimerId, WorkerCtx, WorkerHandler};

/// Last-seen state of one (GPU, event-id) pair plus its listeners
#[derive(Default)]
struct EventRecord {
    /// unset until the event is first observed
    timestamp: Option<TimeSpec>,
    message: String,
    subscribers: Vec<Arc<EventClientCtx>>,
}

/// Per-GPU event state; the mutex covers the whole record map
pub struct GpuEventSlot {
    key: ObjKey,
    events: Mutex<HashMap<EventId, EventRecord>>,
}

/// Event database shared between the monitor (writer) and the read path
pub struct EventDb {
    slots: RwLock<HashMap<GpuHandle, Arc<GpuEventSlot>>>,
}

impl EventDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new(HashMap::new()),
        })
    }

    /// Create the slot for one GPU; called during startup enumeration
    pub fn init_gpu(&self, handle: GpuHandle, key: ObjKey) {
        self.slots.write().insert(
            handle,
            Arc::new(GpuEventSlot {
                key,
                events: Mutex::new(HashMap::new()),
            }),
        );
    }

    fn slot(&self, handle: GpuHandle) -> Option<Arc<GpuEventSlot>> {
        self.slots.read().get(&handle).cloned()
    }

    fn all_slots(&self) -> Vec<Arc<GpuEventSlot>> {
        self.slots.read().values().cloned().collect()
    }

    /// Read every observed event matching the filter
    pub fn read_all(&self, filter: &EventFilter) -> Vec<EventInfo> {
        let mut out = Vec::new();
        for slot in self.all_slots() {
            if !filter.gpus.is_empty() && !filter.gpus.contains(&slot.key) {
                continue;
            }
            let events = slot.events.lock();
            for (id, record) in events.iter() {
                if !filter.events.is_empty() && !filter.events.contains(id) {
                    continue;
                }
                let timestamp = match record.timestamp {
                    Some(ts) => ts,
                    // subscribed-to but never observed
                    None => continue,
                };
                out.push(EventInfo {
                    id: *id,
                    category: id.category(),
                    severity: id.severity(),
                    timestamp,
                    gpu: slot.key,
                    message: record.message.clone(),
                });
            }
        }
        out
    }

    /// Number of listeners attached to one (GPU, event-id) pair
    pub fn subscriber_count(&self, handle: GpuHandle, event: EventId) -> usize {
        self.slot(handle)
            .map(|slot| {
                slot.events
                    .lock()
                    .get(&event)
                    .map(|r| r.subscribers.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Remove one client from every event record across all GPUs
    fn remove_subscriber_everywhere(&self, ctx: &Arc<EventClientCtx>) {
        for slot in self.all_slots() {
            let mut events = slot.events.lock();
            for record in events.values_mut() {
                record.subscribers.retain(|c| !Arc::ptr_eq(c, ctx));
            }
        }
    }

    /// Detach and signal every subscriber; used at shutdown
    fn drain_subscribers(&self) {
        let mut drained: Vec<Arc<EventClientCtx>> = Vec::new();
        for slot in self.all_slots() {
            let mut events = slot.events.lock();
            for record in events.values_mut() {
                for ctx in record.subscribers.drain(..) {
                    if !drained.iter().any(|c| Arc::ptr_eq(c, &ctx)) {
                        drained.push(ctx);
                    }
                }
            }
        }
        for ctx in drained {
            ctx.mark_inactive();
        }
    }
}

pub struct EventMonitor {
    smi: Arc<dyn SmiBackend>,
    db: Arc<EventDb>,
    /// synthetic events injected by the generate hook, consumed by the next
    /// tick together with the backend batch
    generated: VecDeque<RawEvent>,
    start_delay: Duration,
    interval: Duration,
}

impl EventMonitor {
    pub fn new(
        smi: Arc<dyn SmiBackend>,
        db: Arc<EventDb>,
        start_delay: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            smi,
            db,
            generated: VecDeque::new(),
            start_delay,
            interval,
        }
    }

    /// One poll tick: gather the batch and deliver it
    fn tick(&mut self) {
        let mut batch: Vec<RawEvent> = self.generated.drain(..).collect();
        batch.extend(self.smi.event_poll());
        if !batch.is_empty() {
            self.handle_events(batch);
        }
    }

    fn handle_events(&self, batch: Vec<RawEvent>) {
        let now = TimeSpec::now();
        let mut dead: Vec<Arc<EventClientCtx>> = Vec::new();

        for raw in batch {
            let slot = match self.db.slot(raw.handle) {
                Some(slot) => slot,
                // event for a GPU we never enumerated, drop it
                None => continue,
            };
            let mut events = slot.events.lock();
            let record = events.entry(raw.id).or_default();
            record.timestamp = Some(now);
            record.message = raw.message.clone();

            let event = EventInfo {
                id: raw.id,
                category: raw.id.category(),
                severity: raw.id.severity(),
                timestamp: now,
                gpu: slot.key,
                message: raw.message,
            };
            for ctx in &record.subscribers {
                if ctx.write(&event).is_err() {
                    if !dead.iter().any(|c| Arc::ptr_eq(c, ctx)) {
                        dead.push(ctx.clone());
                    }
                }
            }
        }
        if !dead.is_empty() {
            self.cleanup_listeners(dead);
        }
    }

    /// Dead-listener sweep: a context that failed for one GPU is removed
    /// from every record before the parked frontend is woken, otherwise its
    /// remaining registrations would dangle
    fn cleanup_listeners(&self, dead: Vec<Arc<EventClientCtx>>) {
        for ctx in dead {
            info!("harvesting dead event listener {}", ctx.client());
            self.db.remove_subscriber_everywhere(&ctx);
            ctx.mark_inactive();
        }
    }

    fn handle_subscribe(&self, args: EventSubscribeArgs) {
        for handle in &args.gpus {
            let slot = match self.db.slot(*handle) {
                Some(slot) => slot,
                None => {
                    warn!("subscribe request for unknown GPU handle {}", handle.0);
                    continue;
                }
            };
            let mut events = slot.events.lock();
            for event in &args.events {
                let record = events.entry(*event).or_default();
                if !record
                    .subscribers
                    .iter()
                    .any(|c| Arc::ptr_eq(c, &args.client))
                {
                    record.subscribers.push(args.client.clone());
                }
            }
        }
        debug!(
            "client {} subscribed to {} events on {} GPUs",
            args.client.client(),
            args.events.len(),
            args.gpus.len()
        );
    }

    fn handle_generate(&mut self, args: EventGenArgs) {
        for handle in &args.gpus {
            for event in &args.events {
                self.generated.push_back(RawEvent {
                    handle: *handle,
                    id: *event,
                    message: "test event".to_string(),
                });
            }
        }
        debug!("queued {} synthetic events", self.generated.len());
    }
}

impl WorkerHandler for EventMonitor {
    fn init(&mut self, ctx: &mut WorkerCtx<'_>) {
        ctx.subscribe(MsgId::Shutdown);
        ctx.arm_periodic(timer::EVENT_POLL, self.start_delay, self.interval);
        info!(
            "event monitor started (poll every {:?} after {:?})",
            self.interval, self.start_delay
        );
    }

    fn on_message(&mut self, ctx: &mut WorkerCtx<'_>, env: Envelope) {
        match env.kind {
            EnvelopeKind::Request { payload, token } => {
                let reply = match payload {
                    Payload::EventSubscribe(args) => {
                        self.handle_subscribe(args);
                        Payload::ok()
                    }
                    Payload::EventGen(args) => {
                        self.handle_generate(args);
                        Payload::ok()
                    }
                    _ => {
                        warn!("event monitor received unexpected payload");
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
                    self.db.drain_subscribers();
                }
                ctx.broadcast_handled(token);
            }
            _ => {}
        }
    }

    fn on_timer(&mut self, _ctx: &mut WorkerCtx<'_>, timer_id: TimerId) {
        if timer_id == timer::EVENT_POLL {
            self.tick();
        }
    }

    fn exit(&mut self, _ctx: &mut WorkerCtx<'_>) {
        self.db.drain_subscribers();
    }
}
