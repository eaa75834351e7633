//! Event-loop workers
//!
//! Each worker owns one OS thread, one bus inbox and one timer set, and runs
//! a single-threaded cooperative loop: wait for the inbox or a ready timer,
//! dispatch one handler to completion, repeat. Suspension happens only at
//! handler return and inside `blocking_request`.
//!
//! Every worker arms a periodic heartbeat timer that punches a
//! monotonically-increasing tick into process-global state, readable by a
//! supervisor through [`heartbeat_tick`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use vigil_error::AgentError;

use crate::bus::{BroadcastToken, Bus, CompletionFn, Envelope, EnvelopeKind, ReplyToken};
use crate::constants::{HEARTBEAT_INTERVAL, WORKER_IDLE_WAIT};
use crate::msg::{EndpointId, MsgId, Payload};

/// Identifier of a handler-owned timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub u32);

enum TimerKind {
    User(TimerId),
    Heartbeat,
    RequestExpiry(u64),
}

struct TimerEntry {
    kind: TimerKind,
    deadline: Instant,
    period: Option<Duration>,
}

/// Armed timers of one worker
#[derive(Default)]
pub struct TimerSet {
    entries: Vec<TimerEntry>,
}

impl TimerSet {
    fn arm(&mut self, kind: TimerKind, delay: Duration, period: Option<Duration>) {
        self.entries.push(TimerEntry {
            kind,
            deadline: Instant::now() + delay,
            period,
        });
    }

    fn cancel_user(&mut self, id: TimerId) {
        self.entries
            .retain(|e| !matches!(e.kind, TimerKind::User(t) if t == id));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Collect everything due at `now`; periodic timers re-arm, one-shot
    /// timers are removed
    fn pop_due(&mut self, now: Instant) -> Vec<TimerKind> {
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].deadline > now {
                idx += 1;
                continue;
            }
            match self.entries[idx].period {
                Some(period) => {
                    self.entries[idx].deadline = now + period;
                    due.push(match self.entries[idx].kind {
                        TimerKind::User(id) => TimerKind::User(id),
                        TimerKind::Heartbeat => TimerKind::Heartbeat,
                        TimerKind::RequestExpiry(id) => TimerKind::RequestExpiry(id),
                    });
                    idx += 1;
                }
                None => {
                    let entry = self.entries.swap_remove(idx);
                    due.push(entry.kind);
                }
            }
        }
        due
    }
}

/// Per-dispatch view of the worker handed to the handler
pub struct WorkerCtx<'a> {
    name: &'static str,
    endpoint: EndpointId,
    bus: &'a Arc<Bus>,
    timers: &'a mut TimerSet,
}

impl<'a> WorkerCtx<'a> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn bus(&self) -> &Arc<Bus> {
        self.bus
    }

    /// Arm a periodic timer; re-armed automatically after each fire
    pub fn arm_periodic(&mut self, id: TimerId, initial_delay: Duration, period: Duration) {
        self.timers.cancel_user(id);
        self.timers
            .arm(TimerKind::User(id), initial_delay, Some(period));
    }

    /// Arm a one-shot timer
    pub fn arm_oneshot(&mut self, id: TimerId, delay: Duration) {
        self.timers.cancel_user(id);
        self.timers.arm(TimerKind::User(id), delay, None);
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel_user(id);
    }

    /// Register interest in a broadcast topic
    pub fn subscribe(&self, msg_id: MsgId) {
        self.bus.subscribe(msg_id, self.endpoint);
    }

    /// Release the reply for a received request
    pub fn respond(&self, token: ReplyToken, payload: Payload) {
        self.bus.respond(token, payload);
    }

    /// Signal completion of a broadcast delivery
    pub fn broadcast_handled(&self, token: BroadcastToken) {
        self.bus.broadcast_handled(token);
    }

    /// Asynchronous request; the completion runs on this worker. A non-zero
    /// timeout arms an expiry timer that fires the completion with `None`.
    pub fn request(
        &mut self,
        to: EndpointId,
        msg_id: MsgId,
        payload: Payload,
        timeout: Duration,
        cb: CompletionFn,
    ) {
        match self.bus.request(self.endpoint, to, msg_id, payload, cb) {
            Ok(req_id) => {
                if !timeout.is_zero() {
                    self.timers
                        .arm(TimerKind::RequestExpiry(req_id), timeout, None);
                }
            }
            Err(e) => warn!("{}: request {:?} to {:?} failed: {}", self.name, msg_id, to, e),
        }
    }

    /// Park this worker until the recipient replies or the timeout elapses.
    /// A handler must never issue a blocking request to its own endpoint.
    pub fn blocking_request(
        &self,
        to: EndpointId,
        msg_id: MsgId,
        payload: Payload,
        timeout: Duration,
    ) -> Option<Payload> {
        debug_assert_ne!(
            to, self.endpoint,
            "blocking request to own endpoint would deadlock"
        );
        self.bus.blocking_request(to, msg_id, payload, timeout)
    }
}

/// Cooperative handler run by a worker
pub trait WorkerHandler: Send {
    /// Runs once on the worker thread before the loop starts
    fn init(&mut self, ctx: &mut WorkerCtx<'_>);

    /// One inbox envelope; runs to completion before the next dispatch
    fn on_message(&mut self, ctx: &mut WorkerCtx<'_>, env: Envelope);

    /// One ready timer
    fn on_timer(&mut self, ctx: &mut WorkerCtx<'_>, timer: TimerId);

    /// Runs once after the stop flag is observed
    fn exit(&mut self, _ctx: &mut WorkerCtx<'_>) {}
}

pub struct WorkerConfig {
    pub name: &'static str,
    pub endpoint: EndpointId,
    /// serialized bus delivery (see bus docs)
    pub serialized: bool,
}

pub struct WorkerHandle {
    name: &'static str,
    endpoint: EndpointId,
    stop: Arc<AtomicBool>,
    bus: Arc<Bus>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Set the stop flag and wait for the worker to observe it and exit;
    /// in-flight handlers finish first
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.bus.post_wakeup(self.endpoint);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("worker {} panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn heartbeats() -> &'static RwLock<HashMap<&'static str, Arc<AtomicU64>>> {
    static HEARTBEATS: OnceLock<RwLock<HashMap<&'static str, Arc<AtomicU64>>>> = OnceLock::new();
    HEARTBEATS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Current heartbeat tick of a worker, if it exists
pub fn heartbeat_tick(name: &str) -> Option<u64> {
    heartbeats()
        .read()
        .get(name)
        .map(|hb| hb.load(Ordering::Relaxed))
}

/// Spawn a worker: register its endpoint, start the thread, run the loop
pub fn spawn(
    cfg: WorkerConfig,
    bus: Arc<Bus>,
    handler: Box<dyn WorkerHandler>,
) -> Result<WorkerHandle, AgentError> {
    let rx = bus.register(cfg.endpoint, cfg.serialized)?;
    let stop = Arc::new(AtomicBool::new(false));
    let heartbeat = Arc::new(AtomicU64::new(0));
    heartbeats().write().insert(cfg.name, heartbeat.clone());

    let thread_bus = bus.clone();
    let thread_stop = stop.clone();
    let name = cfg.name;
    let endpoint = cfg.endpoint;
    let serialized = cfg.serialized;
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            run_loop(
                name, endpoint, serialized, thread_bus, rx, thread_stop, heartbeat, handler,
            )
        })
        .map_err(|e| AgentError::Worker(format!("failed to spawn {}: {}", name, e)))?;

    Ok(WorkerHandle {
        name,
        endpoint,
        stop,
        bus,
        join: Some(join),
    })
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    name: &'static str,
    endpoint: EndpointId,
    serialized: bool,
    bus: Arc<Bus>,
    rx: Receiver<Envelope>,
    stop: Arc<AtomicBool>,
    heartbeat: Arc<AtomicU64>,
    mut handler: Box<dyn WorkerHandler>,
) {
    info!("worker {} starting", name);
    let mut timers = TimerSet::default();
    timers.arm(
        TimerKind::Heartbeat,
        HEARTBEAT_INTERVAL,
        Some(HEARTBEAT_INTERVAL),
    );
    {
        let mut ctx = WorkerCtx {
            name,
            endpoint,
            bus: &bus,
            timers: &mut timers,
        };
        handler.init(&mut ctx);
    }

    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        for kind in timers.pop_due(now) {
            match kind {
                TimerKind::User(id) => {
                    let mut ctx = WorkerCtx {
                        name,
                        endpoint,
                        bus: &bus,
                        timers: &mut timers,
                    };
                    handler.on_timer(&mut ctx, id);
                }
                TimerKind::Heartbeat => {
                    heartbeat.fetch_add(1, Ordering::Relaxed);
                }
                TimerKind::RequestExpiry(req_id) => {
                    bus.expire_request(req_id);
                }
            }
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let wait = timers
            .next_deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(WORKER_IDLE_WAIT);
        match rx.recv_timeout(wait) {
            Ok(env) => {
                let Envelope { msg_id, kind } = env;
                match kind {
                    EnvelopeKind::Completion { cb, data } => {
                        cb(data);
                        if serialized {
                            bus.delivery_complete(endpoint);
                        }
                    }
                    EnvelopeKind::Wakeup => {
                        if serialized {
                            bus.delivery_complete(endpoint);
                        }
                    }
                    kind => {
                        let mut ctx = WorkerCtx {
                            name,
                            endpoint,
                            bus: &bus,
                            timers: &mut timers,
                        };
                        handler.on_message(&mut ctx, Envelope { msg_id, kind });
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("worker {} inbox closed", name);
                break;
            }
        }
    }

    {
        let mut ctx = WorkerCtx {
            name,
            endpoint,
            bus: &bus,
            timers: &mut timers,
        };
        handler.exit(&mut ctx);
    }
    info!("worker {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct CountingHandler {
        ticks: Arc<AtomicU64>,
        messages: Arc<AtomicU64>,
        replies: Arc<Mutex<Vec<bool>>>,
    }

    impl WorkerHandler for CountingHandler {
        fn init(&mut self, ctx: &mut WorkerCtx<'_>) {
            ctx.arm_periodic(TimerId(7), Duration::from_millis(10), Duration::from_millis(10));
        }

        fn on_message(&mut self, ctx: &mut WorkerCtx<'_>, env: Envelope) {
            self.messages.fetch_add(1, Ordering::SeqCst);
            match env.kind {
                EnvelopeKind::Request { token, .. } => ctx.respond(token, Payload::ok()),
                EnvelopeKind::Broadcast { token, .. } => ctx.broadcast_handled(token),
                _ => {}
            }
        }

        fn on_timer(&mut self, _ctx: &mut WorkerCtx<'_>, timer: TimerId) {
            assert_eq!(timer, TimerId(7));
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn exit(&mut self, _ctx: &mut WorkerCtx<'_>) {
            self.replies.lock().unwrap().push(true);
        }
    }

    #[test]
    fn worker_runs_timers_and_messages() {
        let bus = Bus::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let messages = Arc::new(AtomicU64::new(0));
        let replies = Arc::new(Mutex::new(Vec::new()));
        let mut handle = spawn(
            WorkerConfig {
                name: "test-worker",
                endpoint: EndpointId::TestA,
                serialized: false,
            },
            bus.clone(),
            Box::new(CountingHandler {
                ticks: ticks.clone(),
                messages: messages.clone(),
                replies: replies.clone(),
            }),
        )
        .unwrap();

        let reply = bus.blocking_request(
            EndpointId::TestA,
            MsgId::ApiRequest,
            Payload::None,
            Duration::from_secs(5),
        );
        assert!(reply.is_some());

        std::thread::sleep(Duration::from_millis(80));
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(messages.load(Ordering::SeqCst), 1);

        handle.stop();
        // exit hook ran exactly once
        assert_eq!(replies.lock().unwrap().len(), 1);
    }

    #[test]
    fn serialized_worker_processes_requests_in_order() {
        let bus = Bus::new();
        let mut handle = spawn(
            WorkerConfig {
                name: "serial-worker",
                endpoint: EndpointId::TestB,
                serialized: true,
            },
            bus.clone(),
            Box::new(CountingHandler {
                ticks: Arc::new(AtomicU64::new(0)),
                messages: Arc::new(AtomicU64::new(0)),
                replies: Arc::new(Mutex::new(Vec::new())),
            }),
        )
        .unwrap();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let bus = bus.clone();
            joins.push(std::thread::spawn(move || {
                bus.blocking_request(
                    EndpointId::TestB,
                    MsgId::ApiRequest,
                    Payload::None,
                    Duration::from_secs(5),
                )
                .is_some()
            }));
        }
        for join in joins {
            assert!(join.join().unwrap());
        }
        handle.stop();
    }

    #[test]
    fn async_request_timeout_fires_completion_with_none() {
        let bus = Bus::new();
        // an endpoint that never answers
        let _silent = bus.register(EndpointId::TestB, false).unwrap();

        struct Requester {
            done: mpsc::Sender<bool>,
        }
        impl WorkerHandler for Requester {
            fn init(&mut self, ctx: &mut WorkerCtx<'_>) {
                let done = self.done.clone();
                ctx.request(
                    EndpointId::TestB,
                    MsgId::ApiRequest,
                    Payload::None,
                    Duration::from_millis(30),
                    Box::new(move |reply| {
                        let _ = done.send(reply.is_none());
                    }),
                );
            }
            fn on_message(&mut self, _ctx: &mut WorkerCtx<'_>, _env: Envelope) {}
            fn on_timer(&mut self, _ctx: &mut WorkerCtx<'_>, _timer: TimerId) {}
        }

        let (done_tx, done_rx) = mpsc::channel();
        let mut handle = spawn(
            WorkerConfig {
                name: "requester",
                endpoint: EndpointId::TestA,
                serialized: false,
            },
            bus.clone(),
            Box::new(Requester { done: done_tx }),
        )
        .unwrap();

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handle.stop();
    }

    #[test]
    fn heartbeat_registers() {
        let bus = Bus::new();
        let mut handle = spawn(
            WorkerConfig {
                name: "hb-worker",
                endpoint: EndpointId::TestA,
                serialized: false,
            },
            bus,
            Box::new(CountingHandler {
                ticks: Arc::new(AtomicU64::new(0)),
                messages: Arc::new(AtomicU64::new(0)),
                replies: Arc::new(Mutex::new(Vec::new())),
            }),
        )
        .unwrap();

        assert!(heartbeat_tick("hb-worker").is_some());
        assert_eq!(heartbeat_tick("no-such-worker"), None);
        handle.stop();
    }
}
