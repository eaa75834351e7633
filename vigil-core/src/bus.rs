//! In-process message bus
//!
//! Point-to-point request/response (blocking and asynchronous) and topic
//! broadcast between worker endpoints. Each endpoint owns a FIFO inbox;
//! posting never blocks on the recipient's processing.
//!
//! Request/reply is exactly-once: a pending table keyed by request id is
//! consumed atomically by whichever of `respond` or expiry fires first; the
//! loser finds the entry gone and the late outcome is discarded.
//!
//! An endpoint may register in *serialized delivery* mode: at most one
//! envelope is in flight to its handler at a time, later arrivals queue in a
//! hold list and are released when the handler signals completion through
//! `respond` or `broadcast_handled`. The API engine relies on this to keep
//! mutations from interleaving.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use vigil_error::AgentError;

use crate::msg::{EndpointId, MsgId, Payload};

/// Completion callback of an asynchronous request; runs on the originating
/// worker with `Some(reply)` or `None` on timeout
pub type CompletionFn = Box<dyn FnOnce(Option<Payload>) + Send>;

/// Reply handle carried by a request envelope; consumed by `respond`
pub struct ReplyToken {
    req_id: u64,
    dst: EndpointId,
}

/// Handle carried by a broadcast envelope; consumed by `broadcast_handled`
pub struct BroadcastToken {
    dst: EndpointId,
}

pub enum EnvelopeKind {
    /// point-to-point request expecting exactly one reply
    Request {
        payload: Payload,
        token: ReplyToken,
    },
    /// one copy of a topic broadcast
    Broadcast {
        payload: Payload,
        token: BroadcastToken,
    },
    /// reply (or timeout) completion routed back to the originator
    Completion {
        cb: CompletionFn,
        data: Option<Payload>,
    },
    /// empty envelope used to interrupt a waiting worker
    Wakeup,
}

pub struct Envelope {
    pub msg_id: MsgId,
    pub kind: EnvelopeKind,
}

enum PendingReply {
    /// caller is parked on a rendezvous channel
    Blocking(SyncSender<Payload>),
    /// completion is posted back to the originating endpoint
    Async {
        from: EndpointId,
        msg_id: MsgId,
        cb: CompletionFn,
    },
}

#[derive(Default)]
struct EndpointState {
    in_flight: bool,
    hold: VecDeque<Envelope>,
}

struct Endpoint {
    tx: Sender<Envelope>,
    serialized: bool,
    state: Mutex<EndpointState>,
}

pub struct Bus {
    endpoints: RwLock<HashMap<EndpointId, Arc<Endpoint>>>,
    subscribers: RwLock<HashMap<MsgId, Vec<EndpointId>>>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_req_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
        })
    }

    /// Bind an endpoint and hand back its inbox
    pub fn register(
        &self,
        endpoint: EndpointId,
        serialized: bool,
    ) -> Result<Receiver<Envelope>, AgentError> {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&endpoint) {
            return Err(AgentError::bus(format!(
                "endpoint {:?} already registered",
                endpoint
            )));
        }
        let (tx, rx) = mpsc::channel();
        endpoints.insert(
            endpoint,
            Arc::new(Endpoint {
                tx,
                serialized,
                state: Mutex::new(EndpointState::default()),
            }),
        );
        debug!("registered endpoint {:?} (serialized={})", endpoint, serialized);
        Ok(rx)
    }

    /// Register interest in a broadcast topic
    pub fn subscribe(&self, msg_id: MsgId, endpoint: EndpointId) {
        let mut subs = self.subscribers.write();
        let list = subs.entry(msg_id).or_default();
        if !list.contains(&endpoint) {
            list.push(endpoint);
        }
    }

    /// Deliver one copy of `payload` to every subscriber of the topic;
    /// returns the number of copies delivered
    pub fn broadcast(&self, msg_id: MsgId, payload: Payload) -> usize {
        let targets = self
            .subscribers
            .read()
            .get(&msg_id)
            .cloned()
            .unwrap_or_default();
        let mut delivered = 0;
        for dst in targets {
            let env = Envelope {
                msg_id,
                kind: EnvelopeKind::Broadcast {
                    payload: payload.clone(),
                    token: BroadcastToken { dst },
                },
            };
            if self.deliver(dst, env).is_ok() {
                delivered += 1;
            }
        }
        trace!("broadcast {:?} to {} subscribers", msg_id, delivered);
        delivered
    }

    /// Asynchronous request: `cb` runs on `from`'s worker with the reply, or
    /// with `None` if the request is later expired
    pub fn request(
        &self,
        from: EndpointId,
        to: EndpointId,
        msg_id: MsgId,
        payload: Payload,
        cb: CompletionFn,
    ) -> Result<u64, AgentError> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .insert(req_id, PendingReply::Async { from, msg_id, cb });
        let env = Envelope {
            msg_id,
            kind: EnvelopeKind::Request {
                payload,
                token: ReplyToken { req_id, dst: to },
            },
        };
        if let Err(e) = self.deliver(to, env) {
            self.pending.lock().remove(&req_id);
            return Err(e);
        }
        Ok(req_id)
    }

    /// Synchronous request: suspends the caller until a reply arrives or the
    /// timeout elapses. A zero timeout means no timeout. On expiry the
    /// caller gets `None` and any late reply is discarded.
    pub fn blocking_request(
        &self,
        to: EndpointId,
        msg_id: MsgId,
        payload: Payload,
        timeout: Duration,
    ) -> Option<Payload> {
        let (tx, rx) = mpsc::sync_channel(1);
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(req_id, PendingReply::Blocking(tx));
        let env = Envelope {
            msg_id,
            kind: EnvelopeKind::Request {
                payload,
                token: ReplyToken { req_id, dst: to },
            },
        };
        if let Err(e) = self.deliver(to, env) {
            warn!("blocking request {:?} to {:?} failed: {}", msg_id, to, e);
            self.pending.lock().remove(&req_id);
            return None;
        }
        if timeout.is_zero() {
            return rx.recv().ok();
        }
        match rx.recv_timeout(timeout) {
            Ok(payload) => Some(payload),
            Err(_) => {
                // the pending entry decides the race: if respond() already
                // consumed it the reply is sitting in the channel
                if self.pending.lock().remove(&req_id).is_some() {
                    debug!("blocking request {:?} to {:?} timed out", msg_id, to);
                    None
                } else {
                    rx.try_recv().ok()
                }
            }
        }
    }

    /// Release the reply for a received request; the first of respond/expiry
    /// wins, the other outcome is discarded
    pub fn respond(&self, token: ReplyToken, payload: Payload) {
        self.delivery_complete(token.dst);
        match self.pending.lock().remove(&token.req_id) {
            Some(PendingReply::Blocking(tx)) => {
                let _ = tx.send(payload);
            }
            Some(PendingReply::Async { from, msg_id, cb }) => {
                let env = Envelope {
                    msg_id,
                    kind: EnvelopeKind::Completion {
                        cb,
                        data: Some(payload),
                    },
                };
                if let Err(e) = self.deliver(from, env) {
                    warn!("dropping completion for {:?}: {}", from, e);
                }
            }
            None => {
                trace!("late response for request {} discarded", token.req_id);
            }
        }
    }

    /// Expire an asynchronous request; the completion fires with `None`
    /// exactly once even if a response races in
    pub fn expire_request(&self, req_id: u64) {
        match self.pending.lock().remove(&req_id) {
            Some(PendingReply::Async { from, msg_id, cb }) => {
                let env = Envelope {
                    msg_id,
                    kind: EnvelopeKind::Completion { cb, data: None },
                };
                if let Err(e) = self.deliver(from, env) {
                    warn!("dropping timeout completion for {:?}: {}", from, e);
                }
            }
            Some(PendingReply::Blocking(_)) | None => {}
        }
    }

    /// Signal completion of a held broadcast on a serialized endpoint
    pub fn broadcast_handled(&self, token: BroadcastToken) {
        self.delivery_complete(token.dst);
    }

    /// Interrupt a waiting worker
    pub fn post_wakeup(&self, endpoint: EndpointId) {
        let _ = self.deliver(
            endpoint,
            Envelope {
                msg_id: MsgId::Shutdown,
                kind: EnvelopeKind::Wakeup,
            },
        );
    }

    /// Release the next held envelope on a serialized endpoint, if any
    pub fn delivery_complete(&self, endpoint: EndpointId) {
        let ep = match self.endpoints.read().get(&endpoint) {
            Some(ep) => ep.clone(),
            None => return,
        };
        if !ep.serialized {
            return;
        }
        let mut state = ep.state.lock();
        if let Some(env) = state.hold.pop_front() {
            // keep in_flight set, the next envelope is on its way
            if ep.tx.send(env).is_err() {
                state.in_flight = false;
                state.hold.clear();
            }
        } else {
            state.in_flight = false;
        }
    }

    fn deliver(&self, to: EndpointId, env: Envelope) -> Result<(), AgentError> {
        let ep = self
            .endpoints
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| AgentError::bus(format!("no such endpoint {:?}", to)))?;
        if ep.serialized {
            let mut state = ep.state.lock();
            if state.in_flight {
                state.hold.push_back(env);
                return Ok(());
            }
            state.in_flight = true;
            if ep.tx.send(env).is_err() {
                state.in_flight = false;
                return Err(AgentError::bus(format!("endpoint {:?} inbox closed", to)));
            }
            return Ok(());
        }
        ep.tx
            .send(env)
            .map_err(|_| AgentError::bus(format!("endpoint {:?} inbox closed", to)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use vigil_error::{ApiStatus, ErrorCode};

    /// Service an endpoint inbox in a thread: respond to every request with
    /// the given status after an optional delay
    fn echo_endpoint(
        bus: Arc<Bus>,
        rx: Receiver<Envelope>,
        delay: Duration,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            while let Ok(env) = rx.recv() {
                match env.kind {
                    EnvelopeKind::Request { token, .. } => {
                        if !delay.is_zero() {
                            thread::sleep(delay);
                        }
                        bus.respond(token, Payload::ok());
                    }
                    EnvelopeKind::Wakeup => break,
                    _ => {}
                }
            }
        })
    }

    #[test]
    fn blocking_request_round_trip() {
        let bus = Bus::new();
        let rx = bus.register(EndpointId::TestA, false).unwrap();
        let server = echo_endpoint(bus.clone(), rx, Duration::ZERO);

        let reply = bus.blocking_request(
            EndpointId::TestA,
            MsgId::ApiRequest,
            Payload::None,
            Duration::from_secs(5),
        );
        let (status, code) = reply.expect("reply expected").as_status();
        assert_eq!(status, ApiStatus::Ok);
        assert_eq!(code, ErrorCode::None);

        bus.post_wakeup(EndpointId::TestA);
        server.join().unwrap();
    }

    #[test]
    fn blocking_request_times_out_once() {
        let bus = Bus::new();
        // endpoint registered but never serviced
        let _rx = bus.register(EndpointId::TestA, false).unwrap();
        let reply = bus.blocking_request(
            EndpointId::TestA,
            MsgId::ApiRequest,
            Payload::None,
            Duration::from_millis(30),
        );
        assert!(reply.is_none());
        // the pending table is empty again
        assert!(bus.pending.lock().is_empty());
    }

    #[test]
    fn request_to_unknown_endpoint_fails() {
        let bus = Bus::new();
        let reply = bus.blocking_request(
            EndpointId::TestB,
            MsgId::ApiRequest,
            Payload::None,
            Duration::from_millis(10),
        );
        assert!(reply.is_none());
    }

    #[test]
    fn async_request_completion_is_posted_to_originator() {
        let bus = Bus::new();
        let rx_a = bus.register(EndpointId::TestA, false).unwrap();
        let rx_b = bus.register(EndpointId::TestB, false).unwrap();
        let server = echo_endpoint(bus.clone(), rx_b, Duration::ZERO);

        let (done_tx, done_rx) = mpsc::channel();
        bus.request(
            EndpointId::TestA,
            EndpointId::TestB,
            MsgId::ApiRequest,
            Payload::None,
            Box::new(move |reply| {
                done_tx.send(reply.is_some()).unwrap();
            }),
        )
        .unwrap();

        // completion arrives on A's inbox; run it like a worker would
        match rx_a.recv_timeout(Duration::from_secs(5)).unwrap().kind {
            EnvelopeKind::Completion { cb, data } => cb(data),
            _ => panic!("expected completion"),
        }
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap());

        bus.post_wakeup(EndpointId::TestB);
        server.join().unwrap();
    }

    #[test]
    fn expired_request_completes_with_none_exactly_once() {
        let bus = Bus::new();
        let rx_a = bus.register(EndpointId::TestA, false).unwrap();
        let rx_b = bus.register(EndpointId::TestB, false).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let req_id = bus
            .request(
                EndpointId::TestA,
                EndpointId::TestB,
                MsgId::ApiRequest,
                Payload::None,
                Box::new(move |reply| {
                    done_tx.send(reply.is_none()).unwrap();
                }),
            )
            .unwrap();

        bus.expire_request(req_id);
        // a late response must be discarded
        match rx_b.recv_timeout(Duration::from_secs(1)).unwrap().kind {
            EnvelopeKind::Request { token, .. } => bus.respond(token, Payload::ok()),
            _ => panic!("expected request"),
        }

        // exactly one completion, and it carries None
        match rx_a.recv_timeout(Duration::from_secs(5)).unwrap().kind {
            EnvelopeKind::Completion { cb, data } => cb(data),
            _ => panic!("expected completion"),
        }
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(rx_a.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn serialized_endpoint_holds_second_request() {
        let bus = Bus::new();
        let rx = bus.register(EndpointId::TestA, true).unwrap();

        let bus2 = bus.clone();
        let t1 = thread::spawn(move || {
            bus2.blocking_request(
                EndpointId::TestA,
                MsgId::ApiRequest,
                Payload::None,
                Duration::from_secs(5),
            )
        });
        let bus3 = bus.clone();
        let t2 = thread::spawn(move || {
            bus3.blocking_request(
                EndpointId::TestA,
                MsgId::ApiRequest,
                Payload::None,
                Duration::from_secs(5),
            )
        });

        // first request is deliverable
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        // second stays in the hold list until the first is responded to
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        match first.kind {
            EnvelopeKind::Request { token, .. } => bus.respond(token, Payload::ok()),
            _ => panic!("expected request"),
        }
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        match second.kind {
            EnvelopeKind::Request { token, .. } => bus.respond(token, Payload::ok()),
            _ => panic!("expected request"),
        }

        assert!(t1.join().unwrap().is_some());
        assert!(t2.join().unwrap().is_some());
    }

    #[test]
    fn broadcast_reaches_every_subscriber_once() {
        let bus = Bus::new();
        let rx_a = bus.register(EndpointId::TestA, false).unwrap();
        let rx_b = bus.register(EndpointId::TestB, false).unwrap();
        bus.subscribe(MsgId::TestTopic, EndpointId::TestA);
        bus.subscribe(MsgId::TestTopic, EndpointId::TestB);
        // double subscription must not double delivery
        bus.subscribe(MsgId::TestTopic, EndpointId::TestA);

        let delivered = bus.broadcast(MsgId::TestTopic, Payload::Shutdown);
        assert_eq!(delivered, 2);

        for rx in [&rx_a, &rx_b] {
            let env = rx.recv_timeout(Duration::from_secs(1)).unwrap();
            assert!(matches!(env.kind, EnvelopeKind::Broadcast { .. }));
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        }
    }

    #[test]
    fn broadcast_without_subscribers_is_a_noop() {
        let bus = Bus::new();
        assert_eq!(bus.broadcast(MsgId::TestTopic, Payload::Shutdown), 0);
    }
}
