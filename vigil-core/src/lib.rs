//! Vigil control plane
//!
//! The agent core: a typed in-process message bus, single-threaded
//! cooperative workers, the keyed object store with its mutation latch, the
//! serializing API engine, and the event/watch monitors that fan hardware
//! telemetry out to streaming subscribers.
//!
//! The RPC transport lives in `vigil-daemon`; hardware access lives behind
//! the `SmiBackend` trait in `vigil-smi`. Everything here is wired together
//! by [`System::start`].

pub mod api;
pub mod api_engine;
pub mod bus;
pub mod constants;
pub mod event_monitor;
pub mod msg;
pub mod objects;
pub mod store;
pub mod subscriber;
pub mod system;
pub mod watch_monitor;
pub mod worker;

pub use subscriber::{ClientCtx, EventClientCtx, WatchClientCtx, WriteCb};
pub use system::{System, SystemConfig};
pub use worker::heartbeat_tick;
