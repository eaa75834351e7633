//! Streaming client contexts
//!
//! One context per subscribed RPC stream, shared between the RPC thread and
//! a monitor. The monitor owns the `inactive` transition and signals while
//! still holding its reference; the RPC thread waits out the condition
//! variable and then reclaims the context.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::info;
use vigil_protocol::{EventInfo, WatchInfo};

/// Write callback closing over the client's stream; an error return marks
/// the client dead
pub type WriteCb<T> = Box<dyn Fn(&T) -> Result<(), ()> + Send + Sync>;

pub struct ClientCtx<T> {
    /// peer address, for the logs
    client: String,
    write_cb: WriteCb<T>,
    inactive: Mutex<bool>,
    cond: Condvar,
}

impl<T> ClientCtx<T> {
    pub fn new(client: impl Into<String>, write_cb: WriteCb<T>) -> Arc<Self> {
        Arc::new(Self {
            client: client.into(),
            write_cb,
            inactive: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// Deliver one item to the client stream
    pub fn write(&self, item: &T) -> Result<(), ()> {
        (self.write_cb)(item)
    }

    pub fn is_inactive(&self) -> bool {
        *self.inactive.lock()
    }

    /// Mark the client dead and wake the parked RPC thread. Called by the
    /// monitor after the context has been removed from its maps.
    pub fn mark_inactive(&self) {
        let mut inactive = self.inactive.lock();
        *inactive = true;
        info!("signaling subscribed client {} to quit", self.client);
        self.cond.notify_all();
    }

    /// Park until the monitor marks this context inactive
    pub fn wait_inactive(&self) {
        let mut inactive = self.inactive.lock();
        while !*inactive {
            self.cond.wait(&mut inactive);
        }
    }
}

pub type EventClientCtx = ClientCtx<EventInfo>;
pub type WatchClientCtx = ClientCtx<WatchInfo>;
