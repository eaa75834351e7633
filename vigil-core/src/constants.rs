//! Control-plane constants

use std::time::Duration;

use crate::worker::TimerId;

/// Heartbeat punch cadence of every worker
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before the event monitor starts polling the backend
pub const EVENT_MONITOR_START_DELAY: Duration = Duration::from_secs(10);

/// Event monitor poll cadence
pub const EVENT_MONITOR_INTERVAL: Duration = Duration::from_secs(3);

/// Watch monitor sample cadence
pub const WATCH_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Wall-clock bound on one blocking API request
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback wait when a worker has no armed timer
pub const WORKER_IDLE_WAIT: Duration = Duration::from_millis(500);

/// Timer identifiers used by the control-plane workers
pub mod timer {
    use super::TimerId;

    /// event monitor poll tick
    pub const EVENT_POLL: TimerId = TimerId(1);
    /// watch monitor sample tick
    pub const WATCH_SAMPLE: TimerId = TimerId(2);
}
