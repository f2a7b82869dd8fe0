//! Core heartbeat logic.
//!
//! The agent composes:
//! - A bounded, observable tick interval
//! - Action routing from payload to endpoint
//! - Reply correlation for in-flight requests
//! - The scheduler task that ties them together

mod correlator;
mod heartbeat;
mod interval;
mod payload;
mod router;

pub use correlator::{CorrelationMode, PendingReply, ResponseCorrelator};
pub use heartbeat::{
    DEFAULT_EVENT_HISTORY, DEFAULT_MAX_ATTEMPTS, DEFAULT_REPLY_TIMEOUT, DEFAULT_RETRY_DELAY,
    HeartbeatConfig, HeartbeatEvent, HeartbeatParts, HeartbeatScheduler, PendingRequest,
    ScheduleState, ScheduleStatus, TickOutcome,
};
pub use interval::{DEFAULT_INTERVAL, IntervalController, MAX_INTERVAL, MIN_INTERVAL};
pub use payload::{HeartbeatPayload, PayloadSource, TickContext};
pub use router::{ActionRouter, DEFAULT_ROUTES, ROOT_PATH, RoutingTable, declared_action};
