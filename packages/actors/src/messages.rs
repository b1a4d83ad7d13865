//! Message types for actor communication.

use chrono::{DateTime, Utc};
use fleet_core::HandlerId;

use crate::engine::RunId;

/// Why the control loop was woken before its next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// A client took the last available job.
    QueueDrained,
    /// A successful result is waiting in the finished queue.
    ResultReady,
    /// A client reported a failure.
    JobFailed,
}

/// Messages for the ControlLoop actor.
#[derive(Debug)]
pub enum ControlMessage {
    /// Periodic iteration.
    Tick,

    /// Iterate now instead of waiting for the next tick.
    Wake(WakeReason),
}

/// How an engine run ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeKind {
    /// Handler logic reported completion.
    Finished,
    /// The loop hit a runtime fault.
    Failed { reason: String },
}

/// Sent by a control loop when its run ends without a `stop()` call.
///
/// The registry consumes these to tear the engine down and move the
/// instance into `Finished` or `Failed`.
#[derive(Debug, Clone)]
pub struct EngineNotice {
    pub handler_id: HandlerId,
    pub run_id: RunId,
    pub kind: NoticeKind,
    pub timestamp: DateTime<Utc>,
}
