//! Event records published by the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClientId, FullName, HandlerId, HandlerState, JobId};

/// Why a job went back to the available queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueReason {
    /// The assigned client did not report back in time.
    Timeout,
    /// The client reported an error.
    Failure,
}

/// Severity of a log entry emitted by handler logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the handler system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HandlerEvent {
    /// A handler was registered.
    HandlerAdded {
        handler_id: HandlerId,
        name: FullName,
        timestamp: DateTime<Utc>,
    },
    /// A handler was removed.
    HandlerRemoved {
        handler_id: HandlerId,
        timestamp: DateTime<Utc>,
    },
    /// A handler changed lifecycle state.
    StateChanged {
        handler_id: HandlerId,
        old_state: HandlerState,
        new_state: HandlerState,
        timestamp: DateTime<Utc>,
    },
    /// A job was handed to a client.
    JobAssigned {
        handler_id: HandlerId,
        job_id: JobId,
        client_id: ClientId,
        timestamp: DateTime<Utc>,
    },
    /// A client reported success.
    JobCompleted {
        handler_id: HandlerId,
        job_id: JobId,
        client_id: ClientId,
        timestamp: DateTime<Utc>,
    },
    /// A job went back to the available queue.
    JobRequeued {
        handler_id: HandlerId,
        job_id: JobId,
        reason: RequeueReason,
        timestamp: DateTime<Utc>,
    },
    /// A log entry from handler logic.
    Log {
        handler_id: HandlerId,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl HandlerEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HandlerEvent::HandlerAdded { timestamp, .. } => *timestamp,
            HandlerEvent::HandlerRemoved { timestamp, .. } => *timestamp,
            HandlerEvent::StateChanged { timestamp, .. } => *timestamp,
            HandlerEvent::JobAssigned { timestamp, .. } => *timestamp,
            HandlerEvent::JobCompleted { timestamp, .. } => *timestamp,
            HandlerEvent::JobRequeued { timestamp, .. } => *timestamp,
            HandlerEvent::Log { timestamp, .. } => *timestamp,
        }
    }

    /// Get the handler ID associated with this event.
    pub fn handler_id(&self) -> HandlerId {
        match self {
            HandlerEvent::HandlerAdded { handler_id, .. } => *handler_id,
            HandlerEvent::HandlerRemoved { handler_id, .. } => *handler_id,
            HandlerEvent::StateChanged { handler_id, .. } => *handler_id,
            HandlerEvent::JobAssigned { handler_id, .. } => *handler_id,
            HandlerEvent::JobCompleted { handler_id, .. } => *handler_id,
            HandlerEvent::JobRequeued { handler_id, .. } => *handler_id,
            HandlerEvent::Log { handler_id, .. } => *handler_id,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            HandlerEvent::JobAssigned { job_id, .. } => Some(*job_id),
            HandlerEvent::JobCompleted { job_id, .. } => Some(*job_id),
            HandlerEvent::JobRequeued { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            HandlerEvent::HandlerAdded { name, .. } => format!("Handler '{}' added", name),
            HandlerEvent::HandlerRemoved { handler_id, .. } => {
                format!("Handler {} removed", handler_id)
            }
            HandlerEvent::StateChanged {
                handler_id,
                old_state,
                new_state,
                ..
            } => format!("Handler {} {} -> {}", handler_id, old_state, new_state),
            HandlerEvent::JobAssigned {
                job_id, client_id, ..
            } => format!("Job {} assigned to {}", job_id, client_id),
            HandlerEvent::JobCompleted {
                job_id, client_id, ..
            } => format!("Job {} completed by {}", job_id, client_id),
            HandlerEvent::JobRequeued { job_id, reason, .. } => match reason {
                RequeueReason::Timeout => format!("Job {} requeued after timeout", job_id),
                RequeueReason::Failure => format!("Job {} requeued after failure", job_id),
            },
            HandlerEvent::Log {
                handler_id,
                message,
                ..
            } => format!("Handler {}: {}", handler_id, message),
        }
    }
}
