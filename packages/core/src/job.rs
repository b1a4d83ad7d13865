//! Job domain types for units of work handed out to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{ClientId, HandlerId};

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job as tracked server-side.
///
/// The assignment and result fields are bookkeeping that never leaves the
/// server; clients only ever see a [`JobTicket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// The handler that produced this job.
    pub handler_id: HandlerId,
    /// Opaque input payload produced by handler logic.
    pub input: serde_json::Value,
    /// When the job entered the available queue for the first time.
    pub enqueued_at: DateTime<Utc>,
    /// Client currently holding the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<ClientId>,
    /// When the job was handed to `assigned_to`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    /// When a successful result was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_at: Option<DateTime<Utc>>,
    /// Output payload reported by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl Job {
    /// Create a new unassigned job.
    pub fn new(handler_id: HandlerId, input: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            handler_id,
            input,
            enqueued_at: Utc::now(),
            assigned_to: None,
            assigned_at: None,
            result_at: None,
            output: None,
        }
    }

    /// Record that `client` took the job at `now`.
    pub fn assign(&mut self, client: ClientId, now: DateTime<Utc>) {
        self.assigned_to = Some(client);
        self.assigned_at = Some(now);
    }

    /// Drop the assignment so the job can be handed out again.
    pub fn reset_assignment(&mut self) {
        self.assigned_to = None;
        self.assigned_at = None;
    }

    /// Record a successful result.
    pub fn complete(&mut self, output: serde_json::Value, now: DateTime<Utc>) {
        self.output = Some(output);
        self.result_at = Some(now);
    }

    /// Whether the assignment is older than `timeout_secs` at `now`.
    ///
    /// A zero timeout never expires.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout_secs: u64) -> bool {
        if timeout_secs == 0 {
            return false;
        }
        match self.assigned_at {
            Some(assigned_at) => (now - assigned_at).num_seconds() > timeout_secs as i64,
            None => false,
        }
    }

    /// The client-facing copy of this job.
    pub fn ticket(&self) -> JobTicket {
        JobTicket {
            id: self.id,
            handler_id: self.handler_id,
            input: self.input.clone(),
        }
    }
}

/// What a client receives from `GetJob`: id, owning handler and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTicket {
    pub id: JobId,
    pub handler_id: HandlerId,
    pub input: serde_json::Value,
}

/// Error detail attached to a failed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// Success or failure reported by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { output: serde_json::Value },
    Failure { error: JobError },
}

/// A result reported by a client for a job it was assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub handler_id: HandlerId,
    pub client_id: ClientId,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn success(ticket: &JobTicket, client_id: ClientId, output: serde_json::Value) -> Self {
        Self {
            job_id: ticket.id,
            handler_id: ticket.handler_id,
            client_id,
            outcome: JobOutcome::Success { output },
        }
    }

    pub fn failure(
        ticket: &JobTicket,
        client_id: ClientId,
        message: impl Into<String>,
        trace: Option<String>,
    ) -> Self {
        Self {
            job_id: ticket.id,
            handler_id: ticket.handler_id,
            client_id,
            outcome: JobOutcome::Failure {
                error: JobError {
                    message: message.into(),
                    trace,
                },
            },
        }
    }

    /// Whether the client reported success.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Success { .. })
    }
}
