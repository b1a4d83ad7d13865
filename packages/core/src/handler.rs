//! Handler domain types: identity, settings, lifecycle state and statistics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{ClientId, ClientSelector};

/// Unique identifier for a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub Ulid);

impl HandlerId {
    /// Create a new unique handler ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a handler ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The package/handler/job triple that identifies a handler across re-adds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FullName {
    pub package: String,
    pub handler: String,
    pub job: String,
}

impl FullName {
    pub fn new(
        package: impl Into<String>,
        handler: impl Into<String>,
        job: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            handler: handler.into(),
            job: job.into(),
        }
    }
}

impl std::fmt::Display for FullName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.package, self.handler, self.job)
    }
}

/// Externally visible lifecycle state of a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    /// Not running; no engine.
    #[default]
    Stopped,
    /// Engine active and jobs are dispatched.
    Running,
    /// Engine active but inside the idle window; no dispatch.
    Idle,
    /// Engine active; no new jobs are created.
    Paused,
    /// Administratively switched off.
    Disabled,
    /// Handler logic reported completion.
    Finished,
    /// Initialization or runtime fault.
    Failed,
}

impl HandlerState {
    /// States in which an engine must be running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            HandlerState::Running | HandlerState::Idle | HandlerState::Paused
        )
    }

    /// States from which a cron trigger may restart the handler.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            HandlerState::Stopped | HandlerState::Finished | HandlerState::Failed
        )
    }
}

impl std::fmt::Display for HandlerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerState::Stopped => write!(f, "stopped"),
            HandlerState::Running => write!(f, "running"),
            HandlerState::Idle => write!(f, "idle"),
            HandlerState::Paused => write!(f, "paused"),
            HandlerState::Disabled => write!(f, "disabled"),
            HandlerState::Finished => write!(f, "finished"),
            HandlerState::Failed => write!(f, "failed"),
        }
    }
}

/// Configuration of a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    /// Seconds a client may hold a job before it is reclaimed. 0 disables.
    pub job_timeout_secs: u64,
    /// Start as soon as the handler is created.
    pub autostart: bool,
    /// Cron expression for scheduled restarts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// Daily window `HH:MM-HH:MM` in which no jobs are dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_time: Option<String>,
    /// Consecutive failed results before the handler is failed. 0 disables.
    pub max_sequenced_errors: u32,
    /// Clients allowed to take jobs. Empty allows everyone.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_clients: Vec<String>,
    /// Clients never given jobs. Checked after `allowed_clients`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub denied_clients: Vec<String>,
}

impl HandlerSettings {
    /// Whether `client` passes the allow/deny selectors.
    pub fn accepts_client(&self, client: &ClientId) -> bool {
        let allowed = self.allowed_clients.is_empty()
            || self
                .allowed_clients
                .iter()
                .any(|s| ClientSelector::new(s).matches(client));
        allowed
            && !self
                .denied_clients
                .iter()
                .any(|s| ClientSelector::new(s).matches(client))
    }
}

/// A registered handler: identity, configuration and source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerDefinition {
    /// Generated identifier.
    pub id: HandlerId,
    /// Unique package/handler/job name.
    pub name: FullName,
    /// Configuration.
    #[serde(default)]
    pub settings: HandlerSettings,
    /// Source text handed to the loader.
    #[serde(default)]
    pub source: String,
}

impl HandlerDefinition {
    /// Create a new definition with default settings.
    pub fn new(name: FullName, source: impl Into<String>) -> Self {
        Self {
            id: HandlerId::new(),
            name,
            settings: HandlerSettings::default(),
            source: source.into(),
        }
    }

    /// Set the settings for this definition.
    pub fn with_settings(mut self, settings: HandlerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Whether `other` carries the same name, settings and source.
    ///
    /// The id is ignored: a re-added definition gets a fresh id.
    pub fn same_content(&self, other: &HandlerDefinition) -> bool {
        self.name == other.name && self.settings == other.settings && self.source == other.source
    }
}

/// Queue statistics for a running handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerStats {
    /// Jobs waiting for a client.
    pub available: u64,
    /// Jobs assigned and awaiting a result.
    pub pending: u64,
    /// Successful results since the engine started.
    pub processed: u64,
    /// Failed results since the engine started.
    pub failed: u64,
}

impl HandlerStats {
    /// Jobs still in flight (available + pending).
    pub fn active(&self) -> u64 {
        self.available + self.pending
    }
}

/// Snapshot of a handler for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub id: HandlerId,
    pub name: FullName,
    pub state: HandlerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_start: Option<DateTime<Utc>>,
    pub stats: HandlerStats,
}
