//! Registry errors and outcomes.

use db::DbError;
use fleet_core::HandlerId;
use serde::{Deserialize, Serialize};

use crate::loader::LoadError;
use crate::logic::InitError;

/// Stable reason codes for the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ParseFailed,
    CompileFailed,
    MissingInitializer,
    NotFound,
    Disabled,
    InitializationFailed,
    Persistence,
}

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("handler not found: {0}")]
    NotFound(HandlerId),

    #[error("handler is disabled: {0}")]
    Disabled(HandlerId),

    #[error(transparent)]
    Initialization(#[from] InitError),

    #[error("catalog error: {0}")]
    Persistence(#[from] DbError),
}

impl RegistryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::Load(LoadError::Parse(_)) => ErrorCode::ParseFailed,
            RegistryError::Load(LoadError::Compile { .. }) => ErrorCode::CompileFailed,
            RegistryError::Load(LoadError::MissingInitializer(_)) => ErrorCode::MissingInitializer,
            RegistryError::NotFound(_) => ErrorCode::NotFound,
            RegistryError::Disabled(_) => ErrorCode::Disabled,
            RegistryError::Initialization(_) => ErrorCode::InitializationFailed,
            RegistryError::Persistence(_) => ErrorCode::Persistence,
        }
    }
}

/// What `add` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "handler_id", rename_all = "snake_case")]
pub enum AddOutcome {
    Created(HandlerId),
    Updated(HandlerId),
    Unchanged(HandlerId),
}

impl AddOutcome {
    pub fn handler_id(&self) -> HandlerId {
        match self {
            AddOutcome::Created(id) | AddOutcome::Updated(id) | AddOutcome::Unchanged(id) => *id,
        }
    }
}
