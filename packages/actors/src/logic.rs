//! Contracts for user-supplied handler logic.
//!
//! Handler logic is driven by exactly one control loop and never touched from
//! request threads, so implementations only need to be `Send`, not `Sync`.

use std::sync::Arc;

use fleet_core::{HandlerDefinition, HandlerId, JobId, LogLevel};
use serde_json::Value;

use crate::engine::EngineShared;

/// Error raised by handler logic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LogicError(pub String);

impl LogicError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for LogicError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for LogicError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Error raised while building or starting handler logic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("handler initialization failed: {0}")]
    Failed(String),

    #[error("handler initializer panicked: {0}")]
    Panicked(String),

    #[error("execution context was not initialized")]
    NotInitialized,
}

/// Handle passed to handler logic on every call.
///
/// Gives access to the available queue and to the handler's log stream.
pub struct HandlerContext<'a> {
    shared: &'a EngineShared,
    created: usize,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(shared: &'a EngineShared) -> Self {
        Self { shared, created: 0 }
    }

    /// The handler this logic runs for.
    pub fn handler_id(&self) -> HandlerId {
        self.shared.handler_id()
    }

    /// Enqueue a new job with `input` as its payload.
    pub fn push_job(&mut self, input: Value) -> JobId {
        self.created += 1;
        self.shared.push_new_job(input)
    }

    /// Jobs pushed through this context so far.
    pub fn created(&self) -> usize {
        self.created
    }

    /// Jobs currently waiting for a client.
    pub fn available(&self) -> usize {
        self.shared.available_len()
    }

    /// Write to the handler's log stream.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.shared.log(level, message.into());
    }
}

/// User handler logic.
pub trait HandlerLogic: Send + 'static {
    /// Called once when the engine starts, before any other call.
    fn on_start(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<(), LogicError> {
        Ok(())
    }

    /// Push zero or more jobs. Called whenever the available queue runs dry.
    fn create_more_jobs(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), LogicError>;

    /// Consume a successful result, once per job, in arrival order.
    fn process_result(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        input: &Value,
        output: &Value,
    ) -> Result<(), LogicError>;

    /// Whether all work is done. Checked once per loop iteration.
    fn is_finished(&self) -> bool {
        false
    }

    /// Called when `is_finished` first reports true.
    fn on_finish(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<(), LogicError> {
        Ok(())
    }

    /// Called when the engine is stopped, unless the loop faulted.
    fn on_stop(&mut self, _ctx: &mut HandlerContext<'_>) {}
}

/// Builds handler logic instances. This is what the loader hands back.
pub trait HandlerFactory: Send + Sync + 'static {
    /// Check loader parameters before anything is created.
    fn validate(&self, _params: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Create a fresh logic instance for one engine run.
    fn create(
        &self,
        definition: &HandlerDefinition,
        params: &Value,
    ) -> Result<Box<dyn HandlerLogic>, InitError>;
}

/// A closure-based handler factory.
pub struct FnFactory<F>
where
    F: Fn(&HandlerDefinition, &Value) -> Result<Box<dyn HandlerLogic>, InitError>
        + Send
        + Sync
        + 'static,
{
    create: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&HandlerDefinition, &Value) -> Result<Box<dyn HandlerLogic>, InitError>
        + Send
        + Sync
        + 'static,
{
    pub fn new(create: F) -> Self {
        Self { create }
    }

    pub fn shared(create: F) -> Arc<dyn HandlerFactory> {
        Arc::new(Self::new(create))
    }
}

impl<F> HandlerFactory for FnFactory<F>
where
    F: Fn(&HandlerDefinition, &Value) -> Result<Box<dyn HandlerLogic>, InitError>
        + Send
        + Sync
        + 'static,
{
    fn create(
        &self,
        definition: &HandlerDefinition,
        params: &Value,
    ) -> Result<Box<dyn HandlerLogic>, InitError> {
        (self.create)(definition, params)
    }
}
