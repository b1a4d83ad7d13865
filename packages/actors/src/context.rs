//! Execution contexts: the boundary between an instance and its engine.
//!
//! A [`HandlerInstance`](crate::HandlerInstance) never touches handler logic
//! directly. It asks an [`ExecutionContextProvider`] for a context, and the
//! context owns the logic and the engine that drives it. The bundled
//! [`LocalProvider`] runs everything in-process.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    ClientId, HandlerDefinition, HandlerId, HandlerSettings, HandlerStats, JobResult, JobTicket,
};

use crate::engine::{DEFAULT_LOOP_INTERVAL, EngineChannels, HandlerQueueEngine, RunId, lock};
use crate::loader::LoadedHandler;
use crate::logic::{HandlerLogic, InitError};

/// Handle to one run of a handler.
///
/// Calls are synchronous from the caller's point of view except for
/// `start` and `stop`, which wait for the control loop.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    fn handler_id(&self) -> HandlerId;

    /// Run id of the live engine, if started.
    fn run_id(&self) -> Option<RunId>;

    /// Build the handler logic. Must succeed before `start`.
    fn initialize(&mut self) -> Result<HandlerId, InitError>;

    async fn start(&mut self) -> Result<RunId, InitError>;

    /// Stop the engine. Safe to call more than once.
    async fn stop(&mut self);

    /// Withhold new job creation.
    fn pause(&mut self);

    /// Allow new job creation again.
    fn enable(&mut self);

    /// Withhold new job creation and refuse dispatch.
    fn disable(&mut self);

    fn get_info(&self) -> HandlerStats;

    fn get_job(&self, client: &ClientId) -> Option<JobTicket>;

    fn received_result(&self, result: JobResult) -> bool;

    fn has_jobs(&self) -> bool;

    fn update_settings(&mut self, settings: &HandlerSettings);

    /// Reclaim timed-out jobs as of `now`.
    fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize;
}

/// Creates execution contexts.
pub trait ExecutionContextProvider: Send + Sync + 'static {
    fn create(
        &self,
        definition: &HandlerDefinition,
        loaded: &LoadedHandler,
        channels: EngineChannels,
    ) -> Box<dyn ExecutionContext>;
}

/// Provider that runs handler logic in this process.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    loop_interval: Duration,
}

impl LocalProvider {
    pub fn new(loop_interval: Duration) -> Self {
        Self { loop_interval }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new(DEFAULT_LOOP_INTERVAL)
    }
}

impl ExecutionContextProvider for LocalProvider {
    fn create(
        &self,
        definition: &HandlerDefinition,
        loaded: &LoadedHandler,
        channels: EngineChannels,
    ) -> Box<dyn ExecutionContext> {
        Box::new(LocalContext::new(
            definition.clone(),
            loaded.clone(),
            self.loop_interval,
            channels,
        ))
    }
}

/// In-process execution context.
pub struct LocalContext {
    definition: HandlerDefinition,
    loaded: LoadedHandler,
    engine: HandlerQueueEngine,
    staged: Mutex<Option<Box<dyn HandlerLogic>>>,
    accepting_clients: bool,
}

impl LocalContext {
    pub fn new(
        definition: HandlerDefinition,
        loaded: LoadedHandler,
        loop_interval: Duration,
        channels: EngineChannels,
    ) -> Self {
        let engine = HandlerQueueEngine::new(
            definition.id,
            definition.settings.clone(),
            loop_interval,
            channels,
        );
        Self {
            definition,
            loaded,
            engine,
            staged: Mutex::new(None),
            accepting_clients: true,
        }
    }
}

#[async_trait]
impl ExecutionContext for LocalContext {
    fn handler_id(&self) -> HandlerId {
        self.definition.id
    }

    fn run_id(&self) -> Option<RunId> {
        self.engine.run_id()
    }

    fn initialize(&mut self) -> Result<HandlerId, InitError> {
        let factory = self.loaded.factory.clone();
        let created = catch_unwind(AssertUnwindSafe(|| {
            factory.create(&self.definition, &self.loaded.params)
        }));

        let logic = match created {
            Ok(Ok(logic)) => logic,
            Ok(Err(e)) => return Err(e),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                return Err(InitError::Panicked(message));
            }
        };

        *lock(&self.staged) = Some(logic);
        tracing::debug!(
            handler_id = %self.definition.id,
            entry = %self.loaded.entry,
            "Handler logic initialized"
        );
        Ok(self.definition.id)
    }

    async fn start(&mut self) -> Result<RunId, InitError> {
        if let Some(run_id) = self.engine.run_id() {
            return Ok(run_id);
        }
        let logic = lock(&self.staged).take().ok_or(InitError::NotInitialized)?;
        self.accepting_clients = true;
        self.engine.start(logic).await
    }

    async fn stop(&mut self) {
        self.engine.stop().await;
        lock(&self.staged).take();
    }

    fn pause(&mut self) {
        self.engine.set_allow_new_jobs(false);
    }

    fn enable(&mut self) {
        self.accepting_clients = true;
        self.engine.set_allow_new_jobs(true);
    }

    fn disable(&mut self) {
        self.accepting_clients = false;
        self.engine.set_allow_new_jobs(false);
    }

    fn get_info(&self) -> HandlerStats {
        self.engine.stats()
    }

    fn get_job(&self, client: &ClientId) -> Option<JobTicket> {
        if !self.accepting_clients {
            return None;
        }
        self.engine.get_job(client)
    }

    fn received_result(&self, result: JobResult) -> bool {
        self.engine.received_result(result)
    }

    fn has_jobs(&self) -> bool {
        self.accepting_clients && self.engine.has_available()
    }

    fn update_settings(&mut self, settings: &HandlerSettings) {
        self.definition.settings = settings.clone();
        self.engine.update_settings(settings);
    }

    fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize {
        self.engine.sweep_timeouts(now)
    }
}
