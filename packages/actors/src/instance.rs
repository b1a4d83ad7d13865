//! Handler instance: definition, execution context and lifecycle state.

use std::sync::Arc;

use chrono::{DateTime, Local, NaiveTime, Utc};
use fleet_core::{
    ClientId, CronSchedule, HandlerDefinition, HandlerEvent, HandlerId, HandlerInfo,
    HandlerSettings, HandlerState, IdleWindow, JobResult, JobTicket,
};

use crate::context::{ExecutionContext, ExecutionContextProvider};
use crate::engine::EngineChannels;
use crate::loader::LoadedHandler;
use crate::logic::InitError;
use crate::messages::{EngineNotice, NoticeKind};

/// One registered handler and its externally visible state machine.
///
/// An execution context exists exactly while the state is `Running`,
/// `Idle` or `Paused`.
pub struct HandlerInstance {
    definition: HandlerDefinition,
    loaded: LoadedHandler,
    state: HandlerState,
    context: Option<Box<dyn ExecutionContext>>,
    cron: Option<CronSchedule>,
    idle: Option<IdleWindow>,
    started_at: Option<DateTime<Utc>>,
    next_start: Option<DateTime<Utc>>,
    provider: Arc<dyn ExecutionContextProvider>,
    channels: EngineChannels,
    removed: bool,
}

impl HandlerInstance {
    pub fn new(
        definition: HandlerDefinition,
        loaded: LoadedHandler,
        provider: Arc<dyn ExecutionContextProvider>,
        channels: EngineChannels,
    ) -> Self {
        let settings = definition.settings.clone();
        let mut instance = Self {
            definition,
            loaded,
            state: HandlerState::Stopped,
            context: None,
            cron: None,
            idle: None,
            started_at: None,
            next_start: None,
            provider,
            channels,
            removed: false,
        };
        instance.update_settings(settings);
        instance
    }

    pub fn id(&self) -> HandlerId {
        self.definition.id
    }

    pub fn definition(&self) -> &HandlerDefinition {
        &self.definition
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn next_start(&self) -> Option<DateTime<Utc>> {
        self.next_start
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// Whether the instance was taken out of its registry.
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Detach the instance from its registry. It will never start again.
    pub async fn retire(&mut self) {
        self.removed = true;
        self.stop().await;
    }

    /// Replace source and settings, keeping the id and any running engine.
    ///
    /// A new source takes effect on the next start.
    pub fn update_definition(&mut self, mut definition: HandlerDefinition, loaded: LoadedHandler) {
        definition.id = self.definition.id;
        let settings = definition.settings.clone();
        self.definition = definition;
        self.loaded = loaded;
        self.update_settings(settings);
    }

    /// Apply settings and re-derive the cron schedule and idle window.
    ///
    /// A bad cron expression or idle window only switches that feature off.
    pub fn update_settings(&mut self, settings: HandlerSettings) {
        let id = self.definition.id;

        self.cron = match settings.cron.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(expression) => match CronSchedule::parse(expression) {
                Ok(schedule) => Some(schedule),
                Err(e) => {
                    tracing::warn!(handler_id = %id, "Scheduling disabled: {}", e);
                    None
                }
            },
        };
        self.next_start = self
            .cron
            .as_ref()
            .and_then(|cron| cron.next_after(Utc::now()));

        self.idle = match settings.idle_time.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(window) => match IdleWindow::parse(window) {
                Ok(window) => Some(window),
                Err(e) => {
                    tracing::warn!(handler_id = %id, "Idle checking disabled: {}", e);
                    None
                }
            },
        };

        if let Some(context) = self.context.as_mut() {
            context.update_settings(&settings);
        }
        self.definition.settings = settings;
    }

    fn set_state(&mut self, new_state: HandlerState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }
        self.state = new_state;
        tracing::info!(
            handler_id = %self.definition.id,
            name = %self.definition.name,
            "State {} -> {}",
            old_state,
            new_state
        );
        let _ = self.channels.events.send(HandlerEvent::StateChanged {
            handler_id: self.definition.id,
            old_state,
            new_state,
            timestamp: Utc::now(),
        });
    }

    fn fail(&mut self, error: &InitError) {
        tracing::error!(
            handler_id = %self.definition.id,
            name = %self.definition.name,
            "Handler failed to start: {}",
            error
        );
        self.set_state(HandlerState::Failed);
    }

    /// Start the handler, building a fresh execution context if none is live.
    ///
    /// Returns `Ok(false)` when the handler is disabled or removed. A paused
    /// handler resumes; a running or idle one is left alone.
    pub async fn start(&mut self) -> Result<bool, InitError> {
        if self.removed {
            tracing::debug!(handler_id = %self.definition.id, "Start refused, handler was removed");
            return Ok(false);
        }
        match self.state {
            HandlerState::Disabled => {
                tracing::warn!(handler_id = %self.definition.id, "Start refused, handler is disabled");
                return Ok(false);
            }
            HandlerState::Running | HandlerState::Idle => return Ok(true),
            HandlerState::Paused => {
                if let Some(context) = self.context.as_mut() {
                    context.enable();
                }
                self.set_state(HandlerState::Running);
                return Ok(true);
            }
            HandlerState::Stopped | HandlerState::Finished | HandlerState::Failed => {}
        }

        let mut context =
            self.provider
                .create(&self.definition, &self.loaded, self.channels.clone());

        if let Err(e) = context.initialize() {
            self.fail(&e);
            return Err(e);
        }
        if let Err(e) = context.start().await {
            context.stop().await;
            self.fail(&e);
            return Err(e);
        }

        self.context = Some(context);
        self.started_at = Some(Utc::now());
        self.set_state(HandlerState::Running);
        Ok(true)
    }

    async fn release_context(&mut self) {
        if let Some(mut context) = self.context.take() {
            context.stop().await;
        }
    }

    /// Stop the engine and release the context. A disabled handler stays
    /// disabled.
    pub async fn stop(&mut self) {
        self.release_context().await;
        if self.state != HandlerState::Disabled {
            self.set_state(HandlerState::Stopped);
        }
    }

    /// Withhold new job creation. Only valid while running or idle.
    pub fn pause(&mut self) -> bool {
        match self.state {
            HandlerState::Paused => true,
            HandlerState::Running | HandlerState::Idle => {
                if let Some(context) = self.context.as_mut() {
                    context.pause();
                }
                self.set_state(HandlerState::Paused);
                true
            }
            _ => false,
        }
    }

    /// Switch the handler off, tearing down any live engine.
    pub async fn disable(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.disable();
        }
        self.release_context().await;
        self.set_state(HandlerState::Disabled);
    }

    /// Bring a disabled handler back to `Stopped`. No-op otherwise.
    pub fn enable(&mut self) {
        if self.state == HandlerState::Disabled {
            self.set_state(HandlerState::Stopped);
        }
    }

    /// Toggle between `Running` and `Idle` against the wall clock.
    pub fn check_idle(&mut self) {
        self.check_idle_at(Local::now().time());
    }

    /// Toggle between `Running` and `Idle` for the given time of day.
    ///
    /// Leaves every other state untouched.
    pub fn check_idle_at(&mut self, time_of_day: NaiveTime) {
        let Some(window) = self.idle else {
            return;
        };
        let in_idle = window.contains(time_of_day);
        match (self.state, in_idle) {
            (HandlerState::Running, true) => self.set_state(HandlerState::Idle),
            (HandlerState::Idle, false) => self.set_state(HandlerState::Running),
            _ => {}
        }
    }

    pub async fn scheduled_start_or_reschedule(&mut self) {
        self.scheduled_start_or_reschedule_at(Utc::now()).await;
    }

    /// Start on a due cron trigger, or push the next trigger forward while
    /// the handler is active.
    pub async fn scheduled_start_or_reschedule_at(&mut self, now: DateTime<Utc>) {
        if self.removed {
            return;
        }
        let Some(cron) = self.cron.clone() else {
            return;
        };

        if self.state.is_restartable() {
            let due = self.next_start.is_some_and(|at| at <= now);
            if due {
                tracing::info!(
                    handler_id = %self.definition.id,
                    cron = %cron.expression(),
                    "Scheduled start"
                );
                // Failure is recorded in the state.
                let _ = self.start().await;
                self.next_start = cron.next_after(now);
            }
        } else if self.state.is_active() {
            self.next_start = cron.next_after(now);
        }
    }

    /// Whether `client` may be offered a job right now.
    pub fn is_dispatchable(&self, client: &ClientId) -> bool {
        self.state == HandlerState::Running
            && self.definition.settings.accepts_client(client)
            && self.context.as_ref().is_some_and(|c| c.has_jobs())
    }

    pub fn get_job(&self, client: &ClientId) -> Option<JobTicket> {
        if self.state != HandlerState::Running || !self.definition.settings.accepts_client(client)
        {
            return None;
        }
        self.context.as_ref()?.get_job(client)
    }

    pub fn received_result(&self, result: JobResult) -> bool {
        match self.context.as_ref() {
            Some(context) => context.received_result(result),
            None => {
                tracing::warn!(
                    handler_id = %self.definition.id,
                    job_id = %result.job_id,
                    state = %self.state,
                    "Result for a handler with no live engine"
                );
                false
            }
        }
    }

    /// Reclaim timed-out jobs as of `now`.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize {
        self.context
            .as_ref()
            .map_or(0, |context| context.sweep_timeouts(now))
    }

    /// React to an engine ending its run on its own.
    ///
    /// Notices from an earlier run are ignored.
    pub async fn on_engine_notice(&mut self, notice: &EngineNotice) {
        let live = self.context.as_ref().and_then(|c| c.run_id());
        if live != Some(notice.run_id) {
            tracing::debug!(
                handler_id = %self.definition.id,
                run_id = %notice.run_id,
                "Ignoring notice from a stale run"
            );
            return;
        }

        self.release_context().await;
        match &notice.kind {
            NoticeKind::Finished => self.set_state(HandlerState::Finished),
            NoticeKind::Failed { reason } => {
                tracing::error!(handler_id = %self.definition.id, "Handler run failed: {}", reason);
                self.set_state(HandlerState::Failed);
            }
        }
    }

    pub fn info(&self) -> HandlerInfo {
        HandlerInfo {
            id: self.definition.id,
            name: self.definition.name.clone(),
            state: self.state,
            started_at: self.started_at,
            next_start: self.next_start,
            stats: self
                .context
                .as_ref()
                .map(|c| c.get_info())
                .unwrap_or_default(),
        }
    }
}
