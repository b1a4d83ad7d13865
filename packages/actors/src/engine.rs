//! Per-handler job queue engine.
//!
//! A job lives in exactly one of three containers at a time: `available`
//! (waiting for a client), `pending` (assigned, waiting for a result) or
//! `finished` (result accepted, waiting for handler logic). Jobs are moved
//! between them, never copied.
//!
//! Client-facing calls (`get_job`, `received_result`) run on the caller's
//! task. Handler logic only ever runs inside the [`ControlLoop`] actor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{
    ClientId, HandlerEvent, HandlerId, HandlerSettings, HandlerStats, Job, JobId, JobOutcome,
    JobResult, JobTicket, LogLevel, RequeueReason,
};
use ractor::concurrency::JoinHandle;
use ractor::{Actor, ActorRef};
use tokio::sync::{broadcast, mpsc};
use ulid::Ulid;

use crate::clients::ClientTracker;
use crate::control_loop::{ControlLoop, ControlLoopArgs};
use crate::logic::{HandlerLogic, InitError};
use crate::messages::{ControlMessage, EngineNotice, WakeReason};

/// Identifies one start/stop cycle of an engine.
pub type RunId = Ulid;

/// Default pause between control-loop iterations.
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Channels an engine reports on.
#[derive(Clone)]
pub struct EngineChannels {
    /// Fan-out of job and log events.
    pub events: broadcast::Sender<HandlerEvent>,
    /// Run-ending notices for the registry.
    pub notices: mpsc::UnboundedSender<EngineNotice>,
    /// Per-client counters; released when a job is taken back from a client.
    pub clients: Arc<ClientTracker>,
}

impl EngineChannels {
    /// Standalone channels, for running an engine outside a registry.
    pub fn detached(
        capacity: usize,
    ) -> (
        Self,
        broadcast::Receiver<HandlerEvent>,
        mpsc::UnboundedReceiver<EngineNotice>,
    ) {
        let (events, events_rx) = broadcast::channel(capacity);
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let channels = Self {
            events,
            notices,
            clients: Arc::new(ClientTracker::new()),
        };
        (channels, events_rx, notices_rx)
    }
}

/// Outcome of result intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// Success accepted; job moved to `finished`.
    Completed,
    /// Failure accepted; job moved back to `available`.
    Requeued,
    /// Engine not accepting calls.
    Closed,
    /// No pending job with that id.
    UnknownJob,
    /// Job is assigned to a different client.
    ClientMismatch,
}

impl Intake {
    pub fn accepted(&self) -> bool {
        matches!(self, Intake::Completed | Intake::Requeued)
    }
}

/// State shared between the engine handle, request tasks and the control loop.
pub struct EngineShared {
    handler_id: HandlerId,
    run_id: RunId,
    available: Mutex<VecDeque<Job>>,
    pending: Mutex<HashMap<JobId, Job>>,
    finished: Mutex<VecDeque<Job>>,
    processed: AtomicU64,
    failed: AtomicU64,
    sequenced_errors: AtomicU32,
    job_timeout_secs: AtomicU64,
    max_sequenced_errors: AtomicU32,
    pub(crate) accepting: AtomicBool,
    pub(crate) allow_new_jobs: AtomicBool,
    pub(crate) faulted: AtomicBool,
    pub(crate) wake_pending: AtomicBool,
    events: broadcast::Sender<HandlerEvent>,
    clients: Arc<ClientTracker>,
}

impl EngineShared {
    pub(crate) fn new(
        handler_id: HandlerId,
        settings: &HandlerSettings,
        channels: &EngineChannels,
    ) -> Self {
        Self {
            handler_id,
            run_id: Ulid::new(),
            available: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sequenced_errors: AtomicU32::new(0),
            job_timeout_secs: AtomicU64::new(settings.job_timeout_secs),
            max_sequenced_errors: AtomicU32::new(settings.max_sequenced_errors),
            accepting: AtomicBool::new(true),
            allow_new_jobs: AtomicBool::new(true),
            faulted: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
            events: channels.events.clone(),
            clients: channels.clients.clone(),
        }
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub(crate) fn apply_settings(&self, settings: &HandlerSettings) {
        self.job_timeout_secs
            .store(settings.job_timeout_secs, Ordering::Relaxed);
        self.max_sequenced_errors
            .store(settings.max_sequenced_errors, Ordering::Relaxed);
    }

    pub fn job_timeout_secs(&self) -> u64 {
        self.job_timeout_secs.load(Ordering::Relaxed)
    }

    /// Consecutive failures, or `None` if the breaker is off or not tripped.
    pub(crate) fn tripped_breaker(&self) -> Option<u32> {
        let limit = self.max_sequenced_errors.load(Ordering::Relaxed);
        let count = self.sequenced_errors.load(Ordering::Relaxed);
        (limit > 0 && count >= limit).then_some(count)
    }

    pub(crate) fn push_new_job(&self, input: serde_json::Value) -> JobId {
        let job = Job::new(self.handler_id, input);
        let id = job.id;
        lock(&self.available).push_back(job);
        id
    }

    pub fn available_len(&self) -> usize {
        lock(&self.available).len()
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn finished_len(&self) -> usize {
        lock(&self.finished).len()
    }

    /// Move the head of `available` into `pending` under `client`.
    ///
    /// Returns the client-facing ticket and whether `available` is now empty.
    pub(crate) fn take_job(&self, client: &ClientId, now: DateTime<Utc>) -> Option<(JobTicket, bool)> {
        if !self.accepting.load(Ordering::Acquire) {
            return None;
        }

        let (mut job, drained) = {
            let mut available = lock(&self.available);
            let job = available.pop_front()?;
            (job, available.is_empty())
        };

        job.assign(client.clone(), now);
        let ticket = job.ticket();
        lock(&self.pending).insert(job.id, job);

        let _ = self.events.send(HandlerEvent::JobAssigned {
            handler_id: self.handler_id,
            job_id: ticket.id,
            client_id: client.clone(),
            timestamp: now,
        });

        Some((ticket, drained))
    }

    /// Apply a client's result to the pending job it refers to.
    pub(crate) fn accept_result(&self, result: JobResult, now: DateTime<Utc>) -> Intake {
        if !self.accepting.load(Ordering::Acquire) {
            return Intake::Closed;
        }

        let mut job = {
            let mut pending = lock(&self.pending);
            match pending.get(&result.job_id) {
                None => return Intake::UnknownJob,
                Some(job) if job.assigned_to.as_ref() != Some(&result.client_id) => {
                    return Intake::ClientMismatch;
                }
                Some(_) => {}
            }
            match pending.remove(&result.job_id) {
                Some(job) => job,
                None => return Intake::UnknownJob,
            }
        };

        match result.outcome {
            JobOutcome::Failure { error } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.sequenced_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    handler_id = %self.handler_id,
                    job_id = %job.id,
                    client_id = %result.client_id,
                    error = %error.message,
                    "Job failed, requeueing"
                );
                job.reset_assignment();
                let job_id = job.id;
                lock(&self.available).push_back(job);
                let _ = self.events.send(HandlerEvent::JobRequeued {
                    handler_id: self.handler_id,
                    job_id,
                    reason: RequeueReason::Failure,
                    timestamp: now,
                });
                Intake::Requeued
            }
            JobOutcome::Success { output } => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.sequenced_errors.store(0, Ordering::Relaxed);
                job.complete(output, now);
                let job_id = job.id;
                lock(&self.finished).push_back(job);
                let _ = self.events.send(HandlerEvent::JobCompleted {
                    handler_id: self.handler_id,
                    job_id,
                    client_id: result.client_id,
                    timestamp: now,
                });
                Intake::Completed
            }
        }
    }

    pub(crate) fn pop_finished(&self) -> Option<Job> {
        lock(&self.finished).pop_front()
    }

    /// Move every pending job assigned longer than the timeout back to
    /// `available`. Returns how many were reclaimed.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.job_timeout_secs();
        if timeout == 0 {
            return 0;
        }

        let expired: Vec<Job> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<JobId> = pending
                .values()
                .filter(|job| job.is_expired(now, timeout))
                .map(|job| job.id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = expired.len();
        for mut job in expired {
            tracing::warn!(
                handler_id = %self.handler_id,
                job_id = %job.id,
                client_id = ?job.assigned_to,
                timeout_secs = timeout,
                "Job timed out, requeueing"
            );
            if let Some(client) = job.assigned_to.as_ref() {
                self.clients.job_released(client);
            }
            job.reset_assignment();
            let job_id = job.id;
            lock(&self.available).push_back(job);
            let _ = self.events.send(HandlerEvent::JobRequeued {
                handler_id: self.handler_id,
                job_id,
                reason: RequeueReason::Timeout,
                timestamp: now,
            });
        }
        count
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            available: self.available_len() as u64,
            pending: self.pending_len() as u64,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Debug => tracing::debug!(handler_id = %self.handler_id, "{}", message),
            LogLevel::Info => tracing::info!(handler_id = %self.handler_id, "{}", message),
            LogLevel::Warn => tracing::warn!(handler_id = %self.handler_id, "{}", message),
            LogLevel::Error => tracing::error!(handler_id = %self.handler_id, "{}", message),
        }
        let _ = self.events.send(HandlerEvent::Log {
            handler_id: self.handler_id,
            level,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Drop all jobs and reset counters. Clients holding pending jobs get
    /// their in-progress slot back.
    pub(crate) fn clear(&self) {
        lock(&self.available).clear();
        for (_, job) in lock(&self.pending).drain() {
            if let Some(client) = job.assigned_to.as_ref() {
                self.clients.job_released(client);
            }
        }
        lock(&self.finished).clear();
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.sequenced_errors.store(0, Ordering::Relaxed);
    }
}

struct EngineRun {
    shared: Arc<EngineShared>,
    actor: ActorRef<ControlMessage>,
    handle: JoinHandle<()>,
}

/// Job supply and assignment for one handler.
pub struct HandlerQueueEngine {
    handler_id: HandlerId,
    settings: HandlerSettings,
    loop_interval: Duration,
    channels: EngineChannels,
    run: Option<EngineRun>,
}

impl HandlerQueueEngine {
    pub fn new(
        handler_id: HandlerId,
        settings: HandlerSettings,
        loop_interval: Duration,
        channels: EngineChannels,
    ) -> Self {
        Self {
            handler_id,
            settings,
            loop_interval,
            channels,
            run: None,
        }
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler_id
    }

    pub fn is_started(&self) -> bool {
        self.run.is_some()
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run.as_ref().map(|run| run.shared.run_id())
    }

    /// Spawn the control loop around `logic`. A no-op if already started.
    pub async fn start(&mut self, logic: Box<dyn HandlerLogic>) -> Result<RunId, InitError> {
        if let Some(run) = &self.run {
            return Ok(run.shared.run_id());
        }

        let shared = Arc::new(EngineShared::new(
            self.handler_id,
            &self.settings,
            &self.channels,
        ));

        let args = ControlLoopArgs {
            shared: shared.clone(),
            logic,
            notices: self.channels.notices.clone(),
            loop_interval: self.loop_interval,
        };

        let (actor, handle) = Actor::spawn(None, ControlLoop, args)
            .await
            .map_err(|e| InitError::Failed(e.to_string()))?;

        let run_id = shared.run_id();
        tracing::info!(handler_id = %self.handler_id, run_id = %run_id, "Engine started");
        self.run = Some(EngineRun {
            shared,
            actor,
            handle,
        });
        Ok(run_id)
    }

    /// Stop the control loop and drop all queued work.
    ///
    /// Waits for the loop to exit unless it already died from a fault.
    pub async fn stop(&mut self) {
        let Some(run) = self.run.take() else {
            return;
        };

        run.shared.accepting.store(false, Ordering::Release);
        run.actor.stop(Some("engine stopped".to_string()));

        if run.shared.faulted.load(Ordering::Acquire) {
            tracing::debug!(handler_id = %self.handler_id, "Control loop faulted, not joining");
        } else if let Err(e) = run.handle.await {
            tracing::warn!(handler_id = %self.handler_id, "Control loop join failed: {}", e);
        }

        run.shared.clear();
        tracing::info!(handler_id = %self.handler_id, "Engine stopped");
    }

    /// Hand the next available job to `client`.
    pub fn get_job(&self, client: &ClientId) -> Option<JobTicket> {
        let run = self.run.as_ref()?;
        let (ticket, drained) = run.shared.take_job(client, Utc::now())?;
        if drained {
            Self::wake(run, WakeReason::QueueDrained);
        }
        Some(ticket)
    }

    /// Accept a client's result. Returns false if it was rejected.
    pub fn received_result(&self, result: JobResult) -> bool {
        let Some(run) = self.run.as_ref() else {
            tracing::warn!(
                handler_id = %self.handler_id,
                job_id = %result.job_id,
                "Result for a handler that is not running"
            );
            return false;
        };

        let job_id = result.job_id;
        let client_id = result.client_id.clone();
        let intake = run.shared.accept_result(result, Utc::now());
        match intake {
            Intake::Completed => Self::wake(run, WakeReason::ResultReady),
            Intake::Requeued => Self::wake(run, WakeReason::JobFailed),
            Intake::Closed => {
                tracing::warn!(handler_id = %self.handler_id, job_id = %job_id, "Engine is shutting down, result dropped");
            }
            Intake::UnknownJob => {
                tracing::warn!(
                    handler_id = %self.handler_id,
                    job_id = %job_id,
                    client_id = %client_id,
                    "Result for unknown job"
                );
            }
            Intake::ClientMismatch => {
                tracing::warn!(
                    handler_id = %self.handler_id,
                    job_id = %job_id,
                    client_id = %client_id,
                    "Result from a client the job is not assigned to"
                );
            }
        }
        intake.accepted()
    }

    /// Whether at least one job is waiting for a client.
    pub fn has_available(&self) -> bool {
        self.run
            .as_ref()
            .is_some_and(|run| run.shared.available_len() > 0)
    }

    /// Reclaim timed-out jobs as of `now`. The control loop does this on
    /// every iteration; exposed for callers that need a deterministic sweep.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize {
        self.run
            .as_ref()
            .map_or(0, |run| run.shared.sweep_timeouts(now))
    }

    pub fn stats(&self) -> HandlerStats {
        self.run
            .as_ref()
            .map(|run| run.shared.stats())
            .unwrap_or_default()
    }

    /// Allow or suppress `create_more_jobs` calls.
    pub fn set_allow_new_jobs(&self, allow: bool) {
        if let Some(run) = &self.run {
            run.shared.allow_new_jobs.store(allow, Ordering::Release);
            if allow {
                Self::wake(run, WakeReason::QueueDrained);
            }
        }
    }

    /// Apply new timeout and breaker settings, also to a live run.
    pub fn update_settings(&mut self, settings: &HandlerSettings) {
        self.settings = settings.clone();
        if let Some(run) = &self.run {
            run.shared.apply_settings(settings);
        }
    }

    fn wake(run: &EngineRun, reason: WakeReason) {
        if !run.shared.wake_pending.swap(true, Ordering::AcqRel) {
            let _ = run.actor.send_message(ControlMessage::Wake(reason));
        }
    }
}
