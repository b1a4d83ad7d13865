//! Control loop actor: the only caller of handler logic.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::EngineShared;
use crate::logic::{HandlerContext, HandlerLogic, LogicError};
use crate::messages::{ControlMessage, EngineNotice, NoticeKind};

/// A fault that ends the run.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Fault {
    #[error("{hook} failed: {error}")]
    Logic {
        hook: &'static str,
        error: LogicError,
    },

    #[error("{hook} panicked: {message}")]
    Panic { hook: &'static str, message: String },

    #[error("{count} consecutive job failures")]
    TooManyErrors { count: u32 },
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a handler-logic call, turning errors and panics into a [`Fault`].
fn guarded<T>(
    hook: &'static str,
    call: impl FnOnce() -> Result<T, LogicError>,
) -> Result<T, Fault> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(Fault::Logic { hook, error }),
        Err(payload) => Err(Fault::Panic {
            hook,
            message: panic_message(payload),
        }),
    }
}

enum Flow {
    Continue,
    Finished,
}

/// Arguments for the control loop actor.
pub struct ControlLoopArgs {
    pub shared: Arc<EngineShared>,
    pub logic: Box<dyn HandlerLogic>,
    pub notices: mpsc::UnboundedSender<EngineNotice>,
    pub loop_interval: Duration,
}

/// State for the control loop actor.
pub struct ControlLoopState {
    shared: Arc<EngineShared>,
    logic: Box<dyn HandlerLogic>,
    notices: mpsc::UnboundedSender<EngineNotice>,
    ticker: Option<JoinHandle<()>>,
    done: bool,
}

impl ControlLoopState {
    /// One pass: deliver results, reclaim timeouts, refill, check completion.
    fn iterate(&mut self) -> Result<Flow, Fault> {
        let shared = self.shared.clone();

        while let Some(job) = shared.pop_finished() {
            let output = job.output.unwrap_or(serde_json::Value::Null);
            let mut ctx = HandlerContext::new(&shared);
            guarded("process_result", || {
                self.logic.process_result(&mut ctx, &job.input, &output)
            })?;
        }

        shared.sweep_timeouts(Utc::now());

        if let Some(count) = shared.tripped_breaker() {
            return Err(Fault::TooManyErrors { count });
        }

        if shared.allow_new_jobs.load(Ordering::Acquire) && shared.available_len() == 0 {
            let mut ctx = HandlerContext::new(&shared);
            guarded("create_more_jobs", || self.logic.create_more_jobs(&mut ctx))?;
            if ctx.created() > 0 {
                tracing::debug!(
                    handler_id = %shared.handler_id(),
                    created = ctx.created(),
                    "Handler created jobs"
                );
            }
        }

        let finished = guarded("is_finished", || Ok(self.logic.is_finished()))?;
        if finished {
            let mut ctx = HandlerContext::new(&shared);
            guarded("on_finish", || self.logic.on_finish(&mut ctx))?;
            return Ok(Flow::Finished);
        }

        Ok(Flow::Continue)
    }

    fn notify(&self, kind: NoticeKind) {
        let notice = EngineNotice {
            handler_id: self.shared.handler_id(),
            run_id: self.shared.run_id(),
            kind,
            timestamp: Utc::now(),
        };
        if self.notices.send(notice).is_err() {
            tracing::warn!(handler_id = %self.shared.handler_id(), "No one is listening for engine notices");
        }
    }
}

/// Control loop actor. One per running engine.
pub struct ControlLoop;

impl Actor for ControlLoop {
    type Msg = ControlMessage;
    type State = ControlLoopState;
    type Arguments = ControlLoopArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let ControlLoopArgs {
            shared,
            mut logic,
            notices,
            loop_interval,
        } = args;

        tracing::debug!(handler_id = %shared.handler_id(), "Starting control loop");

        let mut ctx = HandlerContext::new(&shared);
        guarded("on_start", || logic.on_start(&mut ctx))
            .map_err(|fault| ActorProcessingErr::from(fault.to_string()))?;

        // Periodic tick; the first iteration runs right away.
        let myself_clone = myself.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(loop_interval);
            loop {
                interval.tick().await;
                if myself_clone.send_message(ControlMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(ControlLoopState {
            shared,
            logic,
            notices,
            ticker: Some(ticker),
            done: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.done {
            return Ok(());
        }

        match message {
            ControlMessage::Tick | ControlMessage::Wake(_) => {
                state.shared.wake_pending.store(false, Ordering::Release);

                match state.iterate() {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Finished) => {
                        tracing::info!(handler_id = %state.shared.handler_id(), "Handler finished");
                        state.done = true;
                        state.notify(NoticeKind::Finished);
                        myself.stop(Some("finished".to_string()));
                    }
                    Err(fault) => {
                        tracing::error!(
                            handler_id = %state.shared.handler_id(),
                            "Control loop fault: {}",
                            fault
                        );
                        state.done = true;
                        state.shared.faulted.store(true, Ordering::Release);
                        state.shared.accepting.store(false, Ordering::Release);
                        state.notify(NoticeKind::Failed {
                            reason: fault.to_string(),
                        });
                        myself.stop(Some("faulted".to_string()));
                    }
                }
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }

        if !state.shared.faulted.load(Ordering::Acquire) {
            let shared = state.shared.clone();
            let mut ctx = HandlerContext::new(&shared);
            let stopped = guarded("on_stop", || {
                state.logic.on_stop(&mut ctx);
                Ok(())
            });
            if let Err(fault) = stopped {
                tracing::warn!(handler_id = %shared.handler_id(), "{}", fault);
            }
        }

        tracing::debug!(handler_id = %state.shared.handler_id(), "Control loop stopped");
        Ok(())
    }
}
