#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{
    EngineChannels, FactoryLoader, FnFactory, HandlerContext, HandlerFactory, HandlerLogic,
    HandlerRegistry, InitError, LoadedHandler, LocalProvider, LogicError, RegistryConfig,
};
use fleet_core::{FullName, HandlerDefinition, HandlerId, HandlerSettings, HandlerState, LogLevel};
use serde_json::{Value, json};

pub const LOOP: Duration = Duration::from_millis(50);
pub const WAIT: Duration = Duration::from_secs(5);

/// What scripted handler logic was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start,
    Create(usize),
    Result { input: Value, output: Value },
    Finish,
    Stop,
}

/// Which hook should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakage {
    StartError,
    CreatePanic,
    ResultError,
}

/// Shared script driving [`ScriptedLogic`] and recording its calls.
#[derive(Default)]
pub struct Plan {
    batches: Mutex<VecDeque<Vec<Value>>>,
    calls: Mutex<Vec<Call>>,
    finished: AtomicBool,
    breakage: Mutex<Option<Breakage>>,
}

impl Plan {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A plan whose first `create_more_jobs` call pushes `inputs`.
    pub fn with_batch(inputs: Vec<Value>) -> Arc<Self> {
        let plan = Self::new();
        plan.queue_batch(inputs);
        plan
    }

    pub fn queue_batch(&self, inputs: Vec<Value>) {
        self.batches.lock().unwrap().push_back(inputs);
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.finished.store(false, Ordering::SeqCst);
    }

    pub fn break_with(&self, breakage: Breakage) {
        *self.breakage.lock().unwrap() = Some(breakage);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn results(&self) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Result { input, .. } => Some(input.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn broken(&self, breakage: Breakage) -> bool {
        *self.breakage.lock().unwrap() == Some(breakage)
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn HandlerFactory> {
        let plan = self.clone();
        FnFactory::shared(move |_, _| {
            Ok(Box::new(ScriptedLogic { plan: plan.clone() }) as Box<dyn HandlerLogic>)
        })
    }

    pub fn logic(self: &Arc<Self>) -> Box<dyn HandlerLogic> {
        Box::new(ScriptedLogic { plan: self.clone() })
    }

    pub fn loaded(self: &Arc<Self>) -> LoadedHandler {
        LoadedHandler::new("scripted", self.factory())
    }
}

pub struct ScriptedLogic {
    plan: Arc<Plan>,
}

impl HandlerLogic for ScriptedLogic {
    fn on_start(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), LogicError> {
        self.plan.record(Call::Start);
        if self.plan.broken(Breakage::StartError) {
            return Err("refusing to start".into());
        }
        ctx.log(LogLevel::Info, "scripted logic started");
        Ok(())
    }

    fn create_more_jobs(&mut self, ctx: &mut HandlerContext<'_>) -> Result<(), LogicError> {
        if self.plan.broken(Breakage::CreatePanic) {
            panic!("job source exploded");
        }
        let batch = self.plan.batches.lock().unwrap().pop_front();
        if let Some(batch) = batch {
            let n = batch.len();
            for input in batch {
                ctx.push_job(input);
            }
            self.plan.record(Call::Create(n));
        }
        Ok(())
    }

    fn process_result(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        input: &Value,
        output: &Value,
    ) -> Result<(), LogicError> {
        self.plan.record(Call::Result {
            input: input.clone(),
            output: output.clone(),
        });
        if self.plan.broken(Breakage::ResultError) {
            return Err("cannot store result".into());
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.plan.finished.load(Ordering::SeqCst)
    }

    fn on_finish(&mut self, _ctx: &mut HandlerContext<'_>) -> Result<(), LogicError> {
        self.plan.record(Call::Finish);
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut HandlerContext<'_>) {
        self.plan.record(Call::Stop);
    }
}

/// A factory whose `create` always fails.
pub fn failing_factory() -> Arc<dyn HandlerFactory> {
    FnFactory::shared(|_, _| Err(InitError::Failed("no GPU available".to_string())))
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Async flavour of [`wait_for`].
pub async fn wait_for_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn channels() -> EngineChannels {
    let (channels, _events, _notices) = EngineChannels::detached(256);
    channels
}

pub fn provider() -> Arc<LocalProvider> {
    Arc::new(LocalProvider::new(LOOP))
}

pub fn definition(job: &str, entry: &str) -> HandlerDefinition {
    HandlerDefinition::new(
        FullName::new("render", "Frames", job),
        json!({ "entry": entry }).to_string(),
    )
}

pub fn definition_with(job: &str, entry: &str, settings: HandlerSettings) -> HandlerDefinition {
    definition(job, entry).with_settings(settings)
}

pub fn test_config() -> RegistryConfig {
    RegistryConfig::default()
        .with_loop_interval(LOOP)
        .with_tick_interval(Duration::from_secs(3600))
}

pub fn registry_with(loader: FactoryLoader) -> HandlerRegistry {
    HandlerRegistry::builder(test_config())
        .with_loader(Arc::new(loader))
        .build()
}

/// Wait until the registry reports `state` for `id`.
pub async fn wait_for_state(registry: &HandlerRegistry, id: HandlerId, state: HandlerState) -> bool {
    wait_for_async(WAIT, move || async move {
        registry.info(id).await.is_some_and(|info| info.state == state)
    })
    .await
}

/// Wait until handler `id` has `count` jobs waiting.
pub async fn wait_for_available(registry: &HandlerRegistry, id: HandlerId, count: u64) -> bool {
    wait_for_async(WAIT, move || async move {
        registry
            .info(id)
            .await
            .is_some_and(|info| info.stats.available == count)
    })
    .await
}
