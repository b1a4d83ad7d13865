//! The handler registry: the single entry point for the transport layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{DateTime, Local, NaiveTime, Utc};
use db::repositories::HandlerRepository;
use fleet_core::{
    ClientId, ClientInfo, FullName, HandlerDefinition, HandlerEvent, HandlerId, HandlerInfo,
    HandlerSettings, HandlerState, JobResult, JobTicket,
};
use futures_util::future::join_all;
use rand::Rng;
use tokio::sync::{RwLock as AsyncRwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clients::ClientTracker;
use crate::config::RegistryConfig;
use crate::context::{ExecutionContextProvider, LocalProvider};
use crate::engine::{EngineChannels, lock};
use crate::error::{AddOutcome, RegistryError};
use crate::instance::HandlerInstance;
use crate::loader::{FactoryLoader, HandlerLoader, LoadedHandler};
use crate::messages::EngineNotice;
use crate::scheduler::SchedulerTick;

type InstanceRef = Arc<AsyncRwLock<HandlerInstance>>;

#[derive(Default)]
struct Slots {
    by_id: HashMap<HandlerId, InstanceRef>,
    by_name: HashMap<FullName, HandlerId>,
}

struct RegistryInner {
    config: RegistryConfig,
    slots: RwLock<Slots>,
    /// Serializes add/remove so find-or-create is atomic.
    structure: tokio::sync::Mutex<()>,
    provider: Arc<dyn ExecutionContextProvider>,
    loader: Arc<dyn HandlerLoader>,
    catalog: Option<HandlerRepository>,
    channels: EngineChannels,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistryInner {
    fn read_slots(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self, id: HandlerId) -> Option<InstanceRef> {
        self.read_slots().by_id.get(&id).cloned()
    }

    fn find_by_name(&self, name: &FullName) -> Option<InstanceRef> {
        let slots = self.read_slots();
        slots
            .by_name
            .get(name)
            .and_then(|id| slots.by_id.get(id))
            .cloned()
    }

    /// Stable copy of the instance list, ordered by id.
    fn snapshot(&self) -> Vec<(HandlerId, InstanceRef)> {
        let mut instances: Vec<_> = self
            .read_slots()
            .by_id
            .iter()
            .map(|(id, instance)| (*id, instance.clone()))
            .collect();
        instances.sort_by_key(|(id, _)| id.0);
        instances
    }
}

/// Builder for [`HandlerRegistry`].
pub struct RegistryBuilder {
    config: RegistryConfig,
    provider: Option<Arc<dyn ExecutionContextProvider>>,
    loader: Option<Arc<dyn HandlerLoader>>,
    catalog: Option<HandlerRepository>,
}

impl RegistryBuilder {
    pub fn with_provider(mut self, provider: Arc<dyn ExecutionContextProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn HandlerLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Write definitions through to this catalog.
    pub fn with_catalog(mut self, catalog: HandlerRepository) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Build the registry and spawn its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> HandlerRegistry {
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let provider = self
            .provider
            .unwrap_or_else(|| {
                Arc::new(LocalProvider::new(self.config.loop_interval))
                    as Arc<dyn ExecutionContextProvider>
            });
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(FactoryLoader::new()) as Arc<dyn HandlerLoader>);

        let registry = HandlerRegistry {
            inner: Arc::new(RegistryInner {
                config: self.config,
                slots: RwLock::new(Slots::default()),
                structure: tokio::sync::Mutex::new(()),
                provider,
                loader,
                catalog: self.catalog,
                channels: EngineChannels {
                    events,
                    notices,
                    clients: Arc::new(ClientTracker::new()),
                },
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let scheduler = SchedulerTick::new(registry.downgrade(), registry.inner.config.tick_interval);
        let scheduler = tokio::spawn(scheduler.run(registry.inner.cancel.clone()));
        let pump = tokio::spawn(pump_notices(
            registry.downgrade(),
            notices_rx,
            registry.inner.cancel.clone(),
        ));
        lock(&registry.inner.tasks).extend([scheduler, pump]);

        tracing::info!(
            tick_interval_ms = registry.inner.config.tick_interval.as_millis() as u64,
            loop_interval_ms = registry.inner.config.loop_interval.as_millis() as u64,
            catalog = registry.inner.catalog.is_some(),
            "Handler registry started"
        );
        registry
    }
}

/// Consume run-ending notices from engines and settle instance state.
async fn pump_notices(
    registry: WeakRegistry,
    mut notices: mpsc::UnboundedReceiver<EngineNotice>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notice = notices.recv() => {
                let Some(notice) = notice else { break };
                let Some(registry) = registry.upgrade() else { break };
                registry.apply_notice(notice).await;
            }
        }
    }
    tracing::debug!("Engine notice pump stopped");
}

/// Non-owning handle used by background tasks.
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<HandlerRegistry> {
        self.0.upgrade().map(|inner| HandlerRegistry { inner })
    }
}

/// Collection of handler instances.
///
/// Cheap to clone; all clones share the same handlers.
#[derive(Clone)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl HandlerRegistry {
    pub fn builder(config: RegistryConfig) -> RegistryBuilder {
        RegistryBuilder {
            config,
            provider: None,
            loader: None,
            catalog: None,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Receive every handler event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HandlerEvent> {
        self.inner.channels.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.read_slots().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn persist(&self, definition: &HandlerDefinition, enabled: bool) {
        let Some(catalog) = &self.inner.catalog else {
            return;
        };
        if let Err(e) = catalog.upsert(definition, enabled).await {
            tracing::warn!(handler_id = %definition.id, "Catalog write failed: {}", e);
        }
    }

    /// Load and register a definition, or update the one with the same full
    /// name.
    pub async fn add(&self, definition: HandlerDefinition) -> Result<AddOutcome, RegistryError> {
        let loaded = self.inner.loader.load(&definition).inspect_err(|e| {
            tracing::warn!(name = %definition.name, "Handler rejected: {}", e);
        })?;
        self.add_loaded(definition, loaded).await
    }

    /// Register a definition that was already loaded.
    pub async fn add_loaded(
        &self,
        definition: HandlerDefinition,
        loaded: LoadedHandler,
    ) -> Result<AddOutcome, RegistryError> {
        self.insert(definition, loaded, true).await
    }

    async fn insert(
        &self,
        mut definition: HandlerDefinition,
        loaded: LoadedHandler,
        enabled: bool,
    ) -> Result<AddOutcome, RegistryError> {
        let _structure = self.inner.structure.lock().await;

        if let Some(existing) = self.inner.find_by_name(&definition.name) {
            let mut instance = existing.write().await;
            let id = instance.id();
            if instance.definition().same_content(&definition) {
                tracing::debug!(handler_id = %id, name = %definition.name, "Handler unchanged");
                return Ok(AddOutcome::Unchanged(id));
            }

            instance.update_definition(definition, loaded);
            let stored = instance.definition().clone();
            let enabled = instance.state() != HandlerState::Disabled;
            drop(instance);

            self.persist(&stored, enabled).await;
            tracing::info!(handler_id = %id, name = %stored.name, "Handler updated");
            return Ok(AddOutcome::Updated(id));
        }

        if self.inner.read_slots().by_id.contains_key(&definition.id) {
            definition.id = HandlerId::new();
        }
        let id = definition.id;
        let name = definition.name.clone();
        let autostart = definition.settings.autostart;

        let instance = Arc::new(AsyncRwLock::new(HandlerInstance::new(
            definition.clone(),
            loaded,
            self.inner.provider.clone(),
            self.inner.channels.clone(),
        )));
        {
            let mut slots = self.inner.write_slots();
            slots.by_id.insert(id, instance.clone());
            slots.by_name.insert(name.clone(), id);
        }

        self.persist(&definition, enabled).await;
        tracing::info!(handler_id = %id, name = %name, "Handler added");
        let _ = self.inner.channels.events.send(HandlerEvent::HandlerAdded {
            handler_id: id,
            name,
            timestamp: Utc::now(),
        });

        let mut instance = instance.write().await;
        if !enabled {
            instance.disable().await;
        } else if autostart {
            // A failed autostart leaves the handler in `Failed`; the add itself succeeded.
            let _ = instance.start().await;
        }

        Ok(AddOutcome::Created(id))
    }

    /// Stop and unregister a handler.
    pub async fn remove(&self, id: HandlerId) -> bool {
        let _structure = self.inner.structure.lock().await;

        let removed = {
            let mut slots = self.inner.write_slots();
            let removed = slots.by_id.remove(&id);
            slots.by_name.retain(|_, slot| *slot != id);
            removed
        };
        let Some(instance) = removed else {
            return false;
        };

        // Anyone still holding the instance sees the flag once they get the lock.
        instance.write().await.retire().await;

        if let Some(catalog) = &self.inner.catalog {
            if let Err(e) = catalog.delete(id).await {
                tracing::warn!(handler_id = %id, "Catalog delete failed: {}", e);
            }
        }

        tracing::info!(handler_id = %id, "Handler removed");
        let _ = self.inner.channels.events.send(HandlerEvent::HandlerRemoved {
            handler_id: id,
            timestamp: Utc::now(),
        });
        true
    }

    /// Start a handler, reporting why it could not be started.
    pub async fn try_start(&self, id: HandlerId) -> Result<(), RegistryError> {
        let instance = self.inner.get(id).ok_or(RegistryError::NotFound(id))?;
        let mut instance = instance.write().await;
        if instance.is_removed() {
            return Err(RegistryError::NotFound(id));
        }
        let started = instance.start().await?;
        if !started {
            return Err(RegistryError::Disabled(id));
        }
        Ok(())
    }

    pub async fn start(&self, id: HandlerId) -> bool {
        self.try_start(id).await.is_ok()
    }

    pub async fn stop(&self, id: HandlerId) -> bool {
        let Some(instance) = self.inner.get(id) else {
            return false;
        };
        let mut instance = instance.write().await;
        if instance.is_removed() {
            return false;
        }
        instance.stop().await;
        true
    }

    pub async fn pause(&self, id: HandlerId) -> bool {
        let Some(instance) = self.inner.get(id) else {
            return false;
        };
        let mut instance = instance.write().await;
        !instance.is_removed() && instance.pause()
    }

    pub async fn disable(&self, id: HandlerId) -> bool {
        let Some(instance) = self.inner.get(id) else {
            return false;
        };
        let definition = {
            let mut instance = instance.write().await;
            if instance.is_removed() {
                return false;
            }
            instance.disable().await;
            instance.definition().clone()
        };
        self.persist(&definition, false).await;
        true
    }

    pub async fn enable(&self, id: HandlerId) -> bool {
        let Some(instance) = self.inner.get(id) else {
            return false;
        };
        let definition = {
            let mut instance = instance.write().await;
            if instance.is_removed() {
                return false;
            }
            instance.enable();
            instance.definition().clone()
        };
        self.persist(&definition, true).await;
        true
    }

    /// Replace a handler's settings. Takes effect on the live engine too.
    pub async fn update_settings(&self, id: HandlerId, settings: HandlerSettings) -> bool {
        let Some(instance) = self.inner.get(id) else {
            return false;
        };
        let (definition, enabled) = {
            let mut instance = instance.write().await;
            if instance.is_removed() {
                return false;
            }
            instance.update_settings(settings);
            (
                instance.definition().clone(),
                instance.state() != HandlerState::Disabled,
            )
        };
        self.persist(&definition, enabled).await;
        true
    }

    /// Hand a job to `client` from a randomly chosen running handler.
    pub async fn get_job(&self, client: &ClientId) -> Option<JobTicket> {
        self.inner.channels.clients.touch(client, Utc::now());

        for _ in 0..self.inner.config.dispatch_attempts {
            let mut candidates = Vec::new();
            for (_, instance) in self.inner.snapshot() {
                if instance.read().await.is_dispatchable(client) {
                    candidates.push(instance);
                }
            }
            if candidates.is_empty() {
                return None;
            }

            let pick = rand::rng().random_range(0..candidates.len());
            let ticket = candidates[pick].read().await.get_job(client);
            if let Some(ticket) = ticket {
                self.inner.channels.clients.job_assigned(client, Utc::now());
                tracing::debug!(
                    handler_id = %ticket.handler_id,
                    job_id = %ticket.id,
                    client_id = %client,
                    "Job dispatched"
                );
                return Some(ticket);
            }
        }

        tracing::debug!(
            client_id = %client,
            attempts = self.inner.config.dispatch_attempts,
            "No job after retries"
        );
        None
    }

    /// Route a client's result to the owning handler.
    pub async fn process_result(&self, result: JobResult) -> bool {
        let now = Utc::now();
        let client = result.client_id.clone();
        let success = result.is_success();
        self.inner.channels.clients.touch(&client, now);

        let Some(instance) = self.inner.get(result.handler_id) else {
            tracing::warn!(
                handler_id = %result.handler_id,
                job_id = %result.job_id,
                client_id = %client,
                "Result for unknown handler"
            );
            return false;
        };

        let accepted = instance.read().await.received_result(result);
        if accepted {
            self.inner.channels.clients.result_reported(&client, success, now);
        }
        accepted
    }

    /// One scheduler pass against the wall clock.
    pub async fn tick(&self) {
        self.tick_at(Utc::now(), Local::now().time()).await;
    }

    /// One scheduler pass: idle check, then cron start or reschedule, for
    /// every handler.
    ///
    /// Handlers busy with another operation are skipped until the next tick.
    pub async fn tick_at(&self, now: DateTime<Utc>, time_of_day: NaiveTime) {
        let passes = self.inner.snapshot().into_iter().map(|(id, slot)| {
            tokio::spawn(async move {
                let Ok(mut instance) = slot.try_write() else {
                    tracing::debug!(handler_id = %id, "Handler busy, skipping tick");
                    return;
                };
                if instance.is_removed() {
                    return;
                }
                instance.check_idle_at(time_of_day);
                instance.scheduled_start_or_reschedule_at(now).await;
            })
        });

        for pass in join_all(passes).await {
            if let Err(e) = pass {
                tracing::error!("Scheduler pass for a handler aborted: {}", e);
            }
        }
    }

    async fn apply_notice(&self, notice: EngineNotice) {
        let Some(instance) = self.inner.get(notice.handler_id) else {
            tracing::debug!(handler_id = %notice.handler_id, "Notice for a removed handler");
            return;
        };
        instance.write().await.on_engine_notice(&notice).await;
    }

    /// Replay the catalog. Returns how many handlers were restored.
    ///
    /// Entries that fail to load are logged and skipped.
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let Some(catalog) = &self.inner.catalog else {
            return Ok(0);
        };

        let entries = catalog.list().await?;
        let mut restored = 0;
        for entry in entries {
            let name = entry.definition.name.clone();
            let loaded = match self.inner.loader.load(&entry.definition) {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!(name = %name, "Skipping catalog entry: {}", e);
                    continue;
                }
            };
            match self.insert(entry.definition, loaded, entry.enabled).await {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!(name = %name, "Skipping catalog entry: {}", e),
            }
        }

        tracing::info!(restored, "Catalog restored");
        Ok(restored)
    }

    pub async fn info(&self, id: HandlerId) -> Option<HandlerInfo> {
        let instance = self.inner.get(id)?;
        let info = instance.read().await.info();
        Some(info)
    }

    /// Snapshots of every handler, ordered by id.
    pub async fn list(&self) -> Vec<HandlerInfo> {
        let mut infos = Vec::new();
        for (_, instance) in self.inner.snapshot() {
            infos.push(instance.read().await.info());
        }
        infos
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.inner.channels.clients.snapshot()
    }

    /// Stop the scheduler tick and every handler.
    pub async fn teardown(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        for (_, instance) in self.inner.snapshot() {
            instance.write().await.stop().await;
        }
        tracing::info!("Handler registry torn down");
    }
}
