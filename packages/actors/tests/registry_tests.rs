#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use actors::{AddOutcome, ErrorCode, FactoryLoader, FnFactory, HandlerLogic, HandlerRegistry};
use chrono::{NaiveTime, Utc};
use common::{
    Plan, WAIT, registry_with, test_config, wait_for, wait_for_available, wait_for_state,
};
use db::DbConfig;
use db::repositories::HandlerRepository;
use fleet_core::{
    ClientId, FullName, HandlerDefinition, HandlerEvent, HandlerId, HandlerSettings,
    HandlerState, JobResult,
};
use serde_json::json;

fn autostart() -> HandlerSettings {
    HandlerSettings {
        autostart: true,
        ..Default::default()
    }
}

async fn state_of(registry: &HandlerRegistry, id: HandlerId) -> Option<HandlerState> {
    registry.info(id).await.map(|info| info.state)
}

#[tokio::test]
async fn test_add_twice_is_unchanged_and_keeps_queue() -> Result<(), Box<dyn Error>> {
    let plan = Plan::with_batch(vec![json!("a"), json!("b")]);
    let registry = registry_with(FactoryLoader::new().with("scripted", plan.factory()));

    let definition = common::definition_with("scene-1", "scripted", autostart());
    let created = registry.add(definition.clone()).await?;
    let id = match created {
        AddOutcome::Created(id) => id,
        other => return Err(format!("expected Created, got {:?}", other).into()),
    };
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Running));

    assert!(wait_for_available(&registry, id, 2).await);
    let client = ClientId::from("worker");
    let ticket = registry.get_job(&client).await.ok_or("no job dispatched")?;
    assert_eq!(ticket.handler_id, id);

    // Same content, fresh id: nothing changes.
    let mut again = definition.clone();
    again.id = HandlerId::new();
    assert_eq!(registry.add(again).await?, AddOutcome::Unchanged(id));
    let info = registry.info(id).await.ok_or("handler vanished")?;
    assert_eq!(info.stats.pending, 1);
    assert_eq!(info.state, HandlerState::Running);

    // Changed settings update in place and keep the run going.
    let mut changed = definition.clone();
    changed.settings.job_timeout_secs = 45;
    assert_eq!(registry.add(changed).await?, AddOutcome::Updated(id));
    let info = registry.info(id).await.ok_or("handler vanished")?;
    assert_eq!(info.stats.pending, 1);
    assert_eq!(registry.len(), 1);

    registry.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_load_errors_are_reported_with_codes() -> Result<(), Box<dyn Error>> {
    let strict = FnFactory::shared(|_, _| {
        Err(actors::InitError::Failed("never built".to_string()))
    });
    struct Picky;
    impl actors::HandlerFactory for Picky {
        fn validate(&self, params: &serde_json::Value) -> Result<(), String> {
            if params.get("frames").is_some() {
                Ok(())
            } else {
                Err("missing 'frames'".to_string())
            }
        }

        fn create(
            &self,
            _definition: &HandlerDefinition,
            _params: &serde_json::Value,
        ) -> Result<Box<dyn HandlerLogic>, actors::InitError> {
            Err(actors::InitError::Failed("unused".to_string()))
        }
    }

    let loader = FactoryLoader::new()
        .with("strict", strict)
        .with("picky", Arc::new(Picky));
    let registry = registry_with(loader);
    let name = || FullName::new("render", "Frames", "broken");

    let bad_json = HandlerDefinition::new(name(), "{not json");
    let err = registry.add(bad_json).await.err().ok_or("bad json accepted")?;
    assert_eq!(err.code(), ErrorCode::ParseFailed);

    let empty_entry = HandlerDefinition::new(name(), r#"{"entry": "  "}"#);
    let err = registry.add(empty_entry).await.err().ok_or("empty entry accepted")?;
    assert_eq!(err.code(), ErrorCode::ParseFailed);

    let unknown = HandlerDefinition::new(name(), r#"{"entry": "ghost"}"#);
    let err = registry.add(unknown).await.err().ok_or("unknown entry accepted")?;
    assert_eq!(err.code(), ErrorCode::MissingInitializer);

    let rejected = HandlerDefinition::new(name(), r#"{"entry": "picky", "params": {}}"#);
    let err = registry.add(rejected).await.err().ok_or("bad params accepted")?;
    assert_eq!(err.code(), ErrorCode::CompileFailed);
    assert!(err.to_string().contains("missing 'frames'"));

    assert!(registry.is_empty());

    // Loading succeeds but the factory fails at start time.
    let outcome = registry
        .add(HandlerDefinition::new(name(), r#"{"entry": "strict"}"#))
        .await?;
    let id = outcome.handler_id();
    let err = registry.try_start(id).await.err().ok_or("start succeeded")?;
    assert_eq!(err.code(), ErrorCode::InitializationFailed);
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Failed));

    registry.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_ids_are_rejected() -> Result<(), Box<dyn Error>> {
    let registry = registry_with(FactoryLoader::new());
    let ghost = HandlerId::new();

    assert!(!registry.start(ghost).await);
    assert!(!registry.stop(ghost).await);
    assert!(!registry.pause(ghost).await);
    assert!(!registry.disable(ghost).await);
    assert!(!registry.enable(ghost).await);
    assert!(!registry.remove(ghost).await);
    assert_eq!(
        registry.try_start(ghost).await.err().map(|e| e.code()),
        Some(ErrorCode::NotFound)
    );
    assert!(registry.info(ghost).await.is_none());
    assert!(registry.get_job(&ClientId::from("worker")).await.is_none());

    registry.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_dispatch_and_result_intake() -> Result<(), Box<dyn Error>> {
    let first = Plan::with_batch(vec![json!(1)]);
    let second = Plan::with_batch(vec![json!(2)]);
    let loader = FactoryLoader::new()
        .with("first", first.factory())
        .with("second", second.factory());
    let registry = registry_with(loader);

    registry
        .add(common::definition_with("one", "first", autostart()))
        .await?;
    registry
        .add(common::definition_with("two", "second", autostart()))
        .await?;

    let client = ClientId::from("worker-1");
    let mut tickets = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while tickets.len() < 2 && tokio::time::Instant::now() < deadline {
        match registry.get_job(&client).await {
            Some(ticket) => tickets.push(ticket),
            None => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    assert_eq!(tickets.len(), 2);

    let mut inputs: Vec<_> = tickets.iter().map(|t| t.input.clone()).collect();
    inputs.sort_by_key(|v| v.as_i64());
    assert_eq!(inputs, vec![json!(1), json!(2)]);
    assert!(registry.get_job(&client).await.is_none());

    for ticket in &tickets {
        let result = JobResult::success(ticket, client.clone(), json!("ok"));
        assert!(registry.process_result(result).await);
    }
    assert!(wait_for(WAIT, || first.results().len() == 1 && second.results().len() == 1).await);

    // Unknown handler id.
    let mut stray = JobResult::success(&tickets[0], client.clone(), json!("ok"));
    stray.handler_id = HandlerId::new();
    assert!(!registry.process_result(stray).await);

    let clients = registry.clients();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].processed, 2);
    assert_eq!(clients[0].in_progress, 0);

    registry.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_selectors_and_states_limit_dispatch() -> Result<(), Box<dyn Error>> {
    let plan = Plan::with_batch(vec![json!("x"), json!("y")]);
    let registry = registry_with(FactoryLoader::new().with("scripted", plan.factory()));

    let settings = HandlerSettings {
        autostart: true,
        denied_clients: vec!["blocked-*".to_string()],
        ..Default::default()
    };
    let id = registry
        .add(common::definition_with("scene", "scripted", settings))
        .await?
        .handler_id();
    assert!(wait_for_available(&registry, id, 2).await);

    assert!(registry.get_job(&ClientId::from("blocked-7")).await.is_none());

    assert!(registry.pause(id).await);
    assert!(registry.get_job(&ClientId::from("worker")).await.is_none());
    assert!(registry.start(id).await);
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Running));
    assert!(registry.get_job(&ClientId::from("worker")).await.is_some());

    assert!(registry.disable(id).await);
    assert!(registry.get_job(&ClientId::from("worker")).await.is_none());
    assert_eq!(
        registry.try_start(id).await.err().map(|e| e.code()),
        Some(ErrorCode::Disabled)
    );

    assert!(registry.enable(id).await);
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Stopped));

    registry.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_finished_run_settles_instance_state() -> Result<(), Box<dyn Error>> {
    let plan = Plan::new();
    let registry = registry_with(FactoryLoader::new().with("scripted", plan.factory()));
    let mut events = registry.subscribe();

    let id = registry
        .add(common::definition_with("scene", "scripted", autostart()))
        .await?
        .handler_id();

    plan.finish();
    assert!(wait_for_state(&registry, id, HandlerState::Finished).await);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(HandlerEvent::HandlerAdded { .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        HandlerEvent::StateChanged {
            new_state: HandlerState::Finished,
            ..
        }
    )));

    // A finished handler can be started again.
    plan.resume();
    assert!(registry.start(id).await);
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Running));

    assert!(registry.remove(id).await);
    assert!(registry.is_empty());
    registry.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_tick_runs_cron_and_idle() -> Result<(), Box<dyn Error>> {
    let plan = Plan::new();
    let registry = registry_with(FactoryLoader::new().with("scripted", plan.factory()));

    let cron = HandlerSettings {
        cron: Some("* * * * *".to_string()),
        idle_time: Some("22:00-06:00".to_string()),
        ..Default::default()
    };
    let id = registry
        .add(common::definition_with("nightly", "scripted", cron))
        .await?
        .handler_id();
    let plain = registry
        .add(common::definition_with("manual", "scripted", HandlerSettings::default()))
        .await?
        .handler_id();

    let noon = NaiveTime::from_hms_opt(12, 0, 0).ok_or("bad time")?;
    let now = Utc::now() + chrono::Duration::minutes(2);
    registry.tick_at(now, noon).await;
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Running));
    assert_eq!(state_of(&registry, plain).await, Some(HandlerState::Stopped));

    let late = NaiveTime::from_hms_opt(23, 0, 0).ok_or("bad time")?;
    registry.tick_at(now, late).await;
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Idle));

    registry.teardown().await;
    assert_eq!(state_of(&registry, id).await, Some(HandlerState::Stopped));
    Ok(())
}

#[tokio::test]
async fn test_restore_replays_catalog() -> Result<(), Box<dyn Error>> {
    let database = db::init(DbConfig::memory()).await?;
    let catalog = HandlerRepository::new(database);

    let plan = Plan::new();
    let loader = Arc::new(FactoryLoader::new().with("scripted", plan.factory()));

    let registry = HandlerRegistry::builder(test_config())
        .with_loader(loader.clone())
        .with_catalog(catalog.clone())
        .build();
    let kept = registry
        .add(common::definition("kept", "scripted"))
        .await?
        .handler_id();
    let parked = registry
        .add(common::definition("parked", "scripted"))
        .await?
        .handler_id();
    let dropped = registry
        .add(common::definition("dropped", "scripted"))
        .await?
        .handler_id();
    assert!(registry.disable(parked).await);
    assert!(registry.remove(dropped).await);
    registry.teardown().await;

    assert_eq!(catalog.list().await?.len(), 2);

    let restarted = HandlerRegistry::builder(test_config())
        .with_loader(loader)
        .with_catalog(catalog)
        .build();
    assert_eq!(restarted.restore().await?, 2);
    assert_eq!(state_of(&restarted, kept).await, Some(HandlerState::Stopped));
    assert_eq!(state_of(&restarted, parked).await, Some(HandlerState::Disabled));
    assert!(restarted.info(dropped).await.is_none());

    restarted.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_reclaimed_jobs_release_client_slots() -> Result<(), Box<dyn Error>> {
    let plan = Plan::with_batch(vec![json!("frame-1")]);
    let registry = registry_with(FactoryLoader::new().with("scripted", plan.factory()));
    let settings = HandlerSettings {
        job_timeout_secs: 1,
        ..autostart()
    };
    let id = registry
        .add(common::definition_with("slow", "scripted", settings))
        .await?
        .handler_id();
    assert!(wait_for_available(&registry, id, 1).await);

    let slow = ClientId::from("slow-worker");
    let fast = ClientId::from("fast-worker");
    let first = registry.get_job(&slow).await.ok_or("no job dispatched")?;

    // The control loop sweeps the job back once the timeout passes.
    let mut again = None;
    let deadline = tokio::time::Instant::now() + WAIT;
    while again.is_none() && tokio::time::Instant::now() < deadline {
        again = registry.get_job(&fast).await;
        if again.is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    let again = again.ok_or("timed-out job never came back")?;
    assert_eq!(again.id, first.id);

    let by_id = |client: &ClientId| {
        registry
            .clients()
            .into_iter()
            .find(|info| &info.id == client)
    };
    assert_eq!(by_id(&slow).ok_or("slow client unknown")?.in_progress, 0);
    assert_eq!(by_id(&fast).ok_or("fast client unknown")?.in_progress, 1);

    assert!(registry
        .process_result(JobResult::success(&again, fast.clone(), json!("done")))
        .await);
    // The slow client's late answer is refused and changes nothing.
    assert!(!registry
        .process_result(JobResult::success(&first, slow.clone(), json!("late")))
        .await);

    let slow_info = by_id(&slow).ok_or("slow client unknown")?;
    assert_eq!(slow_info.in_progress, 0);
    assert_eq!(slow_info.processed, 0);
    let fast_info = by_id(&fast).ok_or("fast client unknown")?;
    assert_eq!(fast_info.in_progress, 0);
    assert_eq!(fast_info.processed, 1);

    // Stopping the handler hands back jobs still out with clients.
    plan.queue_batch(vec![json!("frame-2")]);
    assert!(wait_for_available(&registry, id, 1).await);
    registry.get_job(&slow).await.ok_or("no job dispatched")?;
    assert_eq!(by_id(&slow).ok_or("slow client unknown")?.in_progress, 1);
    assert!(registry.stop(id).await);
    assert_eq!(by_id(&slow).ok_or("slow client unknown")?.in_progress, 0);

    registry.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_removed_handler_refuses_lifecycle_calls() -> Result<(), Box<dyn Error>> {
    let plan = Plan::with_batch(vec![json!("a")]);
    let registry = registry_with(FactoryLoader::new().with("scripted", plan.factory()));
    let id = registry
        .add(common::definition_with("gone", "scripted", autostart()))
        .await?
        .handler_id();
    assert!(wait_for_available(&registry, id, 1).await);

    assert!(registry.remove(id).await);
    assert!(!registry.start(id).await);
    assert_eq!(
        registry.try_start(id).await.map_err(|e| e.code()),
        Err(ErrorCode::NotFound)
    );
    assert!(!registry.enable(id).await);
    assert!(registry.info(id).await.is_none());
    assert!(registry.get_job(&ClientId::from("worker")).await.is_none());

    // A scheduler pass after removal leaves nothing running.
    registry
        .tick_at(Utc::now() + chrono::Duration::days(1), NaiveTime::default())
        .await;
    assert!(registry.is_empty());
    assert_eq!(plan.count(|c| *c == common::Call::Start), 1);
    assert_eq!(plan.count(|c| *c == common::Call::Stop), 1);

    registry.teardown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_clients_never_share_a_job() -> Result<(), Box<dyn Error>> {
    const JOBS: usize = 40;
    const CLIENTS: usize = 8;

    let plan = Plan::with_batch((0..JOBS).map(|n| json!(n)).collect());
    let registry = registry_with(FactoryLoader::new().with("scripted", plan.factory()));
    let id = registry
        .add(common::definition_with("crowd", "scripted", autostart()))
        .await?
        .handler_id();
    assert!(wait_for_available(&registry, id, JOBS as u64).await);

    let workers: Vec<_> = (0..CLIENTS)
        .map(|n| {
            let registry = registry.clone();
            tokio::spawn(async move {
                let client = ClientId::from(format!("worker-{}", n).as_str());
                let mut taken = Vec::new();
                while let Some(ticket) = registry.get_job(&client).await {
                    taken.push(ticket.id);
                    tokio::task::yield_now().await;
                }
                taken
            })
        })
        .collect();

    let mut total = 0;
    let mut distinct = HashSet::new();
    for worker in workers {
        let taken = worker.await?;
        total += taken.len();
        distinct.extend(taken);
    }
    assert_eq!(distinct.len(), total, "a job was handed out twice");
    assert_eq!(total, JOBS);

    let stats = registry.info(id).await.ok_or("handler vanished")?.stats;
    assert_eq!(stats.available, 0);
    assert_eq!(stats.pending, JOBS as u64);
    assert_eq!(stats.available + stats.pending, JOBS as u64);

    let in_progress: u64 = registry.clients().iter().map(|info| info.in_progress).sum();
    assert_eq!(in_progress, JOBS as u64);

    registry.teardown().await;
    Ok(())
}
