//! Handler lifecycle and job distribution.
//!
//! This crate hosts handler logic, hands its jobs to polling clients and
//! keeps every handler's lifecycle state consistent.
//!
//! # Architecture
//!
//! - `HandlerRegistry` - Entry point for the transport layer; owns all handlers
//!   and the scheduler tick
//! - `HandlerInstance` - One handler's state machine, cron schedule and idle window
//! - `HandlerQueueEngine` - Available/pending/finished job sets for one run
//! - `ControlLoop` - Ractor actor per run; the only caller of handler logic
//!
//! # Usage
//!
//! ```ignore
//! use actors::{FactoryLoader, HandlerRegistry, RegistryConfig};
//!
//! let loader = FactoryLoader::new().with("counter", counter_factory);
//! let registry = HandlerRegistry::builder(RegistryConfig::default())
//!     .with_loader(Arc::new(loader))
//!     .build();
//!
//! registry.add(definition).await?;
//! if let Some(ticket) = registry.get_job(&client).await {
//!     // ...
//!     registry.process_result(JobResult::success(&ticket, client, output)).await;
//! }
//! ```

mod clients;
mod config;
mod context;
mod control_loop;
mod engine;
mod error;
mod instance;
mod loader;
mod logic;
mod messages;
mod registry;
mod scheduler;

pub use clients::ClientTracker;
pub use config::{
    DEFAULT_DISPATCH_ATTEMPTS, DEFAULT_EVENT_CAPACITY, DEFAULT_TICK_INTERVAL, RegistryConfig,
};
pub use context::{ExecutionContext, ExecutionContextProvider, LocalContext, LocalProvider};
pub use control_loop::{ControlLoop, ControlLoopArgs};
pub use engine::{DEFAULT_LOOP_INTERVAL, EngineChannels, EngineShared, HandlerQueueEngine, RunId};
pub use error::{AddOutcome, ErrorCode, RegistryError};
pub use instance::HandlerInstance;
pub use loader::{FactoryLoader, HandlerLoader, LoadError, LoadedHandler};
pub use logic::{FnFactory, HandlerContext, HandlerFactory, HandlerLogic, InitError, LogicError};
pub use messages::{ControlMessage, EngineNotice, NoticeKind, WakeReason};
pub use registry::{HandlerRegistry, RegistryBuilder};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
