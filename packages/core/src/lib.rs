//! Core domain types for the handler orchestration system.
//!
//! This crate contains shared types used across all packages:
//! - Handler definitions, settings and lifecycle state
//! - Jobs, tickets and results exchanged with clients
//! - Cron schedules and idle windows
//! - Events for real-time updates

mod client;
mod events;
mod handler;
mod job;
mod schedule;

pub use client::{ClientId, ClientInfo, ClientSelector};
pub use events::{HandlerEvent, LogLevel, RequeueReason};
pub use handler::{
    FullName, HandlerDefinition, HandlerId, HandlerInfo, HandlerSettings, HandlerState,
    HandlerStats,
};
pub use job::{Job, JobError, JobId, JobOutcome, JobResult, JobTicket};
pub use schedule::{CronSchedule, IdleWindow, ScheduleError};
