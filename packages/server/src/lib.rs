//! Process host for the handler registry.

pub mod config;
pub mod demo;
pub mod events;

pub use config::{ConfigError, ServerConfig};
