//! Repository implementations for database operations.

mod handler_repo;

pub use handler_repo::{CatalogEntry, HandlerRepository};
