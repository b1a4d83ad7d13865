//! Forwarding of registry events to the log.

use fleet_core::HandlerEvent;
use tokio::sync::broadcast::{Receiver, error::RecvError};

/// Log every event until the registry closes the channel.
///
/// A slow logger skips the events it missed and keeps going. Returns how
/// many events were logged.
pub async fn log_events(mut events: Receiver<HandlerEvent>) -> u64 {
    let mut logged = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                tracing::debug!(handler_id = %event.handler_id(), "{}", event.description());
                logged += 1;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    logged
}
