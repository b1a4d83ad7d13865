//! Bookkeeping for the clients polling this server.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fleet_core::{ClientId, ClientInfo};

use crate::engine::lock;

/// Last-seen time and counters per client. Records are never evicted.
#[derive(Default)]
pub struct ClientTracker {
    clients: Mutex<HashMap<ClientId, ClientInfo>>,
}

impl ClientTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, client: &ClientId, now: DateTime<Utc>, f: impl FnOnce(&mut ClientInfo)) {
        let mut clients = lock(&self.clients);
        let info = clients
            .entry(client.clone())
            .or_insert_with(|| ClientInfo::new(client.clone(), now));
        info.last_seen = now;
        f(info);
    }

    /// Record contact without any job traffic.
    pub fn touch(&self, client: &ClientId, now: DateTime<Utc>) {
        self.update(client, now, |_| {});
    }

    pub fn job_assigned(&self, client: &ClientId, now: DateTime<Utc>) {
        self.update(client, now, |info| info.in_progress += 1);
    }

    /// Drop one in-progress job from `client` without counting a result.
    ///
    /// Used when the engine takes a job back (timeout or shutdown). Does not
    /// count as contact from the client.
    pub fn job_released(&self, client: &ClientId) {
        if let Some(info) = lock(&self.clients).get_mut(client) {
            info.in_progress = info.in_progress.saturating_sub(1);
        }
    }

    pub fn result_reported(&self, client: &ClientId, success: bool, now: DateTime<Utc>) {
        self.update(client, now, |info| {
            info.in_progress = info.in_progress.saturating_sub(1);
            if success {
                info.processed += 1;
            } else {
                info.failed += 1;
            }
        });
    }

    pub fn get(&self, client: &ClientId) -> Option<ClientInfo> {
        lock(&self.clients).get(client).cloned()
    }

    /// All known clients, ordered by id.
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        let mut clients: Vec<ClientInfo> = lock(&self.clients).values().cloned().collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    pub fn len(&self) -> usize {
        lock(&self.clients).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
