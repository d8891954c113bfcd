//! Bookkeeping for live connections.
//!
//! The registry never owns a socket. It maps connection ids to the task
//! driving each connection so `stop()` can wait for every one of them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Total number of ids handed out, i.e. connections ever accepted.
    pub fn total_allocated(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Spawns the task driving `id` and records it as live.
    ///
    /// The entry is inserted before the task can run to completion, so a
    /// connection that closes immediately still finds itself to remove.
    pub fn spawn<F>(&self, id: ConnectionId, connection: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut live = self.lock();
        let handle = tokio::spawn(connection);
        live.insert(id, handle);
    }

    /// Forgets `id`. Returns false if it was not registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Empties the registry and returns the tasks it was tracking.
    pub fn drain(&self) -> Vec<(ConnectionId, JoinHandle<()>)> {
        self.lock().drain().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, JoinHandle<()>>> {
        // The map stays consistent even if a holder panicked
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
