//! Registry of live bridge sessions.
//!
//! The map lock is only held for the map operation itself. Closing a
//! session's handles always happens after the entry has been removed and
//! the lock released, so a slow remote never stalls unrelated sessions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::{BridgeSession, SessionId};
use crate::task::supervise;

/// Shortest gap between sweeps. Smaller intervals, including zero, are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Concurrent map from session id to bridge session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<BridgeSession>>>,
    sweeper: Mutex<Option<JoinHandle<Option<()>>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` under its id, replacing any previous entry.
    ///
    /// Returns the replaced session, which the caller now owns.
    pub fn put(&self, session: Arc<BridgeSession>) -> Option<Arc<BridgeSession>> {
        let id = session.id().clone();
        let previous = self.sessions.write().insert(id.clone(), session);
        debug!(session_id = %id, replaced = previous.is_some(), "Session registered");
        previous
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<BridgeSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Removes and closes a session. Absent ids are ignored.
    ///
    /// Returns whether an entry was removed.
    pub async fn delete(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().remove(id);
        match removed {
            Some(session) => {
                session.close().await;
                info!(session_id = %id, remaining = self.len(), "Session removed");
                true
            }
            None => false,
        }
    }

    /// Marks a session as active now. Returns `false` if it is not registered.
    pub fn touch(&self, id: &SessionId) -> bool {
        match self.get(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Evicts every session idle for longer than `max_idle`.
    ///
    /// Returns the number of sessions evicted.
    pub async fn sweep(&self, max_idle: Duration) -> usize {
        let stale: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, session)| session.idle_time() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = 0;
        for id in stale {
            // A touch between the scan and now keeps the session alive.
            let removed = {
                let mut sessions = self.sessions.write();
                match sessions.get(&id) {
                    Some(session) if session.idle_time() > max_idle => sessions.remove(&id),
                    _ => None,
                }
            };
            if let Some(session) = removed {
                info!(
                    session_id = %id,
                    idle_secs = session.idle_time().as_secs(),
                    "Evicting idle session"
                );
                session.close().await;
                evicted += 1;
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Snapshot of registered sessions.
    pub fn sessions(&self) -> Vec<Arc<BridgeSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Starts periodic sweeping.
    ///
    /// `interval` controls how often the registry is scanned and `max_idle`
    /// how long a session may stay quiet. The task holds only a weak
    /// reference and ends once the registry is dropped. `interval` is
    /// raised to [`MIN_SWEEP_INTERVAL`] when shorter.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, max_idle: Duration) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(MIN_SWEEP_INTERVAL);

        let handle = supervise("registry-sweeper", async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let evicted = registry.sweep(max_idle).await;
                if evicted > 0 {
                    debug!(evicted, remaining = registry.len(), "Sweep finished");
                }
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(
            interval = ?interval,
            max_idle_secs = max_idle.as_secs(),
            "Session sweeper started"
        );
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Session sweeper stopped");
        }
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}
