use crate::device::Platform;
use crate::error::{KuromeError, Result};
use crate::session::{PairStatus, SessionHandle};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// What observers of the registry see for each live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: String,
    pub name: String,
    pub platform: Platform,
    pub address: SocketAddr,
    pub fingerprint: String,
    pub status: PairStatus,
}

pub type SessionMap = Arc<BTreeMap<String, SessionSnapshot>>;

enum Entry {
    /// Reserved by a connection attempt that has not produced a session yet.
    Connecting,
    Active(SessionHandle),
}

/// Peer id -> session, with at most one entry per id.
///
/// A single lock guards the map and the published snapshot is replaced while
/// it is held, so subscribers only ever observe complete states.
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    snapshot_tx: watch::Sender<SessionMap>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(BTreeMap::new()));
        Self {
            entries: Mutex::new(HashMap::new()),
            snapshot_tx,
        }
    }

    /// Reserves `id` for a connection attempt. Returns `false` if the id is
    /// already connecting or active; the existing entry is left alone.
    pub fn try_begin(&self, id: &str) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            debug!("Session for {} already in progress", id);
            return false;
        }
        entries.insert(id.to_string(), Entry::Connecting);
        true
    }

    /// Releases a reservation whose attempt failed. Active sessions are not
    /// touched.
    pub fn abandon(&self, id: &str) {
        let mut entries = self.entries.lock();
        if matches!(entries.get(id), Some(Entry::Connecting)) {
            entries.remove(id);
            debug!("Released reservation for {}", id);
        }
    }

    pub fn register(&self, id: &str, handle: SessionHandle) -> Result<()> {
        let mut entries = self.entries.lock();
        if matches!(entries.get(id), Some(Entry::Active(_))) {
            return Err(KuromeError::AlreadyConnected(id.to_string()));
        }
        let snapshot = handle.snapshot();
        entries.insert(id.to_string(), Entry::Active(handle));
        self.snapshot_tx.send_modify(|map| {
            Arc::make_mut(map).insert(id.to_string(), snapshot);
        });
        info!("Session registered for {}", id);
        Ok(())
    }

    pub fn unregister(&self, id: &str) {
        let mut entries = self.entries.lock();
        if entries.remove(id).is_some() {
            self.snapshot_tx.send_if_modified(|map| Arc::make_mut(map).remove(id).is_some());
            info!("Session unregistered for {}", id);
        }
    }

    pub fn update_status(&self, id: &str, status: PairStatus) {
        let entries = self.entries.lock();
        if !matches!(entries.get(id), Some(Entry::Active(_))) {
            return;
        }
        self.snapshot_tx.send_if_modified(|map| match Arc::make_mut(map).get_mut(id) {
            Some(snapshot) if snapshot.status != status => {
                snapshot.status = status;
                true
            }
            _ => false,
        });
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        match self.entries.lock().get(id) {
            Some(Entry::Active(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// True while `id` is connecting or active.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn active_sessions(&self) -> watch::Receiver<SessionMap> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionMap {
        self.snapshot_tx.borrow().clone()
    }

    /// Disconnects every active session. Each session unregisters itself as
    /// its loop winds down.
    pub async fn close_all(&self) {
        let handles: Vec<SessionHandle> = self
            .entries
            .lock()
            .values()
            .filter_map(|entry| match entry {
                Entry::Active(handle) => Some(handle.clone()),
                Entry::Connecting => None,
            })
            .collect();

        for handle in handles {
            handle.disconnect().await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}
