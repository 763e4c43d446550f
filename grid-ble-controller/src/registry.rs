//! Gateway-wide registry of device sessions, at most one live session per MAC

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::{Mutex, RwLock, watch};

use crate::config::SessionSettings;
use crate::identity::{DeviceIdentity, MacAddress};
use crate::session::{DeviceSession, SessionHandle, SessionStatus};

struct Entry {
    session: SessionHandle,
    status: watch::Receiver<SessionStatus>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.status.borrow().is_live()
    }
}

type Slot = Arc<Mutex<Option<Entry>>>;

/// Per-MAC slots. Two callers racing on the same MAC always serialize on the
/// same slot lock. An empty slot leaves the map only while the map holds its
/// last reference.
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: RwLock<HashMap<MacAddress, Slot>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, mac: MacAddress) -> Slot {
        if let Some(slot) = self.slots.read().await.get(&mac) {
            return slot.clone();
        }
        self.slots.write().await.entry(mac).or_default().clone()
    }

    /// Return the live session for `identity`, or create a fresh one. The
    /// flag is true when the session was created by this call.
    ///
    /// A session that reached `Disconnected` after being opened is stale and
    /// gets replaced.
    pub async fn get_or_create(
        &self,
        identity: &DeviceIdentity,
        settings: SessionSettings,
    ) -> (SessionHandle, bool) {
        let slot = self.slot(identity.mac()).await;
        let mut entry = slot.lock().await;
        if let Some(existing) = entry.as_ref() {
            if existing.is_live() {
                return (existing.session.clone(), false);
            }
            debug!("{identity}: replacing stale session");
        }

        let session = DeviceSession::new(identity.clone(), settings);
        let status = session.watch();
        let session = session.into_handle();
        *entry = Some(Entry {
            session: session.clone(),
            status,
        });
        (session, true)
    }

    pub async fn get(&self, mac: MacAddress) -> Option<SessionHandle> {
        let slot = self.slots.read().await.get(&mac).cloned()?;
        let entry = slot.lock().await;
        entry
            .as_ref()
            .filter(|e| e.is_live())
            .map(|e| e.session.clone())
    }

    /// Forget the session for `identity`. Does not disconnect it.
    pub async fn remove(&self, identity: &DeviceIdentity) -> Option<SessionHandle> {
        let slot = self.slots.read().await.get(&identity.mac()).cloned()?;
        let entry = slot.lock().await.take();
        drop(slot);
        self.prune(identity.mac()).await;
        entry.map(|e| e.session)
    }

    /// Remove the entry only if it still holds `session`; a newer session
    /// registered for the same MAC is left alone.
    pub async fn release(&self, identity: &DeviceIdentity, session: &SessionHandle) -> bool {
        let Some(slot) = self.slots.read().await.get(&identity.mac()).cloned() else {
            return false;
        };
        let released = {
            let mut entry = slot.lock().await;
            match entry.as_ref() {
                Some(e) if Arc::ptr_eq(&e.session, session) => {
                    *entry = None;
                    true
                }
                _ => false,
            }
        };
        drop(slot);
        if released {
            self.prune(identity.mac()).await;
        }
        released
    }

    /// Live sessions right now
    pub async fn sessions(&self) -> Vec<SessionHandle> {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        let mut sessions = Vec::new();
        for slot in slots {
            if let Some(entry) = slot.lock().await.as_ref().filter(|e| e.is_live()) {
                sessions.push(entry.session.clone());
            }
        }
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Disconnect and forget every session. Used on shutdown.
    pub async fn disconnect_all(&self) {
        let slots: Vec<_> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            let entry = slot.lock().await.take();
            if let Some(entry) = entry {
                entry.session.lock().await.disconnect().await;
            }
        }
        self.slots.write().await.retain(|_, slot| !unused(slot));
    }

    /// Drop the slot for `mac` if it is empty and unshared. Nobody can clone
    /// a slot out of the map while the write lock is held.
    async fn prune(&self, mac: MacAddress) {
        let mut slots = self.slots.write().await;
        if slots.get(&mac).is_some_and(unused) {
            slots.remove(&mac);
        }
    }
}

fn unused(slot: &Slot) -> bool {
    Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|entry| entry.is_none())
}
