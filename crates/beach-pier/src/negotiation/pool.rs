use std::collections::HashMap;
use std::sync::Arc;

use crate::native::{NativePeerConnection, SignalingState};
use crate::protocol::ConnectionType;

/// Routing key from a native instance back to the connection it serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRef {
    pub kind: ConnectionType,
    pub peer: String,
    pub connection_id: String,
}

pub(crate) struct PoolEntry {
    pub(crate) native: Arc<dyn NativePeerConnection>,
    pub(crate) owner: Option<ConnectionRef>,
}

#[derive(Default)]
struct PeerSlot {
    current: Option<String>,
    entries: HashMap<String, PoolEntry>,
}

/// Native instances keyed by `(type, peer)` and then by entry id.
#[derive(Default)]
pub(crate) struct PeerConnectionPool {
    slots: HashMap<(ConnectionType, String), PeerSlot>,
    index: HashMap<String, (ConnectionType, String)>,
}

impl PeerConnectionPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The current instance for `(kind, peer)` if it can take new work:
    /// not closed and with no negotiation in flight.
    pub(crate) fn reusable(
        &self,
        kind: ConnectionType,
        peer: &str,
    ) -> Option<(String, Arc<dyn NativePeerConnection>)> {
        let slot = self.slots.get(&(kind, peer.to_string()))?;
        let entry_id = slot.current.as_ref()?;
        let entry = slot.entries.get(entry_id)?;
        if entry.native.is_closed() || entry.native.signaling_state() != SignalingState::Stable {
            return None;
        }
        Some((entry_id.clone(), Arc::clone(&entry.native)))
    }

    /// Registers a fresh instance and makes it the current one.
    pub(crate) fn insert(
        &mut self,
        kind: ConnectionType,
        peer: &str,
        entry_id: String,
        native: Arc<dyn NativePeerConnection>,
    ) {
        let key = (kind, peer.to_string());
        let slot = self.slots.entry(key.clone()).or_default();
        slot.entries.insert(
            entry_id.clone(),
            PoolEntry {
                native,
                owner: None,
            },
        );
        slot.current = Some(entry_id.clone());
        self.index.insert(entry_id, key);
    }

    pub(crate) fn get(&self, entry_id: &str) -> Option<&PoolEntry> {
        let key = self.index.get(entry_id)?;
        self.slots.get(key)?.entries.get(entry_id)
    }

    pub(crate) fn set_owner(&mut self, entry_id: &str, owner: ConnectionRef) {
        let Some(key) = self.index.get(entry_id) else {
            return;
        };
        if let Some(entry) = self
            .slots
            .get_mut(key)
            .and_then(|slot| slot.entries.get_mut(entry_id))
        {
            entry.owner = Some(owner);
        }
    }

    pub(crate) fn remove(&mut self, entry_id: &str) -> Option<PoolEntry> {
        let key = self.index.remove(entry_id)?;
        let slot = self.slots.get_mut(&key)?;
        let entry = slot.entries.remove(entry_id);
        if slot.current.as_deref() == Some(entry_id) {
            slot.current = None;
        }
        if slot.entries.is_empty() {
            self.slots.remove(&key);
        }
        entry
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }
}
