//! Connection status notifications for observers outside the mesh layer.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::identity::ParticipantId;

/// Connection state reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    NotConnected,
}

/// Observer for participants coming and going.
pub trait ConnectionStatusListener: Send + Sync {
    fn new_participant_has_connected(&self, participant: ParticipantId);
    fn participant_has_disconnected(&self, participant: ParticipantId);
}

/// Fan-out of connection status changes to registered listeners.
#[derive(Default)]
pub struct ConnectionStatusUpdateNotifier {
    owner: String,
    listeners: RwLock<Vec<Arc<dyn ConnectionStatusListener>>>,
}

impl ConnectionStatusUpdateNotifier {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn ConnectionStatusListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener previously registered with the same `Arc`.
    pub fn unregister_listener(&self, listener: &Arc<dyn ConnectionStatusListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn trigger_notification(&self, participant: ParticipantId, status: ConnectionStatus) {
        debug!(
            "ConnectionStatusUpdateNotifier({}): {participant} is now {status:?}",
            self.owner
        );
        // Snapshot so listeners may (un)register from inside a callback.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            match status {
                ConnectionStatus::Connected => listener.new_participant_has_connected(participant),
                ConnectionStatus::NotConnected => listener.participant_has_disconnected(participant),
            }
        }
    }
}
