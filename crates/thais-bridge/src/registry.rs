use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use thais_events::ConnectionId;

use crate::connection::Connection;

/// Live connections the bridge can route replies to, keyed by id.
///
/// Cheap to clone; every clone sees the same set.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<ConnectionId, Arc<dyn Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the connection previously registered under the same id, if any
    pub fn insert(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        connections.insert(connection.id(), connection)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChannelConnection;

    #[test]
    fn test_insert_get_remove() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = ChannelConnection::new(ConnectionId::from_raw(4));
        assert!(registry.insert(Arc::new(conn)).is_none());

        let clone = registry.clone();
        assert_eq!(clone.len(), 1);
        assert_eq!(
            clone.get(ConnectionId::from_raw(4)).map(|c| c.id()),
            Some(ConnectionId::from_raw(4))
        );

        assert!(registry.remove(ConnectionId::from_raw(4)).is_some());
        assert!(clone.get(ConnectionId::from_raw(4)).is_none());
        assert!(clone.is_empty());
    }
}
