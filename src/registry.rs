use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::protocol::DeviceConnection;

/// Live device connections keyed by UID, scoped to one application instance.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<DeviceConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uid: &str, conn: Arc<DeviceConnection>) {
        debug!(uid = %uid, "Registering device connection");
        self.connections.write().insert(uid.to_string(), conn);
    }

    /// Remove `conn` for `uid`, unless it has already been replaced by a
    /// newer connection.
    pub fn unregister(&self, uid: &str, conn: &Arc<DeviceConnection>) -> bool {
        let mut connections = self.connections.write();
        match connections.get(uid) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                connections.remove(uid);
                debug!(uid = %uid, "Unregistered device connection");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, uid: &str) -> Option<Arc<DeviceConnection>> {
        self.connections.read().get(uid).cloned()
    }

    pub fn is_connected(&self, uid: &str) -> bool {
        self.connections.read().contains_key(uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = DeviceConnection::new("abc");
        registry.register("abc", conn.clone());

        assert!(Arc::ptr_eq(&registry.get("abc").unwrap(), &conn));
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_stale_unregister_keeps_newer_connection() {
        let registry = ConnectionRegistry::new();
        let (old, _old_rx) = DeviceConnection::new("abc");
        let (new, _new_rx) = DeviceConnection::new("abc");

        registry.register("abc", old.clone());
        registry.register("abc", new.clone());

        assert!(!registry.unregister("abc", &old));
        assert!(registry.is_connected("abc"));
        assert!(registry.unregister("abc", &new));
        assert!(!registry.is_connected("abc"));
    }
}
