//! Naming server's bookkeeping of connected client sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::{ClientId, ErrorCode};

#[derive(Debug)]
struct ClientsInner {
    /// Next client ID to assign; never reused.
    next_id: ClientId,

    /// Map from client ID -> remote address of its session.
    sessions: HashMap<ClientId, SocketAddr>,
}

/// Registry of connected clients.
#[derive(Debug)]
pub struct ClientRegistry {
    inner: Mutex<ClientsInner>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        ClientRegistry {
            inner: Mutex::new(ClientsInner {
                next_id: 0,
                sessions: HashMap::new(),
            }),
            max_clients,
        }
    }

    fn inner(&self) -> MutexGuard<'_, ClientsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a session for a client connected from `addr`.
    pub fn register(&self, addr: SocketAddr) -> Result<ClientId, ErrorCode> {
        let mut inner = self.inner();
        if inner.sessions.len() >= self.max_clients {
            return Err(ErrorCode::CapacityExceeded);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.sessions.insert(id, addr);
        Ok(id)
    }

    /// Closes a session. Returns whether it was open.
    pub fn remove(&self, id: ClientId) -> bool {
        self.inner().sessions.remove(&id).is_some()
    }

    pub fn addr_of(&self, id: ClientId) -> Option<SocketAddr> {
        self.inner().sessions.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod clients_tests {
    use super::*;

    #[test]
    fn monotonic_ids() {
        let reg = ClientRegistry::new(2);
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(reg.register(addr), Ok(0));
        assert_eq!(reg.register(addr), Ok(1));
        assert_eq!(reg.register(addr), Err(ErrorCode::CapacityExceeded));
        assert!(reg.remove(0));
        assert!(!reg.remove(0));
        assert_eq!(reg.register(addr), Ok(2));
        assert_eq!(reg.addr_of(2), Some(addr));
        assert_eq!(reg.len(), 2);
    }
}
