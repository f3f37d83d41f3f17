//! Connection registry: shared, reference-counted bus sockets.
//!
//! One registry is created when the daemon starts and passed explicitly to
//! every topic channel. It owns every socket: the same (endpoint, role) pair is
//! opened once and shared, and closed when its last [`Lease`] is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::endpoint;
use super::socket::{PubSocket, SubSocket};
use crate::error::BusError;

/// Which side of the bus a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Binds and sends.
    Publisher,
    /// Dials and receives.
    Subscriber,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Publisher => write!(f, "publisher"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// A shared socket handle.
#[derive(Debug, Clone)]
pub enum Socket {
    Publisher(Arc<PubSocket>),
    Subscriber(Arc<SubSocket>),
}

impl Socket {
    fn close(&self) {
        match self {
            Self::Publisher(s) => s.close(),
            Self::Subscriber(s) => s.close(),
        }
    }
}

/// Exclusive/shared lock serializing sends and receives on one port.
pub type PortLock = Arc<RwLock<()>>;

type ConnectionKey = (String, Role);

#[derive(Debug)]
struct Entry {
    socket: Socket,
    refs: usize,
    /// Port the lock for this entry is registered under (publishers only).
    lock_port: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<ConnectionKey, Entry>,
    locks: HashMap<String, PortLock>,
}

/// Process-scoped table of bus connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open (or reuse) the connection for `(endpoint, role)`.
    ///
    /// Publishers bind, subscribers dial. A bind failure is returned as-is and
    /// leaves no entry behind. Must be called from within a tokio runtime.
    pub fn acquire(self: &Arc<Self>, endpoint: &str, role: Role) -> Result<Lease, BusError> {
        let mut state = self.state();
        let key = (endpoint.to_string(), role);

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.refs += 1;
            debug!(endpoint = %endpoint, role = %role, refs = entry.refs, "Reusing connection");
            return Ok(Lease {
                registry: Arc::clone(self),
                endpoint: endpoint.to_string(),
                role,
                socket: entry.socket.clone(),
            });
        }

        let (socket, lock_port) = match role {
            Role::Publisher => {
                let socket = PubSocket::bind(endpoint)?;
                let port = endpoint::port_of(&socket.local_endpoint());
                (Socket::Publisher(Arc::new(socket)), Some(port))
            }
            Role::Subscriber => (Socket::Subscriber(Arc::new(SubSocket::connect(endpoint)?)), None),
        };

        if let Some(port) = &lock_port {
            state.locks.entry(port.clone()).or_default();
        }
        state.entries.insert(
            key,
            Entry {
                socket: socket.clone(),
                refs: 1,
                lock_port,
            },
        );
        info!(endpoint = %endpoint, role = %role, "Connection opened");

        Ok(Lease {
            registry: Arc::clone(self),
            endpoint: endpoint.to_string(),
            role,
            socket,
        })
    }

    /// Drop one reference to `(endpoint, role)`, closing the socket when none
    /// remain. Returns `false` when there was nothing to release.
    pub fn release(&self, endpoint: &str, role: Role) -> bool {
        let closed = {
            let mut state = self.state();
            let key = (endpoint.to_string(), role);
            let Some(entry) = state.entries.get_mut(&key) else {
                return false;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                debug!(endpoint = %endpoint, role = %role, refs = entry.refs, "Connection released");
                return true;
            }

            let entry = state.entries.remove(&key);
            if let Some(port) = entry.as_ref().and_then(|e| e.lock_port.as_ref()) {
                let still_used = state
                    .entries
                    .values()
                    .any(|e| e.lock_port.as_ref() == Some(port));
                if !still_used {
                    state.locks.remove(port);
                }
            }
            entry.map(|e| e.socket)
        };

        if let Some(socket) = closed {
            socket.close();
            info!(endpoint = %endpoint, role = %role, "Connection closed");
        }
        true
    }

    /// Lock shared by every connection on the endpoint's port, if one is
    /// registered.
    pub fn lock_for(&self, endpoint: &str) -> Option<PortLock> {
        let port = endpoint::port_of(endpoint);
        self.state().locks.get(&port).cloned()
    }

    /// Current reference count for `(endpoint, role)`; 0 when absent.
    pub fn ref_count(&self, endpoint: &str, role: Role) -> usize {
        self.state()
            .entries
            .get(&(endpoint.to_string(), role))
            .map_or(0, |e| e.refs)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped ownership of one registry reference. Dropping it releases.
#[derive(Debug)]
pub struct Lease {
    registry: Arc<ConnectionRegistry>,
    endpoint: String,
    role: Role,
    socket: Socket,
}

impl Lease {
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.release(&self.endpoint, self.role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_k_release_k_leaves_no_entry() {
        let registry = ConnectionRegistry::new();
        let first = registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap();

        let leases: Vec<Lease> = (0..4)
            .map(|_| registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap())
            .collect();
        assert_eq!(registry.ref_count("tcp://127.0.0.1:0", Role::Publisher), 5);
        assert_eq!(registry.len(), 1);

        drop(leases);
        assert_eq!(registry.ref_count("tcp://127.0.0.1:0", Role::Publisher), 1);
        drop(first);
        assert_eq!(registry.ref_count("tcp://127.0.0.1:0", Role::Publisher), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reuse_shares_the_same_socket() {
        let registry = ConnectionRegistry::new();
        let a = registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap();
        let b = registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap();
        match (a.socket(), b.socket()) {
            (Socket::Publisher(x), Socket::Publisher(y)) => assert!(Arc::ptr_eq(x, y)),
            _ => panic!("expected publisher sockets"),
        }
    }

    #[tokio::test]
    async fn over_release_never_underflows() {
        let registry = ConnectionRegistry::new();
        let lease = registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap();
        drop(lease);

        assert!(!registry.release("tcp://127.0.0.1:0", Role::Publisher));
        assert!(!registry.release("tcp://127.0.0.1:0", Role::Publisher));
        assert_eq!(registry.ref_count("tcp://127.0.0.1:0", Role::Publisher), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failed_bind_creates_no_entry() {
        let registry = ConnectionRegistry::new();
        let lease = registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap();
        let taken = match lease.socket() {
            Socket::Publisher(p) => p.local_endpoint(),
            Socket::Subscriber(_) => unreachable!(),
        };

        let err = registry.acquire(&taken, Role::Publisher).unwrap_err();
        assert!(matches!(err, BusError::Bind { .. }));
        assert_eq!(registry.ref_count(&taken, Role::Publisher), 0);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let registry = ConnectionRegistry::new();
        let err = registry.acquire("ipc:///tmp/bus", Role::Subscriber).unwrap_err();
        assert!(matches!(err, BusError::InvalidEndpoint { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn publisher_registers_port_lock() {
        let registry = ConnectionRegistry::new();
        let lease = registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap();
        let local = match lease.socket() {
            Socket::Publisher(p) => p.local_endpoint(),
            Socket::Subscriber(_) => unreachable!(),
        };

        // Subscribers dialing the same port share the lock.
        let dial = local.replace("127.0.0.1", "localhost");
        assert!(registry.lock_for(&local).is_some());
        assert!(registry.lock_for(&dial).is_some());

        drop(lease);
        assert!(registry.lock_for(&local).is_none());
    }

    #[tokio::test]
    async fn roles_are_tracked_separately() {
        let registry = ConnectionRegistry::new();
        let publisher = registry.acquire("tcp://127.0.0.1:0", Role::Publisher).unwrap();
        let local = match publisher.socket() {
            Socket::Publisher(p) => p.local_endpoint(),
            Socket::Subscriber(_) => unreachable!(),
        };
        let _sub = registry.acquire(&local, Role::Subscriber).unwrap();

        assert_eq!(registry.ref_count(&local, Role::Subscriber), 1);
        assert_eq!(registry.ref_count(&local, Role::Publisher), 0);
        assert_eq!(registry.len(), 2);
    }
}
