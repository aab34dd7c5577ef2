//! Connection registry and per-key session state.
//!
//! The registry is the single shared resource of the relay: it owns the
//! forward map (pairing key -> session) and the reverse index
//! (connection -> key + role), and keeps them consistent under every
//! mutation. Callers hold it behind one mutex; all methods are synchronous
//! and never block on I/O. Everything sent to a peer goes through the
//! `Tx` handles stored here; the transport owns the sockets themselves.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use usbshare_proto::device::DeviceEntry;
use warp::ws::Message;

pub type Tx = mpsc::UnboundedSender<Message>;

/// Opaque per-connection identifier handed out at accept time.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Uniform outcome for registry-touching operations. The message loop
/// decides from the variant whether to answer the sender or just log.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No session holds this pairing key. Answered to the sender; the
    /// connection stays open so the caller can retry.
    #[error("invalid connection key")]
    UnknownKey,

    /// The connection already holds a role in some session.
    #[error("connection is already registered")]
    AlreadyRegistered,

    /// The sender resolves to no session at all.
    #[error("connection belongs to no session")]
    NotInSession,

    /// The message type is reserved for the other role.
    #[error("operation requires the {0:?} role")]
    RoleMismatch(Role),
}

impl RegistryError {
    /// Whether the sender gets an explicit `error` reply. Everything else
    /// is logged and dropped without an answer.
    pub fn replies_to_sender(&self) -> bool {
        matches!(self, RegistryError::UnknownKey)
    }
}

/// Transport-level facts about one live connection.
struct ConnEntry {
    tx: Tx,
    /// Stable identifier handed to the device access provider, kept here
    /// so the liveness sweeper can release forwarding without the
    /// connection's own task.
    client_id: String,
    last_seen: Instant,
    /// Reverse-index entry; `None` while unregistered.
    binding: Option<(String, Role)>,
}

/// State for one pairing key. Exists exactly as long as a host is bound.
struct Session {
    host: ConnId,
    clients: HashSet<ConnId>,
    /// Most recent catalog report, replaced wholesale on every update.
    catalog: Vec<DeviceEntry>,
    /// Device ids currently marked shared; always a subset of the catalog
    /// (stale ids are pruned when a new catalog arrives).
    shared: HashSet<String>,
}

/// Handles of a session displaced by a new host registration.
pub struct DisplacedSession {
    pub host_tx: Option<Tx>,
    pub client_txs: Vec<Tx>,
}

/// What a successful unregister dissolved.
pub enum Unbound {
    /// The connection was the host: the whole session went with it.
    Host { key: String, client_txs: Vec<Tx> },
    /// The connection was a client: only its membership was removed.
    Client { key: String },
}

#[derive(Default)]
pub struct Registry {
    connections: HashMap<ConnId, ConnEntry>,
    sessions: HashMap<String, Session>,
}

impl Registry {
    /// Track a freshly accepted connection (no role yet).
    pub fn attach(&mut self, id: ConnId, tx: Tx, client_id: String) {
        self.connections.insert(
            id,
            ConnEntry {
                tx,
                client_id,
                last_seen: Instant::now(),
                binding: None,
            },
        );
    }

    /// Record liveness for a connection.
    pub fn touch(&mut self, id: ConnId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    /// O(1) reverse lookup: which session and role does this connection hold?
    pub fn resolve(&self, id: ConnId) -> Option<(String, Role)> {
        self.connections.get(&id)?.binding.clone()
    }

    /// Bind `id` as host of `key`, displacing any prior host. The displaced
    /// session's handles are returned so the caller can close the old host
    /// and notify its clients; none of its state carries over.
    pub fn register_host(
        &mut self,
        id: ConnId,
        key: &str,
    ) -> Result<Option<DisplacedSession>, RegistryError> {
        match self.connections.get(&id) {
            Some(entry) if entry.binding.is_none() => {}
            Some(_) => return Err(RegistryError::AlreadyRegistered),
            None => return Err(RegistryError::NotInSession),
        }

        let displaced = self.sessions.remove(key).map(|old| {
            let host_tx = self.connections.get(&old.host).map(|e| e.tx.clone());
            let mut client_txs = Vec::new();
            if let Some(entry) = self.connections.get_mut(&old.host) {
                entry.binding = None;
            }
            for client in &old.clients {
                if let Some(entry) = self.connections.get_mut(client) {
                    entry.binding = None;
                    client_txs.push(entry.tx.clone());
                }
            }
            DisplacedSession { host_tx, client_txs }
        });

        self.sessions.insert(
            key.to_string(),
            Session {
                host: id,
                clients: HashSet::new(),
                catalog: Vec::new(),
                shared: HashSet::new(),
            },
        );
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.binding = Some((key.to_string(), Role::Host));
        }
        Ok(displaced)
    }

    /// Add `id` to the session holding `key`. Fails without mutating
    /// anything when no host is registered under that key. Returns the
    /// current catalog for the join reply.
    pub fn register_client(
        &mut self,
        id: ConnId,
        key: &str,
    ) -> Result<Vec<DeviceEntry>, RegistryError> {
        match self.connections.get(&id) {
            Some(entry) if entry.binding.is_none() => {}
            Some(_) => return Err(RegistryError::AlreadyRegistered),
            None => return Err(RegistryError::NotInSession),
        }
        let session = self
            .sessions
            .get_mut(key)
            .ok_or(RegistryError::UnknownKey)?;
        session.clients.insert(id);
        let catalog = session.catalog.clone();
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.binding = Some((key.to_string(), Role::Client));
        }
        Ok(catalog)
    }

    /// Drop whatever binding `id` holds. Idempotent; safe on connections
    /// that never registered.
    pub fn unregister(&mut self, id: ConnId) -> Option<Unbound> {
        let (key, role) = self.connections.get_mut(&id)?.binding.take()?;
        match role {
            Role::Host => {
                let mut client_txs = Vec::new();
                if let Some(session) = self.sessions.remove(&key) {
                    for client in &session.clients {
                        if let Some(entry) = self.connections.get_mut(client) {
                            entry.binding = None;
                            client_txs.push(entry.tx.clone());
                        }
                    }
                }
                Some(Unbound::Host { key, client_txs })
            }
            Role::Client => {
                if let Some(session) = self.sessions.get_mut(&key) {
                    session.clients.remove(&id);
                }
                Some(Unbound::Client { key })
            }
        }
    }

    /// Remove the connection entirely: unregister plus forget the entry.
    pub fn detach(&mut self, id: ConnId) -> Option<Unbound> {
        let unbound = self.unregister(id);
        self.connections.remove(&id);
        unbound
    }

    pub fn session_exists(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn host_tx(&self, key: &str) -> Option<Tx> {
        let session = self.sessions.get(key)?;
        self.connections.get(&session.host).map(|e| e.tx.clone())
    }

    pub fn client_txs(&self, key: &str) -> Vec<Tx> {
        let Some(session) = self.sessions.get(key) else {
            return Vec::new();
        };
        session
            .clients
            .iter()
            .filter_map(|id| self.connections.get(id).map(|e| e.tx.clone()))
            .collect()
    }

    /// Replace the catalog wholesale. Shared ids that vanished from the
    /// report are pruned so the shared set stays a subset of the catalog.
    /// Returns the clients to broadcast the new list to.
    pub fn replace_catalog(&mut self, key: &str, devices: Vec<DeviceEntry>) -> Vec<Tx> {
        if let Some(session) = self.sessions.get_mut(key) {
            session
                .shared
                .retain(|id| devices.iter().any(|d| &d.id == id));
            session.catalog = devices;
        }
        self.client_txs(key)
    }

    /// Mark a device shared. Repeat calls keep the set unchanged but the
    /// caller still notifies (each call is answered with a notification).
    pub fn share_device(&mut self, key: &str, device_id: &str) -> Vec<Tx> {
        if let Some(session) = self.sessions.get_mut(key) {
            session.shared.insert(device_id.to_string());
        }
        self.client_txs(key)
    }

    /// Withdraw a shared device. `None` when the id was not shared, in
    /// which case nothing is broadcast.
    pub fn unshare_device(&mut self, key: &str, device_id: &str) -> Option<Vec<Tx>> {
        let session = self.sessions.get_mut(key)?;
        if !session.shared.remove(device_id) {
            return None;
        }
        Some(self.client_txs(key))
    }

    /// Connections silent for longer than `timeout`. The sweeper gets the
    /// `Tx` to queue a close frame and the client id to release any
    /// forwarding the connection held.
    pub fn stale_connections(&self, timeout: Duration) -> Vec<(ConnId, Tx, String)> {
        let now = Instant::now();
        self.connections
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) > timeout)
            .map(|(id, e)| (*id, e.tx.clone(), e.client_id.clone()))
            .collect()
    }

    #[cfg(test)]
    fn shared_set(&self, key: &str) -> Option<&HashSet<String>> {
        self.sessions.get(key).map(|s| &s.shared)
    }

    #[cfg(test)]
    fn catalog(&self, key: &str) -> Option<&Vec<DeviceEntry>> {
        self.sessions.get(key).map(|s| &s.catalog)
    }
}
