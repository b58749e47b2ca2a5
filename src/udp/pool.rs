//! Connection table for servers

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::types::{ConnId, RemoteKey};
use crate::udp::connection::Connection;

/// Highest number of simultaneous connections: every id except 0.
pub const MAX_CONNECTIONS: usize = u16::MAX as usize;

/// Outcome of admitting a connection request
pub(crate) enum Admission {
    /// A new connection was created and registered
    Created(Arc<Connection>),
    /// The remote endpoint already owns this connection
    Existing(Arc<Connection>),
    /// Every connection id is in use
    Full,
    /// The pool has been drained and takes no more connections
    Closed,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<ConnId, Arc<Connection>>,
    by_remote: HashMap<RemoteKey, ConnId>,
    last_id: ConnId,
    closed: bool,
}

impl Tables {
    /// Next id after the last one handed out that is neither 0 nor in use
    fn allocate_id(&mut self) -> Option<ConnId> {
        if self.by_id.len() >= MAX_CONNECTIONS {
            return None;
        }

        let mut candidate = self.last_id;
        loop {
            candidate = candidate.wrapping_add(1);
            if candidate != 0 && !self.by_id.contains_key(&candidate) {
                self.last_id = candidate;
                return Some(candidate);
            }
        }
    }
}

/// Connections indexed by id and by remote endpoint.
///
/// Both indexes sit behind one lock, so every insert and removal updates
/// them together and there is never more than one connection per remote
/// endpoint.
#[derive(Default)]
pub(crate) struct Pool {
    tables: RwLock<Tables>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connection owned by `remote`, or create one with a fresh
    /// id using `create`.
    pub fn admit<F>(&self, remote: SocketAddr, create: F) -> Admission
    where
        F: FnOnce(ConnId) -> Arc<Connection>,
    {
        let key = RemoteKey::from(remote);
        let mut tables = self.tables.write();
        if tables.closed {
            return Admission::Closed;
        }

        if let Some(conn) = tables
            .by_remote
            .get(&key)
            .and_then(|id| tables.by_id.get(id))
        {
            return Admission::Existing(conn.clone());
        }

        let Some(id) = tables.allocate_id() else {
            return Admission::Full;
        };

        let conn = create(id);
        tables.by_id.insert(id, conn.clone());
        tables.by_remote.insert(key, id);
        Admission::Created(conn)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.tables.read().by_id.get(&id).cloned()
    }

    /// Remove `conn` from both indexes.
    ///
    /// Returns `false` if it was already removed. An id that has since been
    /// handed to a newer connection is left alone.
    pub fn remove(&self, conn: &Connection) -> bool {
        let id = conn.id();
        let mut tables = self.tables.write();
        match tables.by_id.get(&id) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), conn) => {}
            _ => return false,
        }

        tables.by_id.remove(&id);
        let key = conn.remote_key();
        if tables.by_remote.get(&key) == Some(&id) {
            tables.by_remote.remove(&key);
        }
        true
    }

    /// Empty both indexes and refuse later admissions, returning every
    /// connection that was registered
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut tables = self.tables.write();
        tables.closed = true;
        tables.by_remote.clear();
        tables.by_id.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<_> = self.tables.read().by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    fn set_last_id(&self, id: ConnId) {
        self.tables.write().last_id = id;
    }
}
