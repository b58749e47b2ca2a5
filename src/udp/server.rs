//! LSP server: accepts any number of clients on one UDP socket

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::ToSocketAddrs;
use tracing::{debug, info, warn};

use crate::params::Params;
use crate::types::{ConnId, Frame, LspError, Pack, Result};
use crate::udp::connection::{Connection, ConnectionEvents, ConnectionState};
use crate::udp::pool::{Admission, Pool};
use crate::udp::socket::{LspSocket, PacketHandler};

/// LSP Server
///
/// ```no_run
/// use lsp::{Params, Server};
///
/// # async fn run() -> lsp::Result<()> {
/// let server = Server::open(9000, Params::default()).await?;
/// loop {
///     let pack = server.read().await?;
///     server.write(pack)?;
/// }
/// # }
/// ```
pub struct Server {
    core: Arc<ServerCore>,
}

struct ServerCore {
    this: Weak<ServerCore>,
    socket: Arc<LspSocket>,
    pool: Pool,
    params: Params,
    active: AtomicBool,
}

impl Server {
    /// Listen on `port` on every IPv4 interface
    pub async fn open(port: u16, params: Params) -> Result<Self> {
        Self::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), params).await
    }

    /// Listen on a specific address
    pub async fn bind<A: ToSocketAddrs>(addr: A, params: Params) -> Result<Self> {
        params.validate()?;
        let socket = Arc::new(LspSocket::bind(addr, params.queue_capacity).await?);

        let core = Arc::new_cyclic(|this| ServerCore {
            this: this.clone(),
            socket: socket.clone(),
            pool: Pool::new(),
            params,
            active: AtomicBool::new(true),
        });
        socket.start(core.clone());

        info!(addr = %socket.local_addr(), ?params, "LSP server listening");
        Ok(Self { core })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.core.socket.local_addr()
    }

    pub fn params(&self) -> &Params {
        &self.core.params
    }

    pub fn is_active(&self) -> bool {
        self.core.active.load(Ordering::Acquire)
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.core.pool.len()
    }

    /// Ids of the live connections, ascending
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.core.pool.ids()
    }

    /// State of connection `id`, if it is still in the pool
    pub fn connection_state(&self, id: ConnId) -> Option<ConnectionState> {
        self.core.pool.get(id).map(|conn| conn.state())
    }

    /// Wait for the next data message from any client
    pub async fn read(&self) -> Result<Pack> {
        if !self.is_active() {
            return Err(LspError::NotActive);
        }
        self.core.socket.receive().await
    }

    /// Queue a data message for the client that owns `pack.conn_id()`.
    ///
    /// Never waits: a full outbound queue fails with
    /// [`LspError::QueueFull`].
    pub fn write(&self, pack: Pack) -> Result<()> {
        if !self.is_active() {
            return Err(LspError::NotActive);
        }

        let id = pack.conn_id();
        match self.core.pool.get(id) {
            Some(conn) if conn.state() == ConnectionState::Active => self.core.socket.send(pack),
            _ => Err(LspError::ClosedConnection(id)),
        }
    }

    /// Close connection `id` once its queued and in-flight data has been
    /// acknowledged, or once the peer times out.
    pub async fn close_connection(&self, id: ConnId) -> Result<()> {
        if !self.is_active() {
            return Err(LspError::NotActive);
        }

        let conn = self
            .core
            .pool
            .get(id)
            .ok_or(LspError::ClosedConnection(id))?;
        if !conn.request_close() {
            return Err(LspError::ClosedConnection(id));
        }

        info!(conn_id = id, "Closing connection");
        self.core.socket.drained(&conn).await;
        self.core.release(&conn);
        Ok(())
    }

    /// Hard-close every connection and stop the server.
    ///
    /// Pending `read` calls fail with [`LspError::NotActive`].
    pub async fn close_all(&self) {
        if !self.core.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let conns = self.core.pool.drain();
        info!(connections = conns.len(), "Closing all connections");
        futures::future::join_all(conns.iter().map(|conn| conn.shutdown())).await;

        self.core.socket.shutdown();
        self.core.socket.join().await;
        info!(addr = %self.local_addr(), "LSP server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.core.active.swap(false, Ordering::AcqRel) {
            for conn in self.core.pool.drain() {
                conn.close(true);
            }
            self.core.socket.shutdown();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr())
            .field("active", &self.is_active())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ServerCore {
    /// Drop a connection from the pool and stop it
    fn release(&self, conn: &Connection) {
        self.pool.remove(conn);
        conn.close(true);
        self.socket.discard(conn.id());
    }
}

#[async_trait]
impl PacketHandler for ServerCore {
    fn socket(&self) -> &LspSocket {
        &self.socket
    }

    fn connection(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.pool.get(conn_id)
    }

    async fn on_connect(&self, from: SocketAddr, frame: Frame) {
        if frame.conn_id != 0 || frame.seq != 0 {
            debug!(peer = %from, conn_id = frame.conn_id, seq = frame.seq, "Malformed CONNECT");
            return;
        }
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let Some(events) = self.this.upgrade() else {
            return;
        };

        let params = self.params;
        match self
            .pool
            .admit(from, |id| Connection::spawn(id, from, params, events))
        {
            Admission::Existing(conn) => {
                debug!(peer = %from, conn_id = conn.id(), "Duplicate CONNECT");
                conn.note_receipt();
            }
            Admission::Created(conn) => {
                info!(peer = %from, conn_id = conn.id(), "Connection accepted");
                if let Err(e) = self.socket.send_frame(&Frame::ack(conn.id(), 0), from).await {
                    warn!(peer = %from, error = %e, "Failed to acknowledge CONNECT");
                }
            }
            Admission::Full => {
                warn!(peer = %from, "Connection table full, CONNECT ignored");
            }
            Admission::Closed => {
                debug!(peer = %from, "Server closing, CONNECT ignored");
            }
        }
    }
}

#[async_trait]
impl ConnectionEvents for ServerCore {
    async fn on_epoch(&self, conn: &Arc<Connection>) {
        let frame = conn.epoch_frame();
        if let Err(e) = self.socket.send_frame(&frame, conn.remote()).await {
            warn!(conn_id = conn.id(), error = %e, "Epoch retransmission failed");
        }
    }

    async fn on_timeout(&self, conn: &Arc<Connection>) {
        self.release(conn);
    }
}
