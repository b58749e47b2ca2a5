//! LSP client: one connection to one server

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::params::Params;
use crate::types::{ConnId, Frame, LspError, Pack, RemoteKey, Result};
use crate::udp::connection::{Connection, ConnectionEvents, ConnectionState};
use crate::udp::socket::{LspSocket, PacketHandler};

/// LSP Client
///
/// ```no_run
/// use lsp::{Client, Params};
///
/// # async fn run() -> lsp::Result<()> {
/// let client = Client::connect("127.0.0.1", 9000, Params::default()).await?;
/// client.write(&b"ping"[..])?;
/// if let Some(reply) = client.read().await? {
///     println!("{} bytes", reply.len());
/// }
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    core: Arc<ClientCore>,
    // Serializes handshakes so that at most one is in flight
    handshake: tokio::sync::Mutex<()>,
}

/// A CONNECT waiting for its ACK
struct PendingConnect {
    remote: SocketAddr,
    reply: oneshot::Sender<ConnId>,
}

struct ClientCore {
    this: Weak<ClientCore>,
    socket: Arc<LspSocket>,
    params: Params,
    conn: RwLock<Option<Arc<Connection>>>,
    pending: Mutex<Option<PendingConnect>>,
    // Set when the server stopped answering
    lost: AtomicBool,
    // Set by `close`
    closed: AtomicBool,
}

impl Client {
    /// Resolve `host`, bind a local socket and connect.
    ///
    /// Every resolved address is tried in turn; the error from the last one
    /// is returned if none of them answers.
    pub async fn connect(host: &str, port: u16, params: Params) -> Result<Self> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(LspError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {host}:{port}"),
            )));
        }
        Self::connect_any(addrs, params).await
    }

    /// Connect to the first of `addrs` that completes the handshake, binding
    /// a fresh local socket of the matching address family for each attempt
    pub async fn connect_any<I>(addrs: I, params: Params) -> Result<Self>
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        let mut last_err = None;
        for remote in addrs {
            let local = match remote {
                SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
            };
            let attempt = match Self::bind_to(local, params).await {
                Ok(client) => client.connect_to(remote).await.map(|_| client),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(client) => return Ok(client),
                Err(e) => {
                    debug!(peer = %remote, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            LspError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no addresses to connect to",
            ))
        }))
    }

    /// Bind an unconnected client to an ephemeral IPv4 port
    pub async fn bind(params: Params) -> Result<Self> {
        Self::bind_to(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), params).await
    }

    /// Bind an unconnected client to `local`
    pub async fn bind_to(local: SocketAddr, params: Params) -> Result<Self> {
        params.validate()?;
        let socket = Arc::new(LspSocket::bind(local, params.queue_capacity).await?);

        let core = Arc::new_cyclic(|this| ClientCore {
            this: this.clone(),
            socket: socket.clone(),
            params,
            conn: RwLock::new(None),
            pending: Mutex::new(None),
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        socket.start(core.clone());

        Ok(Self {
            core,
            handshake: tokio::sync::Mutex::new(()),
        })
    }

    /// Perform the handshake with the server at `remote`.
    ///
    /// CONNECT is sent once per epoch, up to `epoch_limit` times. A second
    /// call while a handshake is running waits for it, then returns the
    /// same id if it targets the same server.
    pub async fn connect_to(&self, remote: SocketAddr) -> Result<ConnId> {
        let _guard = self.handshake.lock().await;

        if self.core.closed.load(Ordering::Acquire) || !self.core.socket.is_active() {
            return Err(LspError::NotActive);
        }
        if let Some(conn) = self.core.current() {
            if conn.remote_key() == RemoteKey::from(remote) {
                return Ok(conn.id());
            }
            return Err(LspError::AlreadyConnected(conn.remote()));
        }

        let (reply, mut established) = oneshot::channel();
        *self.core.pending.lock() = Some(PendingConnect { remote, reply });

        let attempts = self.core.params.epoch_limit;
        let epoch = self.core.params.epoch_interval;
        for attempt in 1..=attempts {
            if let Err(e) = self.core.socket.send_frame(&Frame::connect(), remote).await {
                self.core.pending.lock().take();
                return Err(e);
            }
            debug!(peer = %remote, attempt, "CONNECT sent");

            match tokio::time::timeout(epoch, &mut established).await {
                Ok(Ok(id)) => return Ok(id),
                Ok(Err(_)) => return Err(LspError::NotActive),
                Err(_) => {}
            }
        }

        self.core.pending.lock().take();
        // The ACK may have landed just as the last epoch ran out
        if let Ok(id) = established.try_recv() {
            return Ok(id);
        }

        warn!(peer = %remote, attempts, "Server did not acknowledge CONNECT");
        Err(LspError::ConnectTimeout { attempts })
    }

    /// Id assigned by the server, once connected
    pub fn conn_id(&self) -> Option<ConnId> {
        self.core.current().map(|conn| conn.id())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.socket.local_addr()
    }

    /// Address of the server, once connected
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.core.current().map(|conn| conn.remote())
    }

    pub fn params(&self) -> &Params {
        &self.core.params
    }

    /// Whether the connection is established and neither lost nor closed
    pub fn is_connected(&self) -> bool {
        self.core
            .current()
            .is_some_and(|conn| conn.state() == ConnectionState::Active)
    }

    /// Wait for the next message from the server.
    ///
    /// Returns `Ok(None)` once the server has stopped answering, and fails
    /// with [`LspError::NotActive`] after [`close`](Self::close).
    pub async fn read(&self) -> Result<Option<Bytes>> {
        if self.core.lost.load(Ordering::Acquire) {
            return Ok(None);
        }
        if self.core.closed.load(Ordering::Acquire) || self.core.current().is_none() {
            return Err(LspError::NotActive);
        }

        match self.core.socket.receive().await {
            Ok(pack) => Ok(Some(pack.into_payload())),
            Err(LspError::NotActive) if self.core.lost.load(Ordering::Acquire) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Queue a message for the server. Never waits: a full outbound queue
    /// fails with [`LspError::QueueFull`].
    pub fn write(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(LspError::NotActive);
        }
        let conn = self.core.current().ok_or(LspError::NotActive)?;
        if conn.state() != ConnectionState::Active {
            return Err(LspError::ClosedConnection(conn.id()));
        }
        self.core.socket.send(Pack::new(conn.id(), payload))
    }

    /// Close the connection after queued and in-flight messages have been
    /// acknowledged, or after the server times out, then release the socket.
    pub async fn close(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Err(LspError::NotActive);
        }

        if let Some(conn) = self.core.current() {
            if conn.request_close() {
                self.core.socket.drained(&conn).await;
            }
            conn.shutdown().await;
        }

        self.core.socket.shutdown();
        self.core.socket.join().await;
        info!(addr = %self.local_addr(), "LSP client closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.core.closed.store(true, Ordering::Release);
        if let Some(conn) = self.core.current() {
            conn.close(true);
        }
        self.core.socket.shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.local_addr())
            .field("connection", &self.core.current())
            .finish()
    }
}

impl ClientCore {
    fn current(&self) -> Option<Arc<Connection>> {
        self.conn.read().clone()
    }

    /// Complete the handshake in flight, if `from` is the server it targets
    fn establish(&self, from: SocketAddr, id: ConnId) {
        let mut pending = self.pending.lock();
        let expected = pending
            .as_ref()
            .is_some_and(|p| RemoteKey::from(p.remote) == RemoteKey::from(from));
        if !expected {
            trace!(peer = %from, conn_id = id, "Handshake ACK from unexpected peer");
            return;
        }
        let Some(waiting) = pending.take() else {
            return;
        };
        let Some(events) = self.this.upgrade() else {
            return;
        };

        let conn = Connection::spawn(id, from, self.params, events);
        conn.note_receipt();
        *self.conn.write() = Some(conn);
        info!(peer = %from, conn_id = id, "Connected");

        // The caller may have given up on this attempt
        let _ = waiting.reply.send(id);
    }
}

#[async_trait]
impl PacketHandler for ClientCore {
    fn socket(&self) -> &LspSocket {
        &self.socket
    }

    fn connection(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.current().filter(|conn| conn.id() == conn_id)
    }

    async fn on_connect(&self, from: SocketAddr, _frame: Frame) {
        debug!(peer = %from, "Client ignores CONNECT");
    }

    async fn on_unmatched_ack(&self, from: SocketAddr, frame: Frame) {
        if frame.conn_id == 0 || frame.seq != 0 || self.current().is_some() {
            trace!(peer = %from, conn_id = frame.conn_id, seq = frame.seq, "Stray ACK");
            return;
        }
        self.establish(from, frame.conn_id);
    }
}

#[async_trait]
impl ConnectionEvents for ClientCore {
    async fn on_epoch(&self, conn: &Arc<Connection>) {
        let frame = conn.epoch_frame();
        if let Err(e) = self.socket.send_frame(&frame, conn.remote()).await {
            warn!(conn_id = conn.id(), error = %e, "Epoch retransmission failed");
        }
    }

    async fn on_timeout(&self, conn: &Arc<Connection>) {
        warn!(conn_id = conn.id(), peer = %conn.remote(), "Connection lost");
        self.lost.store(true, Ordering::Release);
        conn.close(true);
        self.socket.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode_frame, encode_frame};
    use crate::types::MsgType;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    async fn recv(peer: &UdpSocket) -> (Frame, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (len, from) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("no datagram from client")
            .unwrap();
        (decode_frame(Bytes::copy_from_slice(&buf[..len])).unwrap(), from)
    }

    #[tokio::test]
    async fn not_connected_yet() {
        let client = Client::bind(Params::default()).await.unwrap();
        assert_eq!(client.conn_id(), None);
        assert!(!client.is_connected());
        assert!(matches!(client.write(&b"x"[..]), Err(LspError::NotActive)));
        assert!(matches!(client.read().await, Err(LspError::NotActive)));
    }

    #[tokio::test]
    async fn connect_falls_through_to_next_address() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addrs = vec![silent.local_addr().unwrap(), server.local_addr().unwrap()];

        let answer = async {
            let (frame, from) = recv(&server).await;
            assert_eq!(frame.typ, MsgType::Connect);
            let ack = encode_frame(&Frame::ack(9, 0)).unwrap();
            server.send_to(&ack, from).await.unwrap();
        };
        let (client, _) = tokio::join!(
            Client::connect_any(addrs, Params::with_millis(50, 2)),
            answer
        );

        let client = client.unwrap();
        assert_eq!(client.conn_id(), Some(9));
        assert_eq!(client.remote_addr(), Some(server.local_addr().unwrap()));
        // The first address saw every CONNECT attempt
        assert_eq!(recv(&silent).await.0, Frame::connect());
    }

    #[tokio::test]
    async fn connect_any_without_addresses_fails() {
        let result = Client::connect_any(Vec::new(), Params::default()).await;
        assert!(matches!(result, Err(LspError::Io(_))));
    }

    #[tokio::test]
    async fn handshake_ignores_ack_from_other_address() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = Arc::new(Client::bind(Params::with_millis(200, 5)).await.unwrap());

        let connecting = {
            let client = client.clone();
            let addr = server.local_addr().unwrap();
            tokio::spawn(async move { client.connect_to(addr).await })
        };

        let (frame, client_addr) = recv(&server).await;
        assert_eq!(frame.typ, MsgType::Connect);

        let ack = encode_frame(&Frame::ack(9, 0)).unwrap();
        impostor.send_to(&ack, client_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(client.conn_id(), None);

        server.send_to(&ack, client_addr).await.unwrap();
        assert_eq!(connecting.await.unwrap().unwrap(), 9);
        assert_eq!(client.conn_id(), Some(9));
    }

    #[tokio::test]
    async fn second_connect_waits_for_first() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = Arc::new(Client::bind(Params::with_millis(200, 5)).await.unwrap());

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.connect_to(server_addr).await })
        };
        let (_, client_addr) = recv(&server).await;

        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.connect_to(server_addr).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let ack = encode_frame(&Frame::ack(4, 0)).unwrap();
        server.send_to(&ack, client_addr).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap(), 4);
        assert_eq!(second.await.unwrap().unwrap(), 4);

        let elsewhere: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(
            client.connect_to(elsewhere).await,
            Err(LspError::AlreadyConnected(addr)) if addr == server_addr
        ));
    }

    #[tokio::test]
    async fn close_twice_fails() {
        let client = Client::bind(Params::default()).await.unwrap();
        assert!(client.close().await.is_ok());
        assert!(matches!(client.close().await, Err(LspError::NotActive)));
        assert!(matches!(client.read().await, Err(LspError::NotActive)));
    }
}
