//! UDP transport shared by the server and the client
//!
//! An [`LspSocket`] owns one bound UDP socket and two packet queues. A
//! receive task decodes datagrams and hands them to a [`PacketHandler`]; a
//! send task drains the outbound queue through each connection's
//! flow-control slot.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;
use tracing::{debug, info, trace, warn};

use crate::codec::LspCodec;
use crate::types::{ConnId, Frame, InternalPack, LspError, MsgType, Pack, RemoteKey, Result};
use crate::udp::connection::Connection;

/// How often a graceful close re-checks whether a connection has drained
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Protocol hooks invoked by the receive loop.
///
/// The server and the client each supply one implementation; DATA and ACK
/// handling is shared through the provided methods.
#[async_trait]
pub(crate) trait PacketHandler: Send + Sync + 'static {
    /// Transport the handler replies through
    fn socket(&self) -> &LspSocket;

    /// Live connection with this id, regardless of peer address
    fn connection(&self, conn_id: ConnId) -> Option<Arc<Connection>>;

    /// A CONNECT datagram arrived
    async fn on_connect(&self, from: SocketAddr, frame: Frame);

    /// An ACK arrived that matches no connection. The client uses this to
    /// complete its handshake.
    async fn on_unmatched_ack(&self, from: SocketAddr, frame: Frame) {
        trace!(peer = %from, conn_id = frame.conn_id, "ACK for unknown connection");
    }

    /// Connection `conn_id`, but only if it is bound to `from`
    fn lookup(&self, from: SocketAddr, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.connection(conn_id)
            .filter(|conn| conn.remote_key() == RemoteKey::from(from) && !conn.is_closed())
    }

    /// A DATA datagram arrived.
    ///
    /// Every DATA is delivered and acknowledged, retransmissions included.
    /// When the inbound queue is full the datagram only counts as liveness,
    /// so the peer's next epoch retransmission tries again.
    async fn on_data(&self, from: SocketAddr, frame: Frame) {
        let Some(conn) = self.lookup(from, frame.conn_id) else {
            debug!(peer = %from, conn_id = frame.conn_id, "DATA for unknown connection");
            return;
        };

        conn.note_receipt();
        if frame.seq == 0 {
            debug!(conn_id = frame.conn_id, "DATA with reserved sequence number");
            return;
        }

        let socket = self.socket();
        if !socket.deliver(Pack::new(frame.conn_id, frame.payload)) {
            debug!(conn_id = frame.conn_id, seq = frame.seq, "Inbound queue full, DATA not acknowledged");
            return;
        }
        conn.note_receipt_seq(frame.seq);

        if let Err(e) = socket.send_frame(&Frame::ack(frame.conn_id, frame.seq), from).await {
            warn!(peer = %from, error = %e, "Failed to send ACK");
        }
    }

    /// An ACK datagram arrived
    async fn on_ack(&self, from: SocketAddr, frame: Frame) {
        match self.lookup(from, frame.conn_id) {
            Some(conn) => {
                if conn.acknowledge(frame.seq) {
                    self.socket().wake_sender();
                }
            }
            None => self.on_unmatched_ack(from, frame).await,
        }
    }
}

/// Capacity-limited outbound queue
struct Outbox {
    queue: Mutex<VecDeque<Pack>>,
    capacity: usize,
    ready: Notify,
}

impl Outbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
        }
    }

    fn push(&self, pack: Pack) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(LspError::QueueFull);
            }
            queue.push_back(pack);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Take the first queued pack whose connection has a free slot.
    ///
    /// Packs for busy connections stay where they are, so each connection's
    /// packs leave in the order they were written. Packs for connections
    /// that no longer exist are dropped.
    fn next_ready<F>(&self, resolve: F) -> Option<InternalPack>
    where
        F: Fn(ConnId) -> Option<Arc<Connection>>,
    {
        let mut queue = self.queue.lock();
        let mut i = 0;
        while i < queue.len() {
            let conn_id = queue[i].conn_id();
            match resolve(conn_id) {
                Some(conn) if !conn.is_closed() => {
                    if let Some(sequenced) = conn.try_send(&queue[i]) {
                        queue.remove(i);
                        return Some(sequenced);
                    }
                    i += 1;
                }
                _ => {
                    trace!(conn_id, "Dropping queued pack for closed connection");
                    queue.remove(i);
                }
            }
        }
        None
    }

    fn count(&self, conn_id: ConnId) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|pack| pack.conn_id() == conn_id)
            .count()
    }

    fn discard(&self, conn_id: ConnId) {
        self.queue.lock().retain(|pack| pack.conn_id() != conn_id);
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }
}

struct Writer {
    codec: LspCodec,
    buf: BytesMut,
}

/// LSP transport over one UDP socket
pub struct LspSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    // The single send-side lock; the receive half belongs to the receive task
    writer: tokio::sync::Mutex<Writer>,
    inbox_tx: mpsc::Sender<Pack>,
    inbox_rx: tokio::sync::Mutex<mpsc::Receiver<Pack>>,
    outbox: Outbox,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LspSocket {
    /// Bind a UDP socket with inbound and outbound queues of `capacity` packets
    pub async fn bind<A: ToSocketAddrs>(addr: A, capacity: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity);

        info!(addr = %local_addr, "LSP socket bound");

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            writer: tokio::sync::Mutex::new(Writer {
                codec: LspCodec::new(),
                buf: BytesMut::with_capacity(crate::types::MAX_DATAGRAM_SIZE),
            }),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
            outbox: Outbox::new(capacity),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the receive and send tasks
    pub(crate) fn start<H: PacketHandler>(self: &Arc<Self>, handler: Arc<H>) {
        let recv = tokio::spawn(self.clone().recv_loop(handler.clone()));
        let send = tokio::spawn(self.clone().send_loop(handler));
        self.tasks.lock().extend([recv, send]);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Wait for the next delivered data pack, in arrival order.
    ///
    /// Fails with [`LspError::NotActive`] once the socket is shut down,
    /// including for callers already waiting.
    pub async fn receive(&self) -> Result<Pack> {
        let mut inbox = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(LspError::NotActive),
            inbox = self.inbox_rx.lock() => inbox,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LspError::NotActive),
            pack = inbox.recv() => pack.ok_or(LspError::NotActive),
        }
    }

    /// Queue a pack for transmission.
    ///
    /// Fails with [`LspError::QueueFull`] instead of waiting when the
    /// outbound queue is at capacity.
    pub fn send(&self, pack: Pack) -> Result<()> {
        if !self.is_active() {
            return Err(LspError::NotActive);
        }
        pack.check_size()?;
        self.outbox.push(pack)
    }

    /// Number of packs for `conn_id` still waiting in the outbound queue
    pub fn backlog(&self, conn_id: ConnId) -> usize {
        self.outbox.count(conn_id)
    }

    /// Drop every queued pack for `conn_id`
    pub(crate) fn discard(&self, conn_id: ConnId) {
        self.outbox.discard(conn_id);
    }

    /// Hand a received pack to the application side. Returns `false` if the
    /// inbound queue is full.
    pub(crate) fn deliver(&self, pack: Pack) -> bool {
        self.inbox_tx.try_send(pack).is_ok()
    }

    /// Wait until `conn` has no DATA in flight and nothing queued, or until
    /// it or the socket is closed
    pub(crate) async fn drained(&self, conn: &Connection) {
        loop {
            if conn.is_closed() || (!conn.has_pending() && self.backlog(conn.id()) == 0) {
                return;
            }
            tokio::select! {
                _ = conn.closed() => return,
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }
    }

    /// Wake the send task, e.g. after a flow-control slot was freed
    pub(crate) fn wake_sender(&self) {
        self.outbox.ready.notify_one();
    }

    /// Encode and transmit one frame
    pub async fn send_frame(&self, frame: &Frame, to: SocketAddr) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Writer { codec, buf } = &mut *writer;
        buf.clear();
        codec.encode(frame, buf)?;
        self.socket.send_to(&buf[..], to).await?;
        trace!(
            peer = %to,
            typ = %frame.typ,
            conn_id = frame.conn_id,
            seq = frame.seq,
            len = frame.payload.len(),
            "Sent datagram"
        );
        Ok(())
    }

    /// Stop both tasks and fail every pending or future `receive`
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.outbox.clear();
        info!(addr = %self.local_addr, "LSP socket shut down");
    }

    /// Wait until the receive and send tasks have exited
    pub async fn join(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;
    }

    async fn recv_loop<H: PacketHandler>(self: Arc<Self>, handler: Arc<H>) {
        let mut framed = UdpFramed::new(self.socket.clone(), LspCodec::new());

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = framed.next() => next,
            };

            match next {
                Some(Ok((frame, from))) => {
                    trace!(
                        peer = %from,
                        typ = %frame.typ,
                        conn_id = frame.conn_id,
                        seq = frame.seq,
                        "Received datagram"
                    );
                    match frame.typ {
                        MsgType::Connect => handler.on_connect(from, frame).await,
                        MsgType::Data => handler.on_data(from, frame).await,
                        MsgType::Ack => handler.on_ack(from, frame).await,
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "UDP receive failed");
                }
                None => break,
            }
        }

        debug!(addr = %self.local_addr, "Receive loop stopped");
    }

    async fn send_loop<H: PacketHandler>(self: Arc<Self>, handler: Arc<H>) {
        loop {
            match self.outbox.next_ready(|conn_id| handler.connection(conn_id)) {
                Some(sequenced) => {
                    if let Err(e) = self
                        .send_frame(&sequenced.to_frame(), sequenced.remote())
                        .await
                    {
                        // The epoch monitor retransmits from the slot
                        warn!(
                            conn_id = sequenced.conn_id(),
                            seq = sequenced.seq(),
                            error = %e,
                            "Failed to send DATA"
                        );
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.outbox.ready.notified() => {}
                    }
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }
        }

        debug!(addr = %self.local_addr, "Send loop stopped");
    }
}

impl std::fmt::Debug for LspSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspSocket")
            .field("local_addr", &self.local_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use bytes::Bytes;

    fn addr() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    #[test]
    fn outbox_rejects_when_full() {
        let outbox = Outbox::new(2);
        assert!(outbox.push(Pack::new(1, Bytes::from_static(b"a"))).is_ok());
        assert!(outbox.push(Pack::new(1, Bytes::from_static(b"b"))).is_ok());
        assert!(matches!(
            outbox.push(Pack::new(1, Bytes::from_static(b"c"))),
            Err(LspError::QueueFull)
        ));
        assert_eq!(outbox.count(1), 2);
    }

    #[test]
    fn outbox_skips_busy_connections() {
        let busy = Arc::new(Connection::new(1, addr(), Params::default()));
        let idle = Arc::new(Connection::new(2, addr(), Params::default()));
        busy.try_send(&Pack::new(1, Bytes::from_static(b"in flight"))).unwrap();

        let outbox = Outbox::new(8);
        outbox.push(Pack::new(1, Bytes::from_static(b"waits"))).unwrap();
        outbox.push(Pack::new(2, Bytes::from_static(b"goes"))).unwrap();
        outbox.push(Pack::new(2, Bytes::from_static(b"after"))).unwrap();

        let resolve = |id: ConnId| match id {
            1 => Some(busy.clone()),
            2 => Some(idle.clone()),
            _ => None,
        };

        let first = outbox.next_ready(resolve).unwrap();
        assert_eq!(first.conn_id(), 2);
        assert_eq!(&first.payload()[..], b"goes");

        // Both connections now have a pack in flight
        assert!(outbox.next_ready(resolve).is_none());
        assert_eq!(outbox.count(1), 1);
        assert_eq!(outbox.count(2), 1);

        busy.acknowledge(1);
        let second = outbox.next_ready(resolve).unwrap();
        assert_eq!(second.conn_id(), 1);
        assert_eq!(second.seq(), 2);
        assert_eq!(&second.payload()[..], b"waits");
    }

    #[test]
    fn outbox_drops_packs_for_missing_connections() {
        let outbox = Outbox::new(4);
        outbox.push(Pack::new(9, Bytes::from_static(b"orphan"))).unwrap();

        assert!(outbox.next_ready(|_| None).is_none());
        assert_eq!(outbox.count(9), 0);
    }

    #[tokio::test]
    async fn receive_fails_after_shutdown() {
        let socket = Arc::new(LspSocket::bind("127.0.0.1:0", 4).await.unwrap());

        let waiter = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.receive().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        socket.shutdown();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(LspError::NotActive)));
        assert!(matches!(
            socket.send(Pack::new(1, Bytes::from_static(b"x"))),
            Err(LspError::NotActive)
        ));
    }

    #[tokio::test]
    async fn delivered_packs_are_received_in_order() {
        let socket = LspSocket::bind("127.0.0.1:0", 2).await.unwrap();
        assert!(socket.deliver(Pack::new(1, Bytes::from_static(b"one"))));
        assert!(socket.deliver(Pack::new(2, Bytes::from_static(b"two"))));
        assert!(!socket.deliver(Pack::new(1, Bytes::from_static(b"three"))));

        assert_eq!(&socket.receive().await.unwrap().payload()[..], b"one");
        assert_eq!(socket.receive().await.unwrap().conn_id(), 2);
    }

    struct SingleConnection {
        socket: Arc<LspSocket>,
        conn: Arc<Connection>,
        connects: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl PacketHandler for SingleConnection {
        fn socket(&self) -> &LspSocket {
            &self.socket
        }

        fn connection(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
            (conn_id == self.conn.id()).then(|| self.conn.clone())
        }

        async fn on_connect(&self, _from: SocketAddr, _frame: Frame) {
            self.connects
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn receive_loop_dispatches_datagrams() {
        use crate::frame::{decode_frame, encode_frame};

        let socket = Arc::new(LspSocket::bind("127.0.0.1:0", 8).await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let handler = Arc::new(SingleConnection {
            socket: socket.clone(),
            conn: Arc::new(Connection::new(3, peer.local_addr().unwrap(), Params::default())),
            connects: Default::default(),
        });
        socket.start(handler.clone());

        let to = socket.local_addr();
        let data = encode_frame(&Frame::data(3, 1, Bytes::from_static(b"a"))).unwrap();
        peer.send_to(&encode_frame(&Frame::connect()).unwrap(), to).await.unwrap();
        peer.send_to(&[0, 1, 0], to).await.unwrap();
        peer.send_to(&data, to).await.unwrap();
        // Retransmission after a lost ACK
        peer.send_to(&data, to).await.unwrap();

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            let pack = tokio::time::timeout(Duration::from_secs(2), socket.receive())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pack, Pack::new(3, Bytes::from_static(b"a")));

            let (len, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let ack = decode_frame(Bytes::copy_from_slice(&buf[..len])).unwrap();
            assert_eq!(ack, Frame::ack(3, 1));
        }
        assert_eq!(handler.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(handler.conn.last_received_seq(), Some(1));

        socket.shutdown();
        socket.join().await;
    }
}
