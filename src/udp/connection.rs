//! Per-peer connection state and the epoch monitor

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::params::Params;
use crate::types::{ConnId, Frame, InternalPack, Pack, RemoteKey, SeqNum};

const NO_RECEIPT: i64 = -1;

/// Lifecycle of a connection once it has been admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Exchanging data
    Active,
    /// Close requested; outstanding data may still be in flight
    Draining,
    /// Terminal: monitor stopped, no longer routable
    Closed,
}

/// Callbacks driven by a connection's epoch monitor
#[async_trait]
pub(crate) trait ConnectionEvents: Send + Sync + 'static {
    /// Fired once per epoch while the connection is open
    async fn on_epoch(&self, conn: &Arc<Connection>);

    /// Fired once when `epoch_limit` consecutive epochs pass without any
    /// datagram from the peer
    async fn on_timeout(&self, conn: &Arc<Connection>);
}

/// Flow-control and delivery state, guarded by one lock per connection
#[derive(Debug, Default)]
struct Slot {
    last_sent_seq: SeqNum,
    pending: Option<InternalPack>,
    last_received_seq: Option<SeqNum>,
    close_requested: bool,
}

/// One LSP connection.
///
/// Owns no socket: the transport feeds it receipts and acknowledgments and
/// asks it for permission to send.
pub struct Connection {
    id: ConnId,
    remote: SocketAddr,
    remote_key: RemoteKey,
    params: Params,
    slot: Mutex<Slot>,

    // Microseconds since `created`, only ever raised by the receive path
    created: Instant,
    last_receipt_us: AtomicI64,

    closed: AtomicBool,
    cancel: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, remote: SocketAddr, params: Params) -> Self {
        Self {
            id,
            remote,
            remote_key: RemoteKey::from(remote),
            params,
            slot: Mutex::new(Slot::default()),
            created: Instant::now(),
            last_receipt_us: AtomicI64::new(NO_RECEIPT),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Create a connection and start its epoch monitor
    pub(crate) fn spawn<E: ConnectionEvents>(
        id: ConnId,
        remote: SocketAddr,
        params: Params,
        events: Arc<E>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self::new(id, remote, params));
        let handle = tokio::spawn(run_monitor(conn.clone(), events));
        *conn.monitor.lock() = Some(handle);
        debug!(conn_id = id, peer = %remote, "Epoch monitor started");
        conn
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn remote_key(&self) -> RemoteKey {
        self.remote_key
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.slot.lock().close_requested {
            ConnectionState::Draining
        } else {
            ConnectionState::Active
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_close_requested(&self) -> bool {
        self.slot.lock().close_requested
    }

    /// Whether a sent DATA message is still waiting for its ACK
    pub fn has_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Sequence number of the outstanding DATA message, if any
    pub fn pending_seq(&self) -> Option<SeqNum> {
        self.slot.lock().pending.as_ref().map(InternalPack::seq)
    }

    /// Sequence number of the last DATA message delivered to the application
    pub fn last_received_seq(&self) -> Option<SeqNum> {
        self.slot.lock().last_received_seq
    }

    /// Time elapsed since the last datagram from the peer, if any arrived
    pub fn idle_time(&self) -> Option<Duration> {
        let last = self.last_receipt_us.load(Ordering::Acquire);
        if last == NO_RECEIPT {
            return None;
        }
        let since = self.created.elapsed().as_micros() as i64 - last;
        Some(Duration::from_micros(since.max(0) as u64))
    }

    /// Claim the flow-control slot for `pack`.
    ///
    /// Returns the sequenced pack if the slot was free, `None` if a previous
    /// message is still unacknowledged or the connection is closed.
    pub fn try_send(&self, pack: &Pack) -> Option<InternalPack> {
        if self.is_closed() {
            return None;
        }

        let mut slot = self.slot.lock();
        if slot.pending.is_some() {
            return None;
        }

        let seq = next_seq(slot.last_sent_seq);
        slot.last_sent_seq = seq;
        let sequenced = InternalPack::new(pack.clone(), seq, self.remote);
        slot.pending = Some(sequenced.clone());
        trace!(conn_id = self.id, seq, "Flow-control slot taken");
        Some(sequenced)
    }

    /// Record an ACK from the peer.
    ///
    /// Returns `true` if it freed the flow-control slot. ACKs for other
    /// sequence numbers only count as liveness.
    pub fn acknowledge(&self, seq: SeqNum) -> bool {
        self.note_receipt();

        let mut slot = self.slot.lock();
        match &slot.pending {
            Some(pending) if pending.seq() == seq => {
                slot.pending = None;
                trace!(conn_id = self.id, seq, "Flow-control slot freed");
                true
            }
            _ => false,
        }
    }

    /// Record that a datagram arrived from the peer
    pub fn note_receipt(&self) {
        let now = self.created.elapsed().as_micros() as i64;
        self.last_receipt_us.fetch_max(now, Ordering::AcqRel);
    }

    /// Record that DATA `seq` arrived and was delivered
    pub fn note_receipt_seq(&self, seq: SeqNum) {
        self.slot.lock().last_received_seq = Some(seq);
        self.note_receipt();
    }

    /// The frame to retransmit on an epoch tick: the outstanding DATA, else
    /// the ACK of the last delivered DATA, else `ACK(id, 0)`.
    pub fn epoch_frame(&self) -> Frame {
        let slot = self.slot.lock();
        if let Some(pending) = &slot.pending {
            return pending.to_frame();
        }
        Frame::ack(self.id, slot.last_received_seq.unwrap_or(0))
    }

    /// Close the connection.
    ///
    /// A hard close stops the monitor immediately and makes the connection
    /// terminal. A soft close only marks it as draining; the monitor keeps
    /// running until a hard close follows.
    pub fn close(&self, hard: bool) {
        if hard {
            if !self.closed.swap(true, Ordering::AcqRel) {
                self.cancel.cancel();
                info!(conn_id = self.id, peer = %self.remote, "Connection closed");
            }
        } else {
            self.request_close();
        }
    }

    /// Mark the connection as draining. Returns `false` if a close was
    /// already requested or the connection is closed.
    pub fn request_close(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut slot = self.slot.lock();
        if slot.close_requested {
            return false;
        }
        slot.close_requested = true;
        debug!(conn_id = self.id, "Connection draining");
        true
    }

    /// Resolves once the connection has been hard-closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Hard-close and wait for the monitor task to finish
    pub(crate) async fn shutdown(&self) {
        self.close(true);
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Monotonic marker that changes whenever a datagram is received
    fn receipt_marker(&self) -> i64 {
        self.last_receipt_us.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_last_sent_seq(&self, seq: SeqNum) {
        self.slot.lock().last_sent_seq = seq;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Next data sequence number after `seq`; 0 is never produced.
pub(crate) fn next_seq(seq: SeqNum) -> SeqNum {
    match seq.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

async fn run_monitor<E: ConnectionEvents>(conn: Arc<Connection>, events: Arc<E>) {
    let epoch = conn.params.epoch_interval;
    let limit = conn.params.epoch_limit;

    let mut ticker = tokio::time::interval_at(Instant::now() + epoch, epoch);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut remaining = limit;
    let mut seen = conn.receipt_marker();

    loop {
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        events.on_epoch(&conn).await;

        let marker = conn.receipt_marker();
        if marker != seen {
            seen = marker;
            remaining = limit;
        } else {
            remaining = remaining.saturating_sub(1);
        }

        if remaining == 0 {
            if !conn.is_closed() {
                info!(
                    conn_id = conn.id,
                    peer = %conn.remote,
                    epochs = limit,
                    "Connection timed out"
                );
                events.on_timeout(&conn).await;
            }
            break;
        }
    }

    trace!(conn_id = conn.id, "Epoch monitor stopped");
}
