//! Raw UDP peer used to drive LSP endpoints datagram by datagram

#![allow(dead_code)]

use bytes::Bytes;
use lsp::{decode_frame, encode_frame, Frame, MsgType};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(2);

pub struct RawPeer {
    socket: UdpSocket,
}

impl RawPeer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, frame: Frame, to: SocketAddr) {
        let buf = encode_frame(&frame).unwrap();
        self.socket.send_to(&buf, to).await.unwrap();
    }

    pub async fn send_raw(&self, bytes: &[u8], to: SocketAddr) {
        self.socket.send_to(bytes, to).await.unwrap();
    }

    /// Next decodable datagram within `limit`
    pub async fn recv_within(&self, limit: Duration) -> Option<(Frame, SocketAddr)> {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = timeout(limit, self.socket.recv_from(&mut buf))
                .await
                .ok()?
                .unwrap();
            if let Some(frame) = decode_frame(Bytes::copy_from_slice(&buf[..len])) {
                return Some((frame, from));
            }
        }
    }

    pub async fn recv(&self) -> Frame {
        self.recv_from().await.0
    }

    pub async fn recv_from(&self) -> (Frame, SocketAddr) {
        self.recv_within(WAIT)
            .await
            .expect("no datagram within the wait limit")
    }

    /// Next DATA frame, skipping ACKs
    pub async fn recv_data(&self) -> Frame {
        loop {
            let frame = self.recv().await;
            if frame.typ == MsgType::Data {
                return frame;
            }
        }
    }

    /// Every datagram that arrives during `window`
    pub async fn collect(&self, window: Duration) -> Vec<Frame> {
        let deadline = tokio::time::Instant::now() + window;
        let mut frames = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return frames;
            }
            match self.recv_within(left).await {
                Some((frame, _)) => frames.push(frame),
                None => return frames,
            }
        }
    }

    /// Handshake with an LSP server, returning the assigned id
    pub async fn connect(&self, server: SocketAddr) -> u16 {
        self.send(Frame::connect(), server).await;
        let ack = self.recv().await;
        assert_eq!(ack.typ, MsgType::Ack);
        assert_eq!(ack.seq, 0);
        assert_ne!(ack.conn_id, 0);
        ack.conn_id
    }
}

pub fn random_payload(max: usize) -> Vec<u8> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(1..=max);
    (0..len).map(|_| rng.gen()).collect()
}

/// Poll `check` until it holds or `WAIT` passes
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
