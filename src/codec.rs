//! Datagram codec for use with `tokio_util::udp::UdpFramed`

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::frame::{decode_frame, encode_into};
use crate::types::{Frame, LspError};

/// Codec mapping one UDP datagram to one [`Frame`].
///
/// `UdpFramed` hands the decoder exactly one datagram per read, so the
/// decoder always consumes the whole buffer. Datagrams that do not decode are
/// dropped here and never reach the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct LspCodec;

impl LspCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for LspCodec {
    type Item = Frame;
    type Error = LspError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        // Copy out so the frame does not pin the framed reader's buffer
        let len = src.len();
        let frame = decode_frame(Bytes::copy_from_slice(&src[..]));
        src.clear();
        if frame.is_none() {
            trace!(len, "Discarding malformed datagram");
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for LspCodec {
    type Error = LspError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, dst)
    }
}

impl Encoder<&Frame> for LspCodec {
    type Error = LspError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(item, dst)
    }
}
