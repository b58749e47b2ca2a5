//! Frame encoding and decoding for the LSP wire format
//!
//! ```text
//! byte 0-1: msgType   (0=CONNECT, 1=DATA, 2=ACK)
//! byte 2-3: connId
//! byte 4-5: seqNum
//! byte 6..: payload (DATA only)
//! ```
//!
//! All header fields are big-endian.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Frame, LspError, MsgType, Result, HEADER_LEN, MAX_DATAGRAM_SIZE, MAX_PAYLOAD};

/// Encode a frame into a new buffer
pub fn encode_frame(frame: &Frame) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(frame.wire_len());
    encode_into(frame, &mut buf)?;
    Ok(buf)
}

/// Append the encoded frame to `buf`.
///
/// Fails with [`LspError::PayloadTooLarge`] without touching `buf` if the
/// payload does not fit in one datagram.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(LspError::PayloadTooLarge {
            size: frame.payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    buf.reserve(frame.wire_len());
    buf.put_u16(frame.typ.to_u16());
    buf.put_u16(frame.conn_id);
    buf.put_u16(frame.seq);
    buf.extend_from_slice(&frame.payload);
    Ok(())
}

/// Decode one datagram.
///
/// Returns `None` for anything that is not a valid LSP datagram: fewer than
/// [`HEADER_LEN`] bytes, an unknown message type, or more than
/// [`MAX_DATAGRAM_SIZE`] bytes. The payload shares the datagram's buffer.
pub fn decode_frame(datagram: Bytes) -> Option<Frame> {
    if datagram.len() < HEADER_LEN || datagram.len() > MAX_DATAGRAM_SIZE {
        return None;
    }

    let typ = MsgType::from_u16(BigEndian::read_u16(&datagram[0..2]))?;
    let conn_id = BigEndian::read_u16(&datagram[2..4]);
    let seq = BigEndian::read_u16(&datagram[4..6]);

    Some(Frame {
        typ,
        conn_id,
        seq,
        payload: datagram.slice(HEADER_LEN..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_layout() {
        let frame = Frame::data(0x0102, 0x0304, Bytes::from_static(b"hello"));
        let encoded = encode_frame(&frame).unwrap();

        assert_eq!(&encoded[..HEADER_LEN], &[0x00, 0x01, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&encoded[HEADER_LEN..], b"hello");
        assert_eq!(decode_frame(encoded.freeze()), Some(frame));
    }

    #[test]
    fn connect_and_ack_have_no_payload() {
        let connect = encode_frame(&Frame::connect()).unwrap();
        assert_eq!(&connect[..], &[0, 0, 0, 0, 0, 0]);

        let ack = encode_frame(&Frame::ack(7, 0)).unwrap();
        assert_eq!(&ack[..], &[0, 2, 0, 7, 0, 0]);
    }

    #[test]
    fn short_datagram_is_discarded() {
        for len in 0..HEADER_LEN {
            assert_eq!(decode_frame(Bytes::from(vec![0u8; len])), None);
        }
        assert!(decode_frame(Bytes::from(vec![0u8; HEADER_LEN])).is_some());
    }

    #[test]
    fn unknown_type_is_discarded() {
        assert_eq!(decode_frame(Bytes::from_static(&[0, 9, 0, 1, 0, 1])), None);
    }

    #[test]
    fn oversized_datagram_is_discarded() {
        let mut raw = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        raw[1] = 1;
        assert_eq!(decode_frame(Bytes::from(raw)), None);
    }

    #[test]
    fn payload_limit_on_encode() {
        let fits = Frame::data(1, 1, Bytes::from(vec![7u8; MAX_PAYLOAD]));
        assert_eq!(encode_frame(&fits).unwrap().len(), MAX_DATAGRAM_SIZE);

        let too_big = Frame::data(1, 1, Bytes::from(vec![7u8; MAX_PAYLOAD + 1]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_into(&too_big, &mut buf),
            Err(LspError::PayloadTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }
}
