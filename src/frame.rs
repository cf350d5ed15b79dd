use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Serialized size of a [`FrameHeader`] on the wire.
pub const HEADER_LEN: usize = 24;

/// Fixed framing header carried by every request and response.
///
/// All fields are big-endian on the wire, in declaration order. A full framed
/// message is exactly `HEADER_LEN + payload_len` bytes; the payload is opaque
/// to the balancer. Responses carry the request header back with
/// `payload_len = 0`, which lets the client match responses to requests and
/// measure round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Monotonic per client connection, starting at 1.
    pub seq: u32,
    /// Nanoseconds since simulation epoch at send time.
    pub timestamp_ns: i64,
    /// Bytes of opaque payload immediately following the header.
    pub payload_len: u32,
    /// Per-request identifier, used as the key by hash-based policies.
    pub l7_id: u64,
}

impl FrameHeader {
    /// Appends the serialized header to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.seq);
        buf.put_i64(self.timestamp_ns);
        buf.put_u32(self.payload_len);
        buf.put_u64(self.l7_id);
    }

    /// Reads a header from the front of `buf` without consuming it.
    ///
    /// Returns `None` when fewer than [`HEADER_LEN`] bytes are available.
    /// Decoding is total for any 24-byte prefix.
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut b = buf;
        Some(Self {
            seq: b.get_u32(),
            timestamp_ns: b.get_i64(),
            payload_len: b.get_u32(),
            l7_id: b.get_u64(),
        })
    }

    /// Total length of the framed message this header describes.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }

    /// Builds a complete framed message from this header and a payload.
    pub fn to_frame(&self, payload: &[u8]) -> Bytes {
        debug_assert_eq!(payload.len(), self.payload_len as usize);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.write_to(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }
}

/// Per-socket receive buffer that reassembles framed messages out of an
/// ordered byte stream.
///
/// Bytes are appended as they arrive and drained front-to-back one whole
/// message at a time. A partial header or partial payload leaves the buffer
/// untouched until more bytes show up.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Extracts the next complete framed message, or `None` if the buffered
    /// bytes do not yet hold one.
    pub fn next_frame(&mut self) -> Option<(FrameHeader, Bytes)> {
        let header = FrameHeader::peek(&self.buf)?;
        let total = header.frame_len();
        if self.buf.len() < total {
            return None;
        }
        let frame = self.buf.split_to(total).freeze();
        Some((header, frame))
    }
}
