//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! A decoded [`Frame`] always holds its payload unmasked; the mask key is kept
//! alongside so the frame can be re-encoded byte for byte.
//!
//! ```rust
//! use hpx_wsclient::{CloseCode, Frame, OpCode};
//!
//! let first = Frame::text("Hello, ").with_fin(false);
//! let last = Frame::continuation("World!");
//! let close = Frame::close(CloseCode::Normal, "bye");
//!
//! assert_eq!(first.opcode(), OpCode::Text);
//! assert!(last.is_fin());
//! assert_eq!(close.close_code(), Some(CloseCode::Normal));
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::{WebSocketError, close::CloseCode};

/// Largest possible frame header: 2 bytes + 8 bytes length + 4 bytes mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket operation code.
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that start a message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A single WebSocket frame.
///
/// Control frames must have `fin` set and at most 125 bytes of payload; `rsv1` is
/// only legal on the first frame of a compressed message. These rules are checked
/// by the [`Validator`](crate::validator::Validator), not at construction, so that
/// malformed frames can be represented and tested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub(crate) fin: bool,
    pub(crate) rsv1: bool,
    pub(crate) rsv2: bool,
    pub(crate) rsv3: bool,
    pub(crate) opcode: OpCode,
    pub(crate) mask: Option<[u8; 4]>,
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Low-level constructor for a frame with no reserved bits set.
    pub fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a final continuation frame.
    ///
    /// ```rust
    /// use hpx_wsclient::Frame;
    ///
    /// let first = Frame::text("Hel").with_fin(false);
    /// let middle = Frame::continuation("l").with_fin(false);
    /// let last = Frame::continuation("o");
    /// # let _ = (first, middle, last);
    /// ```
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame with a status code and reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code.into());
        payload.put_slice(reason);
        Self::close_raw(payload.freeze())
    }

    /// Creates a close frame with an arbitrary payload.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Marks the frame as the first fragment of a compressed message.
    pub fn with_rsv1(mut self, rsv1: bool) -> Self {
        self.rsv1 = rsv1;
        self
    }

    /// Sets RSV2 and RSV3. No extension defines them; peers must reject such frames.
    pub fn with_reserved(mut self, rsv2: bool, rsv3: bool) -> Self {
        self.rsv2 = rsv2;
        self.rsv3 = rsv3;
        self
    }

    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    #[inline(always)]
    pub fn is_fin(&self) -> bool {
        self.fin
    }

    #[inline(always)]
    pub fn rsv1(&self) -> bool {
        self.rsv1
    }

    #[inline(always)]
    pub fn rsv2(&self) -> bool {
        self.rsv2
    }

    #[inline(always)]
    pub fn rsv3(&self) -> bool {
        self.rsv3
    }

    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline(always)]
    pub fn mask(&self) -> Option<[u8; 4]> {
        self.mask
    }

    #[inline(always)]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Length of the payload as carried in the header.
    #[inline(always)]
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// The unmasked payload.
    #[inline(always)]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Extracts the close code from a Close frame's payload.
    ///
    /// Returns `None` if the payload is shorter than two bytes.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Sets a random mask if none is set yet.
    #[inline]
    pub(crate) fn set_random_mask_if_not_set(&mut self) {
        if self.mask.is_none() {
            self.mask = Some(rand::random());
        }
    }

    /// Writes the frame header into `dst`.
    #[inline]
    pub(crate) fn write_head(&self, dst: &mut BytesMut) {
        let first_byte = (self.fin as u8) << 7
            | (self.rsv1 as u8) << 6
            | (self.rsv2 as u8) << 5
            | (self.rsv3 as u8) << 4
            | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };

        dst.put_u8(first_byte);

        let len = self.payload.len();
        if len < 126 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len <= u16::MAX as usize {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.put_slice(&mask);
        }
    }

    /// Splits the frame into fragments carrying at most `max_size` payload bytes each.
    ///
    /// The first fragment keeps the opcode and RSV1, the rest are continuations.
    pub(crate) fn into_fragments(self, max_size: usize) -> Vec<Frame> {
        if self.payload.len() <= max_size || max_size == 0 {
            return vec![self];
        }

        let mut payload = self.payload;
        let mut fragments = Vec::with_capacity(payload.len().div_ceil(max_size));
        let mut opcode = self.opcode;
        let mut rsv1 = self.rsv1;

        while !payload.is_empty() {
            let chunk = payload.split_to(max_size.min(payload.len()));
            let fin = payload.is_empty() && self.fin;
            fragments.push(Frame::new(fin, opcode, None, chunk).with_rsv1(rsv1));
            opcode = OpCode::Continuation;
            rsv1 = false;
        }

        fragments
    }
}
