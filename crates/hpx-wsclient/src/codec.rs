//! # codec
//!
//! Byte-level encoding and decoding of WebSocket frames according to RFC 6455.
//!
//! The codec is the **lowest layer** of the client:
//! - **Header parsing**: FIN, RSV1-3, [`OpCode`], mask bit and the 7/16/64-bit payload length
//! - **Masking/unmasking**: XOR with the 4-byte key, cycled modulo 4
//! - **Resumable decoding**: a short buffer reports how many more bytes are needed
//!
//! It does not assemble fragments, inflate payloads or validate UTF-8; see
//! [`Reassembler`], [`compression`] and [`Validator`].
//!
//! Two entry points are provided. [`decode_frame`] and [`encode_frame`] are plain
//! functions over byte slices; [`Decoder`] and [`Encoder`] wrap the same logic as
//! [`tokio_util::codec`] types so that a transport can be driven through
//! [`FramedRead`](tokio_util::codec::FramedRead).
//!
//! [`OpCode`]: crate::frame::OpCode
//! [`Reassembler`]: crate::reassembler::Reassembler
//! [`compression`]: crate::compression
//! [`Validator`]: crate::validator::Validator

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    Result, WebSocketError,
    frame::{Frame, MAX_HEAD_SIZE, OpCode},
};

/// The role of the local endpoint.
///
/// A client masks every frame it sends and rejects masked frames from the server.
/// The server role exists so that client frames can be decoded in tests and tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Outcome of [`decode_frame`].
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied in the buffer.
    Frame { frame: Frame, consumed: usize },
    /// The buffer is a valid prefix; at least `needed` more bytes are required.
    Incomplete { needed: usize },
}

#[derive(Debug, Clone, Copy)]
struct Header {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

impl Header {
    fn into_frame(self, mut payload: BytesMut) -> Frame {
        if let Some(mask) = self.mask {
            crate::mask::apply_mask(&mut payload, mask);
        }

        Frame {
            fin: self.fin,
            rsv1: self.rsv1,
            rsv2: self.rsv2,
            rsv3: self.rsv3,
            opcode: self.opcode,
            mask: self.mask,
            payload: payload.freeze(),
        }
    }
}

enum HeaderStatus {
    Complete(Header),
    Incomplete(usize),
}

fn decode_header(src: &[u8], role: Role, max_payload: usize) -> Result<HeaderStatus> {
    if src.len() < 2 {
        return Ok(HeaderStatus::Incomplete(2 - src.len()));
    }

    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
    let masked = src[1] & 0b1000_0000 != 0;

    // servers never mask, clients always do
    if masked != (role == Role::Server) {
        return Err(WebSocketError::InvalidMask);
    }

    let length_code = src[1] & 0x7F;
    let extra = match length_code {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let header_len = 2 + extra + if masked { 4 } else { 0 };

    if src.len() < header_len {
        return Ok(HeaderStatus::Incomplete(header_len - src.len()));
    }

    let payload_len = match extra {
        0 => u64::from(length_code),
        2 => u64::from(u16::from_be_bytes([src[2], src[3]])),
        _ => {
            let mut len = [0u8; 8];
            len.copy_from_slice(&src[2..10]);
            u64::from_be_bytes(len)
        }
    };

    if payload_len & (1 << 63) != 0 {
        return Err(WebSocketError::InvalidLength);
    }

    let payload_len = usize::try_from(payload_len).map_err(|_| WebSocketError::FrameTooLarge)?;
    if payload_len > max_payload || payload_len > usize::MAX - header_len {
        return Err(WebSocketError::FrameTooLarge);
    }

    let mask = masked.then(|| {
        let mut key = [0u8; 4];
        key.copy_from_slice(&src[2 + extra..header_len]);
        key
    });

    Ok(HeaderStatus::Complete(Header {
        fin: src[0] & 0b1000_0000 != 0,
        rsv1: src[0] & 0b0100_0000 != 0,
        rsv2: src[0] & 0b0010_0000 != 0,
        rsv3: src[0] & 0b0001_0000 != 0,
        opcode,
        mask,
        header_len,
        payload_len,
    }))
}

/// Decodes one frame from the start of `buf`.
///
/// `role` is the role of the local endpoint: a [`Role::Client`] rejects masked frames,
/// a [`Role::Server`] rejects unmasked ones. The returned frame carries its payload
/// unmasked and keeps the mask key it arrived with.
///
/// Structural errors (reserved opcode, wrong masking, a 64-bit length with the most
/// significant bit set) are reported as soon as the header bytes are available.
pub fn decode_frame(buf: &[u8], role: Role) -> Result<Decoded> {
    let header = match decode_header(buf, role, usize::MAX)? {
        HeaderStatus::Complete(header) => header,
        HeaderStatus::Incomplete(needed) => return Ok(Decoded::Incomplete { needed }),
    };

    let consumed = header.header_len + header.payload_len;
    if buf.len() < consumed {
        return Ok(Decoded::Incomplete {
            needed: consumed - buf.len(),
        });
    }

    let payload = BytesMut::from(&buf[header.header_len..consumed]);
    Ok(Decoded::Frame {
        frame: header.into_frame(payload),
        consumed,
    })
}

/// Encodes `frame` into `dst`.
///
/// When `masking_required` is set and the frame has no mask key yet, a random one
/// is generated. A frame that already carries a key is always encoded with it, so a
/// decoded frame re-encodes to its original bytes.
pub fn encode_frame(frame: &Frame, masking_required: bool, dst: &mut BytesMut) {
    let mut head = frame.clone();
    if masking_required {
        head.set_random_mask_if_not_set();
    }
    let mask = head.mask;

    dst.reserve(MAX_HEAD_SIZE + frame.payload.len());
    head.write_head(dst);

    let index = dst.len();
    dst.extend_from_slice(&frame.payload);

    if let Some(mask) = mask {
        crate::mask::apply_mask(&mut dst[index..], mask);
    }
}

/// A decoder for WebSocket frames, resumable across partial reads.
pub struct Decoder {
    role: Role,
    /// Header of a frame whose payload has not fully arrived yet.
    state: Option<Header>,
    /// Maximum allowed size for the frame payload.
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for the local `role` rejecting payloads above `max_payload_size`.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes WebSocket frames from a `BytesMut` buffer.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a fully decoded frame.
    /// - `Ok(None)`: more data is needed; the buffer is grown by the missing amount.
    /// - `Err(WebSocketError)`: the header is malformed.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let header = match self.state.take() {
            Some(header) => header,
            None => match decode_header(src, self.role, self.max_payload_size)? {
                HeaderStatus::Complete(header) => {
                    src.advance(header.header_len);
                    header
                }
                HeaderStatus::Incomplete(needed) => {
                    src.reserve(needed);
                    return Ok(None);
                }
            },
        };

        if src.len() < header.payload_len {
            src.reserve(header.payload_len - src.len());
            self.state = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(header.payload_len);
        Ok(Some(header.into_frame(payload)))
    }
}

/// WebSocket frame encoder.
///
/// In the client role every frame is masked with a fresh random key unless it
/// already carries one.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    #[inline]
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame, self.role == Role::Client, dst);
        Ok(())
    }
}
