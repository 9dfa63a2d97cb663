//! Logical messages delivered to and from the application.

use bytes::Bytes;

use crate::frame::OpCode;

/// Kind of a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

impl From<MessageKind> for OpCode {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        }
    }
}

/// One or more frames reassembled into a single payload.
///
/// `compressed` records whether the message arrived with RSV1 set; the payload
/// handed to the application is always the inflated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) payload: Bytes,
    pub(crate) compressed: bool,
}

impl Message {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>, compressed: bool) -> Self {
        Self {
            kind,
            payload: payload.into(),
            compressed,
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Text, payload, false)
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Binary, payload, false)
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The data opcode this message was started with.
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.kind.into()
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// The payload as text, if this is a text message with valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }
}
