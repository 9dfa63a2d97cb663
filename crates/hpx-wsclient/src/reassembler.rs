//! Reassembly of fragmented data frames into [`Message`]s.
//!
//! A message starts with a `Text` or `Binary` frame and continues with
//! `Continuation` frames until one has FIN set. Control frames may arrive between
//! fragments; they are handled by the caller and never reach the reassembler.
//!
//! RSV1 is taken from the first frame only: compression applies to the whole
//! message, which is inflated after reassembly. Uncompressed text is UTF-8 checked
//! per fragment when a [`Utf8Validator`] is configured, so an invalid sequence in a
//! middle fragment fails before the rest of the message arrives.

use bytes::{Bytes, BytesMut};

use crate::{
    Result, WebSocketError,
    frame::{Frame, OpCode},
    message::{Message, MessageKind},
    validator::Utf8Validator,
};

struct Partial {
    kind: MessageKind,
    compressed: bool,
    buffer: BytesMut,
}

/// Combines data frames into messages.
pub struct Reassembler {
    partial: Option<Partial>,
    utf8: Option<Utf8Validator>,
    max_message_size: usize,
}

impl Reassembler {
    /// `utf8` enables fail-fast validation of uncompressed text; see
    /// [`Validator::utf8`](crate::validator::Validator::utf8).
    pub fn new(utf8: Option<Utf8Validator>, max_message_size: usize) -> Self {
        Self {
            partial: None,
            utf8,
            max_message_size,
        }
    }

    /// Returns `true` while a fragmented message is being assembled.
    pub fn is_assembling(&self) -> bool {
        self.partial.is_some()
    }

    /// Feeds one data frame, returning the message it completes, if any.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidFragment`] for a `Text`/`Binary` frame in the middle of a message
    /// - [`WebSocketError::InvalidContinuationFrame`] for a `Continuation` frame with nothing to continue
    /// - [`WebSocketError::InvalidUTF8`] as soon as uncompressed text is known to be invalid
    /// - [`WebSocketError::MessageTooLarge`] when the message outgrows the configured limit
    pub fn feed(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode() {
            OpCode::Text | OpCode::Binary => self.start(frame),
            OpCode::Continuation => self.continue_with(frame),
            // control frames are processed by the connection
            OpCode::Close | OpCode::Ping | OpCode::Pong => Ok(None),
        }
    }

    fn start(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.partial.is_some() {
            return Err(WebSocketError::InvalidFragment);
        }

        let kind = if frame.opcode() == OpCode::Text {
            MessageKind::Text
        } else {
            MessageKind::Binary
        };
        let compressed = frame.rsv1();
        let fin = frame.is_fin();
        let payload = frame.into_payload();

        self.check_size(0, payload.len())?;
        self.check_utf8(kind, compressed, &payload, fin)?;

        if fin {
            return Ok(Some(Message::new(kind, payload, compressed)));
        }

        let mut buffer = BytesMut::with_capacity(payload.len() * 2);
        buffer.extend_from_slice(&payload);
        self.partial = Some(Partial {
            kind,
            compressed,
            buffer,
        });

        Ok(None)
    }

    fn continue_with(&mut self, frame: Frame) -> Result<Option<Message>> {
        let Some(partial) = self.partial.as_ref() else {
            return Err(WebSocketError::InvalidContinuationFrame);
        };
        let (kind, compressed, len) = (partial.kind, partial.compressed, partial.buffer.len());
        let fin = frame.is_fin();

        if let Err(err) = self
            .check_size(len, frame.payload().len())
            .and_then(|_| self.check_utf8(kind, compressed, frame.payload(), fin))
        {
            self.partial = None;
            return Err(err);
        }

        let Some(mut partial) = self.partial.take() else {
            return Err(WebSocketError::InvalidContinuationFrame);
        };
        partial.buffer.extend_from_slice(frame.payload());

        if fin {
            let payload: Bytes = partial.buffer.freeze();
            return Ok(Some(Message::new(kind, payload, compressed)));
        }

        self.partial = Some(partial);
        Ok(None)
    }

    fn check_size(&self, current: usize, additional: usize) -> Result<()> {
        if current.saturating_add(additional) > self.max_message_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        Ok(())
    }

    fn check_utf8(
        &mut self,
        kind: MessageKind,
        compressed: bool,
        chunk: &[u8],
        fin: bool,
    ) -> Result<()> {
        if kind != MessageKind::Text || compressed {
            return Ok(());
        }

        if let Some(utf8) = self.utf8.as_mut() {
            let result = utf8.feed(chunk).and_then(|_| {
                if fin { utf8.finish() } else { Ok(()) }
            });
            if result.is_err() {
                // drop any carried-over bytes so the validator can be reused
                let _ = utf8.finish();
            }
            result?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> Reassembler {
        Reassembler::new(Some(Utf8Validator::default()), 1 << 20)
    }

    fn lenient() -> Reassembler {
        Reassembler::new(None, 1 << 20)
    }

    #[test]
    fn test_single_frame_message() {
        let mut reassembler = strict();
        let message = reassembler.feed(Frame::text("hello")).unwrap().unwrap();
        assert_eq!(message, Message::text("hello"));
        assert!(!reassembler.is_assembling());
    }

    #[test]
    fn test_one_byte_fragments_match_single_frame() {
        let payload = "fragmented 😀 text";
        let bytes = payload.as_bytes();

        let mut reassembler = strict();
        let mut delivered = Vec::new();
        for (i, byte) in bytes.iter().enumerate() {
            let fin = i == bytes.len() - 1;
            let frame = if i == 0 {
                Frame::text(vec![*byte]).with_fin(fin)
            } else {
                Frame::continuation(vec![*byte]).with_fin(fin)
            };
            if let Some(message) = reassembler.feed(frame).unwrap() {
                delivered.push(message);
            }
        }

        let single = strict().feed(Frame::text(payload)).unwrap().unwrap();
        assert_eq!(delivered, vec![single]);
    }

    #[test]
    fn test_interleaved_control_frames_do_not_disturb() {
        let mut reassembler = lenient();
        assert!(reassembler.feed(Frame::binary("ab").with_fin(false)).unwrap().is_none());
        assert!(reassembler.feed(Frame::ping("p")).unwrap().is_none());
        assert!(reassembler.is_assembling());
        assert!(reassembler.feed(Frame::continuation("cd").with_fin(false)).unwrap().is_none());
        assert!(reassembler.feed(Frame::pong("")).unwrap().is_none());
        let message = reassembler.feed(Frame::continuation("ef")).unwrap().unwrap();
        assert_eq!(message, Message::binary("abcdef"));
    }

    #[test]
    fn test_data_frame_mid_sequence_is_protocol_error() {
        let mut reassembler = lenient();
        reassembler.feed(Frame::text("a").with_fin(false)).unwrap();
        let err = reassembler.feed(Frame::text("b")).unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidFragment));
        assert_eq!(err.close_code(), Some(crate::close::CloseCode::Protocol));
    }

    #[test]
    fn test_orphan_continuation() {
        let mut reassembler = lenient();
        assert!(matches!(
            reassembler.feed(Frame::continuation("x")),
            Err(WebSocketError::InvalidContinuationFrame)
        ));
    }

    #[test]
    fn test_rsv1_taken_from_first_frame() {
        let mut reassembler = strict();
        reassembler
            .feed(Frame::text(vec![0xff]).with_rsv1(true).with_fin(false))
            .unwrap();
        let message = reassembler.feed(Frame::continuation(vec![0xfe])).unwrap().unwrap();
        assert!(message.is_compressed());
        assert_eq!(message.payload().as_ref(), &[0xff, 0xfe]);
    }

    #[test]
    fn test_invalid_utf8_in_final_fragment_fails_at_that_fragment() {
        let fragments = [
            Frame::text("κόσμε").with_fin(false),
            Frame::continuation(" ok ").with_fin(false),
            Frame::continuation(vec![0xed, 0xa0, 0x80]),
        ];

        let mut reassembler = strict();
        assert!(reassembler.feed(fragments[0].clone()).unwrap().is_none());
        assert!(reassembler.feed(fragments[1].clone()).unwrap().is_none());
        assert!(matches!(
            reassembler.feed(fragments[2].clone()),
            Err(WebSocketError::InvalidUTF8)
        ));
        assert!(!reassembler.is_assembling());

        let mut reassembler = lenient();
        let mut delivered = None;
        for frame in fragments {
            delivered = reassembler.feed(frame).unwrap();
        }
        assert!(delivered.is_some());
    }

    #[test]
    fn test_invalid_utf8_fails_before_fin() {
        let mut reassembler = strict();
        reassembler.feed(Frame::text("ok").with_fin(false)).unwrap();
        assert!(matches!(
            reassembler.feed(Frame::continuation(vec![0xc0, 0x80]).with_fin(false)),
            Err(WebSocketError::InvalidUTF8)
        ));
    }

    #[test]
    fn test_code_point_split_across_fragments() {
        let bytes = "€".as_bytes();
        let mut reassembler = strict();
        reassembler.feed(Frame::text(bytes[..1].to_vec()).with_fin(false)).unwrap();
        reassembler
            .feed(Frame::continuation(bytes[1..2].to_vec()).with_fin(false))
            .unwrap();
        let message = reassembler
            .feed(Frame::continuation(bytes[2..].to_vec()))
            .unwrap()
            .unwrap();
        assert_eq!(message.as_text(), Some("€"));
    }

    #[test]
    fn test_message_size_limit() {
        let mut reassembler = Reassembler::new(None, 4);
        reassembler.feed(Frame::binary("abc").with_fin(false)).unwrap();
        assert!(matches!(
            reassembler.feed(Frame::continuation("de")),
            Err(WebSocketError::MessageTooLarge)
        ));
        assert!(matches!(
            Reassembler::new(None, 4).feed(Frame::binary("abcde")),
            Err(WebSocketError::MessageTooLarge)
        ));
    }
}
