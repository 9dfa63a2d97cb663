//! Conformance checks applied to received frames and messages.
//!
//! Structural rules are enforced in every mode:
//! - RSV2/RSV3 must be clear, RSV1 only on the first frame of a compressed data message
//! - control frames must not be fragmented and carry at most 125 bytes
//! - a Close payload must be empty or at least two bytes long
//!
//! Strict mode additionally rejects invalid UTF-8 (text messages and close reasons)
//! and close codes outside 1000-1003, 1007-1011 and 3000-4999. Text is validated
//! fail-fast with [`Utf8Validator`], fragment by fragment.

use crate::{
    Result, WebSocketError,
    close::{CloseCode, CloseInfo},
    frame::{Frame, MAX_CONTROL_PAYLOAD},
};

#[cfg(feature = "simd")]
use simdutf8::compat::from_utf8;
#[cfg(not(feature = "simd"))]
use std::str::from_utf8;

/// Frame and payload validation for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    strict: bool,
    compression: bool,
}

impl Validator {
    /// `compression` tells whether permessage-deflate was negotiated, which makes RSV1 legal.
    pub fn new(strict: bool, compression: bool) -> Self {
        Self {
            strict,
            compression,
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Checks the header-level rules of a single frame.
    pub fn validate_frame(&self, frame: &Frame) -> Result<()> {
        if frame.rsv2() || frame.rsv3() {
            return Err(WebSocketError::ReservedBitsNotZero);
        }

        if frame.rsv1() {
            if !self.compression {
                return Err(WebSocketError::CompressionNotSupported);
            }
            if !frame.opcode().is_data() {
                return Err(WebSocketError::ReservedBitsNotZero);
            }
        }

        if frame.opcode().is_control() {
            if !frame.is_fin() {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if frame.payload().len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        }

        Ok(())
    }

    /// Parses and checks a Close payload.
    ///
    /// Returns `None` for an empty payload. In non-strict mode illegal codes are passed
    /// through and an invalid reason is replaced lossily.
    pub fn validate_close(&self, payload: &[u8]) -> Result<Option<CloseInfo>> {
        match payload.len() {
            0 => return Ok(None),
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {}
        }

        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = &payload[2..];

        if self.strict && !CloseCode::from(code).is_allowed() {
            return Err(WebSocketError::InvalidCloseCode(code));
        }

        let reason = if self.strict {
            from_utf8(reason)
                .map_err(|_| WebSocketError::InvalidUTF8)?
                .to_owned()
        } else {
            String::from_utf8_lossy(reason).into_owned()
        };

        Ok(Some(CloseInfo { code, reason }))
    }

    /// Checks a complete text payload. A no-op unless strict.
    pub fn validate_text(&self, payload: &[u8]) -> Result<()> {
        if self.strict && from_utf8(payload).is_err() {
            return Err(WebSocketError::InvalidUTF8);
        }
        Ok(())
    }

    /// An incremental UTF-8 validator for a fragmented text message, or `None` when
    /// not strict.
    pub fn utf8(&self) -> Option<Utf8Validator> {
        self.strict.then(Utf8Validator::default)
    }
}

/// Incremental UTF-8 validation across fragment boundaries.
///
/// A sequence is rejected as soon as it cannot be the prefix of valid UTF-8; a code
/// point split between fragments is carried over to the next call.
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    partial: [u8; 4],
    partial_len: usize,
}

impl Utf8Validator {
    /// Feeds the next chunk of a text message.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<()> {
        if self.partial_len > 0 {
            let width = utf8_width(self.partial[0]);
            let take = (width - self.partial_len).min(chunk.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&chunk[..take]);
            self.partial_len += take;
            chunk = &chunk[take..];

            match from_utf8(&self.partial[..self.partial_len]) {
                Ok(_) => self.partial_len = 0,
                Err(e) if e.error_len().is_none() && self.partial_len < width => {
                    return Ok(());
                }
                Err(_) => return Err(WebSocketError::InvalidUTF8),
            }
        }

        match from_utf8(chunk) {
            Ok(_) => Ok(()),
            Err(e) => match e.error_len() {
                Some(_) => Err(WebSocketError::InvalidUTF8),
                None => {
                    let tail = &chunk[e.valid_up_to()..];
                    self.partial[..tail.len()].copy_from_slice(tail);
                    self.partial_len = tail.len();
                    Ok(())
                }
            },
        }
    }

    /// Ends the message. Fails if a code point is still incomplete.
    pub fn finish(&mut self) -> Result<()> {
        let incomplete = self.partial_len > 0;
        self.partial_len = 0;
        if incomplete {
            Err(WebSocketError::InvalidUTF8)
        } else {
            Ok(())
        }
    }
}

// leading byte of a sequence already accepted as a valid incomplete prefix
fn utf8_width(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::CloseCode;

    fn strict() -> Validator {
        Validator::new(true, false)
    }

    fn lenient() -> Validator {
        Validator::new(false, false)
    }

    #[test]
    fn test_reserved_bits() {
        let frame = Frame::text("x").with_reserved(true, false);
        assert!(matches!(
            lenient().validate_frame(&frame),
            Err(WebSocketError::ReservedBitsNotZero)
        ));

        let frame = Frame::text("x").with_reserved(false, true);
        assert!(lenient().validate_frame(&frame).is_err());

        let frame = Frame::text("x").with_rsv1(true);
        assert!(matches!(
            lenient().validate_frame(&frame),
            Err(WebSocketError::CompressionNotSupported)
        ));
        assert!(Validator::new(false, true).validate_frame(&frame).is_ok());

        let frame = Frame::ping("").with_rsv1(true);
        assert!(Validator::new(false, true).validate_frame(&frame).is_err());

        let frame = Frame::continuation("").with_rsv1(true);
        assert!(Validator::new(false, true).validate_frame(&frame).is_err());
    }

    #[test]
    fn test_control_frames() {
        assert!(lenient().validate_frame(&Frame::ping(vec![0u8; 125])).is_ok());
        assert!(matches!(
            lenient().validate_frame(&Frame::ping(vec![0u8; 126])),
            Err(WebSocketError::ControlFrameTooLarge)
        ));
        assert!(matches!(
            lenient().validate_frame(&Frame::pong("").with_fin(false)),
            Err(WebSocketError::ControlFrameFragmented)
        ));
        // data frames have no such limit
        assert!(strict().validate_frame(&Frame::binary(vec![0u8; 126])).is_ok());
    }

    #[test]
    fn test_close_payload() {
        assert_eq!(strict().validate_close(&[]).unwrap(), None);
        assert!(matches!(
            lenient().validate_close(&[0x03]),
            Err(WebSocketError::InvalidCloseFrame)
        ));

        let info = strict()
            .validate_close(Frame::close(CloseCode::Normal, "done").payload())
            .unwrap()
            .unwrap();
        assert_eq!(info.code, 1000);
        assert_eq!(info.reason, "done");
    }

    #[test]
    fn test_close_codes_strict() {
        for code in [1000u16, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert!(
                strict().validate_close(&code.to_be_bytes()).is_ok(),
                "{code} should be accepted"
            );
        }
        for code in [0u16, 999, 1004, 1005, 1006, 1012, 1015, 1016, 2999, 5000] {
            let err = strict().validate_close(&code.to_be_bytes()).unwrap_err();
            assert!(matches!(err, WebSocketError::InvalidCloseCode(c) if c == code));
            assert_eq!(err.close_code(), Some(CloseCode::Protocol));
        }
    }

    #[test]
    fn test_close_relaxed_when_not_strict() {
        let info = lenient().validate_close(&1005u16.to_be_bytes()).unwrap().unwrap();
        assert_eq!(info.code, 1005);

        let mut payload = 1000u16.to_be_bytes().to_vec();
        // "κόσμε" followed by an encoded surrogate
        payload.extend_from_slice(&[
            0xce, 0xba, 0xe1, 0xbd, 0xb9, 0xcf, 0x83, 0xce, 0xbc, 0xce, 0xb5, 0xed, 0xa0, 0x80,
        ]);
        assert!(matches!(
            strict().validate_close(&payload),
            Err(WebSocketError::InvalidUTF8)
        ));
        assert!(lenient().validate_close(&payload).is_ok());
    }

    #[test]
    fn test_validate_text() {
        assert!(strict().validate_text("κόσμε".as_bytes()).is_ok());
        assert!(strict().validate_text(&[0xff]).is_err());
        assert!(lenient().validate_text(&[0xff]).is_ok());
        assert!(lenient().utf8().is_none());
        assert!(strict().utf8().is_some());
    }

    #[test]
    fn test_utf8_split_code_point() {
        let text = "κόσμε €𝄞".as_bytes();
        for split in 0..=text.len() {
            let mut utf8 = Utf8Validator::default();
            utf8.feed(&text[..split]).unwrap();
            utf8.feed(&text[split..]).unwrap();
            utf8.finish().unwrap();
        }

        // one byte at a time
        let mut utf8 = Utf8Validator::default();
        for byte in text {
            utf8.feed(std::slice::from_ref(byte)).unwrap();
        }
        utf8.finish().unwrap();
    }

    #[test]
    fn test_utf8_fail_fast() {
        // 0xF4 0x90 starts a code point above U+10FFFF and is rejected immediately
        let mut utf8 = Utf8Validator::default();
        utf8.feed("hello".as_bytes()).unwrap();
        assert!(utf8.feed(&[0xf4, 0x90]).is_err());

        // invalid continuation completing a carried-over prefix
        let mut utf8 = Utf8Validator::default();
        utf8.feed(&[0xe2, 0x82]).unwrap();
        assert!(utf8.feed(&[0x41]).is_err());

        // surrogate half split across calls
        let mut utf8 = Utf8Validator::default();
        utf8.feed(&[0xed]).unwrap();
        assert!(utf8.feed(&[0xa0, 0x80]).is_err());
    }

    #[test]
    fn test_utf8_incomplete_at_finish() {
        let mut utf8 = Utf8Validator::default();
        utf8.feed(&[0xe2, 0x82]).unwrap();
        assert!(utf8.finish().is_err());

        // state resets after finish
        utf8.feed(b"ok").unwrap();
        utf8.finish().unwrap();
    }
}
