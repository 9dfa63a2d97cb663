// This code is sourced primarily from the tungstenite-rs library, which can be found at:
// https://github.com/snapview/tungstenite-rs/blob/42b8797e8b7f39efb7d9322dc8af3e9089db4f7d/src/protocol/frame/coding.rs#L117
//
// Original contributions by:
// Copyright (c) 2017 Alexey Galakhov
// Copyright (c) 2016 Jason Housley
// Licensed under both MIT and Apache 2.0 licenses
//
// Modifications made by:
// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// You may obtain a copy of the License at:
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is provided "AS IS", WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
// either express or implied. See the License for specific language governing permissions and limitations.
//

//! Close status codes and the Close frame payload (RFC 6455 §5.5.1, §7.4).
//!
//! A Close payload is either empty, or a 2-byte big-endian status code followed by
//! an optional UTF-8 reason of at most 123 bytes.

use bytes::{BufMut, Bytes, BytesMut};

use self::CloseCode::*;
use crate::{Result, WebSocketError};

/// Maximum length of a close reason, so that code + reason fits a control frame.
pub const MAX_REASON_LEN: usize = 123;

/// Status codes representing the reasons why an endpoint is closing the WebSocket connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// 1000, the purpose of the connection has been fulfilled.
    Normal,
    /// 1001, the endpoint is going away.
    Away,
    /// 1002, the endpoint received a frame violating the protocol.
    Protocol,
    /// 1003, the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005, no status code was present. Never sent on the wire.
    Status,
    /// 1006, the connection closed without a Close frame. Never sent on the wire.
    Abnormal,
    /// 1007, message data was inconsistent with its type (e.g. invalid UTF-8).
    Invalid,
    /// 1008, generic policy violation.
    Policy,
    /// 1009, message too large to process.
    Size,
    /// 1010, the client expected extensions the server did not negotiate.
    Extension,
    /// 1011, unexpected condition on the server.
    Error,
    /// 1012, service restart.
    Restart,
    /// 1013, try again later.
    Again,
    /// 1015, TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1004, 1014 and 1016-2999, reserved for future revisions of the protocol.
    Reserved(u16),
    /// 3000-3999, registered with IANA.
    Iana(u16),
    /// 4000-4999, private use.
    Library(u16),
    /// Anything else.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if the code may appear in a Close frame received from a peer.
    ///
    /// Legal codes are 1000-1003, 1007-1011 and 3000-4999.
    pub fn is_allowed(self) -> bool {
        matches!(
            u16::from(self),
            1000..=1003 | 1007..=1011 | 3000..=4999
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1015 => Tls,
            1004 | 1014 | 1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            Tls => 1015,
            Reserved(code) | Iana(code) | Library(code) | Bad(code) => code,
        }
    }
}

/// Code and reason carried by a Close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Creates a `CloseInfo`, rejecting reasons longer than 123 bytes.
    pub fn new(code: impl Into<u16>, reason: impl Into<String>) -> Result<Self> {
        let reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            return Err(WebSocketError::CloseReasonTooLong);
        }
        Ok(Self {
            code: code.into(),
            reason,
        })
    }

    /// The code as a [`CloseCode`].
    pub fn close_code(&self) -> CloseCode {
        CloseCode::from(self.code)
    }

    /// Serializes into a Close frame payload.
    pub fn to_payload(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(self.code);
        payload.put_slice(self.reason.as_bytes());
        payload.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011] {
            assert!(CloseCode::from(code).is_allowed(), "{code} should be allowed");
        }
        for code in [3000, 3999, 4000, 4999] {
            assert!(CloseCode::from(code).is_allowed(), "{code} should be allowed");
        }
    }

    #[test]
    fn test_illegal_codes() {
        for code in [
            0, 999, 1004, 1005, 1006, 1012, 1013, 1014, 1015, 1016, 1100, 2000, 2999, 5000, 65535,
        ] {
            assert!(
                !CloseCode::from(code).is_allowed(),
                "{code} should be rejected"
            );
        }
    }

    #[test]
    fn test_round_trip_u16() {
        for code in 0..=u16::MAX {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }

    #[test]
    fn test_close_info_payload() {
        let info = CloseInfo::new(CloseCode::Normal, "bye").unwrap();
        assert_eq!(info.to_payload().as_ref(), b"\x03\xe8bye");
        assert_eq!(info.close_code(), CloseCode::Normal);
    }

    #[test]
    fn test_close_info_reason_limit() {
        assert!(CloseInfo::new(1000u16, "a".repeat(MAX_REASON_LEN)).is_ok());
        assert!(matches!(
            CloseInfo::new(1000u16, "a".repeat(MAX_REASON_LEN + 1)),
            Err(WebSocketError::CloseReasonTooLong)
        ));
    }
}
