//! # hpx-wsclient
//!
//! WebSocket client engine (RFC 6455) with permessage-deflate compression (RFC 7692)
//! and a strict conformance mode suitable for the Autobahn testsuite.
//!
//! # Features
//! - `rustls-ring` (default): ring crypto provider for `wss://` connections
//! - `rustls-aws-lc-rs`: aws-lc-rs crypto provider for `wss://` connections
//! - `simd`: SIMD-accelerated UTF-8 validation
//!
//! # Layers
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ WebSocketClient (client)                       │
//! │ • state machine, read loop, writer lock        │
//! └────────────────┬───────────────────────────────┘
//!                  │
//! ┌────────────────▼───────────────────────────────┐
//! │ Reassembler / Validator / Compression          │
//! │ • fragments → messages, UTF-8, close codes     │
//! │ • permessage-deflate with context takeover     │
//! └────────────────┬───────────────────────────────┘
//!                  │
//! ┌────────────────▼───────────────────────────────┐
//! │ Codec                                          │
//! │ • frame encoding/decoding, masking             │
//! └────────────────┬───────────────────────────────┘
//!                  │
//!           Network (TCP/TLS)
//! ```
//!
//! # Client Example
//! ```rust,no_run
//! use hpx_wsclient::{HandshakeRequest, Message, Options, WebSocketClient};
//!
//! async fn echo() -> hpx_wsclient::Result<()> {
//!     let options = Options::default()
//!         .with_strict(true)
//!         .with_compression()
//!         .on_message(|client: WebSocketClient, message: Message| async move {
//!             let _ = client.write(message.opcode(), message.into_payload()).await;
//!         });
//!
//!     let request = HandshakeRequest::new("127.0.0.1:9001", "/runCase?case=1&agent=hpx");
//!     let client = WebSocketClient::connect(request, options).await?;
//!     client.start()?;
//!     client.wait().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod close;
pub mod codec;
pub mod compression;
pub mod frame;
pub mod handshake;
#[doc(hidden)]
pub mod mask;
pub mod message;
mod options;
pub mod reassembler;
mod stream;
pub mod validator;

pub use client::{ConnectionState, WebSocketClient};
pub use close::{CloseCode, CloseInfo};
pub use codec::{Decoded, Role, decode_frame, encode_frame};
pub use compression::ExtensionParams;
pub use frame::{Frame, OpCode};
pub use handshake::{HandshakeOutcome, HandshakeRequest, compute_accept, generate_key};
pub use message::{Message, MessageKind};
pub use options::*;
pub use stream::MaybeTlsStream;
use thiserror::Error;

/// Result type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors that can occur during WebSocket operations.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A data frame started a new message while another one was still being assembled.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Continuation frame without initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Payload contains invalid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Invalid frame opcode.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved bits in frame header are set without a negotiated extension.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Control frame is fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// Control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Frame masking does not match the role of the sender.
    #[error("Invalid frame masking")]
    InvalidMask,

    /// 64-bit payload length with the most significant bit set.
    #[error("Invalid payload length")]
    InvalidLength,

    /// Frame payload exceeds configured maximum.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Assembled message exceeds configured maximum.
    #[error("Message too large")]
    MessageTooLarge,

    /// Close frame has invalid format.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// Close frame contains a status code that may not appear on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Close reason exceeds 123 bytes.
    #[error("Close reason too long")]
    CloseReasonTooLong,

    /// Received compressed frame but compression not negotiated.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// Compressed payload could not be inflated.
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// Outgoing payload could not be deflated.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// HTTP status code not valid for WebSocket upgrade.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// Missing or invalid "Upgrade: websocket" header.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// Missing or invalid "Connection: upgrade" header.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// Sec-WebSocket-Accept is missing or does not match the key.
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,

    /// Sec-WebSocket-Extensions could not be accepted.
    #[error("Invalid extension negotiation: {0}")]
    InvalidExtension(String),

    /// HTTP request or response could not be parsed.
    #[error("Malformed HTTP message: {0}")]
    MalformedHttp(String),

    /// Handshake response headers exceed the allowed size.
    #[error("Handshake response too large")]
    HandshakeTooLarge,

    /// No host could be determined for the connection.
    #[error("Missing host")]
    MissingHost,

    /// URL scheme is not ws:// or wss://.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// The connection is not in the `Open` state.
    #[error("Connection is not open")]
    NotOpen,

    /// The read loop was already started.
    #[error("Read loop already started")]
    AlreadyStarted,

    /// Connection has been closed by the transport.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The message handler panicked.
    #[error("Message handler panicked")]
    HandlerPanicked,

    /// Options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(&'static str),

    /// URL parsing error.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Host is not a valid TLS server name.
    #[error(transparent)]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// TLS configuration error.
    #[error(transparent)]
    Tls(#[from] rustls::Error),

    /// I/O error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns `true` if this is a protocol-level error (RFC 6455 violation).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFragment
                | Self::InvalidContinuationFrame
                | Self::InvalidOpCode(_)
                | Self::ReservedBitsNotZero
                | Self::ControlFrameFragmented
                | Self::ControlFrameTooLarge
                | Self::InvalidMask
                | Self::InvalidLength
                | Self::InvalidCloseFrame
                | Self::InvalidCloseCode(_)
                | Self::CompressionNotSupported
                | Self::Decompression(_)
        )
    }

    /// Returns `true` if this is a handshake error.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidStatusCode(_)
                | Self::InvalidUpgradeHeader
                | Self::InvalidConnectionHeader
                | Self::AcceptMismatch
                | Self::InvalidExtension(_)
                | Self::MalformedHttp(_)
                | Self::HandshakeTooLarge
                | Self::MissingHost
                | Self::InvalidHttpScheme
        )
    }

    /// Returns `true` if the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::NotOpen)
    }

    /// Returns `true` if this is a data validation error (invalid UTF-8 or size limit).
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUTF8 | Self::FrameTooLarge | Self::MessageTooLarge
        )
    }

    /// Returns `true` if this wraps an I/O error.
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::IoError(_))
    }

    /// Returns the underlying I/O error, if any.
    pub fn as_io_error(&self) -> Option<&std::io::Error> {
        match self {
            Self::IoError(e) => Some(e),
            _ => None,
        }
    }

    /// The close code sent to the peer when this error terminates an open connection.
    ///
    /// Returns `None` for errors after which no Close frame can be sent, such as
    /// transport failures.
    pub fn close_code(&self) -> Option<CloseCode> {
        if self.is_protocol_error() {
            return Some(CloseCode::Protocol);
        }

        match self {
            Self::InvalidUTF8 => Some(CloseCode::Invalid),
            Self::FrameTooLarge | Self::MessageTooLarge => Some(CloseCode::Size),
            Self::Compression(_) | Self::HandlerPanicked => Some(CloseCode::Error),
            _ => None,
        }
    }
}
