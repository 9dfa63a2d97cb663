//! Client configuration.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio_rustls::TlsConnector;

use crate::{Result, WebSocketError, client::WebSocketClient, frame::Frame, message::Message};

/// Type alias for the compression level used in WebSocket compression settings.
pub type CompressionLevel = flate2::Compression;

/// Handler invoked by the read loop for every complete message.
///
/// The read loop awaits the returned future before reading further frames, so a
/// slow handler applies backpressure to the connection.
pub type MessageHandler = Arc<dyn Fn(WebSocketClient, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Observer invoked for every decoded frame before it is validated.
pub type FrameHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Default maximum payload of a single frame: 64 MiB.
pub const MAX_PAYLOAD_READ: usize = 64 * 1024 * 1024;

/// Default maximum size of an assembled (and inflated) message: 128 MiB.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;

/// Default bound on the close handshake.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration options for a WebSocket client.
///
/// Unset fields take the defaults listed on each field. Options are checked once
/// with [`Options::validate`] when the client is constructed.
///
/// ```rust
/// use std::time::Duration;
///
/// use hpx_wsclient::Options;
///
/// let options = Options::default()
///     .with_strict(true)
///     .with_compression_no_context_takeover()
///     .with_close_timeout(Duration::from_millis(500));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct Options {
    /// Host to dial. Defaults to the `Host` header of the request.
    pub host: Option<String>,

    /// Port to dial. Defaults to the port in the `Host` header, else 443 with TLS and 80 without.
    pub port: Option<u16>,

    /// Wrap the connection in TLS.
    ///
    /// Default: `false`
    pub use_tls: bool,

    /// Strict RFC 6455 conformance: reject invalid UTF-8 and illegal close codes.
    ///
    /// Default: `false`
    pub strict: bool,

    /// permessage-deflate settings; `None` disables compression.
    ///
    /// Default: `None`
    pub compression: Option<DeflateOptions>,

    /// Called with every complete message.
    pub on_message: Option<MessageHandler>,

    /// Called with every decoded frame, including control frames.
    pub on_frame: Option<FrameHandler>,

    /// How long to wait for the peer's part of the close handshake.
    ///
    /// Default: [`CLOSE_TIMEOUT`]
    pub close_timeout: Duration,

    /// Maximum payload of a single incoming frame, in bytes.
    ///
    /// Default: [`MAX_PAYLOAD_READ`]
    pub max_payload_read: usize,

    /// Maximum size of an incoming message after reassembly and decompression, in bytes.
    ///
    /// Default: [`MAX_MESSAGE_SIZE`]
    pub max_message_size: usize,

    /// Split outgoing data messages into fragments of at most this many bytes.
    ///
    /// Default: `None` (no fragmentation)
    pub fragment_size: Option<usize>,

    /// Disable Nagle's algorithm on the TCP socket.
    ///
    /// Default: `false`
    pub no_delay: bool,

    /// TLS connector used instead of one built from the webpki roots.
    pub connector: Option<TlsConnector>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            use_tls: false,
            strict: false,
            compression: None,
            on_message: None,
            on_frame: None,
            close_timeout: CLOSE_TIMEOUT,
            max_payload_read: MAX_PAYLOAD_READ,
            max_message_size: MAX_MESSAGE_SIZE,
            fragment_size: None,
            no_delay: false,
            connector: None,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("strict", &self.strict)
            .field("compression", &self.compression)
            .field("on_message", &self.on_message.is_some())
            .field("on_frame", &self.on_frame.is_some())
            .field("close_timeout", &self.close_timeout)
            .field("max_payload_read", &self.max_payload_read)
            .field("max_message_size", &self.max_message_size)
            .field("fragment_size", &self.fragment_size)
            .field("no_delay", &self.no_delay)
            .finish_non_exhaustive()
    }
}

impl Options {
    pub fn with_host(self, host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..self
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        Self {
            port: Some(port),
            ..self
        }
    }

    pub fn with_tls(self, use_tls: bool) -> Self {
        Self { use_tls, ..self }
    }

    /// Uses a custom TLS connector and enables TLS.
    pub fn with_connector(self, connector: TlsConnector) -> Self {
        Self {
            connector: Some(connector),
            use_tls: true,
            ..self
        }
    }

    pub fn with_strict(self, strict: bool) -> Self {
        Self { strict, ..self }
    }

    /// Offers permessage-deflate with context takeover and the default level.
    pub fn with_compression(self) -> Self {
        Self {
            compression: Some(self.compression.clone().unwrap_or_default()),
            ..self
        }
    }

    /// Offers permessage-deflate and asks both sides to reset their context after
    /// every message.
    pub fn with_compression_no_context_takeover(self) -> Self {
        Self {
            compression: Some(
                self.compression
                    .clone()
                    .unwrap_or_default()
                    .with_no_context_takeover(),
            ),
            ..self
        }
    }

    pub fn with_compression_options(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    pub fn with_close_timeout(self, close_timeout: Duration) -> Self {
        Self {
            close_timeout,
            ..self
        }
    }

    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: size,
            ..self
        }
    }

    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: size,
            ..self
        }
    }

    /// Splits outgoing messages into fragments of at most `size` bytes.
    pub fn with_fragment_size(self, size: usize) -> Self {
        Self {
            fragment_size: Some(size),
            ..self
        }
    }

    pub fn with_no_delay(self) -> Self {
        Self {
            no_delay: true,
            ..self
        }
    }

    /// Sets the message handler.
    ///
    /// ```rust
    /// use hpx_wsclient::{Message, Options, WebSocketClient};
    ///
    /// let options = Options::default().on_message(|_client: WebSocketClient, message: Message| async move {
    ///     println!("{:?}", message.as_text());
    /// });
    /// # let _ = options;
    /// ```
    pub fn on_message<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(WebSocketClient, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |client, message| Box::pin(handler(client, message)));
        Self {
            on_message: Some(handler),
            ..self
        }
    }

    /// Sets the frame observer.
    pub fn on_frame<F>(self, observer: F) -> Self
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        Self {
            on_frame: Some(Arc::new(observer)),
            ..self
        }
    }

    /// Checks the limits and timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.close_timeout.is_zero() {
            return Err(WebSocketError::InvalidOptions("close_timeout must be positive"));
        }
        if self.max_payload_read == 0 {
            return Err(WebSocketError::InvalidOptions("max_payload_read must be positive"));
        }
        if self.max_message_size == 0 {
            return Err(WebSocketError::InvalidOptions("max_message_size must be positive"));
        }
        if self.fragment_size == Some(0) {
            return Err(WebSocketError::InvalidOptions("fragment_size must be positive"));
        }
        if matches!(&self.host, Some(host) if host.is_empty()) {
            return Err(WebSocketError::InvalidOptions("host must not be empty"));
        }
        Ok(())
    }
}

/// permessage-deflate settings.
///
/// # Example
/// ```
/// use hpx_wsclient::{CompressionLevel, DeflateOptions};
///
/// let opts = DeflateOptions {
///     level: CompressionLevel::fast(),
///     client_no_context_takeover: true,
///     ..Default::default()
/// };
/// # let _ = opts;
/// ```
#[derive(Clone, Debug, Default)]
pub struct DeflateOptions {
    /// Compression level (0-9) for outgoing messages.
    pub level: CompressionLevel,

    /// Reset the client's compression context after every message, and say so in
    /// the offer.
    pub client_no_context_takeover: bool,

    /// Ask the server to reset its compression context after every message.
    pub server_no_context_takeover: bool,
}

impl DeflateOptions {
    pub fn with_level(self, level: CompressionLevel) -> Self {
        Self { level, ..self }
    }

    /// Disables context takeover in both directions.
    pub fn with_no_context_takeover(self) -> Self {
        Self {
            client_no_context_takeover: true,
            server_no_context_takeover: true,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(!options.strict);
        assert!(options.compression.is_none());
        assert!(!options.use_tls);
        assert_eq!(options.close_timeout, CLOSE_TIMEOUT);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_compression_builders() {
        let options = Options::default().with_compression();
        let compression = options.compression.clone().unwrap();
        assert!(!compression.client_no_context_takeover);
        assert!(!compression.server_no_context_takeover);

        let options = options.with_compression_no_context_takeover();
        let compression = options.compression.clone().unwrap();
        assert!(compression.client_no_context_takeover);
        assert!(compression.server_no_context_takeover);

        assert!(options.without_compression().compression.is_none());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(
            Options::default()
                .with_close_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(Options::default().with_fragment_size(0).validate().is_err());
        assert!(Options::default().with_max_payload_read(0).validate().is_err());
        assert!(Options::default().with_host("").validate().is_err());
    }

    #[test]
    fn test_debug_hides_handlers() {
        let options = Options::default().on_frame(|_| {});
        let debug = format!("{options:?}");
        assert!(debug.contains("on_frame: true"));
        assert!(debug.contains("on_message: false"));
    }
}
