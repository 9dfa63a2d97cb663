//! The connection state machine.
//!
//! A [`WebSocketClient`] is a cheap handle to one connection. The read loop, started
//! with [`WebSocketClient::start`], owns the read half of the transport together
//! with the reassembly and inflate state; the write half sits behind an async mutex
//! so that concurrent writers never interleave frames.
//!
//! ```text
//! Handshaking ─► Open ─┬─► ClosingLocal ──┬─► Closed
//!                      └─► ClosingRemote ─┘
//! ```
//!
//! # Message handler
//! Complete messages are passed to [`Options::on_message`]. The read loop awaits
//! the handler before reading the next frame, so a slow handler slows down the
//! connection instead of buffering messages without bound. Calling
//! [`WebSocketClient::wait`] from inside the handler never returns.
//! A handler that panics fails the connection with close code 1011.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Buf, Bytes, BytesMut};
use futures::{FutureExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, watch},
    time::Instant,
};
use tokio_util::codec::FramedRead;
use url::Url;

use crate::{
    Options, Result, WebSocketError,
    close::{CloseCode, CloseInfo},
    codec::{Decoder, Role, encode_frame},
    compression::{Compressor, Decompressor, ExtensionParams},
    frame::{Frame, MAX_CONTROL_PAYLOAD, OpCode},
    handshake::{self, HandshakeRequest},
    message::{Message, MessageKind},
    reassembler::Reassembler,
    stream,
    validator::Validator,
};

tokio::task_local! {
    /// Id of the connection whose read loop runs on the current task.
    static READ_LOOP: u64;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The upgrade request was sent and the response is not yet validated.
    ///
    /// A client is only built once the response was accepted, so handles never
    /// observe this state.
    Handshaking,
    /// Data may flow in both directions.
    Open,
    /// A Close frame was sent, the peer's reply is pending.
    ClosingLocal,
    /// A Close frame was received and echoed.
    ClosingRemote,
    /// The transport is shut down.
    Closed,
}

/// A WebSocket client connection.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct WebSocketClient {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<FrameWriter>,
    shared: StdMutex<Shared>,
    validator: Validator,
    options: Options,
}

#[derive(Default)]
struct Shared {
    /// Taken by the read loop when it starts.
    reader: Option<FrameReader>,
    /// First fatal error, returned by `wait`.
    error: Option<WebSocketError>,
    remote_close: Option<CloseInfo>,
    local_close: Option<CloseInfo>,
}

/// Read side of the connection.
struct FrameReader {
    framed: FramedRead<Box<dyn AsyncRead + Send + Unpin>, Decoder>,
    reassembler: Reassembler,
    decompressor: Option<Decompressor>,
}

impl FrameReader {
    /// Inflates a compressed message and checks its text in strict mode.
    fn inflate(&mut self, message: Message, validator: &Validator) -> Result<Message> {
        if !message.is_compressed() {
            return Ok(message);
        }

        let decompressor = self
            .decompressor
            .as_mut()
            .ok_or(WebSocketError::CompressionNotSupported)?;
        let payload = decompressor.decompress(message.payload())?;

        if message.kind() == MessageKind::Text {
            validator.validate_text(&payload)?;
        }

        Ok(Message::new(message.kind(), payload, true))
    }

    /// Discards frames until the peer closes the transport or `timeout` elapses.
    async fn drain(&mut self, timeout: std::time::Duration) {
        let drained = tokio::time::timeout(timeout, async {
            while let Some(Ok(_)) = self.framed.next().await {}
        })
        .await;

        if drained.is_err() {
            tracing::debug!("peer did not close the transport in time");
        }
    }
}

/// Write side of the connection, guarded by the writer lock.
struct FrameWriter {
    io: Box<dyn AsyncWrite + Send + Unpin>,
    compressor: Option<Compressor>,
    buf: BytesMut,
    fragment_size: Option<usize>,
    close_sent: bool,
}

impl FrameWriter {
    /// Compresses, fragments and writes one data message.
    async fn send_message(&mut self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let frame = match self.compressor.as_mut() {
            Some(compressor) => Frame::new(true, opcode, None, compressor.compress(&payload)?).with_rsv1(true),
            None => Frame::new(true, opcode, None, payload),
        };

        match self.fragment_size {
            Some(size) => {
                for fragment in frame.into_fragments(size) {
                    encode_frame(&fragment, true, &mut self.buf);
                }
            }
            None => encode_frame(&frame, true, &mut self.buf),
        }

        self.flush().await
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        encode_frame(&frame, true, &mut self.buf);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        let written = self.io.write_all(&self.buf).await;
        self.buf.clear();
        written?;
        self.io.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.io.shutdown().await {
            tracing::trace!("shutting down transport: {err}");
        }
    }
}

impl WebSocketClient {
    /// Dials the request's host (or [`Options::host`]/[`Options::port`]) and performs
    /// the opening handshake.
    pub async fn connect(request: HandshakeRequest, options: Options) -> Result<Self> {
        options.validate()?;
        let (host, port) = request.target(&options)?;
        let io = stream::connect(
            &host,
            port,
            options.use_tls,
            options.connector.clone(),
            options.no_delay,
        )
        .await?;

        Self::handshake(io, request, options).await
    }

    /// Connects to a `ws://` or `wss://` URL. TLS is enabled for `wss://`.
    ///
    /// ```rust,no_run
    /// use hpx_wsclient::{Options, WebSocketClient};
    ///
    /// async fn run() -> hpx_wsclient::Result<()> {
    ///     let client = WebSocketClient::connect_url("wss://echo.example.com/", Options::default()).await?;
    ///     client.start()?;
    ///     client.write_text("hello").await?;
    ///     client.stop().await
    /// }
    /// ```
    pub async fn connect_url(url: &str, options: Options) -> Result<Self> {
        let url = Url::parse(url)?;
        let request = HandshakeRequest::from_url(&url)?;
        let options = if url.scheme() == "wss" {
            options.with_tls(true)
        } else {
            options
        };

        Self::connect(request, options).await
    }

    /// Connects using a caller-written upgrade request; see [`HandshakeRequest::from_raw`].
    pub async fn from_raw(raw: &[u8], options: Options) -> Result<Self> {
        Self::connect(HandshakeRequest::from_raw(raw)?, options).await
    }

    /// Performs the opening handshake over an established transport.
    ///
    /// The connection is `Open` on success; call [`start`](Self::start) to begin reading.
    pub async fn handshake<S>(io: S, request: HandshakeRequest, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        options.validate()?;

        let offer = options.compression.as_ref().map(ExtensionParams::from);
        let (mut read_half, mut write_half) = tokio::io::split(io);

        tracing::debug!(path = request.path(), "sending upgrade request");
        write_half.write_all(&request.to_bytes(offer.as_ref())).await?;
        write_half.flush().await?;

        let mut buf = BytesMut::with_capacity(1024);
        let outcome = loop {
            buf.reserve(1024);
            if read_half.read_buf(&mut buf).await? == 0 {
                return Err(WebSocketError::ConnectionClosed);
            }
            if let Some(outcome) = handshake::parse_response(&buf, request.key(), offer.as_ref())? {
                break outcome;
            }
        };
        buf.advance(outcome.consumed);

        let validator = Validator::new(options.strict, outcome.extensions.is_some());
        let (compressor, decompressor) = match (&outcome.extensions, &options.compression) {
            (Some(params), Some(deflate)) => (
                Some(params.compressor(deflate.level, deflate.client_no_context_takeover)),
                Some(params.decompressor(options.max_message_size)),
            ),
            _ => (None, None),
        };

        let mut framed = FramedRead::new(
            Box::new(read_half) as Box<dyn AsyncRead + Send + Unpin>,
            Decoder::new(Role::Client, options.max_payload_read),
        );
        // frames sent right behind the response
        *framed.read_buffer_mut() = buf;

        let reader = FrameReader {
            framed,
            reassembler: Reassembler::new(validator.utf8(), options.max_message_size),
            decompressor,
        };
        let writer = FrameWriter {
            io: Box::new(write_half),
            compressor,
            buf: BytesMut::with_capacity(1024),
            fragment_size: options.fragment_size,
            close_sent: false,
        };

        let (state, _) = watch::channel(ConnectionState::Handshaking);
        let client = Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                state,
                writer: Mutex::new(writer),
                shared: StdMutex::new(Shared {
                    reader: Some(reader),
                    ..Default::default()
                }),
                validator,
                options,
            }),
        };
        client.transition(&[ConnectionState::Handshaking], ConnectionState::Open);

        Ok(client)
    }

    /// Spawns the read loop on the current tokio runtime.
    ///
    /// # Errors
    /// [`WebSocketError::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<()> {
        let reader = self
            .shared()
            .reader
            .take()
            .ok_or(WebSocketError::AlreadyStarted)?;

        let client = self.clone();
        tokio::spawn(READ_LOOP.scope(self.inner.id, async move { client.run(reader).await }));

        Ok(())
    }

    /// Current state of the connection.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The Close frame received from the peer, if any.
    pub fn remote_close(&self) -> Option<CloseInfo> {
        self.shared().remote_close.clone()
    }

    /// The Close frame sent to the peer, if any.
    pub fn local_close(&self) -> Option<CloseInfo> {
        self.shared().local_close.clone()
    }

    /// Sends a text message.
    pub async fn write_text(&self, text: impl Into<Bytes>) -> Result<()> {
        self.write_data(OpCode::Text, text.into()).await
    }

    /// Sends a binary message.
    pub async fn write_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write_data(OpCode::Binary, data.into()).await
    }

    /// Sends a message with an explicit opcode.
    ///
    /// Data opcodes go through compression and fragmentation, control opcodes are
    /// sent as with [`write_control`](Self::write_control).
    pub async fn write(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        match opcode {
            OpCode::Text | OpCode::Binary => self.write_data(opcode, payload.into()).await,
            OpCode::Close | OpCode::Ping | OpCode::Pong => self.write_control(opcode, payload).await,
            OpCode::Continuation => Err(WebSocketError::InvalidOpCode(opcode.into())),
        }
    }

    /// Sends a single control frame.
    ///
    /// A Close frame moves the connection to `ClosingLocal` without waiting for the
    /// reply; use [`close`](Self::close) for the full close handshake.
    pub async fn write_control(&self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if !opcode.is_control() {
            return Err(WebSocketError::InvalidOpCode(opcode.into()));
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        if opcode == OpCode::Close {
            let info = match payload.len() {
                0 => None,
                1 => return Err(WebSocketError::InvalidCloseFrame),
                _ => Some(CloseInfo {
                    code: u16::from_be_bytes([payload[0], payload[1]]),
                    reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
                }),
            };
            return self.send_close(Frame::close_raw(payload), info).await;
        }

        let mut writer = self.inner.writer.lock().await;
        self.ensure_open()?;
        let result = writer.send_frame(Frame::new(true, opcode, None, payload)).await;
        self.check_write(&mut writer, result).await
    }

    /// Starts the close handshake and waits for it to finish.
    ///
    /// Waits at most [`Options::close_timeout`] for the peer, then shuts the transport
    /// down. Called from the message handler, only the Close frame is sent and the read
    /// loop completes the handshake.
    pub async fn close(&self, code: impl Into<u16>, reason: &str) -> Result<()> {
        let info = CloseInfo::new(code, reason)?;
        self.send_close(Frame::close_raw(info.to_payload()), Some(info))
            .await?;

        if READ_LOOP.try_with(|id| *id == self.inner.id).unwrap_or(false) {
            return Ok(());
        }

        self.wait_closed().await;
        Ok(())
    }

    /// Closes with code 1000. Does nothing if the connection is already closing.
    pub async fn stop(&self) -> Result<()> {
        match self.close(CloseCode::Normal, "").await {
            Err(WebSocketError::NotOpen) => Ok(()),
            result => result,
        }
    }

    /// Waits until the connection is `Closed`.
    ///
    /// Returns the error that terminated the connection, once; `Ok(())` after a clean
    /// close.
    pub async fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;

        match self.shared().error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- write path ----

    async fn write_data(&self, opcode: OpCode, payload: Bytes) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        self.ensure_open()?;
        let result = writer.send_message(opcode, payload).await;
        self.check_write(&mut writer, result).await
    }

    async fn send_close(&self, frame: Frame, info: Option<CloseInfo>) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        let result = writer.send_frame(frame).await;
        writer.close_sent = true;
        self.shared().local_close = info;
        self.transition(&[ConnectionState::Open], ConnectionState::ClosingLocal);

        self.check_write(&mut writer, result).await
    }

    /// A failed write leaves the transport unusable.
    async fn check_write(&self, writer: &mut FrameWriter, result: Result<()>) -> Result<()> {
        if let Err(err) = &result {
            if err.is_io_error() {
                tracing::warn!("write failed: {err}");
                writer.shutdown().await;
                self.set_closed();
            }
        }
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(WebSocketError::NotOpen);
        }
        Ok(())
    }

    // ---- state ----

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        let id = self.inner.id;
        self.inner.state.send_if_modified(|state| {
            if !from.contains(state) {
                return false;
            }
            tracing::debug!(id, from = ?*state, ?to, "connection state changed");
            *state = to;
            true
        })
    }

    fn set_closed(&self) {
        self.transition(
            &[
                ConnectionState::Handshaking,
                ConnectionState::Open,
                ConnectionState::ClosingLocal,
                ConnectionState::ClosingRemote,
            ],
            ConnectionState::Closed,
        );
    }

    async fn wait_closed(&self) {
        let mut state = self.inner.state.subscribe();
        let timed_out = tokio::time::timeout(self.inner.options.close_timeout, async {
            let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
        })
        .await
        .is_err();

        if timed_out {
            tracing::debug!(id = self.inner.id, "close handshake timed out");
            self.set_closed();
            self.shutdown_writer().await;
        }
    }

    async fn shutdown_writer(&self) {
        let shutdown = tokio::time::timeout(self.inner.options.close_timeout, async {
            self.inner.writer.lock().await.shutdown().await;
        })
        .await;

        if shutdown.is_err() {
            tracing::debug!(id = self.inner.id, "writer is busy, transport left open until last handle drops");
        }
    }

    // ---- read loop ----

    async fn run(self, mut reader: FrameReader) {
        tracing::trace!(id = self.inner.id, "read loop started");

        if let Err(err) = self.read_loop(&mut reader).await {
            self.fail(err, &mut reader).await;
        }

        self.shutdown_writer().await;
        self.set_closed();
        tracing::trace!(id = self.inner.id, "read loop finished");
    }

    async fn read_loop(&self, reader: &mut FrameReader) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let mut deadline = None;

        loop {
            match self.state() {
                ConnectionState::Closed => return Ok(()),
                ConnectionState::ClosingLocal if deadline.is_none() => {
                    deadline = Some(Instant::now() + self.inner.options.close_timeout);
                }
                _ => {}
            }

            let frame = tokio::select! {
                frame = reader.framed.next() => frame,
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                _ = expire(deadline) => {
                    tracing::debug!(id = self.inner.id, "no reply to close frame");
                    return Ok(());
                }
            };

            let frame = match frame {
                Some(frame) => frame?,
                None if self.state() == ConnectionState::Open => {
                    return Err(WebSocketError::ConnectionClosed);
                }
                None => return Ok(()),
            };

            if let Some(on_frame) = &self.inner.options.on_frame {
                on_frame(&frame);
            }
            self.inner.validator.validate_frame(&frame)?;

            match frame.opcode() {
                OpCode::Ping => self.on_ping(frame).await?,
                OpCode::Pong => {}
                OpCode::Close => return self.on_close(frame, reader).await,
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    // nothing is delivered once closing
                    if self.state() != ConnectionState::Open {
                        continue;
                    }

                    let Some(message) = reader.reassembler.feed(frame)? else {
                        continue;
                    };
                    let message = reader.inflate(message, &self.inner.validator)?;

                    if let Some(on_message) = &self.inner.options.on_message {
                        // a panicking handler fails the connection with 1011
                        AssertUnwindSafe(async { on_message(self.clone(), message).await })
                            .catch_unwind()
                            .await
                            .map_err(|_| WebSocketError::HandlerPanicked)?;
                    }
                }
            }
        }
    }

    async fn on_ping(&self, frame: Frame) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if writer.close_sent {
            return Ok(());
        }
        let result = writer.send_frame(Frame::pong(frame.into_payload())).await;
        self.check_write(&mut writer, result).await
    }

    async fn on_close(&self, frame: Frame, reader: &mut FrameReader) -> Result<()> {
        let info = self.inner.validator.validate_close(frame.payload())?;
        tracing::debug!(id = self.inner.id, ?info, "close frame received");
        self.shared().remote_close = info.clone();

        {
            let mut writer = self.inner.writer.lock().await;
            if !writer.close_sent {
                // echo the code; codes that may not be sent are answered with 1000
                let reply = info.map(|info| match CloseCode::from(info.code) {
                    code if code.is_allowed() => CloseInfo {
                        code: info.code,
                        reason: String::new(),
                    },
                    _ => CloseInfo {
                        code: CloseCode::Normal.into(),
                        reason: String::new(),
                    },
                });
                let frame = match &reply {
                    Some(reply) => Frame::close_raw(reply.to_payload()),
                    None => Frame::close_raw(Bytes::new()),
                };

                writer.close_sent = true;
                self.shared().local_close = reply;
                self.transition(&[ConnectionState::Open], ConnectionState::ClosingRemote);

                let result = writer.send_frame(frame).await;
                self.check_write(&mut writer, result).await?;
            }
        }

        reader.drain(self.inner.options.close_timeout).await;
        Ok(())
    }

    /// Reports a fatal error to the peer with the matching close code.
    async fn fail(&self, err: WebSocketError, reader: &mut FrameReader) {
        tracing::warn!(id = self.inner.id, "connection failed: {err}");

        if let Some(code) = err.close_code() {
            let sent = {
                let mut writer = self.inner.writer.lock().await;
                if writer.close_sent || self.state() == ConnectionState::Closed {
                    false
                } else {
                    writer.close_sent = true;
                    self.shared().local_close = Some(CloseInfo {
                        code: code.into(),
                        reason: String::new(),
                    });
                    self.transition(&[ConnectionState::Open], ConnectionState::ClosingLocal);
                    writer.send_frame(Frame::close(code, "")).await.is_ok()
                }
            };

            if sent {
                reader.drain(self.inner.options.close_timeout).await;
            }
        }

        let mut shared = self.shared();
        if shared.error.is_none() {
            shared.error = Some(err);
        }
    }
}

impl fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .finish()
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
