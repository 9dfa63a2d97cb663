//! permessage-deflate (RFC 7692).
//!
//! [`ExtensionParams`] is both the offer sent in the upgrade request and the
//! parameters accepted from the server's `Sec-WebSocket-Extensions` header.
//! [`Compressor`] and [`Decompressor`] own the deflate/inflate state of one
//! connection; with context takeover the state persists across messages, without it
//! the state is reset after every message.
//!
//! Each compressed message ends with a sync flush whose `00 00 ff ff` tail is
//! stripped before sending and appended again before inflating.

use bytes::Bytes;
use flate2::{FlushCompress, FlushDecompress, Status};
use nom::{
    IResult, Parser,
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::opt,
    sequence::{pair, preceded},
};

use crate::{CompressionLevel, DeflateOptions, Result, WebSocketError};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Only the full 32 KiB window is supported by the deflate backend.
const MAX_WINDOW_BITS: u8 = 15;

/// Negotiated (or offered) permessage-deflate parameters.
///
/// `server_max_window_bits` and `client_max_window_bits` are `Some(None)` when the
/// parameter is present without a value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<Option<u8>>,
    pub client_max_window_bits: Option<Option<u8>>,
}

impl<'a> From<&'a DeflateOptions> for ExtensionParams {
    /// The offer for the upgrade request. Window bits are never requested.
    fn from(value: &'a DeflateOptions) -> Self {
        Self {
            server_no_context_takeover: value.server_no_context_takeover,
            client_no_context_takeover: value.client_no_context_takeover,
            server_max_window_bits: None,
            client_max_window_bits: None,
        }
    }
}

impl std::fmt::Display for ExtensionParams {
    /// Formats the parameters as a `Sec-WebSocket-Extensions` value.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{PERMESSAGE_DEFLATE}")?;

        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }

        match self.server_max_window_bits {
            Some(Some(bits)) => write!(f, "; server_max_window_bits={bits}")?,
            Some(None) => write!(f, "; server_max_window_bits")?,
            None => {}
        }
        match self.client_max_window_bits {
            Some(Some(bits)) => write!(f, "; client_max_window_bits={bits}")?,
            Some(None) => write!(f, "; client_max_window_bits")?,
            None => {}
        }

        Ok(())
    }
}

impl std::str::FromStr for ExtensionParams {
    type Err = WebSocketError;

    /// Parses a single `permessage-deflate` element with its parameters.
    ///
    /// Unknown parameters, repeated parameters and window bits outside 8-15 are errors.
    fn from_str(input: &str) -> Result<Self> {
        Self::parse(input.trim())
            .map_err(|err| WebSocketError::InvalidExtension(format!("{input:?}: {err}")))
    }
}

impl ExtensionParams {
    fn parse(input: &str) -> std::result::Result<Self, String> {
        let (mut input, _) = tag::<_, _, nom::error::Error<&str>>(PERMESSAGE_DEFLATE)
            .parse(input)
            .map_err(|err| err.to_string())?;

        let mut this = Self::default();
        while !input.trim_end().is_empty() {
            let (remaining, (key, value)) = Self::parse_param(input).map_err(|err| err.to_string())?;
            this.apply(key, value)?;
            input = remaining;
        }

        Ok(this)
    }

    fn apply(&mut self, key: &str, value: Option<&str>) -> std::result::Result<(), String> {
        let flag = |set: &mut bool| {
            if *set || value.is_some() {
                return Err(format!("invalid parameter {key}"));
            }
            *set = true;
            Ok(())
        };
        let bits = |slot: &mut Option<Option<u8>>| {
            if slot.is_some() {
                return Err(format!("duplicate parameter {key}"));
            }
            let parsed = match value {
                None => None,
                Some(value) => match value.parse::<u8>() {
                    Ok(n @ 8..=15) => Some(n),
                    _ => return Err(format!("invalid {key}={value}")),
                },
            };
            *slot = Some(parsed);
            Ok(())
        };

        match key {
            "server_no_context_takeover" => flag(&mut self.server_no_context_takeover),
            "client_no_context_takeover" => flag(&mut self.client_no_context_takeover),
            "server_max_window_bits" => bits(&mut self.server_max_window_bits),
            "client_max_window_bits" => bits(&mut self.client_max_window_bits),
            _ => Err(format!("unknown parameter {key}")),
        }
    }

    /// `; key` or `; key=value`, with optional spaces and a quoted value.
    fn parse_param(input: &str) -> IResult<&str, (&str, Option<&str>)> {
        let value = preceded(
            preceded(space0, tag("=")),
            preceded(
                space0,
                nom::branch::alt((
                    digit1,
                    nom::sequence::delimited(tag("\""), digit1, tag("\"")),
                )),
            ),
        );

        preceded(
            preceded(space0, tag(";")),
            preceded(
                space0,
                pair(
                    take_while1(|c: char| c.is_alphanumeric() || c == '_'),
                    opt(value),
                ),
            ),
        )
        .parse(input)
        .map(|(rest, (key, value))| (rest.trim_start(), (key, value)))
    }

    /// Accepts the server's `Sec-WebSocket-Extensions` response.
    ///
    /// `header` is the combined header value, `offered` what the request offered.
    /// Returns `None` when the server declined compression. Any extension that was not
    /// offered, or parameters the client cannot honour, fail the handshake.
    pub fn negotiate(header: Option<&str>, offered: Option<&ExtensionParams>) -> Result<Option<Self>> {
        let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(None);
        };

        if offered.is_none() {
            return Err(WebSocketError::InvalidExtension(format!(
                "server accepted unrequested extension {header:?}"
            )));
        }

        let mut elements = header.split(',').map(str::trim).filter(|e| !e.is_empty());
        let (Some(element), None) = (elements.next(), elements.next()) else {
            return Err(WebSocketError::InvalidExtension(format!(
                "expected a single extension, got {header:?}"
            )));
        };

        let params: ExtensionParams = element.parse()?;

        // requesting a smaller client window is not supported
        if let Some(Some(bits)) = params.client_max_window_bits {
            if bits < MAX_WINDOW_BITS {
                return Err(WebSocketError::InvalidExtension(format!(
                    "client_max_window_bits={bits} is not supported"
                )));
            }
        }

        tracing::debug!(
            "Negotiated permessage-deflate with settings \
            client_no_context_takeover={} server_no_context_takeover={} \
            server_max_window_bits={:?} client_max_window_bits={:?}",
            params.client_no_context_takeover,
            params.server_no_context_takeover,
            params.server_max_window_bits,
            params.client_max_window_bits
        );

        Ok(Some(params))
    }

    /// Compressor for client-to-server messages.
    ///
    /// Context takeover is disabled if the server asked for it or `force_no_context`
    /// is set locally.
    pub fn compressor(&self, level: CompressionLevel, force_no_context: bool) -> Compressor {
        if self.client_no_context_takeover || force_no_context {
            Compressor::no_context_takeover(level)
        } else {
            Compressor::new(level)
        }
    }

    /// Decompressor for server-to-client messages, bounded by `max_size` bytes of output.
    pub fn decompressor(&self, max_size: usize) -> Decompressor {
        if self.server_no_context_takeover {
            Decompressor::no_context_takeover(max_size)
        } else {
            Decompressor::new(max_size)
        }
    }
}

/// Compresses outgoing message payloads.
pub struct Compressor {
    compress: flate2::Compress,
    no_context_takeover: bool,
}

impl Compressor {
    /// A compressor that keeps its dictionary across messages.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
            no_context_takeover: false,
        }
    }

    /// A compressor that resets its dictionary after every message.
    pub fn no_context_takeover(level: CompressionLevel) -> Self {
        Self {
            compress: flate2::Compress::new(level, false),
            no_context_takeover: true,
        }
    }

    /// Compresses a complete message payload, without the trailing `00 00 ff ff`.
    pub fn compress(&mut self, mut input: &[u8]) -> Result<Bytes> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);

        while !input.is_empty() {
            reserve(&mut output, input.len() / 2);
            let before_in = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut output, FlushCompress::None)
                .map_err(|err| WebSocketError::Compression(err.to_string()))?;
            let consumed = (self.compress.total_in() - before_in) as usize;
            input = &input[consumed..];
        }

        loop {
            reserve(&mut output, 64);
            match self
                .compress
                .compress_vec(&[], &mut output, FlushCompress::Sync)
                .map_err(|err| WebSocketError::Compression(err.to_string()))?
            {
                Status::Ok | Status::BufError => {}
                Status::StreamEnd => {
                    return Err(WebSocketError::Compression("unexpected end of stream".into()));
                }
            }

            if output.ends_with(&DEFLATE_TAIL) {
                output.truncate(output.len() - DEFLATE_TAIL.len());
                break;
            }
        }

        if self.no_context_takeover {
            self.compress.reset();
        }

        Ok(output.into())
    }
}

/// Inflates incoming message payloads.
pub struct Decompressor {
    decompress: flate2::Decompress,
    no_context_takeover: bool,
    max_size: usize,
}

impl Decompressor {
    /// A decompressor that keeps its window across messages.
    pub fn new(max_size: usize) -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
            no_context_takeover: false,
            max_size,
        }
    }

    /// A decompressor that resets its window after every message.
    pub fn no_context_takeover(max_size: usize) -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
            no_context_takeover: true,
            max_size,
        }
    }

    /// Inflates a complete message payload received without its `00 00 ff ff` tail.
    ///
    /// Corrupt input yields [`WebSocketError::Decompression`]; output beyond the size
    /// limit yields [`WebSocketError::MessageTooLarge`].
    pub fn decompress(&mut self, input: &[u8]) -> Result<Bytes> {
        match self.inflate(input) {
            Ok((output, stream_end)) => {
                if self.no_context_takeover || stream_end {
                    self.decompress.reset(false);
                }
                Ok(output)
            }
            Err(err) => {
                self.decompress.reset(false);
                Err(err)
            }
        }
    }

    /// Returns the inflated bytes and whether the peer ended the deflate stream.
    fn inflate(&mut self, input: &[u8]) -> Result<(Bytes, bool)> {
        let mut output = Vec::with_capacity((input.len() * 2).min(self.max_size) + 64);

        for mut chunk in [input, &DEFLATE_TAIL[..]] {
            loop {
                reserve(&mut output, 1024);
                let before_in = self.decompress.total_in();
                let before_out = self.decompress.total_out();

                let status = self
                    .decompress
                    .decompress_vec(chunk, &mut output, FlushDecompress::None)
                    .map_err(|err| WebSocketError::Decompression(err.to_string()))?;

                let consumed = (self.decompress.total_in() - before_in) as usize;
                let produced = self.decompress.total_out() - before_out;
                chunk = &chunk[consumed..];

                if output.len() > self.max_size {
                    return Err(WebSocketError::MessageTooLarge);
                }

                match status {
                    Status::StreamEnd => return Ok((output.into(), true)),
                    Status::Ok | Status::BufError => {}
                }

                // drained: all input consumed and the output buffer was not filled
                if chunk.is_empty() && output.len() < output.capacity() {
                    break;
                }

                if consumed == 0 && produced == 0 && output.len() < output.capacity() {
                    return Err(WebSocketError::Decompression("stalled inflate stream".into()));
                }
            }
        }

        Ok((output.into(), false))
    }
}

fn reserve(output: &mut Vec<u8>, additional: usize) {
    let spare = output.capacity() - output.len();
    if spare < additional.max(64) {
        output.reserve(additional.max(1024));
    }
}
