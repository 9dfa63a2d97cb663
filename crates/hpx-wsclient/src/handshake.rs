//! Opening handshake: the HTTP/1.1 upgrade request and the validation of the
//! server's `101 Switching Protocols` response.

use std::{fmt::Write as _, str::FromStr};

use base64::prelude::*;
use bytes::Bytes;
use http::{HeaderName, StatusCode, header, uri::Authority};
use sha1::{Digest, Sha1};
use url::Url;

use crate::{Options, Result, WebSocketError, compression::ExtensionParams};

/// GUID appended to the key when computing `Sec-WebSocket-Accept`.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of the response head.
const MAX_RESPONSE_SIZE: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

/// Headers the engine always writes itself.
const MANAGED_HEADERS: [HeaderName; 6] = [
    header::UPGRADE,
    header::CONNECTION,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_EXTENSIONS,
    header::CONTENT_LENGTH,
];

/// Generates a random base64-encoded 16-byte `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Computes the `Sec-WebSocket-Accept` value expected for `key`.
///
/// ```
/// assert_eq!(
///     hpx_wsclient::compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// The client's upgrade request.
///
/// Built from parts with [`HandshakeRequest::new`] or [`HandshakeRequest::from_url`],
/// or from a caller-written request with [`HandshakeRequest::from_raw`]. The
/// `Upgrade`, `Connection`, `Sec-WebSocket-Key`, `Sec-WebSocket-Version` and
/// `Sec-WebSocket-Extensions` headers are always written by the engine.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    key: String,
}

impl HandshakeRequest {
    /// A `GET` request for `path` with the given `Host` header.
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method: "GET".to_owned(),
            path: if path.is_empty() { "/".to_owned() } else { path },
            headers: vec![("Host".to_owned(), host.into())],
            key: generate_key(),
        }
    }

    /// A request for a `ws://` or `wss://` URL.
    pub fn from_url(url: &Url) -> Result<Self> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(WebSocketError::InvalidHttpScheme);
        }

        let host = url.host_str().ok_or(WebSocketError::MissingHost)?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Ok(Self::new(host, &url[url::Position::BeforePath..]))
    }

    /// Parses a caller-written upgrade request.
    ///
    /// Both `\r\n` and bare `\n` line endings are accepted and a missing blank line
    /// at the end is tolerated. An existing `Sec-WebSocket-Key` is kept, otherwise one
    /// is generated.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        let mut input = raw.trim_ascii_end().to_vec();
        input.extend_from_slice(b"\r\n\r\n");

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&input) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(WebSocketError::MalformedHttp("incomplete request".into()));
            }
            Err(err) => return Err(WebSocketError::MalformedHttp(err.to_string())),
        }

        let (Some(method), Some(path)) = (request.method, request.path) else {
            return Err(WebSocketError::MalformedHttp("missing request line".into()));
        };

        let mut key = None;
        let mut kept = Vec::with_capacity(request.headers.len());
        for h in request.headers.iter() {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| WebSocketError::MalformedHttp(format!("non UTF-8 value for {}", h.name)))?;

            if h.name.eq_ignore_ascii_case(header::SEC_WEBSOCKET_KEY.as_str()) {
                key = Some(value.trim().to_owned());
            } else if !MANAGED_HEADERS.iter().any(|m| h.name.eq_ignore_ascii_case(m.as_str())) {
                kept.push((h.name.to_owned(), value.to_owned()));
            }
        }

        Ok(Self {
            method: method.to_owned(),
            path: path.to_owned(),
            headers: kept,
            key: key.filter(|k| !k.is_empty()).unwrap_or_else(generate_key),
        })
    }

    /// Uses a fixed `Sec-WebSocket-Key`.
    pub fn with_key(self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..self
        }
    }

    /// Adds a header. Headers managed by the engine are ignored.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        if !MANAGED_HEADERS.iter().any(|m| name.eq_ignore_ascii_case(m.as_str())) {
            self.headers.push((name, value.into()));
        }
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The value of the `Host` header, if any.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(header::HOST.as_str()))
            .map(|(_, value)| value.as_str())
    }

    /// Host and port to dial: explicit options first, then the `Host` header.
    pub(crate) fn target(&self, options: &Options) -> Result<(String, u16)> {
        let authority = self.host().and_then(|host| Authority::from_str(host).ok());

        let host = options
            .host
            .clone()
            .or_else(|| {
                authority.as_ref().map(|a| {
                    a.host()
                        .trim_start_matches('[')
                        .trim_end_matches(']')
                        .to_owned()
                })
            })
            .filter(|host| !host.is_empty())
            .ok_or(WebSocketError::MissingHost)?;

        let port = options
            .port
            .or_else(|| authority.as_ref().and_then(Authority::port_u16))
            .unwrap_or(if options.use_tls { 443 } else { 80 });

        Ok((host, port))
    }

    /// Serializes the request, offering `offer` in `Sec-WebSocket-Extensions`.
    pub fn to_bytes(&self, offer: Option<&ExtensionParams>) -> Bytes {
        let mut out = String::with_capacity(256);
        let _ = write!(out, "{} {} HTTP/1.1\r\n", self.method, self.path);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        let _ = write!(
            out,
            "Upgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n",
            self.key
        );
        if let Some(offer) = offer {
            let _ = write!(out, "Sec-WebSocket-Extensions: {offer}\r\n");
        }
        out.push_str("\r\n");

        Bytes::from(out)
    }
}

/// A validated `101 Switching Protocols` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Negotiated permessage-deflate parameters, `None` without compression.
    pub extensions: Option<ExtensionParams>,
    /// Length of the response head; bytes after it already belong to the frame stream.
    pub consumed: usize,
}

/// Parses and validates the server's response to a request sent with `key`.
///
/// Returns `Ok(None)` while the response head is incomplete.
pub fn parse_response(
    buf: &[u8],
    key: &str,
    offered: Option<&ExtensionParams>,
) -> Result<Option<HandshakeOutcome>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) if buf.len() > MAX_RESPONSE_SIZE => {
            return Err(WebSocketError::HandshakeTooLarge);
        }
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(WebSocketError::HandshakeTooLarge),
        Err(err) => return Err(WebSocketError::MalformedHttp(err.to_string())),
    };

    let status = response.code.unwrap_or_default();
    if status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        return Err(WebSocketError::InvalidStatusCode(status));
    }

    let headers = &*response.headers;

    if !header_values(headers, header::UPGRADE).any(|v| v.trim().eq_ignore_ascii_case("websocket")) {
        return Err(WebSocketError::InvalidUpgradeHeader);
    }

    if !header_values(headers, header::CONNECTION)
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(WebSocketError::InvalidConnectionHeader);
    }

    let expected = compute_accept(key);
    let mut accept = header_values(headers, header::SEC_WEBSOCKET_ACCEPT);
    match (accept.next(), accept.next()) {
        (Some(value), None) if value.trim() == expected => {}
        _ => return Err(WebSocketError::AcceptMismatch),
    }

    let extensions = header_values(headers, header::SEC_WEBSOCKET_EXTENSIONS).collect::<Vec<_>>();
    let extensions = (!extensions.is_empty()).then(|| extensions.join(", "));
    let extensions = ExtensionParams::negotiate(extensions.as_deref(), offered)?;

    tracing::debug!(status, compression = extensions.is_some(), "handshake accepted");

    Ok(Some(HandshakeOutcome {
        extensions,
        consumed,
    }))
}

fn header_values<'h, 'b>(
    headers: &'h [httparse::Header<'b>],
    name: HeaderName,
) -> impl Iterator<Item = &'b str> + 'h {
    headers
        .iter()
        .filter(move |h| h.name.eq_ignore_ascii_case(name.as_str()))
        .filter_map(|h| std::str::from_utf8(h.value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn response(extra: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n{extra}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn test_accept_rfc_vector() {
        assert_eq!(compute_accept(KEY), ACCEPT);
    }

    #[test]
    fn test_generated_key_is_16_bytes() {
        let key = generate_key();
        assert_eq!(BASE64_STANDARD.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_request_bytes() {
        let request = HandshakeRequest::new("example.com:9001", "/runCase?case=1").with_key(KEY);
        let bytes = request.to_bytes(None);
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("GET /runCase?case=1 HTTP/1.1\r\nHost: example.com:9001\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Key: {KEY}\r\n")));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(!text.contains("Sec-WebSocket-Extensions"));
        assert!(text.ends_with("\r\n\r\n"));

        let offer = ExtensionParams {
            client_no_context_takeover: true,
            ..Default::default()
        };
        let bytes = request.to_bytes(Some(&offer));
        assert!(
            std::str::from_utf8(&bytes)
                .unwrap()
                .contains("Sec-WebSocket-Extensions: permessage-deflate; client_no_context_takeover\r\n")
        );
    }

    #[test]
    fn test_from_raw() {
        let raw = b"GET /chat HTTP/1.1\nHost: server.example.com\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\nSec-WebSocket-Extensions: x-custom\nOrigin: http://example.com\n";
        let request = HandshakeRequest::from_raw(raw).unwrap();

        assert_eq!(request.key(), KEY);
        assert_eq!(request.path(), "/chat");
        assert_eq!(request.host(), Some("server.example.com"));

        let bytes = request.to_bytes(None);
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("Origin: http://example.com\r\n"));
        assert!(!text.contains("x-custom"));
        assert_eq!(text.matches("Sec-WebSocket-Key").count(), 1);
    }

    #[test]
    fn test_from_raw_generates_key() {
        let request = HandshakeRequest::from_raw(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(BASE64_STANDARD.decode(request.key()).unwrap().len(), 16);

        assert!(matches!(
            HandshakeRequest::from_raw(b"not http"),
            Err(WebSocketError::MalformedHttp(_))
        ));
    }

    #[test]
    fn test_from_url() {
        let url = Url::parse("ws://example.com:9001/runCase?case=3&agent=hpx").unwrap();
        let request = HandshakeRequest::from_url(&url).unwrap();
        assert_eq!(request.host(), Some("example.com:9001"));
        assert_eq!(request.path(), "/runCase?case=3&agent=hpx");

        let url = Url::parse("wss://example.com").unwrap();
        let request = HandshakeRequest::from_url(&url).unwrap();
        assert_eq!(request.host(), Some("example.com"));
        assert_eq!(request.path(), "/");

        let url = Url::parse("http://example.com").unwrap();
        assert!(matches!(
            HandshakeRequest::from_url(&url),
            Err(WebSocketError::InvalidHttpScheme)
        ));
    }

    #[test]
    fn test_target_resolution() {
        let request = HandshakeRequest::new("example.com:9001", "/");
        assert_eq!(
            request.target(&Options::default()).unwrap(),
            ("example.com".to_owned(), 9001)
        );

        let request = HandshakeRequest::new("example.com", "/");
        assert_eq!(request.target(&Options::default()).unwrap().1, 80);
        assert_eq!(request.target(&Options::default().with_tls(true)).unwrap().1, 443);

        let options = Options::default().with_host("127.0.0.1").with_port(1234);
        assert_eq!(request.target(&options).unwrap(), ("127.0.0.1".to_owned(), 1234));

        let request = HandshakeRequest::new("[::1]:8080", "/");
        assert_eq!(
            request.target(&Options::default()).unwrap(),
            ("::1".to_owned(), 8080)
        );

        let request = HandshakeRequest::from_raw(b"GET / HTTP/1.1\r\n").unwrap();
        assert!(matches!(
            request.target(&Options::default()),
            Err(WebSocketError::MissingHost)
        ));
    }

    #[test]
    fn test_parse_valid_response() {
        let mut buf = response(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n"));
        let head_len = buf.len();
        buf.extend_from_slice(&[0x81, 0x00]);

        let outcome = parse_response(&buf, KEY, None).unwrap().unwrap();
        assert_eq!(outcome.consumed, head_len);
        assert_eq!(outcome.extensions, None);
    }

    #[test]
    fn test_parse_partial_response() {
        let buf = response(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n"));
        assert_eq!(parse_response(&buf[..buf.len() - 2], KEY, None).unwrap(), None);

        let mut huge = b"HTTP/1.1 101 Switching Protocols\r\n".to_vec();
        huge.resize(MAX_RESPONSE_SIZE + 1, b'a');
        assert!(matches!(
            parse_response(&huge, KEY, None),
            Err(WebSocketError::HandshakeTooLarge)
        ));
    }

    #[test]
    fn test_accept_mismatch_is_fatal() {
        let buf = response("Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n");
        let err = parse_response(&buf, KEY, None).unwrap_err();
        assert!(matches!(err, WebSocketError::AcceptMismatch));
        assert!(err.is_handshake_error());

        let buf = response("");
        assert!(matches!(
            parse_response(&buf, KEY, None),
            Err(WebSocketError::AcceptMismatch)
        ));
    }

    #[test]
    fn test_bad_status_and_headers() {
        let buf = b"HTTP/1.1 400 Bad Request\r\n\r\n";
        assert!(matches!(
            parse_response(buf, KEY, None),
            Err(WebSocketError::InvalidStatusCode(400))
        ));

        let buf = format!("HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {ACCEPT}\r\n\r\n");
        assert!(matches!(
            parse_response(buf.as_bytes(), KEY, None),
            Err(WebSocketError::InvalidUpgradeHeader)
        ));

        let buf = format!("HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: keep-alive\r\nSec-WebSocket-Accept: {ACCEPT}\r\n\r\n");
        assert!(matches!(
            parse_response(buf.as_bytes(), KEY, None),
            Err(WebSocketError::InvalidConnectionHeader)
        ));

        // token lists are accepted
        let buf = format!("HTTP/1.1 101 Switching Protocols\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\nSec-WebSocket-Accept: {ACCEPT}\r\n\r\n");
        assert!(parse_response(buf.as_bytes(), KEY, None).unwrap().is_some());
    }

    #[test]
    fn test_extension_negotiation() {
        let offer = ExtensionParams::default();
        let buf = response(&format!(
            "Sec-WebSocket-Accept: {ACCEPT}\r\nSec-WebSocket-Extensions: permessage-deflate; server_no_context_takeover\r\n"
        ));

        let outcome = parse_response(&buf, KEY, Some(&offer)).unwrap().unwrap();
        let params = outcome.extensions.unwrap();
        assert!(params.server_no_context_takeover);
        assert!(!params.client_no_context_takeover);

        // server declined
        let buf = response(&format!("Sec-WebSocket-Accept: {ACCEPT}\r\n"));
        let outcome = parse_response(&buf, KEY, Some(&offer)).unwrap().unwrap();
        assert_eq!(outcome.extensions, None);

        // accepted without an offer
        let buf = response(&format!(
            "Sec-WebSocket-Accept: {ACCEPT}\r\nSec-WebSocket-Extensions: permessage-deflate\r\n"
        ));
        assert!(matches!(
            parse_response(&buf, KEY, None),
            Err(WebSocketError::InvalidExtension(_))
        ));

        // malformed parameters
        let buf = response(&format!(
            "Sec-WebSocket-Accept: {ACCEPT}\r\nSec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=99\r\n"
        ));
        assert!(parse_response(&buf, KEY, Some(&offer)).is_err());
    }
}
