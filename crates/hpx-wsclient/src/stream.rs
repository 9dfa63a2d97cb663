use std::{
    pin::{Pin, pin},
    sync::Arc,
    task::{Context, Poll},
};

use rustls::pki_types::{ServerName, TrustAnchor};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::Result;

/// A transport that might be protected with TLS.
#[non_exhaustive]
#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
pub enum MaybeTlsStream<S> {
    /// Unencrypted socket stream.
    Plain(S),
    /// Encrypted socket stream using `rustls`.
    Tls(TlsStream<S>),
}

impl<S> From<S> for MaybeTlsStream<S> {
    fn from(value: S) -> Self {
        Self::Plain(value)
    }
}

impl<S> From<TlsStream<S>> for MaybeTlsStream<S> {
    fn from(value: TlsStream<S>) -> Self {
        Self::Tls(value)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => pin!(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => pin!(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => pin!(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => pin!(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => pin!(s).poll_shutdown(cx),
        }
    }
}

/// Opens a TCP connection to `host:port`, wrapping it in TLS when `use_tls` is set.
///
/// Without an explicit `connector`, one is built from the webpki root certificates.
pub(crate) async fn connect(
    host: &str,
    port: u16,
    use_tls: bool,
    connector: Option<TlsConnector>,
    no_delay: bool,
) -> Result<MaybeTlsStream<TcpStream>> {
    let tcp = TcpStream::connect((host, port)).await?;
    if no_delay {
        tcp.set_nodelay(true)?;
    }

    tracing::debug!(host, port, use_tls, "tcp connection established");

    if !use_tls {
        return Ok(MaybeTlsStream::Plain(tcp));
    }

    let connector = match connector {
        Some(connector) => connector,
        None => tls_connector()?,
    };
    let domain = ServerName::try_from(host.to_owned())?;
    let tls = connector.connect(domain, tcp).await?;

    Ok(MaybeTlsStream::Tls(tls))
}

/// Creates a TLS connector with the webpki root certificates, advertising `http/1.1`.
fn tls_connector() -> Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
        subject: ta.subject.clone(),
        subject_public_key_info: ta.subject_public_key_info.clone(),
        name_constraints: ta.name_constraints.clone(),
    }));

    let maybe_provider = rustls::crypto::CryptoProvider::get_default().cloned();

    #[cfg(any(feature = "rustls-ring", feature = "rustls-aws-lc-rs"))]
    let provider = maybe_provider.unwrap_or_else(|| {
        #[cfg(feature = "rustls-ring")]
        let provider = rustls::crypto::ring::default_provider();
        #[cfg(all(feature = "rustls-aws-lc-rs", not(feature = "rustls-ring")))]
        let provider = rustls::crypto::aws_lc_rs::default_provider();

        Arc::new(provider)
    });

    #[cfg(not(any(feature = "rustls-ring", feature = "rustls-aws-lc-rs")))]
    let provider = maybe_provider.ok_or(crate::WebSocketError::InvalidOptions(
        "no rustls crypto provider installed; pass a connector or enable rustls-ring",
    ))?;

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}
