//! Device-side transport: one long-lived TCP (usually TLS) connection to the
//! device's redirection port.
//!
//! The relay never manufactures sockets itself — it asks a
//! [`TransportFactory`] for a [`DeviceTransport`] and only ever speaks in
//! whole buffers. The transport is opaque to the codec: it delivers whatever
//! the device sent.
//!
//! Read and write halves sit behind separate locks so the device loop's
//! blocking `receive` never serialises against the browser loop's `send`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::Device;
use crate::error::RedirectError;

/// Conventional AMT redirection ports.
const REDIRECTION_PORT_TLS: u16 = 16995;
const REDIRECTION_PORT_PLAIN: u16 = 16994;

/// Read chunk size. Device frames are delivered as-received; KVM pixel
/// payloads arrive in runs of chunks this large.
const RECV_BUF_LEN: usize = 8192;

/// Anything that can carry redirection bytes both ways.
pub trait RedirectStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RedirectStream for T {}

/// An open connection to a device's redirection listener.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Block until the device sends something. Returns an empty buffer on
    /// clean EOF and [`RedirectError::Cancelled`] when the token fires
    /// mid-read.
    async fn receive(&self, cancel: &CancellationToken) -> Result<Vec<u8>, RedirectError>;

    /// Write one frame to the device.
    async fn send(&self, cancel: &CancellationToken, frame: &[u8]) -> Result<(), RedirectError>;

    /// Shut the connection down. Idempotent.
    async fn close(&self);
}

/// Opens transports for devices. Injected so tests (and other deployments)
/// can substitute their own device side.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, device: &Device) -> Result<Box<dyn DeviceTransport>, RedirectError>;
}

/// Production factory: TCP to the device's redirection port, wrapped in TLS
/// unless the device record opts out.
pub struct TcpTransportFactory {
    tls: TlsConnector,
}

impl TcpTransportFactory {
    /// `allow_insecure_ciphers` admits TLS 1.2 alongside 1.3 — AMT firmware
    /// generations before 16.x never negotiate 1.3.
    pub fn new(allow_insecure_ciphers: bool) -> Self {
        let versions: &[&rustls::SupportedProtocolVersion] = if allow_insecure_ciphers {
            rustls::ALL_VERSIONS
        } else {
            &[&rustls::version::TLS13]
        };

        // AMT redirection listeners present self-signed certificates;
        // trust policy for the device LAN is an external decision.
        let config = ClientConfig::builder_with_protocol_versions(versions)
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn open(&self, device: &Device) -> Result<Box<dyn DeviceTransport>, RedirectError> {
        let default_port = if device.use_tls {
            REDIRECTION_PORT_TLS
        } else {
            REDIRECTION_PORT_PLAIN
        };
        let (host, port) = split_host_port(&device.address, default_port);

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;
        debug!(guid = %device.guid, %host, port, tls = device.use_tls, "device connected");

        if device.use_tls {
            let server_name = ServerName::try_from(host.clone())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = self.tls.connect(server_name, tcp).await?;
            Ok(Box::new(TcpTransport::new(stream)))
        } else {
            Ok(Box::new(TcpTransport::new(tcp)))
        }
    }
}

/// Splits `host[:port]`, falling back to the conventional redirection port.
fn split_host_port(address: &str, default_port: u16) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (address.to_string(), default_port),
        },
        // no colon, or a bare IPv6 literal
        _ => (address.to_string(), default_port),
    }
}

/// The concrete transport over any [`RedirectStream`].
pub struct TcpTransport {
    reader: Mutex<ReadHalf<Box<dyn RedirectStream>>>,
    writer: Mutex<WriteHalf<Box<dyn RedirectStream>>>,
    /// Set once a zero-byte read is observed so the relay loop is not spun
    /// by a closed peer.
    saw_eof: AtomicBool,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: impl RedirectStream + 'static) -> Self {
        let boxed: Box<dyn RedirectStream> = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            saw_eof: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DeviceTransport for TcpTransport {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Vec<u8>, RedirectError> {
        if self.saw_eof.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut reader = self.reader.lock().await;
        let n = tokio::select! {
            () = cancel.cancelled() => return Err(RedirectError::Cancelled),
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            self.saw_eof.store(true, Ordering::Release);
        }
        buf.truncate(n);
        Ok(buf)
    }

    async fn send(&self, cancel: &CancellationToken, frame: &[u8]) -> Result<(), RedirectError> {
        let mut writer = self.writer.lock().await;
        tokio::select! {
            () = cancel.cancelled() => Err(RedirectError::Cancelled),
            res = async {
                writer.write_all(frame).await?;
                writer.flush().await
            } => res.map_err(RedirectError::from),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Certificate verifier that accepts whatever the device presents.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpTransport::new(client), server)
    }

    #[tokio::test]
    async fn receive_returns_what_the_peer_wrote() {
        let (transport, mut peer) = loopback_pair().await;
        let cancel = CancellationToken::new();

        peer.write_all(&[0x11, 0x00, 0x22]).await.unwrap();
        let got = transport.receive(&cancel).await.unwrap();
        assert_eq!(got, vec![0x11, 0x00, 0x22]);
    }

    #[tokio::test]
    async fn send_reaches_the_peer() {
        let (transport, mut peer) = loopback_pair().await;
        let cancel = CancellationToken::new();

        transport.send(&cancel, &[0x10, 0x01]).await.unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x10, 0x01]);
    }

    #[tokio::test]
    async fn clean_eof_yields_empty_then_errors() {
        let (transport, peer) = loopback_pair().await;
        let cancel = CancellationToken::new();

        drop(peer);
        let first = transport.receive(&cancel).await.unwrap();
        assert!(first.is_empty(), "clean EOF reports an empty buffer");

        let second = transport.receive(&cancel).await;
        assert!(
            matches!(second, Err(RedirectError::Transport(_))),
            "a closed peer must not spin the relay loop"
        );
    }

    #[tokio::test]
    async fn cancellation_unblocks_receive() {
        let (transport, _peer) = loopback_pair().await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let got = transport.receive(&cancel).await;
        assert!(matches!(got, Err(RedirectError::Cancelled)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (transport, _peer) = loopback_pair().await;
        transport.close().await;
        transport.close().await;
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(
            split_host_port("192.168.1.50", 16995),
            ("192.168.1.50".to_string(), 16995)
        );
        assert_eq!(
            split_host_port("192.168.1.50:16994", 16995),
            ("192.168.1.50".to_string(), 16994)
        );
        assert_eq!(
            split_host_port("amt-host.lan:700", 16995),
            ("amt-host.lan".to_string(), 700)
        );
        // bare IPv6 literal keeps the default port
        assert_eq!(
            split_host_port("fe80::1", 16994),
            ("fe80::1".to_string(), 16994)
        );
    }
}
