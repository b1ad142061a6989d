//! Opens the connection for a subtest.
//!
//! DNS, TCP, optional TLS, optional scrambling, then the WebSocket
//! handshake. Everything here blocks and must run off the async runtime.

use super::scramble::Scrambled;
use super::{DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE, SUBPROTOCOL};
use crate::errors::TestError;
use crate::settings::Settings;
use crate::websocket::handshake::client_handshake;
use crate::websocket::{Transport, WebSocket};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, info};
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme,
    StreamOwned,
};
use rustls_connector::{HandshakeError, RustlsConnector};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::{Host, Url};

/// An established ndt7 connection.
pub type Connection = WebSocket<Box<dyn Transport>>;

impl<S: Transport> Transport for StreamOwned<ClientConnection, S> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_write_timeout(timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.conn.send_close_notify();
        // Best effort: the peer may already be gone.
        let _ = self.conn.complete_io(&mut self.sock);
        self.sock.shutdown()
    }
}

/// Dial `url` according to `settings` and complete the handshake.
///
/// DNS, TCP, TLS and the WebSocket handshake share a single deadline of
/// [`DEFAULT_TIMEOUT`].
pub fn dial(settings: &Settings, url: &Url) -> Result<Connection, TestError> {
    let deadline = Instant::now() + DEFAULT_TIMEOUT;
    let host = url
        .host()
        .ok_or_else(|| TestError::invalid_hostname("URL has no host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TestError::invalid_hostname("URL has no port"))?;

    let address = match &host {
        Host::Ipv4(ip) => IpAddr::V4(*ip),
        Host::Ipv6(ip) => IpAddr::V6(*ip),
        Host::Domain(domain) => resolve_dns(domain, deadline)?,
    };

    let tcp = tcp_connect(SocketAddr::new(address, port), deadline)?;

    let begin = Instant::now();
    let mut transport: Box<dyn Transport> = if settings.use_tls() {
        let server_name = match &host {
            Host::Domain(domain) => domain.to_string(),
            _ => address.to_string(),
        };
        let mut tls = tls_handshake(
            Bounded::new(tcp, deadline),
            &server_name,
            settings.skip_tls_verify,
        )?;
        websocket_handshake(&mut tls, url)?;
        let StreamOwned { conn, sock, .. } = tls;
        Box::new(StreamOwned::new(conn, sock.into_inner()))
    } else if settings.scramble_enabled() {
        debug!("scrambling connection to {}", address);
        let scrambled = Scrambled::new(tcp)
            .map_err(|e| TestError::dial(e.to_string(), e.kind()).with_source(e))?;
        let mut bounded = Bounded::new(scrambled, deadline);
        websocket_handshake(&mut bounded, url)?;
        Box::new(bounded.into_inner())
    } else {
        let mut bounded = Bounded::new(tcp, deadline);
        websocket_handshake(&mut bounded, url)?;
        Box::new(bounded.into_inner())
    };
    debug!("connection set up in {:?}", begin.elapsed());

    transport
        .set_read_timeout(Some(DEFAULT_TIMEOUT))
        .and_then(|_| transport.set_write_timeout(Some(DEFAULT_TIMEOUT)))
        .map_err(|e| TestError::dial(e.to_string(), e.kind()).with_source(e))?;

    Ok(WebSocket::from_handshaken(transport, MAX_MESSAGE_SIZE))
}

fn websocket_handshake<S: Read + Write + ?Sized>(
    stream: &mut S,
    url: &Url,
) -> Result<(), TestError> {
    client_handshake(stream, url, SUBPROTOCOL).map_err(|e| {
        TestError::dial(format!("WebSocket handshake failed: {}", e), e.io_kind())
            .with_source(e)
    })?;
    Ok(())
}

/// Time left until `deadline`, or `TimedOut` once it has passed.
fn remaining(deadline: Instant) -> io::Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection setup deadline expired",
        ));
    }
    Ok(left)
}

/// A stream whose reads and writes all end at a fixed deadline.
///
/// Wraps the connection while it is being set up, so that a peer
/// trickling bytes cannot stretch the handshake past the deadline.
#[derive(Debug)]
struct Bounded<S> {
    inner: S,
    deadline: Instant,
}

impl<S> Bounded<S> {
    fn new(inner: S, deadline: Instant) -> Self {
        Self { inner, deadline }
    }

    fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Transport> Read for Bounded<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.set_read_timeout(Some(remaining(self.deadline)?))?;
        self.inner.read(buf)
    }
}

impl<S: Transport> Write for Bounded<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.set_write_timeout(Some(remaining(self.deadline)?))?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Resolve `host`, preferring IPv4 addresses.
fn resolve_dns(host: &str, deadline: Instant) -> Result<IpAddr, TestError> {
    let lookup = async {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                debug!("no system resolver configuration ({}), using defaults", e);
                TokioAsyncResolver::tokio(
                    ResolverConfig::default(),
                    ResolverOpts::default(),
                )
            }
        };
        let left = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout(left, resolver.lookup_ip(host)).await
    };

    let begin = Instant::now();
    let result = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(lookup),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TestError::dial(e.to_string(), e.kind()).with_source(e))?
            .block_on(lookup),
    };

    let response = match result {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            return Err(TestError::dial(
                format!("cannot resolve {}: {}", host, e),
                io::ErrorKind::NotFound,
            )
            .with_source(e))
        }
        Err(_) => {
            return Err(TestError::dial(
                format!("timed out resolving {}", host),
                io::ErrorKind::TimedOut,
            ))
        }
    };
    debug!("resolved {} in {:?}", host, begin.elapsed());

    let addresses: Vec<IpAddr> = response.iter().collect();
    addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| {
            TestError::dial(
                format!("no addresses found for {}", host),
                io::ErrorKind::NotFound,
            )
        })
}

fn tcp_connect(address: SocketAddr, deadline: Instant) -> Result<TcpStream, TestError> {
    let dial_error = |e: io::Error| {
        TestError::dial(format!("cannot connect to {}: {}", address, e), e.kind())
            .with_source(e)
    };

    let begin = Instant::now();
    let left = remaining(deadline).map_err(dial_error)?;
    let stream = TcpStream::connect_timeout(&address, left).map_err(dial_error)?;
    stream.set_read_timeout(Some(DEFAULT_TIMEOUT)).map_err(dial_error)?;
    stream.set_write_timeout(Some(DEFAULT_TIMEOUT)).map_err(dial_error)?;
    stream.set_nodelay(true).map_err(dial_error)?;
    info!("TCP connection to {} established in {:?}", address, begin.elapsed());

    Ok(stream)
}

fn tls_handshake<S: Read + Write + Send + 'static>(
    sock: S,
    host: &str,
    skip_verify: bool,
) -> Result<StreamOwned<ClientConnection, S>, TestError> {
    let connector = if skip_verify {
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(BlindVerifier))
            .with_no_client_auth();
        RustlsConnector::from(Arc::new(config))
    } else {
        RustlsConnector::new_with_native_certs()
            .unwrap_or_else(|_| RustlsConnector::new_with_webpki_roots_certs())
    };

    let begin = Instant::now();
    let mut stream = match connector.connect(host, sock) {
        Ok(stream) => stream,
        Err(HandshakeError::Failure(e)) => {
            return Err(TestError::dial(format!("TLS handshake failed: {}", e), e.kind())
                .with_source(e))
        }
        Err(HandshakeError::WouldBlock(_)) => {
            return Err(TestError::dial(
                "TLS handshake timed out",
                io::ErrorKind::TimedOut,
            ))
        }
    };
    stream
        .flush()
        .map_err(|e| TestError::dial(format!("TLS handshake failed: {}", e), e.kind()))?;
    debug!("TLS handshake took {:?}", begin.elapsed());

    Ok(stream)
}

/// Accepts any server certificate. Only used with `skip_tls_verify`.
#[derive(Debug)]
struct BlindVerifier;

impl ServerCertVerifier for BlindVerifier {
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
