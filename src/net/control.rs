use std::fmt;

use bytes::BytesMut;
use mumble_protocol_2x::control::{ClientControlCodec, ControlPacket};
use mumble_protocol_2x::voice::{Clientbound, Serverbound};
#[cfg(not(feature = "coverage"))]
use openssl::pkey::PKey;
#[cfg(not(feature = "coverage"))]
use openssl::ssl::{HandshakeError, SslConnector, SslMethod, SslVerifyMode};
#[cfg(not(feature = "coverage"))]
use openssl::x509::X509;
#[cfg(not(feature = "coverage"))]
use std::net::{Shutdown, TcpStream};
#[cfg(not(feature = "coverage"))]
use std::sync::{Arc, Mutex};
#[cfg(not(feature = "coverage"))]
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// TLS material for the control channel. All fields optional; an empty
/// value set means an anonymous client trusting the system roots.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    /// PEM bundle holding the client certificate and its private key.
    pub client_certificate_pem: Option<Vec<u8>>,
    pub certificate_password: Option<String>,
    /// Extra trust roots appended to the system store.
    pub ca_file: Option<String>,
    /// Accept any server certificate. Connection data is still encrypted.
    pub insecure: bool,
}

/// Why a connection attempt failed before the stream became usable.
#[derive(Debug)]
pub enum ConnectError {
    /// Certificate verification failed. Carries the DER-encoded chain the
    /// server presented so callers can surface a trust decision.
    HandshakeFailed(Vec<Vec<u8>>),
    Transport(TransportError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::HandshakeFailed(chain) => {
                write!(f, "tls handshake failed ({} certificates seen)", chain.len())
            }
            ConnectError::Transport(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<TransportError> for ConnectError {
    fn from(error: TransportError) -> Self {
        ConnectError::Transport(error)
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(error: std::io::Error) -> Self {
        ConnectError::Transport(TransportError::from(error))
    }
}

/// One non-blocking-ish read step on the control stream.
#[derive(Debug)]
pub enum RecvOutcome {
    Packet(ControlPacket<Clientbound>),
    /// Nothing decodable arrived within the read timeout.
    Idle,
    /// The peer closed the stream.
    Eof,
}

pub trait ControlStream {
    fn send(&mut self, packet: ControlPacket<Serverbound>) -> Result<(), TransportError>;
    fn recv(&mut self) -> Result<RecvOutcome, TransportError>;
}

/// A connected control channel plus a handle that unblocks any thread
/// sitting in a read on it.
pub struct ControlLink {
    pub stream: Box<dyn ControlStream + Send>,
    pub shutdown: Box<dyn Fn() + Send + Sync>,
}

pub trait StreamConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<ControlLink, ConnectError>;
}

/// Frames a blocking byte stream with the length-prefixed control codec.
/// The underlying stream should carry a read timeout so `recv` yields
/// `Idle` periodically instead of parking forever.
pub struct FramedStream<S> {
    stream: S,
    codec: ClientControlCodec,
    read_buf: BytesMut,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            codec: ClientControlCodec::new(),
            read_buf: BytesMut::with_capacity(4096),
        }
    }
}

impl<S: std::io::Read + std::io::Write> ControlStream for FramedStream<S> {
    fn send(&mut self, packet: ControlPacket<Serverbound>) -> Result<(), TransportError> {
        let mut out = BytesMut::with_capacity(512);
        self.codec
            .encode(packet, &mut out)
            .map_err(|error| TransportError::Protocol(error.to_string()))?;
        self.stream.write_all(&out)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<RecvOutcome, TransportError> {
        loop {
            // A frame the codec cannot parse poisons the stream; there is
            // no resynchronization point in the wire format.
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(packet)) => return Ok(RecvOutcome::Packet(packet)),
                Ok(None) => {}
                Err(error) => return Err(TransportError::Protocol(error.to_string())),
            }

            let mut buffer = [0u8; 4096];
            match self.stream.read(&mut buffer) {
                Ok(0) => return Ok(RecvOutcome::Eof),
                Ok(bytes_read) => self.read_buf.extend_from_slice(&buffer[..bytes_read]),
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(RecvOutcome::Idle);
                }
                Err(error) => return Err(TransportError::from(error)),
            }
        }
    }
}

/// Connector that never reaches a server. Sends are swallowed and reads
/// report an immediately closed stream.
#[derive(Debug, Default)]
pub struct NoopStreamConnector;

struct NoopStream;

impl ControlStream for NoopStream {
    fn send(&mut self, _packet: ControlPacket<Serverbound>) -> Result<(), TransportError> {
        Ok(())
    }

    fn recv(&mut self) -> Result<RecvOutcome, TransportError> {
        Ok(RecvOutcome::Eof)
    }
}

impl StreamConnector for NoopStreamConnector {
    fn connect(&self, _host: &str, _port: u16) -> Result<ControlLink, ConnectError> {
        Ok(ControlLink {
            stream: Box::new(NoopStream),
            shutdown: Box::new(|| {}),
        })
    }
}

/// Read timeout on the raw socket. Bounds how long the network thread can
/// go without draining its outbox or sending a ping.
#[cfg(not(feature = "coverage"))]
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[cfg(not(feature = "coverage"))]
pub struct TlsStreamConnector {
    options: TlsOptions,
}

#[cfg(not(feature = "coverage"))]
impl TlsStreamConnector {
    pub fn new(options: TlsOptions) -> Self {
        Self { options }
    }

    fn build_connector(
        &self,
        seen_chain: Arc<Mutex<Vec<Vec<u8>>>>,
    ) -> Result<SslConnector, TransportError> {
        let mut builder = SslConnector::builder(SslMethod::tls())
            .map_err(|err| TransportError::Io(format!("tls connector init failed: {err}")))?;

        if let Some(pem) = &self.options.client_certificate_pem {
            let certificate = X509::from_pem(pem)
                .map_err(|err| TransportError::InvalidConfig(format!("bad certificate: {err}")))?;
            let key = match &self.options.certificate_password {
                Some(password) => PKey::private_key_from_pem_passphrase(pem, password.as_bytes()),
                None => PKey::private_key_from_pem(pem),
            }
            .map_err(|err| TransportError::InvalidConfig(format!("bad private key: {err}")))?;
            builder
                .set_certificate(&certificate)
                .and_then(|_| builder.set_private_key(&key))
                .and_then(|_| builder.check_private_key())
                .map_err(|err| {
                    TransportError::InvalidConfig(format!("certificate rejected: {err}"))
                })?;
        }

        if let Some(ca_file) = &self.options.ca_file {
            builder
                .set_ca_file(ca_file)
                .map_err(|err| TransportError::InvalidConfig(format!("bad ca file: {err}")))?;
        }

        if self.options.insecure {
            builder.set_verify(SslVerifyMode::NONE);
        } else {
            builder.set_verify_callback(SslVerifyMode::PEER, move |ok, ctx| {
                if let Some(chain) = ctx.chain() {
                    let der = chain
                        .iter()
                        .filter_map(|cert| cert.to_der().ok())
                        .collect::<Vec<_>>();
                    if let Ok(mut seen) = seen_chain.lock() {
                        *seen = der;
                    }
                }
                ok
            });
        }

        Ok(builder.build())
    }
}

#[cfg(not(feature = "coverage"))]
impl StreamConnector for TlsStreamConnector {
    fn connect(&self, host: &str, port: u16) -> Result<ControlLink, ConnectError> {
        let tcp = TcpStream::connect((host, port))?;
        tcp.set_nodelay(true)?;
        let raw = tcp.try_clone()?;

        let seen_chain = Arc::new(Mutex::new(Vec::new()));
        let connector = self.build_connector(Arc::clone(&seen_chain))?;
        let tls = connector.connect(host, tcp).map_err(|err| match err {
            HandshakeError::SetupFailure(cause) => ConnectError::Transport(TransportError::Io(
                format!("tls setup failed: {cause}"),
            )),
            HandshakeError::Failure(_) | HandshakeError::WouldBlock(_) => {
                let chain = seen_chain.lock().map(|seen| seen.clone()).unwrap_or_default();
                ConnectError::HandshakeFailed(chain)
            }
        })?;
        tls.get_ref().set_read_timeout(Some(READ_TIMEOUT))?;

        Ok(ControlLink {
            stream: Box::new(FramedStream::new(tls)),
            shutdown: Box::new(move || {
                let _ = raw.shutdown(Shutdown::Both);
            }),
        })
    }
}
