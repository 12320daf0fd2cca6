use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mumble_protocol_2x::control::{msgs, ControlPacket};
use mumble_protocol_2x::crypt::ClientCryptState;
use mumble_protocol_2x::voice::{Clientbound, Serverbound, VoicePacket};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{SessionError, TransportError};
use crate::net::control::{ConnectError, RecvOutcome, StreamConnector};

pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Datagram pings to leave unanswered before falling back to tunneling
/// voice through the control stream.
const MAX_MISSED_DATAGRAM_PINGS: u64 = 3;

/// Everything the owning session needs to know about the wire, in the
/// order it happened.
pub enum ConnectionEvent {
    /// The control stream is up and authenticable.
    Established,
    /// Certificate verification failed; carries the presented DER chain.
    HandshakeFailed(Vec<Vec<u8>>),
    Control(ControlPacket<Clientbound>),
    Datagram(VoicePacket<Clientbound>),
    /// Terminal. `None` for a local disconnect, the error otherwise.
    Disconnected(Option<SessionError>),
}

#[derive(Default)]
pub struct ConnectionStats {
    pub control_sent: AtomicU64,
    pub control_received: AtomicU64,
    pub datagrams_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    /// Round-trip times in microseconds; zero until the first pong.
    tcp_latency_micros: AtomicU64,
    udp_latency_micros: AtomicU64,
}

impl ConnectionStats {
    pub fn tcp_latency_ms(&self) -> Option<f32> {
        match self.tcp_latency_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(micros as f32 / 1000.0),
        }
    }

    pub fn udp_latency_ms(&self) -> Option<f32> {
        match self.udp_latency_micros.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(micros as f32 / 1000.0),
        }
    }
}

/// Facts the server states about itself during the handshake.
#[derive(Clone, Debug, Default)]
pub struct ServerInfo {
    pub session: Option<u32>,
    pub max_bandwidth: Option<u32>,
    pub welcome_text: Option<String>,
    pub version: Option<u32>,
    pub release: Option<String>,
    pub os: Option<String>,
    pub max_message_length: Option<u32>,
    pub max_users: Option<u32>,
}

struct UdpState {
    socket: UdpSocket,
    crypt: Mutex<ClientCryptState>,
    /// True once a datagram pong proves the path works both ways.
    good: AtomicBool,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
}

/// Owns the network threads for one connection attempt. The control
/// thread multiplexes reads, outbox drains and pings over a stream with a
/// short read timeout; a second thread drains the datagram socket once
/// crypt material arrives. Dropped packets on the datagram path are never
/// an error, the voice path just degrades to the tunnel.
pub struct ConnectionManager {
    events_tx: Sender<ConnectionEvent>,
    events_rx: Receiver<ConnectionEvent>,
    outbox_tx: Sender<ControlPacket<Serverbound>>,
    shutdown: Arc<AtomicBool>,
    link_shutdown: Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>>,
    udp: Arc<Mutex<Option<Arc<UdpState>>>>,
    force_tcp: AtomicBool,
    stats: Arc<ConnectionStats>,
    connected: Arc<AtomicBool>,
    synchronized: AtomicBool,
    server_info: Arc<Mutex<ServerInfo>>,
    epoch: Instant,
}

impl ConnectionManager {
    /// Starts a connection attempt in the background. Progress arrives
    /// through `poll_event`; the attempt ends with exactly one
    /// `Disconnected` event.
    pub fn connect(
        connector: Arc<dyn StreamConnector>,
        host: String,
        port: u16,
        force_tcp: bool,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let (outbox_tx, outbox_rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let link_shutdown: Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>> =
            Arc::new(Mutex::new(None));
        let udp: Arc<Mutex<Option<Arc<UdpState>>>> = Arc::new(Mutex::new(None));
        let stats = Arc::new(ConnectionStats::default());
        let connected = Arc::new(AtomicBool::new(false));
        let server_info = Arc::new(Mutex::new(ServerInfo::default()));
        let epoch = Instant::now();

        let worker = ControlWorker {
            events: events_tx.clone(),
            outbox: outbox_rx,
            shutdown: Arc::clone(&shutdown),
            link_shutdown: Arc::clone(&link_shutdown),
            udp: Arc::clone(&udp),
            stats: Arc::clone(&stats),
            connected: Arc::clone(&connected),
            server_info: Arc::clone(&server_info),
            epoch,
        };
        if let Err(error) = thread::Builder::new()
            .name("control-net".to_string())
            .spawn(move || worker.run(connector, host, port))
        {
            log::error!("failed to spawn control thread: {error}");
            let _ = events_tx.send(ConnectionEvent::Disconnected(Some(
                SessionError::connection("could not start network thread"),
            )));
        }

        Self {
            events_tx,
            events_rx,
            outbox_tx,
            shutdown,
            link_shutdown,
            udp,
            force_tcp: AtomicBool::new(force_tcp),
            stats,
            connected,
            synchronized: AtomicBool::new(false),
            server_info,
            epoch,
        }
    }

    pub fn poll_event(&self, timeout: Duration) -> Option<ConnectionEvent> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn send_control(&self, packet: ControlPacket<Serverbound>) -> Result<(), SessionError> {
        self.stats.control_sent.fetch_add(1, Ordering::Relaxed);
        self.outbox_tx
            .send(packet)
            .map_err(|_| SessionError::connection("control channel closed"))
    }

    /// Ships a voice packet over the datagram path when it is proven
    /// working, through the control tunnel otherwise.
    pub fn send_voice(&self, packet: VoicePacket<Serverbound>) -> Result<(), SessionError> {
        if !self.force_tcp.load(Ordering::Relaxed) {
            let udp = self.udp.lock().ok().and_then(|state| state.clone());
            if let Some(udp) = udp {
                if udp.good.load(Ordering::Relaxed) {
                    return send_datagram(&udp, packet, &self.stats);
                }
            }
        }
        self.send_control(ControlPacket::UDPTunnel(Box::new(packet)))
    }

    /// Brings up the datagram path with the key material the server
    /// handed out. The path carries no voice until a pong comes back.
    pub fn enable_datagram(
        &self,
        key: [u8; 16],
        encrypt_nonce: [u8; 16],
        decrypt_nonce: [u8; 16],
        remote: SocketAddr,
    ) -> Result<(), TransportError> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal address")
        } else {
            "[::]:0".parse().expect("literal address")
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(remote)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        let state = Arc::new(UdpState {
            socket,
            crypt: Mutex::new(ClientCryptState::new_from(
                key,
                encrypt_nonce,
                decrypt_nonce,
            )),
            good: AtomicBool::new(false),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
        });

        if let Ok(mut slot) = self.udp.lock() {
            *slot = Some(Arc::clone(&state));
        }

        let reader = DatagramWorker {
            state,
            events: self.events_tx.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stats: Arc::clone(&self.stats),
            epoch: self.epoch,
        };
        thread::Builder::new()
            .name("datagram-net".to_string())
            .spawn(move || reader.run())
            .map_err(|error| TransportError::Io(format!("udp thread spawn failed: {error}")))?;
        Ok(())
    }

    pub fn set_force_tcp(&self, force_tcp: bool) {
        self.force_tcp.store(force_tcp, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Synchronization is an application-level fact; the orchestrator
    /// reports it once the server sync packet has been processed.
    pub fn set_synchronized(&self, synchronized: bool) {
        self.synchronized.store(synchronized, Ordering::Relaxed);
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::Relaxed)
    }

    /// Snapshot of what the server reported about itself so far.
    pub fn server_info(&self) -> ServerInfo {
        self.server_info
            .lock()
            .map(|info| info.clone())
            .unwrap_or_default()
    }

    pub fn session(&self) -> Option<u32> {
        self.server_info().session
    }

    pub fn max_bandwidth(&self) -> Option<u32> {
        self.server_info().max_bandwidth
    }

    /// Re-authenticates with a new token set without restarting the
    /// connection.
    pub fn send_access_tokens(&self, tokens: &[String]) -> Result<(), SessionError> {
        let mut auth = msgs::Authenticate::new();
        auth.tokens = tokens.to_vec();
        self.send_control(ControlPacket::Authenticate(Box::new(auth)))
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Idempotent. Unblocks the network threads; the control thread
    /// answers with a final `Disconnected(None)`.
    pub fn disconnect(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Ok(mut slot) = self.link_shutdown.lock() {
            if let Some(shutdown) = slot.take() {
                shutdown();
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn now_micros(epoch: Instant) -> u64 {
    epoch.elapsed().as_micros() as u64
}

fn send_datagram(
    udp: &UdpState,
    packet: VoicePacket<Serverbound>,
    stats: &ConnectionStats,
) -> Result<(), SessionError> {
    let mut out = BytesMut::with_capacity(256);
    {
        let mut crypt = udp
            .crypt
            .lock()
            .map_err(|_| SessionError::connection("crypt state poisoned"))?;
        crypt
            .encode(packet, &mut out)
            .map_err(|error| SessionError::connection(format!("datagram encrypt failed: {error}")))?;
    }
    udp.socket
        .send(&out)
        .map_err(|error| SessionError::connection(format!("datagram send failed: {error}")))?;
    stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

struct ControlWorker {
    events: Sender<ConnectionEvent>,
    outbox: Receiver<ControlPacket<Serverbound>>,
    shutdown: Arc<AtomicBool>,
    link_shutdown: Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>>,
    udp: Arc<Mutex<Option<Arc<UdpState>>>>,
    stats: Arc<ConnectionStats>,
    connected: Arc<AtomicBool>,
    server_info: Arc<Mutex<ServerInfo>>,
    epoch: Instant,
}

impl ControlWorker {
    fn run(self, connector: Arc<dyn StreamConnector>, host: String, port: u16) {
        let link = match connector.connect(&host, port) {
            Ok(link) => link,
            Err(ConnectError::HandshakeFailed(chain)) => {
                let _ = self.events.send(ConnectionEvent::HandshakeFailed(chain));
                let _ = self.events.send(ConnectionEvent::Disconnected(Some(
                    SessionError::new("tls handshake failed", crate::error::DisconnectReason::OtherError),
                )));
                return;
            }
            Err(ConnectError::Transport(error)) => {
                let _ = self
                    .events
                    .send(ConnectionEvent::Disconnected(Some(SessionError::from(error))));
                return;
            }
        };

        let mut stream = link.stream;
        if let Ok(mut slot) = self.link_shutdown.lock() {
            *slot = Some(link.shutdown);
        }
        if self.shutdown.load(Ordering::Relaxed) {
            // Raced with a disconnect that landed mid-dial.
            let _ = self.events.send(ConnectionEvent::Disconnected(None));
            return;
        }
        self.connected.store(true, Ordering::Relaxed);
        let _ = self.events.send(ConnectionEvent::Established);

        let mut last_ping = Instant::now();
        let error = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break None;
            }

            while let Ok(packet) = self.outbox.try_recv() {
                if let Err(error) = stream.send(packet) {
                    log::warn!("control send failed: {error}");
                }
            }

            if last_ping.elapsed() >= PING_INTERVAL {
                last_ping = Instant::now();
                self.send_pings(&mut *stream);
            }

            match stream.recv() {
                Ok(RecvOutcome::Packet(packet)) => self.handle_packet(packet),
                Ok(RecvOutcome::Idle) => {}
                Ok(RecvOutcome::Eof) => {
                    break Some(SessionError::connection("server closed the connection"));
                }
                Err(error) => break Some(SessionError::from(error)),
            }
        };

        let error = if self.shutdown.load(Ordering::Relaxed) {
            None
        } else {
            error
        };
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.events.send(ConnectionEvent::Disconnected(error));
    }

    fn send_pings(&self, stream: &mut dyn crate::net::control::ControlStream) {
        let mut ping = msgs::Ping::new();
        ping.timestamp = Some(now_micros(self.epoch));
        if let Err(error) = stream.send(ControlPacket::Ping(Box::new(ping))) {
            log::warn!("control ping failed: {error}");
        }

        let udp = self.udp.lock().ok().and_then(|state| state.clone());
        if let Some(udp) = udp {
            let missed = udp
                .pings_sent
                .load(Ordering::Relaxed)
                .saturating_sub(udp.pongs_received.load(Ordering::Relaxed));
            if missed >= MAX_MISSED_DATAGRAM_PINGS && udp.good.swap(false, Ordering::Relaxed) {
                log::info!("datagram path lost, voice falls back to the tunnel");
            }
            let ping: VoicePacket<Serverbound> = VoicePacket::Ping {
                timestamp: now_micros(self.epoch),
            };
            if send_datagram(&udp, ping, &self.stats).is_ok() {
                udp.pings_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn handle_packet(&self, packet: ControlPacket<Clientbound>) {
        self.stats.control_received.fetch_add(1, Ordering::Relaxed);
        match packet {
            ControlPacket::Ping(ping) => {
                if let Some(sent) = ping.timestamp {
                    let rtt = now_micros(self.epoch).saturating_sub(sent).max(1);
                    self.stats
                        .tcp_latency_micros
                        .store(rtt, Ordering::Relaxed);
                }
            }
            ControlPacket::UDPTunnel(voice) => {
                let _ = self.events.send(ConnectionEvent::Datagram(*voice));
            }
            other => {
                self.capture_server_info(&other);
                let _ = self.events.send(ConnectionEvent::Control(other));
            }
        }
    }

    /// Records handshake facts before the packet travels on.
    fn capture_server_info(&self, packet: &ControlPacket<Clientbound>) {
        let mut info = match self.server_info.lock() {
            Ok(info) => info,
            Err(_) => return,
        };
        match packet {
            ControlPacket::ServerSync(msg) => {
                info.session = msg.session.or(info.session);
                info.max_bandwidth = msg.max_bandwidth.or(info.max_bandwidth);
                info.welcome_text = msg.welcome_text.clone().or(info.welcome_text.take());
            }
            ControlPacket::Version(msg) => {
                info.version = msg.version_v1.or(info.version);
                info.release = msg.release.clone().or(info.release.take());
                info.os = msg.os.clone().or(info.os.take());
            }
            ControlPacket::ServerConfig(msg) => {
                info.max_message_length = msg.message_length.or(info.max_message_length);
                info.max_users = msg.max_users.or(info.max_users);
            }
            _ => {}
        }
    }
}

struct DatagramWorker {
    state: Arc<UdpState>,
    events: Sender<ConnectionEvent>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<ConnectionStats>,
    epoch: Instant,
}

impl DatagramWorker {
    fn run(self) {
        let mut buffer = [0u8; 1024];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let received = match self.state.socket.recv(&mut buffer) {
                Ok(received) => received,
                Err(error)
                    if matches!(
                        error.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(error) => {
                    log::warn!("datagram receive failed: {error}");
                    return;
                }
            };

            let mut bytes = BytesMut::from(&buffer[..received]);
            let decoded = match self.state.crypt.lock() {
                Ok(mut crypt) => crypt.decode(&mut bytes),
                Err(_) => return,
            };
            match decoded {
                Ok(Some(VoicePacket::Ping { timestamp })) => {
                    self.state.good.store(true, Ordering::Relaxed);
                    self.state.pongs_received.fetch_add(1, Ordering::Relaxed);
                    let rtt = now_micros(self.epoch).saturating_sub(timestamp).max(1);
                    self.stats.udp_latency_micros.store(rtt, Ordering::Relaxed);
                }
                Ok(Some(packet)) => {
                    self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
                    let _ = self.events.send(ConnectionEvent::Datagram(packet));
                }
                Ok(None) => {}
                Err(error) => {
                    // Stray or replayed datagrams are dropped silently.
                    log::debug!("undecryptable datagram: {error}");
                }
            }
        }
    }
}
