pub mod connection;
pub mod control;
pub mod reconnect;

pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionStats, ServerInfo, PING_INTERVAL,
};
#[cfg(not(feature = "coverage"))]
pub use control::TlsStreamConnector;
pub use control::{
    ConnectError, ControlLink, ControlStream, FramedStream, NoopStreamConnector, RecvOutcome,
    StreamConnector, TlsOptions,
};
pub use reconnect::{ReconnectDecision, ReconnectionController, RECONNECT_DELAY};
