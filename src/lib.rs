//! Client-side engine for the Mumble voice-chat protocol.
//!
//! The crate owns everything between raw sockets and a host application:
//! the TLS control channel and encrypted datagram path, the channel/user
//! model, Opus capture and playback, and a single-threaded [`Session`]
//! that ties them together and fans events out to observers.

pub mod audio;
pub mod error;
pub mod model;
pub mod net;
pub mod protocol;
pub mod session;

pub use error::{DisconnectReason, SessionError, TransportError};
pub use session::{
    ChatMessage, ConnectionState, Session, SessionConfig, SessionEvent, SessionObserver,
    VoiceTargetMode,
};

/// Protocol version sent during the handshake, packed major.minor.patch.
pub const PROTOCOL_VERSION: u32 = (1 << 16) | (2 << 8) | 19;

/// One-time process-wide crypto initialization. Safe to call repeatedly;
/// hosts that never touch TLS can skip it entirely.
pub fn init_crypto() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        #[cfg(not(feature = "coverage"))]
        openssl::init();
    });
}

#[cfg(test)]
mod tests {
    use super::{init_crypto, PROTOCOL_VERSION};

    /// The advertised version decodes to 1.2.19.
    #[test]
    fn protocol_version_packs_major_minor_patch() {
        assert_eq!(PROTOCOL_VERSION >> 16, 1);
        assert_eq!((PROTOCOL_VERSION >> 8) & 0xff, 2);
        assert_eq!(PROTOCOL_VERSION & 0xff, 19);
    }

    /// Initialization is idempotent.
    #[test]
    fn init_crypto_is_repeatable() {
        init_crypto();
        init_crypto();
    }
}
