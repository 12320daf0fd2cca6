use mumble_protocol_2x::control::msgs;
use std::fmt;

/// Why a connection ended, mirroring the protocol's disconnect taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server explicitly refused the handshake or authentication.
    Reject,
    /// The client was kicked or banned mid-session.
    UserRemove,
    /// Transport-level failure: socket error, TLS failure, timeout.
    ConnectionError,
    /// Caller-contract violation, e.g. using the session API while disconnected.
    OtherError,
}

#[derive(Clone, Debug)]
pub struct SessionError {
    message: String,
    reason: DisconnectReason,
    reject: Option<Box<msgs::Reject>>,
    user_remove: Option<Box<msgs::UserRemove>>,
}

impl SessionError {
    pub fn new(message: impl Into<String>, reason: DisconnectReason) -> Self {
        Self {
            message: message.into(),
            reason,
            reject: None,
            user_remove: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(message, DisconnectReason::ConnectionError)
    }

    pub fn rejected(reject: msgs::Reject) -> Self {
        let reason = reject.reason.clone().unwrap_or_default();
        Self {
            message: format!("Rejected: {reason}"),
            reason: DisconnectReason::Reject,
            reject: Some(Box::new(reject)),
            user_remove: None,
        }
    }

    pub fn removed(user_remove: msgs::UserRemove) -> Self {
        let verb = if user_remove.ban.unwrap_or(false) {
            "Banned"
        } else {
            "Kicked"
        };
        let reason = user_remove.reason.clone().unwrap_or_default();
        Self {
            message: format!("{verb}: {reason}"),
            reason: DisconnectReason::UserRemove,
            reject: None,
            user_remove: Some(Box::new(user_remove)),
        }
    }

    pub fn not_connected() -> Self {
        Self::new("not connected to a server", DisconnectReason::OtherError)
    }

    pub fn not_synchronized() -> Self {
        Self::new(
            "session is not synchronized with the server",
            DisconnectReason::OtherError,
        )
    }

    pub fn reason(&self) -> DisconnectReason {
        self.reason
    }

    /// The structured reject payload, present when `reason` is `Reject`.
    pub fn reject(&self) -> Option<&msgs::Reject> {
        self.reject.as_deref()
    }

    /// The structured kick/ban payload, present when `reason` is `UserRemove`.
    pub fn user_remove(&self) -> Option<&msgs::UserRemove> {
        self.user_remove.as_deref()
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SessionError {}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        // Malformed frames are a broken peer or a broken client, not a
        // transient loss; retrying the connection cannot help.
        let reason = match &error {
            TransportError::Protocol(_) => DisconnectReason::OtherError,
            _ => DisconnectReason::ConnectionError,
        };
        SessionError::new(error.to_string(), reason)
    }
}

#[derive(Debug)]
pub enum TransportError {
    Disconnected,
    Protocol(String),
    Io(String),
    InvalidConfig(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Disconnected => write!(f, "transport disconnected"),
            TransportError::Protocol(message) => write!(f, "protocol error: {message}"),
            TransportError::Io(message) => write!(f, "io error: {message}"),
            TransportError::InvalidConfig(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}
