use std::io;

use thiserror::Error;

/// Reason codes carried by `SSH_MSG_DISCONNECT` (RFC 4253 §11.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum DisconnectReason {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    Reserved = 4,
    MacError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// Reason codes carried by `SSH_MSG_CHANNEL_OPEN_FAILURE` (RFC 4254 §5.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum OpenFailureReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

/// Errors raised by the connection layer.
///
/// Per-method auth failures never surface here; they are converted into
/// `USERAUTH_FAILURE` replies at the method boundary. Everything else
/// propagates to the session driver, which disconnects on protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A decode would read past the written portion of a buffer, or a
    /// declared string length exceeds the bytes available.
    #[error("malformed wire data: {0}")]
    Encoding(&'static str),

    /// The peer violated the protocol; the session is disconnected with
    /// reason `PROTOCOL_ERROR`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure to open a channel, carrying the RFC 4254 §5.1 reason code.
    #[error("open channel failed ({code}): {message}")]
    OpenChannel {
        /// Numeric reason code to echo in `CHANNEL_OPEN_FAILURE`.
        code: u32,
        /// Human-readable description.
        message: String,
    },

    /// An SFTP request completed with a non-OK `SSH_FX_*` substatus.
    #[error("sftp error ({code}): {message}")]
    Sftp {
        /// The `SSH_FX_*` substatus.
        code: u32,
        /// Server-supplied message.
        message: String,
    },

    /// The channel (or the whole session) is already closed.
    #[error("the connection was terminated")]
    Disconnected,

    /// Authentication cannot proceed (too many attempts, changed
    /// username/service tuple, unknown method state).
    #[error("authentication error: {0}")]
    Auth(String),

    /// A file violates the strict permission policy (authorized_keys
    /// files must be at most 0600, their directory at most 0700).
    #[error("permissions too open on {path}: mode {mode:o}")]
    FileSystem {
        /// Offending path.
        path: String,
        /// The mode bits found on it.
        mode: u32,
    },

    /// Malformed configuration input (host config, authorized_keys,
    /// auth method lists).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Underlying transport or socket failure; fatal to the session.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn unknown_channel(cmd: u8, id: u32) -> Self {
        Error::Protocol(format!("Received message {} on unknown channel {}", cmd, id))
    }

    /// The disconnect reason a session driver should use for this error,
    /// if the error is fatal to the session.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            Error::Protocol(_) | Error::Encoding(_) => Some(DisconnectReason::ProtocolError),
            Error::Auth(_) => Some(DisconnectReason::ProtocolError),
            Error::Io(_) => Some(DisconnectReason::ConnectionLost),
            _ => None,
        }
    }
}

/// Typedef just like `std::io::Result`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_sanity() {
        let e = Error::Encoding("underrun");
        assert!(!format!("{}", e).is_empty());
        assert_eq!(e.disconnect_reason(), Some(DisconnectReason::ProtocolError));

        let e = Error::OpenChannel {
            code: OpenFailureReason::UnknownChannelType as u32,
            message: "no factory".into(),
        };
        assert!(format!("{}", e).contains("no factory"));
        assert_eq!(e.disconnect_reason(), None);

        let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(e.disconnect_reason(), Some(DisconnectReason::ConnectionLost));
    }
}
