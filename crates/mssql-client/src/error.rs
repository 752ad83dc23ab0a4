//! Client error types.
//!
//! Errors fall into the classes reported by [`Error::class`]. Connection
//! level failures ([`ErrorClass::Protocol`], [`ErrorClass::Login`]) leave
//! the connection unusable; request level failures are reported to the
//! request that caused them and the connection carries on.

use mssql_auth::{AuthError, EncryptionError};
use mssql_codec::CodecError;
use tds_protocol::{ProtocolError, ServerMessage};
use thiserror::Error;

use crate::state::InvalidTransition;

/// Code attached to local parameter validation failures.
pub const EPARAM: &str = "EPARAM";
/// Code attached to requests cancelled by the caller.
pub const ECANCEL: &str = "ECANCEL";
/// Code attached to requests that ran past their timeout.
pub const ETIMEOUT: &str = "ETIMEOUT";
/// Code attached to operations issued in the wrong connection state.
pub const EINVALIDSTATE: &str = "EINVALIDSTATE";

/// Login error numbers worth retrying: database starting up, failover in
/// progress, service busy or throttled.
const TRANSIENT_LOGIN_ERRORS: [i32; 8] = [4060, 40197, 40501, 40613, 49918, 49919, 49920, 4221];

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed packet or token stream. The connection is closed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication or login negotiation failed.
    #[error("login failed: {message}")]
    Login {
        /// Description of the failure.
        message: String,
        /// The server's error token, when the server rejected the login.
        server_error: Option<ServerError>,
    },

    /// A request failed; the connection remains usable.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Always Encrypted could not protect or recover a value.
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    /// The request was cancelled and the server acknowledged it.
    #[error("{message}")]
    Cancelled {
        /// Message reported to the caller.
        message: String,
    },

    /// Transport I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A request, login or cancellation ran past its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A request is already executing on this connection.
    #[error("requests can only be made in the LoggedIn state, not the {state} state")]
    Busy {
        /// State the connection was in.
        state: &'static str,
    },

    /// An event arrived that the connection state does not accept.
    #[error(transparent)]
    State(#[from] InvalidTransition),

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A value did not fit its declared type.
    #[error("type error: {0}")]
    Type(#[from] mssql_types::TypeError),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wire grammar violation.
    Protocol,
    /// Login or negotiation failure.
    Login,
    /// Request-scoped failure.
    Request,
    /// Encryption failure.
    Encryption,
    /// Cancellation or timeout of a request.
    Cancellation,
    /// Transport failure.
    Transport,
    /// Local misuse or configuration.
    Usage,
}

impl Error {
    /// The cancellation error reported when the server acknowledges an attention.
    pub(crate) fn cancelled() -> Self {
        Self::Cancelled {
            message: "Canceled.".into(),
        }
    }

    /// Which class this error belongs to.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Protocol(_) => ErrorClass::Protocol,
            Self::Login { .. } => ErrorClass::Login,
            Self::Request(_) | Self::Type(_) => ErrorClass::Request,
            Self::Encryption(_) => ErrorClass::Encryption,
            Self::Cancelled { .. } | Self::Timeout(_) => ErrorClass::Cancellation,
            Self::Io(_) | Self::ConnectionClosed => ErrorClass::Transport,
            Self::Config(_) | Self::Busy { .. } | Self::State(_) => ErrorClass::Usage,
        }
    }

    /// Whether the connection can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_) | Self::Login { .. } | Self::Io(_) | Self::ConnectionClosed => true,
            Self::Request(RequestError::Server(e)) => e.is_fatal(),
            _ => false,
        }
    }

    /// Whether retrying the operation on a fresh connection may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::Timeout(_) => true,
            Self::Login {
                server_error: Some(e),
                ..
            } => TRANSIENT_LOGIN_ERRORS.contains(&e.number),
            _ => false,
        }
    }

    /// Short machine-readable code for local request failures.
    #[must_use]
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Request(RequestError::Local { code, .. }) => Some(code),
            Self::Cancelled { .. } => Some(ECANCEL),
            Self::Timeout(_) => Some(ETIMEOUT),
            Self::Busy { .. } | Self::State(_) => Some(EINVALIDSTATE),
            _ => None,
        }
    }

    /// The server error behind this error, if any.
    #[must_use]
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Request(RequestError::Server(e)) => Some(e),
            Self::Login { server_error, .. } => server_error.as_ref(),
            _ => None,
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        self.server_error().is_some_and(|e| e.number == number)
    }

    /// Severity of the server error, 0 to 25.
    #[must_use]
    pub fn severity(&self) -> Option<u8> {
        self.server_error().map(|e| e.class)
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Protocol(p) => Self::Protocol(p),
            CodecError::Io(io) => Self::Io(io),
            CodecError::ConnectionClosed { .. } => Self::ConnectionClosed,
            other @ CodecError::PacketTooLarge { .. } => {
                Self::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, other.to_string()))
            }
        }
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Self::Login {
            message: e.to_string(),
            server_error: None,
        }
    }
}

/// A failure scoped to one request.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The server sent an ERROR token.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The request was rejected before anything was sent, or the server's
    /// reply did not fit the request.
    #[error("{message}")]
    Local {
        /// One of the `E*` codes in this module.
        code: &'static str,
        /// Description of the failure.
        message: String,
    },
}

impl RequestError {
    /// A parameter validation failure.
    pub(crate) fn param(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::Local {
            code: EPARAM,
            message: format!("Validation failed for parameter '{name}'. {reason}"),
        }
    }

    /// A request issued in a state that does not allow it.
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::Local {
            code: EINVALIDSTATE,
            message: message.into(),
        }
    }
}

/// An ERROR token from the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error {number}: {message}")]
pub struct ServerError {
    /// Error number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity, 0 to 25. 20 and above terminate the connection.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name, when reported.
    pub server: Option<String>,
    /// Procedure name, when the error came from one.
    pub procedure: Option<String>,
    /// Line number in the batch or procedure.
    pub line: u32,
}

impl ServerError {
    /// Whether the server closes the connection after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class >= 20
    }
}

impl From<ServerMessage> for ServerError {
    fn from(msg: ServerMessage) -> Self {
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        Self {
            number: msg.number,
            state: msg.state,
            class: msg.class,
            message: msg.message,
            server: non_empty(msg.server),
            procedure: non_empty(msg.procedure),
            line: u32::try_from(msg.line).unwrap_or_default(),
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn server_message(number: i32, class: u8) -> ServerMessage {
        ServerMessage {
            number,
            state: 1,
            class,
            message: "boom".into(),
            server: "srv".into(),
            procedure: String::new(),
            line: 3,
        }
    }

    #[test]
    fn test_server_message_conversion() {
        let err = ServerError::from(server_message(208, 16));
        assert_eq!(err.server.as_deref(), Some("srv"));
        assert_eq!(err.procedure, None);
        assert_eq!(err.line, 3);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_classes_and_codes() {
        let cancelled = Error::cancelled();
        assert_eq!(cancelled.to_string(), "Canceled.");
        assert_eq!(cancelled.code(), Some(ECANCEL));
        assert_eq!(cancelled.class(), ErrorClass::Cancellation);

        let param = Error::from(RequestError::param("a", "value out of range for int"));
        assert_eq!(param.code(), Some(EPARAM));
        assert_eq!(
            param.to_string(),
            "Validation failed for parameter 'a'. value out of range for int"
        );
        assert!(!param.is_fatal());

        let busy = Error::Busy { state: "Executing" };
        assert_eq!(busy.code(), Some(EINVALIDSTATE));
        assert_eq!(busy.class(), ErrorClass::Usage);
    }

    #[test]
    fn test_fatal_and_transient() {
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(Error::Protocol(ProtocolError::TrailingBytes(1)).is_fatal());

        let severe = Error::from(RequestError::Server(server_message(1, 20).into()));
        assert!(severe.is_fatal());
        assert!(severe.is_server_error(1));
        assert_eq!(severe.severity(), Some(20));

        let throttled = Error::Login {
            message: "busy".into(),
            server_error: Some(server_message(40501, 14).into()),
        };
        assert!(throttled.is_transient());

        let bad_password = Error::Login {
            message: "denied".into(),
            server_error: Some(server_message(18456, 14).into()),
        };
        assert!(!bad_password.is_transient());
    }

    #[test]
    fn test_codec_error_mapping() {
        let closed = Error::from(CodecError::ConnectionClosed { partial: true });
        assert!(matches!(closed, Error::ConnectionClosed));
        let proto = Error::from(CodecError::Protocol(ProtocolError::TrailingBytes(2)));
        assert!(matches!(proto, Error::Protocol(_)));
    }
}
