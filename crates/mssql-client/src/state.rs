//! Connection state machine.
//!
//! ## State Transitions
//!
//! ```text
//! Connecting -> SentPreLogin -> [TlsNegotiation] -> SentLogin -> LoggedIn
//! LoggedIn -> Executing (request issued)
//! Executing -> LoggedIn (final DONE)
//! Executing -> Attention (timeout or cancel; attention sent)
//! Attention -> LoggedIn (DONE with ATTN)
//! LoggedIn -> Closing -> Closed
//! any -> Errored (fatal error; absorbing)
//! ```
//!
//! [`ConnectionState::on`] is a pure transition function. The connection
//! driver feeds it events and acts on the state it returns, so every rule
//! about what may happen when lives here.

use std::fmt;

/// Why an attention was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionReason {
    /// The caller cancelled the request.
    Cancel,
    /// The request timer expired.
    Timeout,
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is being established.
    Connecting,
    /// PRELOGIN sent, waiting for the server's PRELOGIN.
    SentPreLogin,
    /// TLS handshake in progress.
    TlsNegotiation,
    /// LOGIN7 sent, waiting for LOGINACK.
    SentLogin,
    /// Idle and ready for a request.
    LoggedIn,
    /// One request or bulk load is in flight.
    Executing,
    /// An attention was sent; waiting for the DONE that acknowledges it.
    Attention {
        /// What triggered the attention.
        reason: AttentionReason,
    },
    /// Close requested.
    Closing,
    /// Transport closed cleanly.
    Closed,
    /// A fatal error occurred. Nothing leaves this state.
    Errored,
}

/// Something that happened to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The transport is open.
    TransportConnected,
    /// The server's PRELOGIN arrived; `tls` is whether a handshake follows.
    PreLoginResponse {
        /// Whether TLS was negotiated.
        tls: bool,
    },
    /// The TLS handshake finished.
    TlsHandshakeComplete,
    /// LOGINACK arrived.
    LoginAck,
    /// FEATUREEXTACK arrived.
    FeatureExtAck {
        /// Whether column encryption was acknowledged.
        column_encryption: bool,
    },
    /// An ERROR token arrived.
    ErrorToken,
    /// A DONE token arrived.
    DoneToken {
        /// The ATTN bit was set.
        attention_ack: bool,
        /// The MORE bit was clear.
        last: bool,
    },
    /// The caller issued a request.
    RequestIssued,
    /// The packet timer expired.
    Timeout,
    /// The caller asked to cancel.
    CancelRequested,
    /// The transport failed.
    TransportError,
    /// The transport reached end of stream.
    TransportClosed,
    /// The caller asked to close.
    CloseRequested,
}

/// An event that the current state does not accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    /// State the event arrived in.
    pub state: ConnectionState,
    /// The rejected event.
    pub event: Event,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} is not valid in the {} state", self.event, self.state)
    }
}

impl std::error::Error for InvalidTransition {}

impl ConnectionState {
    /// The state after `event`, or an error if the event is not allowed.
    pub fn on(self, event: Event) -> Result<Self, InvalidTransition> {
        use ConnectionState as S;
        use Event as E;

        let next = match (self, event) {
            (S::Errored, _) => S::Errored,
            (_, E::TransportError) => S::Errored,
            (S::Closing | S::LoggedIn | S::Closed, E::TransportClosed) => S::Closed,
            (_, E::TransportClosed) => S::Errored,

            (S::Connecting, E::TransportConnected) => S::SentPreLogin,
            (S::SentPreLogin, E::PreLoginResponse { tls: true }) => S::TlsNegotiation,
            (S::SentPreLogin, E::PreLoginResponse { tls: false }) => S::SentLogin,
            (S::TlsNegotiation, E::TlsHandshakeComplete) => S::SentLogin,

            (S::SentLogin, E::LoginAck) => S::LoggedIn,
            (S::SentLogin, E::FeatureExtAck { .. } | E::ErrorToken) => S::SentLogin,
            (S::LoggedIn, E::FeatureExtAck { .. }) => S::LoggedIn,
            // a login DONE without LOGINACK means the server refused us
            (S::SentLogin, E::DoneToken { .. }) => S::Errored,

            (S::LoggedIn, E::RequestIssued) => S::Executing,
            (S::LoggedIn, E::CloseRequested) => S::Closing,

            (S::Executing, E::ErrorToken) => S::Executing,
            (S::Executing, E::DoneToken { last: true, .. }) => S::LoggedIn,
            (S::Executing, E::DoneToken { last: false, .. }) => S::Executing,
            (S::Executing, E::Timeout) => S::Attention {
                reason: AttentionReason::Timeout,
            },
            (S::Executing, E::CancelRequested) => S::Attention {
                reason: AttentionReason::Cancel,
            },

            (S::Attention { .. }, E::DoneToken {
                attention_ack: true,
                ..
            }) => S::LoggedIn,
            (S::Attention { .. }, E::DoneToken { .. } | E::ErrorToken | E::CancelRequested) => {
                self
            }
            (S::Attention { .. }, E::Timeout) => S::Errored,

            (state, event) => return Err(InvalidTransition { state, event }),
        };

        if next != self {
            tracing::debug!(from = %self, to = %next, ?event, "connection state transition");
        }
        Ok(next)
    }

    /// Whether a request may be issued.
    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Self::LoggedIn
    }

    /// Whether a request or bulk load owns the connection.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Executing | Self::Attention { .. })
    }

    /// Whether the connection can never be used again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    /// State name for messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting",
            Self::SentPreLogin => "SentPreLogin",
            Self::TlsNegotiation => "TlsNegotiation",
            Self::SentLogin => "SentLogin",
            Self::LoggedIn => "LoggedIn",
            Self::Executing => "Executing",
            Self::Attention { .. } => "Attention",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Errored => "Errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const FINAL_DONE: Event = Event::DoneToken {
        attention_ack: false,
        last: true,
    };

    fn logged_in() -> ConnectionState {
        ConnectionState::Connecting
            .on(Event::TransportConnected)
            .unwrap()
            .on(Event::PreLoginResponse { tls: false })
            .unwrap()
            .on(Event::LoginAck)
            .unwrap()
            .on(Event::FeatureExtAck {
                column_encryption: true,
            })
            .unwrap()
    }

    #[test]
    fn test_login_sequence() {
        assert_eq!(logged_in(), ConnectionState::LoggedIn);
        let state = ConnectionState::Connecting
            .on(Event::TransportConnected)
            .unwrap()
            .on(Event::PreLoginResponse { tls: true })
            .unwrap();
        assert_eq!(state, ConnectionState::TlsNegotiation);
        assert_eq!(
            state.on(Event::TlsHandshakeComplete).unwrap(),
            ConnectionState::SentLogin
        );
    }

    #[test]
    fn test_request_lifecycle() {
        let state = ConnectionState::LoggedIn.on(Event::RequestIssued).unwrap();
        assert_eq!(state, ConnectionState::Executing);
        let state = state
            .on(Event::DoneToken {
                attention_ack: false,
                last: false,
            })
            .unwrap();
        assert!(state.is_busy());
        assert_eq!(state.on(FINAL_DONE).unwrap(), ConnectionState::LoggedIn);
    }

    #[test]
    fn test_second_request_rejected() {
        let err = ConnectionState::Executing
            .on(Event::RequestIssued)
            .unwrap_err();
        assert_eq!(err.state, ConnectionState::Executing);
        assert!(
            ConnectionState::Attention {
                reason: AttentionReason::Cancel
            }
            .on(Event::RequestIssued)
            .is_err()
        );
    }

    #[test]
    fn test_attention_completes_only_on_ack() {
        let state = ConnectionState::Executing.on(Event::Timeout).unwrap();
        assert_eq!(
            state,
            ConnectionState::Attention {
                reason: AttentionReason::Timeout
            }
        );
        // rows and DONEs still in flight are discarded
        assert_eq!(state.on(FINAL_DONE).unwrap(), state);
        let acked = state
            .on(Event::DoneToken {
                attention_ack: true,
                last: true,
            })
            .unwrap();
        assert_eq!(acked, ConnectionState::LoggedIn);
    }

    #[test]
    fn test_second_timeout_is_fatal() {
        let state = ConnectionState::Executing
            .on(Event::CancelRequested)
            .unwrap()
            .on(Event::Timeout)
            .unwrap();
        assert_eq!(state, ConnectionState::Errored);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_errored_is_absorbing() {
        for event in [
            Event::TransportConnected,
            Event::LoginAck,
            Event::RequestIssued,
            Event::CloseRequested,
            Event::TransportClosed,
        ] {
            assert_eq!(
                ConnectionState::Errored.on(event).unwrap(),
                ConnectionState::Errored
            );
        }
    }

    #[test]
    fn test_transport_events() {
        assert_eq!(
            ConnectionState::Executing
                .on(Event::TransportClosed)
                .unwrap(),
            ConnectionState::Errored
        );
        assert_eq!(
            ConnectionState::Closing.on(Event::TransportClosed).unwrap(),
            ConnectionState::Closed
        );
        assert_eq!(
            ConnectionState::LoggedIn.on(Event::TransportError).unwrap(),
            ConnectionState::Errored
        );
        assert_eq!(
            ConnectionState::SentLogin.on(FINAL_DONE).unwrap(),
            ConnectionState::Errored
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = ConnectionState::Connecting.on(Event::LoginAck).unwrap_err();
        assert_eq!(err.to_string(), "LoginAck is not valid in the Connecting state");
    }
}
