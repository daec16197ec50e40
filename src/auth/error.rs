//! Error taxonomy for the sign-in flow
//!
//! Every variant is recovered by the flow controller and rendered as a
//! message. Nothing here is meant to escape past a single login attempt.

use thiserror::Error;

/// Why a signer transport could not produce a public key
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    #[error("No Nostr browser extension detected. Install one (Alby, nos2x) or pick another method.")]
    ExtensionUnavailable,

    #[error("No response from {app}. Make sure {app} is installed and try again.")]
    TimedOut { app: String },

    #[error("{app} returned a compressed response, which is not supported")]
    CompressedResponse { app: String },

    #[error("Callback from {app} did not include a public key")]
    MissingCallbackKey { app: String },

    #[error("Could not connect to bunker relay {relay}: {reason}")]
    NoRelayConnection { relay: String, reason: String },

    #[error("Bunker did not respond: {0}")]
    NoResponse(String),

    #[error("Bunker rejected the connection: {0}")]
    RemoteRejected(String),

    #[error("Bunker timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Errors surfaced to the user at the end of a login attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error(transparent)]
    Transport(#[from] TransportFailure),

    #[error("Signer declined: {0}")]
    RemoteRejected(String),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

impl AuthError {
    pub fn invalid(what: impl Into<String>) -> Self {
        AuthError::InvalidFormat(what.into())
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_app() {
        let err = AuthError::from(TransportFailure::TimedOut { app: "Amber".into() });
        let msg = err.to_string();
        assert!(msg.contains("Amber"));
        assert!(msg.contains("installed"));
    }

    #[test]
    fn test_login_failed_carries_message() {
        let err = AuthError::LoginFailed("key banned".into());
        assert_eq!(err.to_string(), "Login failed: key banned");
    }
}
