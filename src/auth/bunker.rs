//! NIP-46 relay bunker handshake
//!
//! A fresh client keypair is generated for every connect. `nostr-connect`
//! publishes the kind-24133 `connect` request to the remote signer, matches
//! the response by request id, and keeps waiting through an `auth_url`
//! challenge until the signer answers for real.

use std::time::Duration;

use async_trait::async_trait;
use nostr::prelude::*;
use nostr_connect::prelude::*;
use nostr_sdk::prelude::*;
use tracing::{debug, info};

use super::error::{AuthError, AuthResult, TransportFailure};
use super::identifier::BunkerDescriptor;

/// Talks to a remote signer and returns the user key it vouches for
#[async_trait]
pub trait RemoteSignerConnector: Send + Sync {
    async fn connect(&self, descriptor: &BunkerDescriptor, timeout: Duration) -> AuthResult<PublicKey>;
}

/// Production connector on top of `nostr-connect`
#[derive(Debug, Default, Clone, Copy)]
pub struct NostrConnectConnector;

#[async_trait]
impl RemoteSignerConnector for NostrConnectConnector {
    async fn connect(&self, descriptor: &BunkerDescriptor, timeout: Duration) -> AuthResult<PublicKey> {
        check_relay(descriptor.relay(), timeout).await?;

        let uri = descriptor.to_nostr_connect_uri()?;
        let client_keys = Keys::generate();
        debug!("NIP-46 client key for this session: {}", client_keys.public_key());

        let connect = NostrConnect::new(uri, client_keys, timeout, None).map_err(|e| {
            AuthError::from(TransportFailure::NoRelayConnection {
                relay: descriptor.relay().to_string(),
                reason: e.to_string(),
            })
        })?;

        let result = connect.get_public_key().await;
        connect.shutdown().await;

        let public_key = result.map_err(|e| classify_failure(&e.to_string(), timeout))?;
        info!("Bunker {} confirmed user {}", descriptor.remote_signer_pubkey(), public_key);
        Ok(public_key)
    }
}

/// Make sure the relay accepts a websocket before sending anything through it
async fn check_relay(relay: &str, timeout: Duration) -> AuthResult<()> {
    let no_connection = |reason: String| {
        AuthError::from(TransportFailure::NoRelayConnection {
            relay: relay.to_string(),
            reason,
        })
    };

    let url = RelayUrl::parse(relay).map_err(|e| no_connection(e.to_string()))?;
    // `Relay::new` is crate-private in nostr-relay-pool 0.44; obtain the handle via a pool
    let pool = RelayPool::default();
    pool.add_relay(url.clone(), RelayOptions::default())
        .await
        .map_err(|e| no_connection(e.to_string()))?;
    let relay_conn = pool.relay(url).await.map_err(|e| no_connection(e.to_string()))?;
    let result = relay_conn.try_connect(timeout).await;
    relay_conn.disconnect();

    result.map_err(|e| no_connection(e.to_string()))
}

/// Sort a `nostr-connect` failure into the reasons the UI distinguishes
///
/// `get_public_key` goes through `NostrSigner`, which hands back an opaque
/// `SignerError` with only its message. A refusal from the remote signer is
/// free text chosen by the signer app, so the message is all there is to go on.
pub(crate) fn classify_failure(message: &str, timeout: Duration) -> TransportFailure {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        TransportFailure::Timeout {
            secs: timeout.as_secs(),
        }
    } else if ["reject", "denied", "unauthorized", "not allowed", "invalid secret"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        TransportFailure::RemoteRejected(message.to_string())
    } else {
        TransportFailure::NoResponse(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        let t = Duration::from_secs(30);
        assert_eq!(
            classify_failure("Timeout", t),
            TransportFailure::Timeout { secs: 30 }
        );
        assert!(matches!(
            classify_failure("response error: connection rejected by user", t),
            TransportFailure::RemoteRejected(_)
        ));
        assert!(matches!(
            classify_failure("relay pool shut down", t),
            TransportFailure::NoResponse(_)
        ));
    }

    #[test]
    fn test_classify_signer_refusals() {
        let t = Duration::from_secs(30);
        for message in [
            "Response error: invalid secret",
            "Response error: Permission DENIED",
            "response error: unauthorized client",
            "connect not allowed for this app",
        ] {
            assert_eq!(
                classify_failure(message, t),
                TransportFailure::RemoteRejected(message.to_string()),
                "{}",
                message
            );
        }
        assert!(matches!(
            classify_failure("Timed out waiting for response", t),
            TransportFailure::Timeout { secs: 30 }
        ));
    }
}
