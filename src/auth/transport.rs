//! Picking a signer transport and getting a public key out of it

use std::sync::Arc;

use nostr::prelude::*;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::bunker::RemoteSignerConnector;
use super::callback::{CallbackChannel, CallbackWait, SignerRequestKind};
use super::error::{AuthError, AuthResult, TransportFailure};
use super::identifier::{parse_bunker_url, BunkerDescriptor, PublicKeyIdentifier};
use super::method::{AuthMethod, SigningMethod};
use super::navigator::{next_exit, PageEvent};
use super::settings::FlowSettings;

/// Upper bound on NIP-46 round trips in one handshake (relay, connect, get_public_key)
const HANDSHAKE_ROUND_TRIPS: u32 = 3;

/// Where the public key is going to come from
#[derive(Debug, Clone)]
pub enum Transport {
    Extension,
    LocalKey(Keys),
    ReadOnly(PublicKeyIdentifier),
    /// Launch the external app and wait for its callback
    DirectExternalApp,
    /// External app already paired through a bunker URL; no round trip
    ExternalAppViaBunkerUrl(BunkerDescriptor),
    /// Full NIP-46 over the descriptor's relay
    RelayBunker(BunkerDescriptor),
}

impl Transport {
    /// Decide the transport from the method and whatever the user typed
    ///
    /// Everything here is local: malformed input never reaches the network.
    pub fn select(method: AuthMethod, input: Option<&str>) -> AuthResult<Self> {
        let input = input.map(str::trim).filter(|s| !s.is_empty());
        let required = |what: &str| AuthError::invalid(format!("{} is required", what));

        match method {
            AuthMethod::Extension => Ok(Self::Extension),
            AuthMethod::ExternalSigner => match input {
                None => Ok(Self::DirectExternalApp),
                Some(uri) => Ok(Self::ExternalAppViaBunkerUrl(parse_bunker_url(uri)?)),
            },
            AuthMethod::Bunker => {
                let uri = input.ok_or_else(|| required("a bunker:// URL"))?;
                Ok(Self::RelayBunker(parse_bunker_url(uri)?))
            }
            AuthMethod::ReadOnly => {
                let key = input.ok_or_else(|| required("a public key"))?;
                Ok(Self::ReadOnly(PublicKeyIdentifier::parse(key)?))
            }
            AuthMethod::PrivateKey => {
                let secret = input.ok_or_else(|| required("a private key"))?;
                let keys = Keys::parse(secret).map_err(|_| {
                    AuthError::invalid("private key must be an nsec or 64 hex characters")
                })?;
                Ok(Self::LocalKey(keys))
            }
        }
    }
}

/// A transport that produced a key
#[derive(Debug, Clone, PartialEq)]
pub struct Connected {
    pub public_key: PublicKeyIdentifier,
    pub signing_method: SigningMethod,
    pub metadata: Option<Value>,
    /// Set when the key came through a bunker, so it can be remembered
    pub bunker: Option<BunkerDescriptor>,
}

impl Connected {
    fn new(public_key: PublicKeyIdentifier, signing_method: SigningMethod) -> Self {
        Self {
            public_key,
            signing_method,
            metadata: None,
            bunker: None,
        }
    }

    fn via_bunker(mut self, descriptor: BunkerDescriptor, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self.bunker = Some(descriptor);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutcome {
    Connected(Connected),
    Abandoned(PageEvent),
}

/// Per-attempt transport lifecycle
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    AwaitingInput,
    Connecting,
    Connected(Connected),
    Failed(AuthError),
}

impl TransportState {
    pub fn for_method(method: AuthMethod) -> Self {
        if method.needs_input() {
            Self::AwaitingInput
        } else {
            Self::Idle
        }
    }

    pub fn connecting(self) -> Self {
        match self {
            Self::Idle | Self::AwaitingInput => Self::Connecting,
            other => {
                warn!("Transport cannot start from {:?}", other);
                other
            }
        }
    }

    pub fn finish(self, result: &AuthResult<TransportOutcome>) -> Self {
        match (self, result) {
            (Self::Connecting, Ok(TransportOutcome::Connected(c))) => Self::Connected(c.clone()),
            (Self::Connecting, Ok(TransportOutcome::Abandoned(_))) => Self::Idle,
            (Self::Connecting, Err(e)) => Self::Failed(e.clone()),
            (other, _) => other,
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected(_) | Self::Failed(_))
    }
}

pub struct TransportSelector {
    extension: Option<Arc<dyn NostrSigner>>,
    connector: Arc<dyn RemoteSignerConnector>,
    state: TransportState,
}

impl TransportSelector {
    pub fn new(
        extension: Option<Arc<dyn NostrSigner>>,
        connector: Arc<dyn RemoteSignerConnector>,
    ) -> Self {
        Self {
            extension,
            connector,
            state: TransportState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> &TransportState {
        &self.state
    }

    /// Start a fresh transport instance for `method`
    pub fn reset(&mut self, method: AuthMethod) {
        self.state = TransportState::for_method(method);
    }

    pub fn abandon(&mut self) {
        self.state = TransportState::Idle;
    }

    /// Pick the transport for `method` and run it to a terminal state
    ///
    /// Failures are returned as-is, never retried.
    pub async fn connect(
        &mut self,
        method: AuthMethod,
        input: Option<&str>,
        channel: &mut CallbackChannel,
        events: &mut mpsc::Receiver<PageEvent>,
        settings: &FlowSettings,
    ) -> AuthResult<TransportOutcome> {
        self.state = std::mem::take(&mut self.state).connecting();
        let result = match Transport::select(method, input) {
            Ok(transport) => self.run(transport, channel, events, settings).await,
            Err(e) => Err(e),
        };
        self.state = std::mem::take(&mut self.state).finish(&result);
        result
    }

    async fn run(
        &self,
        transport: Transport,
        channel: &mut CallbackChannel,
        events: &mut mpsc::Receiver<PageEvent>,
        settings: &FlowSettings,
    ) -> AuthResult<TransportOutcome> {
        let connected = match transport {
            Transport::Extension => {
                let signer = self
                    .extension
                    .as_ref()
                    .ok_or(TransportFailure::ExtensionUnavailable)?;
                let public_key = tokio::select! {
                    result = signer.get_public_key() => result
                        .map_err(|e| AuthError::RemoteRejected(e.to_string()))?,
                    exit = next_exit(events) => return Ok(TransportOutcome::Abandoned(exit)),
                };
                Connected::new(public_key.into(), SigningMethod::BrowserExtension)
            }
            Transport::LocalKey(keys) => {
                Connected::new(keys.public_key().into(), SigningMethod::PrivateKey)
            }
            Transport::ReadOnly(public_key) => Connected::new(public_key, SigningMethod::None),
            Transport::DirectExternalApp => {
                channel.open_external_signer(
                    AuthMethod::ExternalSigner,
                    SignerRequestKind::GetPublicKey,
                    &settings.callback_url,
                    &settings.app_name,
                    events,
                )?;
                match channel.await_callback(events).await? {
                    CallbackWait::Resolved(public_key) => {
                        Connected::new(public_key, SigningMethod::Amber)
                    }
                    CallbackWait::Abandoned(exit) => return Ok(TransportOutcome::Abandoned(exit)),
                }
            }
            Transport::ExternalAppViaBunkerUrl(descriptor) => {
                let metadata = json!({
                    "bunker_url": descriptor.to_uri(),
                    "relay": descriptor.relay(),
                });
                Connected::new(descriptor.remote_signer(), SigningMethod::Bunker)
                    .via_bunker(descriptor, metadata)
            }
            Transport::RelayBunker(descriptor) => {
                info!("Connecting to bunker via {}", descriptor.relay());
                let guard = settings
                    .bunker_timeout
                    .checked_mul(HANDSHAKE_ROUND_TRIPS)
                    .ok_or_else(|| {
                        AuthError::invalid(format!(
                            "bunker timeout {:?} is out of range",
                            settings.bunker_timeout
                        ))
                    })?;
                let handshake = tokio::time::timeout(
                    guard,
                    self.connector.connect(&descriptor, settings.bunker_timeout),
                );
                let public_key = tokio::select! {
                    result = handshake => result.map_err(|_| TransportFailure::Timeout {
                        secs: guard.as_secs(),
                    })??,
                    exit = next_exit(events) => return Ok(TransportOutcome::Abandoned(exit)),
                };
                let metadata = json!({
                    "bunker_url": descriptor.to_uri(),
                    "relay": descriptor.relay(),
                    "remote_signer_pubkey": descriptor.remote_signer_pubkey(),
                });
                Connected::new(public_key.into(), SigningMethod::Bunker)
                    .via_bunker(descriptor, metadata)
            }
        };

        Ok(TransportOutcome::Connected(connected))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use ::url::Url;

    use super::*;
    use crate::auth::navigator::testing::RecordingNavigator;

    const KEY: &str = "79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3";

    /// Connector that returns a canned answer, or never answers
    pub struct ScriptedConnector {
        pub answer: Mutex<Option<AuthResult<PublicKey>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedConnector {
        pub fn answering(answer: AuthResult<PublicKey>) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(answer)),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn silent() -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(None),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteSignerConnector for ScriptedConnector {
        async fn connect(
            &self,
            _descriptor: &BunkerDescriptor,
            _timeout: Duration,
        ) -> AuthResult<PublicKey> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer.lock().unwrap().clone();
            match answer {
                Some(answer) => answer,
                None => std::future::pending().await,
            }
        }
    }

    fn settings() -> FlowSettings {
        FlowSettings::new(Url::parse("http://localhost:8080").unwrap())
    }

    fn channel(nav: &RecordingNavigator, s: &FlowSettings) -> CallbackChannel {
        CallbackChannel::new(
            Arc::new(nav.clone()),
            s.callback_path(),
            s.signer_app.clone(),
            s.callback_timeout,
            s.settle_delay,
        )
    }

    fn bunker_uri() -> String {
        format!("bunker://{}?relay=wss://relay.nsec.app&secret=s", KEY)
    }

    #[test]
    fn test_select_transport() {
        assert!(matches!(
            Transport::select(AuthMethod::ExternalSigner, None).unwrap(),
            Transport::DirectExternalApp
        ));
        assert!(matches!(
            Transport::select(AuthMethod::ExternalSigner, Some("  ")).unwrap(),
            Transport::DirectExternalApp
        ));
        assert!(matches!(
            Transport::select(AuthMethod::ExternalSigner, Some(&bunker_uri())).unwrap(),
            Transport::ExternalAppViaBunkerUrl(_)
        ));
        assert!(matches!(
            Transport::select(AuthMethod::Bunker, Some(&bunker_uri())).unwrap(),
            Transport::RelayBunker(_)
        ));
        assert!(matches!(
            Transport::select(AuthMethod::Bunker, None),
            Err(AuthError::InvalidFormat(_))
        ));
        assert!(matches!(
            Transport::select(AuthMethod::ReadOnly, Some("nope")),
            Err(AuthError::InvalidFormat(_))
        ));
        assert!(matches!(
            Transport::select(AuthMethod::PrivateKey, Some("nsec1garbage")),
            Err(AuthError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_state_machine() {
        let s = TransportState::for_method(AuthMethod::Bunker);
        assert_eq!(s, TransportState::AwaitingInput);
        let s = s.connecting();
        assert_eq!(s, TransportState::Connecting);
        let s = s.finish(&Err(AuthError::from(TransportFailure::Timeout { secs: 30 })));
        assert!(s.is_terminal());
        // terminal states don't restart
        assert!(matches!(s.connecting(), TransportState::Failed(_)));
    }

    #[tokio::test]
    async fn test_descriptor_path_connects_without_network() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let connector = ScriptedConnector::silent();
        let mut selector = TransportSelector::new(None, connector.clone());
        let (_tx, mut rx) = mpsc::channel(1);

        let outcome = selector
            .connect(AuthMethod::ExternalSigner, Some(&bunker_uri()), &mut ch, &mut rx, &s)
            .await
            .unwrap();

        let TransportOutcome::Connected(c) = outcome else {
            panic!("expected connection");
        };
        assert_eq!(c.public_key, PublicKeyIdentifier::Hex(KEY.to_string()));
        assert_eq!(c.signing_method, SigningMethod::Bunker);
        let metadata = c.metadata.unwrap();
        assert_eq!(metadata["relay"], "wss://relay.nsec.app");
        assert!(metadata["bunker_url"].as_str().unwrap().starts_with("bunker://"));
        assert_eq!(connector.calls(), 0);
        assert!(nav.opened().is_empty());
        assert!(matches!(selector.state(), TransportState::Connected(_)));
    }

    #[tokio::test]
    async fn test_relay_bunker_returns_confirmed_key() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let user = Keys::generate().public_key();
        let connector = ScriptedConnector::answering(Ok(user));
        let mut selector = TransportSelector::new(None, connector.clone());
        let (_tx, mut rx) = mpsc::channel(1);

        let outcome = selector
            .connect(AuthMethod::Bunker, Some(&bunker_uri()), &mut ch, &mut rx, &s)
            .await
            .unwrap();

        let TransportOutcome::Connected(c) = outcome else {
            panic!("expected connection");
        };
        assert_eq!(c.public_key, PublicKeyIdentifier::from(user));
        assert!(c.bunker.is_some());
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_relay_bunker_reports_specific_failure() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let failure = TransportFailure::NoRelayConnection {
            relay: "wss://relay.nsec.app".into(),
            reason: "connection refused".into(),
        };
        let connector = ScriptedConnector::answering(Err(failure.clone().into()));
        let mut selector = TransportSelector::new(None, connector);
        let (_tx, mut rx) = mpsc::channel(1);

        let err = selector
            .connect(AuthMethod::Bunker, Some(&bunker_uri()), &mut ch, &mut rx, &s)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Transport(failure));
        assert!(matches!(selector.state(), TransportState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_bunker_bounded_wait() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let mut selector = TransportSelector::new(None, ScriptedConnector::silent());
        let (_tx, mut rx) = mpsc::channel(1);

        let started = tokio::time::Instant::now();
        let err = selector
            .connect(AuthMethod::Bunker, Some(&bunker_uri()), &mut ch, &mut rx, &s)
            .await
            .unwrap_err();
        // the whole handshake is bounded, and the message reports that bound
        assert_eq!(started.elapsed(), Duration::from_secs(90));
        assert_eq!(
            err,
            AuthError::Transport(TransportFailure::Timeout { secs: 90 })
        );
        assert_eq!(err.to_string(), "Bunker timed out after 90s");
    }

    #[tokio::test]
    async fn test_relay_bunker_unrepresentable_timeout() {
        let nav = RecordingNavigator::default();
        let mut s = settings();
        s.bunker_timeout = Duration::from_secs(u64::MAX);
        s.callback_timeout = Duration::from_secs(u64::MAX);
        let mut ch = channel(&nav, &s);
        let connector = ScriptedConnector::silent();
        let mut selector = TransportSelector::new(None, connector.clone());
        let (_tx, mut rx) = mpsc::channel(1);

        let err = selector
            .connect(AuthMethod::Bunker, Some(&bunker_uri()), &mut ch, &mut rx, &s)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidFormat(_)));
        assert_eq!(connector.calls(), 0);
        assert!(matches!(selector.state(), TransportState::Failed(_)));
    }

    #[tokio::test]
    async fn test_relay_bunker_abandoned() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let mut selector = TransportSelector::new(None, ScriptedConnector::silent());
        let (tx, mut rx) = mpsc::channel(2);
        tx.send(PageEvent::VisibilityRegained).await.unwrap();
        tx.send(PageEvent::GoBack).await.unwrap();

        let outcome = selector
            .connect(AuthMethod::Bunker, Some(&bunker_uri()), &mut ch, &mut rx, &s)
            .await
            .unwrap();
        assert_eq!(outcome, TransportOutcome::Abandoned(PageEvent::GoBack));
        assert_eq!(selector.state(), &TransportState::Idle);
    }

    #[tokio::test]
    async fn test_parse_failure_is_terminal() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let connector = ScriptedConnector::silent();
        let mut selector = TransportSelector::new(None, connector.clone());
        selector.reset(AuthMethod::Bunker);
        let (_tx, mut rx) = mpsc::channel(1);

        let err = selector
            .connect(AuthMethod::Bunker, Some("bunker://short?relay=wss://x"), &mut ch, &mut rx, &s)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidFormat(_)));
        assert!(matches!(selector.state(), TransportState::Failed(_)));
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test]
    async fn test_extension_missing() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let mut selector = TransportSelector::new(None, ScriptedConnector::silent());
        let (_tx, mut rx) = mpsc::channel(1);

        let err = selector
            .connect(AuthMethod::Extension, None, &mut ch, &mut rx, &s)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Transport(TransportFailure::ExtensionUnavailable));
    }

    #[tokio::test]
    async fn test_extension_signer() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let keys = Keys::generate();
        let extension: Arc<dyn NostrSigner> = Arc::new(keys.clone());
        let mut selector = TransportSelector::new(Some(extension), ScriptedConnector::silent());
        let (_tx, mut rx) = mpsc::channel(1);

        let outcome = selector
            .connect(AuthMethod::Extension, None, &mut ch, &mut rx, &s)
            .await
            .unwrap();
        let TransportOutcome::Connected(c) = outcome else {
            panic!("expected connection");
        };
        assert_eq!(c.public_key, PublicKeyIdentifier::from(keys.public_key()));
        assert_eq!(c.signing_method, SigningMethod::BrowserExtension);
    }

    #[tokio::test]
    async fn test_private_key_stays_local() {
        let nav = RecordingNavigator::default();
        let s = settings();
        let mut ch = channel(&nav, &s);
        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        let mut selector = TransportSelector::new(None, ScriptedConnector::silent());
        let (_tx, mut rx) = mpsc::channel(1);

        let outcome = selector
            .connect(AuthMethod::PrivateKey, Some(&nsec), &mut ch, &mut rx, &s)
            .await
            .unwrap();
        let TransportOutcome::Connected(c) = outcome else {
            panic!("expected connection");
        };
        assert_eq!(c.public_key.as_str(), keys.public_key().to_hex());
        assert_eq!(c.signing_method, SigningMethod::PrivateKey);
    }
}
