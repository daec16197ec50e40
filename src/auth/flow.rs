//! Top-level sign-in flow
//!
//! [`AuthFlowState`] is a plain value; each transition consumes it and
//! returns the next one. [`AuthFlowController`] owns that value together
//! with the transport, callback channel, and the resulting [`Session`], and
//! is the only place errors are turned into user-facing messages.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::audit::AuditLog;
use super::callback::CallbackChannel;
use super::config::RememberedBunker;
use super::error::{AuthError, AuthResult};
use super::identifier::PublicKeyIdentifier;
use super::method::AuthMethod;
use super::navigator::{next_exit, Navigator, PageEvent};
use super::session::{create_session, Session, SessionApi};
use super::settings::FlowSettings;
use super::transport::{Connected, TransportOutcome, TransportSelector};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Stage {
    #[default]
    MethodSelection,
    /// Waiting for the user to submit; `error` is the last failure, if any
    MethodForm {
        method: AuthMethod,
        error: Option<String>,
    },
    Transporting {
        method: AuthMethod,
    },
    Negotiating {
        method: AuthMethod,
        public_key: PublicKeyIdentifier,
    },
    Success {
        method: AuthMethod,
        redirect_url: Option<String>,
    },
    Closing,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthFlowState {
    stage: Stage,
}

impl AuthFlowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn method(&self) -> Option<AuthMethod> {
        match &self.stage {
            Stage::MethodForm { method, .. }
            | Stage::Transporting { method }
            | Stage::Negotiating { method, .. }
            | Stage::Success { method, .. } => Some(*method),
            Stage::MethodSelection | Stage::Closing => None,
        }
    }

    /// A network or external-app round trip is in progress
    pub fn is_loading(&self) -> bool {
        matches!(
            self.stage,
            Stage::Transporting { .. } | Stage::Negotiating { .. }
        )
    }

    pub fn error(&self) -> Option<&str> {
        match &self.stage {
            Stage::MethodForm { error, .. } => error.as_deref(),
            _ => None,
        }
    }

    fn rejected(self, action: &str) -> Self {
        warn!("Ignoring {} in {:?}", action, self.stage);
        self
    }

    /// Open the form for `method`, dropping whatever the previous attempt left
    pub fn select_method(self, method: AuthMethod) -> Self {
        match self.stage {
            Stage::Closing => self.rejected("method selection"),
            _ => Self {
                stage: Stage::MethodForm {
                    method,
                    error: None,
                },
            },
        }
    }

    pub fn start(self) -> Self {
        match self.stage {
            Stage::MethodForm { method, .. } => Self {
                stage: Stage::Transporting { method },
            },
            _ => self.rejected("submit"),
        }
    }

    pub fn negotiate(self, public_key: PublicKeyIdentifier) -> Self {
        match self.stage {
            Stage::Transporting { method } => Self {
                stage: Stage::Negotiating { method, public_key },
            },
            _ => self.rejected("negotiation"),
        }
    }

    pub fn succeed(self, redirect_url: Option<String>) -> Self {
        match self.stage {
            Stage::Negotiating { method, .. } => Self {
                stage: Stage::Success {
                    method,
                    redirect_url,
                },
            },
            _ => self.rejected("success"),
        }
    }

    /// Back to the same method's form with the error shown
    pub fn fail(self, error: &AuthError) -> Self {
        match self.method() {
            Some(method) if !matches!(self.stage, Stage::Success { .. }) => Self {
                stage: Stage::MethodForm {
                    method,
                    error: Some(error.to_string()),
                },
            },
            _ => self.rejected("failure"),
        }
    }

    pub fn go_back(self) -> Self {
        Self {
            stage: Stage::MethodSelection,
        }
    }

    pub fn close(self) -> Self {
        Self {
            stage: Stage::Closing,
        }
    }
}

/// How a submit ended
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    SignedIn {
        session: Session,
        redirect_url: Option<String>,
    },
    /// The error is also shown on the method form
    Failed(AuthError),
    /// User went back or closed before it finished
    Abandoned(PageEvent),
}

pub struct AuthFlowController {
    state: AuthFlowState,
    settings: FlowSettings,
    navigator: Arc<dyn Navigator>,
    api: Arc<dyn SessionApi>,
    transports: TransportSelector,
    channel: CallbackChannel,
    audit: Arc<Mutex<AuditLog>>,
    session: Option<Session>,
}

impl AuthFlowController {
    pub fn new(
        settings: FlowSettings,
        navigator: Arc<dyn Navigator>,
        api: Arc<dyn SessionApi>,
        transports: TransportSelector,
        audit: Arc<Mutex<AuditLog>>,
    ) -> Self {
        let channel = CallbackChannel::new(
            navigator.clone(),
            settings.callback_path(),
            settings.signer_app.clone(),
            settings.callback_timeout,
            settings.settle_delay,
        );
        Self {
            state: AuthFlowState::new(),
            settings,
            navigator,
            api,
            transports,
            channel,
            audit,
            session: None,
        }
    }

    pub fn state(&self) -> &AuthFlowState {
        &self.state
    }

    /// The session from the last successful sign-in
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[cfg(test)]
    pub fn transports(&self) -> &TransportSelector {
        &self.transports
    }

    #[cfg(test)]
    pub fn channel(&self) -> &CallbackChannel {
        &self.channel
    }

    fn transition(&mut self, f: impl FnOnce(AuthFlowState) -> AuthFlowState) {
        let next = f(std::mem::take(&mut self.state));
        debug!(loading = next.is_loading(), "Flow stage: {:?}", next.stage());
        self.state = next;
    }

    fn discard_in_flight(&mut self) {
        self.channel.abandon();
        self.transports.abandon();
    }

    pub fn select_method(&mut self, method: AuthMethod) {
        self.discard_in_flight();
        self.transports.reset(method);
        self.transition(|s| s.select_method(method));
        info!("Selected {} sign-in", method);
    }

    pub fn go_back(&mut self) {
        self.discard_in_flight();
        self.transition(AuthFlowState::go_back);
    }

    pub fn close(&mut self) {
        self.discard_in_flight();
        self.transition(AuthFlowState::close);
    }

    fn abandon(&mut self, exit: PageEvent) -> FlowOutcome {
        match exit {
            PageEvent::Close => self.close(),
            _ => self.go_back(),
        }
        info!("Sign-in abandoned");
        FlowOutcome::Abandoned(exit)
    }

    async fn fail(&mut self, method: AuthMethod, error: AuthError) -> FlowOutcome {
        warn!("{} sign-in failed: {}", method, error);
        self.audit.lock().await.record_failure(method, &error);
        self.transition(|s| s.fail(&error));
        FlowOutcome::Failed(error)
    }

    /// Run the selected method with `input` through to a session
    ///
    /// Errors never escape; they come back as [`FlowOutcome::Failed`] and
    /// leave the form open on the same method.
    pub async fn submit(
        &mut self,
        input: Option<&str>,
        events: &mut mpsc::Receiver<PageEvent>,
    ) -> FlowOutcome {
        let method = match self.state.stage() {
            Stage::MethodForm { method, .. } => *method,
            other => {
                warn!("Submit ignored in {:?}", other);
                return FlowOutcome::Failed(AuthError::invalid("choose a sign-in method first"));
            }
        };

        self.audit.lock().await.record_attempt(method);
        self.transports.reset(method);
        self.transition(AuthFlowState::start);

        let connected = match self.connect(method, input, events).await {
            Ok(TransportOutcome::Connected(connected)) => connected,
            Ok(TransportOutcome::Abandoned(exit)) => return self.abandon(exit),
            Err(e) => return self.fail(method, e).await,
        };

        let public_key = connected.public_key.clone();
        self.transition(|s| s.negotiate(public_key));

        let negotiated = tokio::select! {
            result = create_session(self.api.as_ref(), method, &connected) => result,
            exit = next_exit(events) => return self.abandon(exit),
        };
        let (session, result) = match negotiated {
            Ok(ok) => ok,
            Err(e) => return self.fail(method, e).await,
        };

        self.remember_bunker(method, &connected).await;
        self.audit.lock().await.record_success(method, &session);
        info!("Signed in as {} ({})", session.public_key, session.mode);

        self.session = Some(session.clone());
        self.transition(|s| s.succeed(result.redirect_url.clone()));
        self.hand_off(result.redirect_url.as_deref());
        self.transition(AuthFlowState::close);

        FlowOutcome::SignedIn {
            session,
            redirect_url: result.redirect_url,
        }
    }

    async fn connect(
        &mut self,
        method: AuthMethod,
        input: Option<&str>,
        events: &mut mpsc::Receiver<PageEvent>,
    ) -> AuthResult<TransportOutcome> {
        self.transports
            .connect(method, input, &mut self.channel, events, &self.settings)
            .await
    }

    async fn remember_bunker(&self, method: AuthMethod, connected: &Connected) {
        let (Some(state_dir), Some(descriptor)) = (&self.settings.state_dir, &connected.bunker) else {
            return;
        };
        if method != AuthMethod::Bunker {
            return;
        }
        match RememberedBunker::remember(state_dir, descriptor, &connected.public_key) {
            Ok(_) => {
                self.audit
                    .lock()
                    .await
                    .record_bunker_connect(descriptor, &connected.public_key);
            }
            Err(e) => warn!("Could not remember bunker: {:#}", e),
        }
    }

    /// Pass the post-login page on to the navigator
    fn hand_off(&self, redirect_url: Option<&str>) {
        let Some(redirect) = redirect_url else {
            return;
        };
        match self.settings.api_url.join(redirect) {
            Ok(target) => {
                if let Err(e) = self.navigator.open(&target) {
                    warn!("Could not open {}: {:#}", target, e);
                }
            }
            Err(e) => warn!("Ignoring bad redirect {}: {}", redirect, e),
        }
    }
}
