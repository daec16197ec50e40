//! Round trip through an external signer app
//!
//! The app is launched with a `nostrsigner:` URI and answers by sending the
//! browser back with an `event` query parameter. Nothing blocks while that
//! happens: [`CallbackChannel::await_callback`] races a deadline against page
//! events, and whichever comes first decides the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::error::{AuthError, AuthResult, TransportFailure};
use super::identifier::PublicKeyIdentifier;
use super::method::AuthMethod;
use super::navigator::{Navigator, PageEvent};

/// Prefix Amber puts on gzip-compressed responses
pub const COMPRESSION_MARKER: &str = "Signer1";

/// What we ask the external app to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerRequestKind {
    GetPublicKey,
}

impl SignerRequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetPublicKey => "get_public_key",
        }
    }
}

/// One outstanding external-app request
#[derive(Debug, Clone)]
pub struct PendingCallback {
    pub method: AuthMethod,
    pub issued_at: Instant,
}

/// How a wait on the external app ended, short of an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackWait {
    Resolved(PublicKeyIdentifier),
    /// User went back or closed; carries the event that did it
    Abandoned(PageEvent),
}

/// `encodeURIComponent`-style: spaces become `%20`, never `+`
fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Build the `nostrsigner:` URI that launches the external app
pub fn signer_uri(kind: SignerRequestKind, callback_url: &Url, app_label: &str) -> AuthResult<Url> {
    let raw = format!(
        "nostrsigner:?compressionType=none&returnType=signature&type={}&callbackUrl={}&appName={}",
        kind.as_str(),
        encode_component(callback_url.as_str()),
        encode_component(app_label),
    );
    Url::parse(&raw).map_err(|e| AuthError::invalid(format!("could not build signer URI: {}", e)))
}

pub struct CallbackChannel {
    navigator: Arc<dyn Navigator>,
    callback_path: String,
    signer_app: String,
    timeout: Duration,
    settle_delay: Duration,
    pending: Option<PendingCallback>,
    resolved: Option<PublicKeyIdentifier>,
}

impl CallbackChannel {
    pub fn new(
        navigator: Arc<dyn Navigator>,
        callback_path: impl Into<String>,
        signer_app: impl Into<String>,
        timeout: Duration,
        settle_delay: Duration,
    ) -> Self {
        Self {
            navigator,
            callback_path: callback_path.into(),
            signer_app: signer_app.into(),
            timeout,
            settle_delay,
            pending: None,
            resolved: None,
        }
    }

    /// Launch the external app and arm the callback. Replaces any previous round trip.
    ///
    /// Page events already queued on `events` belong to an earlier round trip
    /// and are dropped before the new request goes out.
    pub fn open_external_signer(
        &mut self,
        method: AuthMethod,
        kind: SignerRequestKind,
        callback_url: &Url,
        app_label: &str,
        events: &mut mpsc::Receiver<PageEvent>,
    ) -> AuthResult<Url> {
        let target = signer_uri(kind, callback_url, app_label)?;

        let mut stale = 0;
        while events.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Dropped {} page events from an earlier round trip", stale);
        }

        self.resolved = None;
        self.pending = Some(PendingCallback {
            method,
            issued_at: Instant::now(),
        });

        info!("Handing off to {} ({})", self.signer_app, kind.as_str());
        if let Err(e) = self.navigator.open(&target) {
            self.pending = None;
            return Err(TransportFailure::NoResponse(format!(
                "could not launch {}: {}",
                self.signer_app, e
            ))
            .into());
        }

        Ok(target)
    }

    /// A request is out and nothing has come back yet
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    #[cfg(test)]
    pub fn pending(&self) -> Option<&PendingCallback> {
        self.pending.as_ref()
    }

    #[cfg(test)]
    pub fn resolved(&self) -> Option<&PublicKeyIdentifier> {
        self.resolved.as_ref()
    }

    /// Drop any round trip in flight. Later callbacks are ignored.
    pub fn abandon(&mut self) {
        if self.pending.take().is_some() {
            debug!("Abandoned pending {} callback", self.signer_app);
        }
        self.resolved = None;
    }

    /// Try to read the external app's answer off `url`
    ///
    /// `Ok(None)` means the URL is not a callback, or nothing is pending.
    /// Once a key has been received, every call returns that same key.
    pub fn consume_callback(&mut self, url: &Url) -> AuthResult<Option<PublicKeyIdentifier>> {
        if let Some(key) = &self.resolved {
            return Ok(Some(key.clone()));
        }

        let event = url
            .query_pairs()
            .find(|(k, _)| k == "event")
            .map(|(_, v)| v.into_owned());
        if url.path() != self.callback_path && event.is_none() {
            return Ok(None);
        }

        let Some(pending) = self.pending.take() else {
            warn!("Ignoring {} callback with no request pending", self.signer_app);
            return Ok(None);
        };

        let value = event.ok_or_else(|| TransportFailure::MissingCallbackKey {
            app: self.signer_app.clone(),
        })?;
        if value.starts_with(COMPRESSION_MARKER) {
            return Err(TransportFailure::CompressedResponse {
                app: self.signer_app.clone(),
            }
            .into());
        }
        let key = PublicKeyIdentifier::parse(&value)?;

        let mut clean = url.clone();
        clean.set_query(None);
        self.navigator.replace_url(clean);

        debug!(
            "{} callback received after {:?} for {}",
            self.signer_app,
            pending.issued_at.elapsed(),
            pending.method
        );
        self.resolved = Some(key.clone());
        Ok(Some(key))
    }

    fn expire(&mut self) -> AuthError {
        self.pending = None;
        warn!("No callback from {} within {:?}", self.signer_app, self.timeout);
        TransportFailure::TimedOut {
            app: self.signer_app.clone(),
        }
        .into()
    }

    /// Wait for the callback, the deadline, or the user giving up
    ///
    /// The deadline lives only as long as this call, so a consumed callback
    /// leaves no timer behind.
    pub async fn await_callback(
        &mut self,
        events: &mut mpsc::Receiver<PageEvent>,
    ) -> AuthResult<CallbackWait> {
        if let Some(key) = &self.resolved {
            return Ok(CallbackWait::Resolved(key.clone()));
        }
        let Some(pending) = &self.pending else {
            return Err(TransportFailure::TimedOut {
                app: self.signer_app.clone(),
            }
            .into());
        };

        let expires_at = pending
            .issued_at
            .checked_add(self.timeout)
            .ok_or_else(|| AuthError::invalid(format!("signer timeout {:?} is out of range", self.timeout)))?;
        let deadline = tokio::time::sleep_until(expires_at);
        tokio::pin!(deadline);
        let mut page_open = true;

        loop {
            tokio::select! {
                _ = &mut deadline => return Err(self.expire()),
                event = events.recv(), if page_open => match event {
                    Some(PageEvent::Navigated(url)) => {
                        if let Some(key) = self.consume_callback(&url)? {
                            return Ok(CallbackWait::Resolved(key));
                        }
                        debug!("Navigation to {} is not a signer callback", url);
                    }
                    Some(PageEvent::VisibilityRegained) => {
                        debug!("Page visible again, re-checking URL in {:?}", self.settle_delay);
                        tokio::select! {
                            _ = &mut deadline => return Err(self.expire()),
                            _ = tokio::time::sleep(self.settle_delay) => {}
                        }
                        if let Some(url) = self.navigator.current_url() {
                            if let Some(key) = self.consume_callback(&url)? {
                                return Ok(CallbackWait::Resolved(key));
                            }
                        }
                    }
                    Some(event @ (PageEvent::GoBack | PageEvent::Close)) => {
                        self.abandon();
                        return Ok(CallbackWait::Abandoned(event));
                    }
                    None => {
                        debug!("Page event source closed, waiting out the deadline");
                        page_open = false;
                    }
                },
            }
        }
    }
}
