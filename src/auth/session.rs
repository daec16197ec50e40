//! Exchanging a public key for a backend session

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::error::{AuthError, AuthResult};
use super::identifier::PublicKeyIdentifier;
use super::method::{AuthMethod, RequestedMode, SigningMethod};
use super::transport::Connected;

pub const LOGIN_PATH: &str = "/api/v1/auth/login";
pub const SESSION_PATH: &str = "/api/v1/session";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `POST /api/v1/auth/login`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRequest {
    pub public_key: String,
    pub requested_mode: RequestedMode,
    pub signing_method: SigningMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SessionRequest {
    /// Read-only always asks for `read_only` with no signing method; everything else asks for `write`
    pub fn for_method(
        method: AuthMethod,
        public_key: &PublicKeyIdentifier,
        signing_method: SigningMethod,
        metadata: Option<Value>,
    ) -> Self {
        let (requested_mode, signing_method) = match method {
            AuthMethod::ReadOnly => (RequestedMode::ReadOnly, SigningMethod::None),
            _ => (RequestedMode::Write, signing_method),
        };
        Self {
            public_key: public_key.as_str().to_string(),
            requested_mode,
            signing_method,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub signing_method: Option<String>,
}

/// A signed-in session as the backend describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub public_key: String,
    pub mode: String,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl Session {
    /// Stand-in for backends that answer `success` without echoing the session
    fn from_request(request: &SessionRequest) -> Self {
        Self {
            public_key: request.public_key.clone(),
            mode: request.requested_mode.as_str().to_string(),
            capabilities: Capabilities {
                signing_method: Some(request.signing_method.as_str().to_string()),
            },
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == RequestedMode::ReadOnly.as_str()
    }
}

/// Response of `POST /api/v1/auth/login`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionResult {
    pub success: bool,
    pub session: Option<Session>,
    pub redirect_url: Option<String>,
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// Turn a raw login response into a result or a `LoginFailed`
pub fn interpret_response(status: u16, body: &str) -> AuthResult<SessionResult> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or_else(|| format!("HTTP {}", status));
        return Err(AuthError::LoginFailed(message));
    }

    let result: SessionResult = serde_json::from_str(body)
        .map_err(|e| AuthError::NetworkError(format!("unreadable login response: {}", e)))?;
    if !result.success {
        let message = result
            .message
            .unwrap_or_else(|| "server refused the login".to_string());
        return Err(AuthError::LoginFailed(message));
    }
    Ok(result)
}

/// The backend session endpoints
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, request: &SessionRequest) -> AuthResult<SessionResult>;

    /// Whether the backend already considers us signed in
    async fn has_session(&self) -> AuthResult<bool>;
}

pub struct HttpSessionApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpSessionApi {
    pub fn new(base: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> AuthResult<Url> {
        self.base
            .join(path)
            .map_err(|e| AuthError::NetworkError(format!("bad endpoint {}: {}", path, e)))
    }
}

fn network_error(e: reqwest::Error) -> AuthError {
    AuthError::NetworkError(e.to_string())
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, request: &SessionRequest) -> AuthResult<SessionResult> {
        let url = self.endpoint(LOGIN_PATH)?;
        let response = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(network_error)?;
        debug!("Login response: HTTP {}", status);
        interpret_response(status, &body)
    }

    async fn has_session(&self) -> AuthResult<bool> {
        let url = self.endpoint(SESSION_PATH)?;
        let response = self.client.get(url).send().await.map_err(network_error)?;
        Ok(response.status().is_success())
    }
}

/// Submit the connected key and return what the backend made of it
pub async fn create_session(
    api: &dyn SessionApi,
    method: AuthMethod,
    connected: &Connected,
) -> AuthResult<(Session, SessionResult)> {
    let request = SessionRequest::for_method(
        method,
        &connected.public_key,
        connected.signing_method,
        connected.metadata.clone(),
    );
    info!(
        "Requesting {:?} session for {} ({:?})",
        request.requested_mode, request.public_key, request.signing_method
    );

    let result = api.create_session(&request).await?;
    let session = result
        .session
        .clone()
        .unwrap_or_else(|| Session::from_request(&request));
    Ok((session, result))
}
