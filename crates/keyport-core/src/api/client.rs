//! API client for the keyport service.
//!
//! Every authenticated call goes through [`ApiClient::send`], which attaches
//! the session credential and recovers from an expired one by refreshing
//! and replaying the call once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use super::error::is_auth_failure;
use super::refresh::{HttpTokenRefresher, REFRESH_PATH};
use super::ApiError;
use crate::auth::{Credential, CredentialStore, ProactiveScheduler, RefreshCoordinator, Session};
use crate::config::Config;
use crate::models::{AuthResponse, LoginRequest, Profile, ProfileResponse, RegisterRequest};

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/api/auth/login/";
const REGISTER_PATH: &str = "/api/auth/register/";
const PROFILE_PATH: &str = "/api/auth/profile/";

/// Shown when a failed login carries no server message
const DEFAULT_LOGIN_ERROR: &str = "Invalid email or password";

/// API client bound to one session.
/// Clone is cheap - the reqwest client and the session are shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    /// Create a client for the configured API, keeping credentials in `store`.
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        let base_url = config.api_base_url.trim_end_matches('/').to_string();
        let refresher = HttpTokenRefresher::new(client.clone(), join_url(&base_url, REFRESH_PATH));
        let coordinator = RefreshCoordinator::new(Session::new(store), Arc::new(refresher));

        Ok(Self::from_parts(client, base_url, coordinator))
    }

    /// Assemble a client from existing parts (custom refresher, shared session).
    pub fn from_parts(client: Client, base_url: impl Into<String>, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            coordinator,
        }
    }

    pub fn session(&self) -> &Session {
        self.coordinator.session()
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Proactive refresh scheduler for this client's session
    pub fn scheduler(&self) -> ProactiveScheduler {
        ProactiveScheduler::new(self.coordinator.clone())
    }

    /// Resolve `path` against the base URL. Absolute URLs pass through.
    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// Start building a request; send it with [`ApiClient::send`].
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Send a request with the session credential attached.
    ///
    /// On 401/403 the credential is refreshed and the request replayed once
    /// with the new credential; that second response is returned whatever
    /// its status. Any other response, success or not, is returned as is.
    ///
    /// # Errors
    /// `ApiError::AuthenticationFailed` when no fresh credential could be
    /// obtained, `ApiError::NetworkError` when the request could not be sent.
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let replay = builder.try_clone();
        let sent_with = self.session().credential();

        let response = self.execute(builder, sent_with.as_ref()).await?;
        if !is_auth_failure(response.status()) {
            return Ok(response);
        }
        debug!(status = %response.status(), "Request not authorized, refreshing credential");

        let fresh = match self.session().credential() {
            // Someone else's refresh already landed while this call was out
            Some(current) if Some(&current) != sent_with.as_ref() => {
                debug!("Credential replaced while request was in flight");
                current
            }
            _ => match self.coordinator.refresh().await {
                Some(credential) => credential,
                None => return Err(ApiError::AuthenticationFailed),
            },
        };

        let Some(replay) = replay else {
            warn!("Request body cannot be replayed, returning original response");
            return Ok(response);
        };
        self.execute(replay, Some(&fresh)).await
    }

    async fn execute(&self, builder: RequestBuilder, credential: Option<&Credential>) -> Result<Response, ApiError> {
        let mut request = builder
            .build()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

        if let Some(credential) = credential {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", credential.as_str()))
                .map_err(|_| ApiError::InvalidRequest("Credential is not a valid header value".to_string()))?;
            value.set_sensitive(true);
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let method = request.method().clone();
        let url = request.url().clone();
        let response = self.client.execute(request).await?;
        debug!(%method, %url, status = %response.status(), "Received response");
        Ok(response)
    }

    async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let response = check_response(response).await?;
        let url = response.url().clone();
        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e)))
    }

    /// Authenticated GET, decoding a JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        Self::parse_json(response).await
    }

    /// Authenticated POST with a JSON body, decoding a JSON body
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self.send(self.request(Method::POST, path).json(body)).await?;
        Self::parse_json(response).await
    }

    // ===== Session Establishment =====

    /// Log in and start a new session.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = Some(ApiError::server_message(&body))
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOGIN_ERROR.to_string());
            warn!(%status, "Login rejected");
            return Err(ApiError::LoginFailed(message));
        }

        let parsed: AuthResponse = serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;
        let grant = parsed
            .into_grant()
            .ok_or_else(|| ApiError::InvalidResponse("Token not found in login response".to_string()))?;

        self.session().establish(grant);
        info!("Login successful");
        Ok(())
    }

    /// Create an account.
    ///
    /// Returns `true` when the server also issued credentials (the session is
    /// now established), `false` when the user still has to log in.
    pub async fn register(&self, name: &str, email: &str, password: &str) -> Result<bool, ApiError> {
        let response = self
            .client
            .post(self.url(REGISTER_PATH))
            .json(&RegisterRequest { name, email, password })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, &body));
        }

        let parsed: AuthResponse = serde_json::from_str(&body).unwrap_or_default();
        match parsed.into_grant() {
            Some(grant) => {
                self.session().establish(grant);
                info!("Registration successful, session established");
                Ok(true)
            }
            None => {
                info!("Registration successful, login required");
                Ok(false)
            }
        }
    }

    /// Explicit logout
    pub fn logout(&self) {
        self.session().terminate();
    }

    /// Fetch the logged-in user's profile
    pub async fn profile(&self) -> Result<Profile, ApiError> {
        let response: ProfileResponse = self.get_json(PROFILE_PATH).await?;
        response
            .data
            .ok_or_else(|| ApiError::InvalidResponse("Profile response did not contain data".to_string()))
    }
}

/// Check if response is successful, returning an error with body if not.
pub(crate) async fn check_response(response: Response) -> Result<Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}
