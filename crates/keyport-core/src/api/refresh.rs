use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::debug;

use super::client::check_response;
use super::ApiError;
use crate::auth::{Credential, TokenGrant, TokenRefresher};
use crate::models::{AuthResponse, RefreshRequest};

/// Refresh endpoint path, relative to the API base URL
pub const REFRESH_PATH: &str = "/api/auth/refresh/";

/// `TokenRefresher` that talks to the refresh endpoint over HTTP.
#[derive(Clone)]
pub struct HttpTokenRefresher {
    client: Client,
    url: String,
}

impl HttpTokenRefresher {
    /// Create a refresher sharing `client`'s connection pool.
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn exchange(
        &self,
        credential: &Credential,
        refresh: Option<&Credential>,
    ) -> Result<TokenGrant, ApiError> {
        let mut request = self
            .client
            .post(&self.url)
            .bearer_auth(credential.as_str())
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(refresh) = refresh {
            request = request.json(&RefreshRequest {
                refresh: refresh.as_str(),
            });
        }

        let response = request.send().await?;
        let response = check_response(response).await?;
        debug!(status = %response.status(), "Refresh endpoint responded");

        let body: AuthResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse refresh response: {}", e)))?;

        body.into_grant().ok_or_else(|| {
            ApiError::InvalidResponse("Refresh response did not contain an access token".to_string())
        })
    }
}
