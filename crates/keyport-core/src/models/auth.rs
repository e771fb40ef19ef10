use serde::{Deserialize, Serialize};

use crate::auth::{Credential, TokenGrant};

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh: &'a str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TokenPayload {
    access: Option<String>,
    refresh: Option<String>,
}

/// Token envelope. The server nests tokens under `data`; some endpoints
/// return them at the top level instead.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    data: Option<TokenPayload>,
    #[serde(default)]
    access: Option<String>,
    #[serde(default)]
    refresh: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AuthResponse {
    /// Extract the issued tokens, or `None` when no access token is present.
    pub fn into_grant(self) -> Option<TokenGrant> {
        let nested = self.data.unwrap_or_default();
        let access = nested.access.or(self.access).filter(|t| !t.is_empty())?;
        let refresh = nested.refresh.or(self.refresh).filter(|t| !t.is_empty());

        Some(TokenGrant {
            access: Credential::new(access),
            refresh: refresh.map(Credential::new),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    /// Account balance
    #[serde(default)]
    pub saldo: f64,
    #[serde(default)]
    pub is_staff: bool,
}

impl Profile {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.email
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileResponse {
    #[serde(default)]
    pub data: Option<Profile>,
}
