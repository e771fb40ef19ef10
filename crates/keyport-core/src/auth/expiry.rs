//! Offline inspection of a credential's embedded expiry claim.
//!
//! Credentials are signed tokens of the form `header.payload.signature`
//! where `payload` is base64url-encoded JSON carrying `exp` (seconds since
//! the epoch). Nothing here verifies the signature; the server does that.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::credentials::Credential;

/// Refresh when fewer than this many minutes of validity remain.
pub const DEFAULT_REFRESH_THRESHOLD_MINUTES: i64 = 15;

pub fn default_refresh_threshold() -> Duration {
    Duration::minutes(DEFAULT_REFRESH_THRESHOLD_MINUTES)
}

#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("Credential is not a three-segment token")]
    MalformedStructure,

    #[error("Payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Payload is not a valid claims object: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The subset of claims this client cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Expiry in seconds since the epoch. NumericDate may be fractional.
    pub exp: f64,
}

impl Claims {
    pub fn expires_at_millis(&self) -> f64 {
        self.exp * 1000.0
    }
}

/// Decode the claims segment of a credential.
pub fn decode_claims(credential: &Credential) -> Result<Claims, ClaimsError> {
    let segments: Vec<&str> = credential.as_str().split('.').collect();
    if segments.len() != 3 {
        return Err(ClaimsError::MalformedStructure);
    }

    let payload = segments[1].trim_end_matches('=');
    let bytes = match URL_SAFE_NO_PAD.decode(payload) {
        Ok(bytes) => bytes,
        // Some issuers emit the standard alphabet
        Err(url_err) => STANDARD_NO_PAD.decode(payload).map_err(|_| url_err)?,
    };

    Ok(serde_json::from_slice(&bytes)?)
}

/// Whether the credential expires within `threshold` of now.
///
/// Undecodable credentials count as near expiry.
pub fn is_near_expiry(credential: &Credential, threshold: Duration) -> bool {
    is_near_expiry_at(credential, threshold, Utc::now())
}

/// Clock-injected form of [`is_near_expiry`].
pub fn is_near_expiry_at(credential: &Credential, threshold: Duration, now: DateTime<Utc>) -> bool {
    match decode_claims(credential) {
        Ok(claims) => {
            let remaining_ms = claims.expires_at_millis() - now.timestamp_millis() as f64;
            remaining_ms < threshold.num_milliseconds() as f64
        }
        Err(e) => {
            debug!(error = %e, "Credential claims undecodable, treating as expired");
            true
        }
    }
}

/// Time left before the credential expires (negative once expired).
///
/// `None` when the claims are undecodable or the expiry is out of range.
pub fn time_until_expiry(credential: &Credential) -> Option<Duration> {
    let claims = decode_claims(credential).ok()?;
    let remaining_ms = claims.expires_at_millis() - Utc::now().timestamp_millis() as f64;
    if !remaining_ms.is_finite() || remaining_ms.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(remaining_ms as i64)
}
