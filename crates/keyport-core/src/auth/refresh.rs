//! Single-flight credential refresh.
//!
//! Any number of callers may ask for a refresh at the same moment (typically
//! every request that just got a 401 after the credential expired). Only the
//! first one starts a network exchange; the rest await the same shared
//! result. The exchange runs on its own task so a caller giving up never
//! cancels it for the others.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::credentials::{Credential, TokenGrant};
use super::session::Session;
use crate::api::ApiError;

/// Performs the network exchange of a stale credential for a fresh one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange `credential` (and the refresh credential, when held) for a
    /// new grant.
    ///
    /// # Errors
    /// Returns an error for which [`ApiError::is_auth_rejection`] holds when
    /// the server refuses the credentials; any other error is transient.
    async fn exchange(
        &self,
        credential: &Credential,
        refresh: Option<&Credential>,
    ) -> Result<TokenGrant, ApiError>;
}

type InFlight = Shared<BoxFuture<'static, Option<Credential>>>;

struct Inner {
    session: Session,
    refresher: Arc<dyn TokenRefresher>,
    in_flight: Mutex<Option<InFlight>>,
}

/// Refreshes the session credential, at most one exchange at a time.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

/// Clears the in-flight slot when the exchange task finishes or unwinds.
struct SettleGuard(Arc<Inner>);

impl Drop for SettleGuard {
    fn drop(&mut self) {
        self.0.in_flight.lock().take();
    }
}

impl RefreshCoordinator {
    pub fn new(session: Session, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                refresher,
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Whether an exchange is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Obtain a fresh credential.
    ///
    /// Joins the outstanding exchange if there is one. Resolves to `None`
    /// when there is nothing to refresh or the exchange failed; an explicit
    /// rejection by the server has already terminated the session by then.
    /// Must be called from within a Tokio runtime.
    pub async fn refresh(&self) -> Option<Credential> {
        let flight = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight credential refresh");
                    existing.clone()
                }
                None => {
                    let flight = self.start_exchange();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    // Caller holds the in-flight lock; the spawned task cannot clear the
    // slot before it has been filled.
    fn start_exchange(&self) -> InFlight {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let guard = SettleGuard(Arc::clone(&inner));
            let outcome = inner.perform_refresh().await;
            drop(guard);
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "Credential refresh task failed");
                    None
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl Inner {
    async fn perform_refresh(&self) -> Option<Credential> {
        let Some(current) = self.session.credential() else {
            debug!("No credential to refresh");
            return None;
        };
        let refresh = self.session.refresh_credential();

        debug!(has_refresh = refresh.is_some(), "Refreshing credential");
        // The session may be logged out or replaced while the exchange is
        // out; outcomes only apply to the session that was refreshed
        match self.refresher.exchange(&current, refresh.as_ref()).await {
            Ok(grant) => {
                let access = grant.access.clone();
                let held = self.session.apply_refresh(&current, grant);
                if held.as_ref() == Some(&access) {
                    info!("Credential refreshed");
                }
                held
            }
            Err(e) if e.is_auth_rejection() => {
                warn!(error = %e, "Refresh rejected by server");
                self.session.terminate_rejected(&current)
            }
            Err(e) => {
                warn!(error = %e, "Credential refresh failed, will retry later");
                None
            }
        }
    }
}
