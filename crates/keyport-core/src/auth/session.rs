use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::credentials::{Credential, CredentialStore, Slot, TokenGrant};

/// Buffered session events per subscriber before old ones are dropped
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session lifecycle announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new access credential was written to the store
    CredentialUpdated(Credential),
    /// The store was cleared; the user must log in again
    SessionTerminated,
}

/// Handle on the current session: the credential store plus the
/// announcement channel. Clone is cheap and all clones share state.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn CredentialStore>,
    events: broadcast::Sender<SessionEvent>,
    // Held across every credential transition so a check of the stored
    // credential and the write that depends on it see the same state
    transition: Arc<Mutex<()>>,
}

impl Session {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            events,
            transition: Arc::new(Mutex::new(())),
        }
    }

    /// Current access credential, if any
    pub fn credential(&self) -> Option<Credential> {
        self.store.get(Slot::Access)
    }

    /// Current refresh credential, if any
    pub fn refresh_credential(&self) -> Option<Credential> {
        self.store.get(Slot::Refresh)
    }

    pub fn is_authenticated(&self) -> bool {
        self.credential().is_some()
    }

    /// Listen for session events. Events sent before subscribing are not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a fresh session after login or registration.
    ///
    /// Whatever was stored before is discarded, including a refresh
    /// credential the new grant does not replace.
    pub fn establish(&self, grant: TokenGrant) -> Credential {
        let _transition = self.transition.lock();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear previous session");
        }
        info!(has_refresh = grant.refresh.is_some(), "Session established");
        self.store_grant(grant)
    }

    /// Record the result of a successful refresh of `refreshed`.
    ///
    /// A refresh credential is only replaced when the server rotated it.
    /// If the session no longer holds `refreshed` (logout or a new login
    /// while the exchange was out) the grant is discarded. Returns the
    /// credential the session holds afterwards.
    pub(crate) fn apply_refresh(&self, refreshed: &Credential, grant: TokenGrant) -> Option<Credential> {
        let _transition = self.transition.lock();
        let stored = self.credential();
        if stored.as_ref() != Some(refreshed) {
            debug!(authenticated = stored.is_some(), "Session changed during refresh, discarding grant");
            return stored;
        }
        debug!(rotated_refresh = grant.refresh.is_some(), "Applying refreshed credential");
        Some(self.store_grant(grant))
    }

    /// End the session because the server rejected `rejected`.
    ///
    /// Does nothing if the session has already moved on from `rejected`.
    /// Returns the credential the session holds afterwards.
    pub(crate) fn terminate_rejected(&self, rejected: &Credential) -> Option<Credential> {
        let _transition = self.transition.lock();
        let stored = self.credential();
        if stored.as_ref() != Some(rejected) {
            debug!(authenticated = stored.is_some(), "Session changed during refresh, ignoring rejection");
            return stored;
        }
        self.clear_and_announce();
        None
    }

    fn store_grant(&self, grant: TokenGrant) -> Credential {
        if let Err(e) = self.store.set(Slot::Access, &grant.access) {
            warn!(error = %e, "Failed to persist access credential");
        }
        if let Some(ref refresh) = grant.refresh {
            if let Err(e) = self.store.set(Slot::Refresh, refresh) {
                warn!(error = %e, "Failed to persist refresh credential");
            }
        }
        self.announce(SessionEvent::CredentialUpdated(grant.access.clone()));
        grant.access
    }

    /// End the session: clear both credentials and announce termination.
    ///
    /// Navigating back to a login entry point is left to whoever observes
    /// [`SessionEvent::SessionTerminated`].
    pub fn terminate(&self) {
        let _transition = self.transition.lock();
        self.clear_and_announce();
    }

    fn clear_and_announce(&self) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear credential store");
        }
        info!("Session terminated");
        self.announce(SessionEvent::SessionTerminated);
    }

    fn announce(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}
