use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Opaque bearer token.
///
/// `Debug` is redacted so a credential can sit inside logged structs
/// without leaking the secret.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<redacted, {} bytes>)", self.0.len())
    }
}

impl From<String> for Credential {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for Credential {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

/// Storage slot for a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Short-lived access credential
    Access,
    /// Optional long-lived refresh credential
    Refresh,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::Access, Slot::Refresh];

    /// Persistent key name for this slot
    pub fn key(self) -> &'static str {
        match self {
            Slot::Access => "token",
            Slot::Refresh => "refresh_token",
        }
    }
}

/// Credentials issued by login, registration or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access: Credential,
    pub refresh: Option<Credential>,
}

impl TokenGrant {
    pub fn new(access: impl Into<Credential>) -> Self {
        Self {
            access: access.into(),
            refresh: None,
        }
    }

    pub fn with_refresh(mut self, refresh: impl Into<Credential>) -> Self {
        self.refresh = Some(refresh.into());
        self
    }
}

/// Persistent home of the session credentials.
///
/// Implementations hold at most one value per slot. `get` never touches
/// the backing medium; `set` and `remove` update the in-process value
/// first and only then persist, so a persistence error never leaves the
/// running process with a stale view.
pub trait CredentialStore: Send + Sync {
    fn get(&self, slot: Slot) -> Option<Credential>;

    fn set(&self, slot: Slot, credential: &Credential) -> Result<()>;

    fn remove(&self, slot: Slot) -> Result<()>;

    /// Remove both slots
    fn clear(&self) -> Result<()> {
        let mut first_error = None;
        for slot in Slot::ALL {
            if let Err(e) = self.remove(slot) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// In-process store. Also serves as the mirror for the persistent stores.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<Slot, Credential>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, slot: Slot) -> Option<Credential> {
        self.slots.read().get(&slot).cloned()
    }

    fn set(&self, slot: Slot, credential: &Credential) -> Result<()> {
        self.slots.write().insert(slot, credential.clone());
        Ok(())
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        self.slots.write().remove(&slot);
        Ok(())
    }
}
