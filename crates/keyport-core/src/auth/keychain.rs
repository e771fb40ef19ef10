use anyhow::{Context, Result};
use keyring::Entry;
use tracing::{debug, warn};

use super::credentials::{Credential, CredentialStore, MemoryStore, Slot};

/// Default keychain service name
pub const SERVICE_NAME: &str = "keyport";

/// Credential store backed by the OS keychain, one entry per slot.
pub struct KeyringStore {
    service: String,
    mirror: MemoryStore,
}

impl KeyringStore {
    /// Open the store and load whatever the keychain currently holds.
    pub fn open(service: impl Into<String>) -> Result<Self> {
        let service = service.into();
        let mirror = MemoryStore::new();

        for slot in Slot::ALL {
            let entry = Self::entry(&service, slot)?;
            match entry.get_password() {
                Ok(secret) => {
                    mirror.set(slot, &Credential::new(secret))?;
                    debug!(slot = slot.key(), "Loaded credential from keychain");
                }
                Err(keyring::Error::NoEntry) => {}
                Err(e) => warn!(slot = slot.key(), error = %e, "Failed to read keychain entry"),
            }
        }

        Ok(Self { service, mirror })
    }

    fn entry(service: &str, slot: Slot) -> Result<Entry> {
        Entry::new(service, slot.key()).context("Failed to create keyring entry")
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, slot: Slot) -> Option<Credential> {
        self.mirror.get(slot)
    }

    fn set(&self, slot: Slot, credential: &Credential) -> Result<()> {
        self.mirror.set(slot, credential)?;
        Self::entry(&self.service, slot)?
            .set_password(credential.as_str())
            .context("Failed to store credential in keychain")?;
        Ok(())
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        self.mirror.remove(slot)?;
        match Self::entry(&self.service, slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::collections::HashMap;
    use std::sync::{Arc, Once};

    use keyring::credential::{Credential as KeyringCredential, CredentialApi, CredentialBuilderApi};
    use parking_lot::Mutex;

    use super::*;

    type Vault = Arc<Mutex<HashMap<(String, String), Vec<u8>>>>;

    /// Keychain stand-in shared by every entry, so a reopened store sees
    /// what an earlier one wrote.
    struct VaultBuilder(Vault);

    struct VaultEntry {
        vault: Vault,
        key: (String, String),
    }

    impl CredentialApi for VaultEntry {
        fn set_password(&self, password: &str) -> keyring::Result<()> {
            self.set_secret(password.as_bytes())
        }

        fn set_secret(&self, secret: &[u8]) -> keyring::Result<()> {
            self.vault.lock().insert(self.key.clone(), secret.to_vec());
            Ok(())
        }

        fn get_password(&self) -> keyring::Result<String> {
            let secret = self.get_secret()?;
            String::from_utf8(secret).map_err(|e| keyring::Error::BadEncoding(e.into_bytes()))
        }

        fn get_secret(&self) -> keyring::Result<Vec<u8>> {
            self.vault.lock().get(&self.key).cloned().ok_or(keyring::Error::NoEntry)
        }

        fn delete_credential(&self) -> keyring::Result<()> {
            self.vault.lock().remove(&self.key).map(|_| ()).ok_or(keyring::Error::NoEntry)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl CredentialBuilderApi for VaultBuilder {
        fn build(
            &self,
            _target: Option<&str>,
            service: &str,
            user: &str,
        ) -> keyring::Result<Box<KeyringCredential>> {
            Ok(Box::new(VaultEntry {
                vault: Arc::clone(&self.0),
                key: (service.to_string(), user.to_string()),
            }))
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn use_test_vault() {
        static INSTALL: Once = Once::new();
        INSTALL.call_once(|| {
            keyring::set_default_credential_builder(Box::new(VaultBuilder(Vault::default())));
        });
    }

    #[test]
    fn test_credentials_survive_reopen() {
        use_test_vault();
        let store = KeyringStore::open("keyport-test-reopen").unwrap();
        store.set(Slot::Access, &Credential::new("persisted")).unwrap();
        store.set(Slot::Refresh, &Credential::new("long-lived")).unwrap();
        drop(store);

        let reopened = KeyringStore::open("keyport-test-reopen").unwrap();
        assert_eq!(reopened.get(Slot::Access), Some(Credential::new("persisted")));
        assert_eq!(reopened.get(Slot::Refresh), Some(Credential::new("long-lived")));
    }

    #[test]
    fn test_clear_removes_keychain_entries() {
        use_test_vault();
        let store = KeyringStore::open("keyport-test-clear").unwrap();
        store.set(Slot::Access, &Credential::new("access")).unwrap();

        // Refresh slot was never written; deleting it is not an error
        store.clear().unwrap();
        assert!(store.get(Slot::Access).is_none());

        let reopened = KeyringStore::open("keyport-test-clear").unwrap();
        assert!(reopened.get(Slot::Access).is_none());
        assert!(reopened.get(Slot::Refresh).is_none());
    }
}
