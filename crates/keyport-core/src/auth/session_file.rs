use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::credentials::{Credential, CredentialStore, MemoryStore, Slot};

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// On-disk layout of `session.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionFileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<Credential>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Credential store persisted as JSON in the cache directory.
pub struct FileStore {
    path: PathBuf,
    mirror: MemoryStore,
    // Serializes disk writes so the file always matches one mirror state
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store, loading any existing session file.
    pub fn open(cache_dir: impl AsRef<Path>) -> Result<Self> {
        let path = cache_dir.as_ref().join(SESSION_FILE);
        let mirror = MemoryStore::new();

        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read session file")?;
            let data: SessionFileData = serde_json::from_str(&contents)
                .context("Failed to parse session file")?;
            if let Some(ref token) = data.token {
                mirror.set(Slot::Access, token)?;
            }
            if let Some(ref refresh) = data.refresh_token {
                mirror.set(Slot::Refresh, refresh)?;
            }
            debug!(path = %path.display(), "Session file loaded");
        }

        Ok(Self {
            path,
            mirror,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock();

        if self.mirror.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove session file")?;
            }
            return Ok(());
        }

        let data = SessionFileData {
            token: self.mirror.get(Slot::Access),
            refresh_token: self.mirror.get(Slot::Refresh),
            updated_at: Some(Utc::now()),
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&data)?;
        std::fs::write(&self.path, contents).context("Failed to write session file")?;
        Ok(())
    }
}

impl CredentialStore for FileStore {
    fn get(&self, slot: Slot) -> Option<Credential> {
        self.mirror.get(slot)
    }

    fn set(&self, slot: Slot, credential: &Credential) -> Result<()> {
        self.mirror.set(slot, credential)?;
        self.persist()
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        self.mirror.remove(slot)?;
        self.persist()
    }

    fn clear(&self) -> Result<()> {
        for slot in Slot::ALL {
            self.mirror.remove(slot)?;
        }
        self.persist()
    }
}
