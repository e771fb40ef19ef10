//! Session credential lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: where the access and refresh credentials live
//!   (`MemoryStore`, `FileStore`, `KeyringStore`)
//! - `expiry`: offline check of a credential's `exp` claim
//! - `Session`: store access, session events, and termination
//! - `RefreshCoordinator`: single-flight credential refresh
//! - `ProactiveScheduler`: refreshes ahead of expiry on a timer and on
//!   foreground events

pub mod credentials;
pub mod expiry;
pub mod keychain;
pub mod refresh;
pub mod scheduler;
pub mod session;
pub mod session_file;

pub use credentials::{Credential, CredentialStore, MemoryStore, Slot, TokenGrant};
pub use keychain::KeyringStore;
pub use refresh::{RefreshCoordinator, TokenRefresher};
pub use scheduler::{ProactiveScheduler, SchedulerHandle};
pub use session::{Session, SessionEvent};
pub use session_file::FileStore;
