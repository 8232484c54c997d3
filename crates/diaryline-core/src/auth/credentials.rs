use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Keychain service name used when none is configured
pub const DEFAULT_SERVICE_NAME: &str = "diaryline";

/// Keychain account holding the credential blob
const ACCOUNT_NAME: &str = "authToken";

/// The persisted access token. Stored as a single JSON blob.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Decode a stored blob. Blobs written as a bare token string are accepted.
    pub fn from_blob(blob: &str) -> Result<Self> {
        let blob = blob.trim();
        if blob.starts_with('{') {
            return serde_json::from_str(blob).context("Failed to parse stored credential");
        }
        if blob.is_empty() {
            anyhow::bail!("Stored credential is empty");
        }
        Ok(Self {
            access_token: blob.to_string(),
            saved_at: None,
        })
    }

    pub fn to_blob(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode credential")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("saved_at", &self.saved_at)
            .finish()
    }
}

/// Secure storage for the single session credential (last write wins).
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<Option<Credential>>;
    fn set(&self, credential: &Credential) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Credential store backed by the OS keychain.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(&self.service, ACCOUNT_NAME).context("Failed to create keyring entry")
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Result<Option<Credential>> {
        match self.entry()?.get_password() {
            Ok(blob) => Credential::from_blob(&blob).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn set(&self, credential: &Credential) -> Result<()> {
        self.entry()?
            .set_password(&credential.to_blob()?)
            .context("Failed to store credential in keychain")
    }

    fn clear(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}

/// Process-local credential store for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }

    /// Stored token, if any
    pub fn token(&self) -> Option<String> {
        self.slot.lock().as_ref().map(|c| c.access_token.clone())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Result<Option<Credential>> {
        Ok(self.slot.lock().clone())
    }

    fn set(&self, credential: &Credential) -> Result<()> {
        *self.slot.lock() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}
