use log::{debug, error};
use std::sync::Mutex;

const SERVICE_NAME: &str = "com.mathgrade.app";

/// Fixed key identifying the analysis credential.
pub const CREDENTIAL_KEY: &str = "analysis_api_key";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to access keychain entry: {0}")]
    Entry(String),
    #[error("Failed to store credential: {0}")]
    Store(String),
    #[error("Failed to delete credential: {0}")]
    Delete(String),
    #[error("API key was rejected by {0} or the service is unreachable; not stored")]
    Rejected(String),
}

/// Opaque secret store for the single analysis credential.
pub trait CredentialStore {
    /// Blank values count as absent.
    fn get(&self) -> Option<String>;
    fn set(&self, value: &str) -> Result<(), CredentialError>;
    fn delete(&self) -> Result<(), CredentialError>;

    fn is_present(&self) -> bool {
        self.get().is_some()
    }

    /// Masked form for display: bullets plus the last four characters.
    fn hint(&self) -> Option<String> {
        self.get().map(|key| mask(&key))
    }
}

fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let last4: String = if chars.len() >= 4 {
        chars[chars.len() - 4..].iter().collect()
    } else {
        key.to_string()
    };
    format!(
        "\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}\u{2022}{}",
        last4
    )
}

/* ──────────────────────────────────────────────────────────────── */

/// OS keychain backed store; survives restarts.
pub struct KeyringCredentialStore {
    key: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            key: CREDENTIAL_KEY.to_string(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(SERVICE_NAME, &self.key).map_err(|e| {
            error!("Failed to create keyring entry for '{}': {}", self.key, e);
            CredentialError::Entry(e.to_string())
        })
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self) -> Option<String> {
        let entry = self.entry().ok()?;
        match entry.get_password() {
            Ok(key) if key.trim().is_empty() => None,
            Ok(key) => Some(key),
            Err(keyring::Error::NoEntry) => {
                debug!("No keychain entry found for '{}'", self.key);
                None
            }
            Err(e) => {
                error!("Failed to retrieve '{}' from keychain: {}", self.key, e);
                None
            }
        }
    }

    fn set(&self, value: &str) -> Result<(), CredentialError> {
        self.entry()?.set_password(value.trim()).map_err(|e| {
            error!("Failed to store '{}' in keychain: {}", self.key, e);
            CredentialError::Store(e.to_string())
        })
    }

    fn delete(&self) -> Result<(), CredentialError> {
        match self.entry()?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => {
                debug!("No keychain entry to delete for '{}'", self.key);
                Ok(())
            }
            Err(e) => {
                error!("Failed to delete '{}' from keychain: {}", self.key, e);
                Err(CredentialError::Delete(e.to_string()))
            }
        }
    }
}

/* ──────────────────────────────────────────────────────────────── */

/// Process-local store, used for one-shot keys and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    value: Mutex<Option<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: &str) -> Self {
        Self {
            value: Mutex::new(Some(value.to_string())),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<String> {
        let guard = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone().filter(|key| !key.trim().is_empty())
    }

    fn set(&self, value: &str) -> Result<(), CredentialError> {
        *self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(value.trim().to_string());
        Ok(())
    }

    fn delete(&self) -> Result<(), CredentialError> {
        *self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for Box<T> {
    fn get(&self) -> Option<String> {
        (**self).get()
    }

    fn set(&self, value: &str) -> Result<(), CredentialError> {
        (**self).set(value)
    }

    fn delete(&self) -> Result<(), CredentialError> {
        (**self).delete()
    }
}
