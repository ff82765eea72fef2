use keyring::Entry;

use super::KeyStore;
use crate::error::StoreError;

const KEYRING_SERVICE: &str = "pulse-chat";

/// Stores each entry as a credential in the OS keyring (Windows Credential Manager,
/// macOS Keychain, Linux kernel keyutils). Every call opens a fresh `Entry`, so
/// values are only visible across calls when the platform store is compiled in.
#[derive(Debug, Clone)]
pub struct KeyringKeyStore {
    service: String,
}

impl Default for KeyringKeyStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl KeyringKeyStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Ok(Entry::new(&self.service, key)?)
    }
}

impl KeyStore for KeyringKeyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?.set_password(value)?;
        Ok(())
    }
}
