//! Relay credentials kept in the OS keychain, one entry per profile.

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(not(test))]
use keyring::Entry;

use hubsync_core::RelayConfig;

use crate::error::CliError;

#[cfg(not(test))]
const KEYRING_SERVICE_NAME: &str = "hubsync-cli";

type StoreResult<T> = Result<T, CliError>;

#[derive(Clone, Debug)]
pub struct RelayConfigStore {
    username: String,
}

impl RelayConfigStore {
    pub fn new(profile_name: &str) -> Self {
        Self {
            username: format!("relay_config:{profile_name}"),
        }
    }

    #[cfg(test)]
    fn test_store() -> &'static Mutex<HashMap<String, String>> {
        static STORE: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
        STORE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    #[cfg(not(test))]
    fn entry(&self) -> StoreResult<Entry> {
        Entry::new(KEYRING_SERVICE_NAME, &self.username)
            .map_err(|error| CliError::SecretStore(error.to_string()))
    }

    #[cfg(not(test))]
    pub fn load(&self) -> StoreResult<Option<RelayConfig>> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(CliError::SecretStore(error.to_string())),
        }
    }

    #[cfg(test)]
    pub fn load(&self) -> StoreResult<Option<RelayConfig>> {
        let guard = Self::test_store()
            .lock()
            .map_err(|error| CliError::SecretStore(error.to_string()))?;
        match guard.get(&self.username) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    #[cfg(not(test))]
    pub fn save(&self, config: &RelayConfig) -> StoreResult<()> {
        let raw = serde_json::to_string(config)?;
        self.entry()?
            .set_password(&raw)
            .map_err(|error| CliError::SecretStore(error.to_string()))
    }

    #[cfg(test)]
    pub fn save(&self, config: &RelayConfig) -> StoreResult<()> {
        let raw = serde_json::to_string(config)?;
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| CliError::SecretStore(error.to_string()))?;
        guard.insert(self.username.clone(), raw);
        Ok(())
    }

    #[cfg(not(test))]
    pub fn clear(&self) -> StoreResult<()> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(CliError::SecretStore(error.to_string())),
        }
    }

    #[cfg(test)]
    pub fn clear(&self) -> StoreResult<()> {
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| CliError::SecretStore(error.to_string()))?;
        guard.remove(&self.username);
        Ok(())
    }
}
