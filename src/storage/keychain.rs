//! OS keychain access for inference API keys and the Gmail client secret.
//!
//! Secrets never touch the settings file. Settings only name the keychain
//! key a secret lives under; [`KeychainAccess::ai_api_key`] and
//! [`KeychainAccess::gmail_client_secret_key`] produce the default names.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeychainError {
    #[error("keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("no secret stored under {0}")]
    NotFound(String),

    #[error("blocking task failed: {0}")]
    TaskFailed(String),
}

pub type Result<T> = std::result::Result<T, KeychainError>;

/// Secrets under one keychain service name.
#[derive(Debug, Clone)]
pub struct KeychainAccess {
    service_name: String,
}

impl KeychainAccess {
    pub const DEFAULT_SERVICE: &'static str = "io.inbox-triage";

    /// Creates keychain access under [`Self::DEFAULT_SERVICE`].
    pub fn new() -> Self {
        Self::with_service(Self::DEFAULT_SERVICE)
    }

    /// Creates keychain access under a custom service name, e.g. to keep test
    /// secrets apart from real ones.
    pub fn with_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Returns the service name secrets are stored under.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Key for an inference backend's API key, e.g. `ai.api_key.anthropic`.
    pub fn ai_api_key(provider: &str) -> String {
        format!("ai.api_key.{provider}")
    }

    /// Key for the Gmail OAuth client secret.
    pub fn gmail_client_secret_key() -> String {
        "gmail.client_secret".to_string()
    }

    /// Runs `op` against the entry for `key` on the blocking pool; keyring
    /// backends may prompt or hit D-Bus.
    async fn with_entry<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce(keyring::Entry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service_name.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || op(keyring::Entry::new(&service, &key)?))
            .await
            .map_err(|e| KeychainError::TaskFailed(e.to_string()))?
    }

    /// Stores a secret, replacing any previous value.
    pub async fn store(&self, key: &str, value: &str) -> Result<()> {
        let value = value.to_string();
        self.with_entry(key, move |entry| Ok(entry.set_password(&value)?))
            .await
    }

    /// The secret under `key`, or `None` when nothing is stored.
    pub async fn retrieve(&self, key: &str) -> Result<Option<String>> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    /// Like [`retrieve`](Self::retrieve), but a missing secret is an error.
    pub async fn require(&self, key: &str) -> Result<String> {
        self.retrieve(key)
            .await?
            .ok_or_else(|| KeychainError::NotFound(key.to_string()))
    }

    /// Removes the secret under `key`. Deleting a missing secret is
    /// [`KeychainError::NotFound`].
    pub async fn delete(&self, key: &str) -> Result<()> {
        let missing = key.to_string();
        self.with_entry(key, move |entry| match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Err(KeychainError::NotFound(missing)),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

impl Default for KeychainAccess {
    fn default() -> Self {
        Self::new()
    }
}
