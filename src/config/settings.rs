//! Settings types and persistence.
//!
//! Settings are persisted to `settings.json` in the platform config directory
//! (`~/.config/inbox-triage/` on Linux) and loaded at startup. A missing file
//! means defaults. Secrets never live here; entries only name keychain ids.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::KeychainAccess;

/// Errors loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no home directory to place settings in")]
    NoConfigDir,

    #[error("settings IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is invalid: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Inference backend configuration.
    pub ai: AiSettings,
    /// Background sync settings.
    pub sync: SyncSettings,
    /// Mail source configuration.
    pub mail: MailSettings,
    /// Reply drafting style.
    pub drafting: DraftSettings,
    /// Database location.
    pub storage: StorageSettings,
}

impl Settings {
    /// Loads settings from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(config_path()?)
    }

    /// Loads settings from `path`, or defaults when the file does not exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No settings file, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Saves settings to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(config_path()?)
    }

    /// Writes settings as pretty JSON, creating the parent directory.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Configured database path, or `triage.db` in the data directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(project_dirs()?.data_dir().join("triage.db")),
        }
    }
}

fn project_dirs() -> Result<ProjectDirs, ConfigError> {
    ProjectDirs::from("", "", "inbox-triage").ok_or(ConfigError::NoConfigDir)
}

/// Default settings file location.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(project_dirs()?.config_dir().join("settings.json"))
}

/// Inference backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// Master switch. When off, every message gets the default classification
    /// and no draft.
    pub enabled: bool,
    /// Name of the provider entry to use.
    pub default_provider: String,
    /// Provider-specific configurations keyed by provider name.
    pub providers: HashMap<String, ProviderSettings>,
    /// Sampling temperature for classification.
    pub classification_temperature: f32,
    /// Sampling temperature for drafting.
    pub draft_temperature: f32,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_provider: "openai".to_string(),
            providers: HashMap::from([(
                "openai".to_string(),
                ProviderSettings {
                    api_key_keychain_id: Some(KeychainAccess::ai_api_key("openai")),
                    base_url: None,
                    model: "gpt-4o-mini".to_string(),
                },
            )]),
            classification_temperature: 0.2,
            draft_temperature: 0.3,
        }
    }
}

impl AiSettings {
    /// The entry named by `default_provider`.
    pub fn active_provider(&self) -> Option<&ProviderSettings> {
        self.providers.get(&self.default_provider)
    }
}

/// Configuration for a single inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Keychain identifier for the API key.
    pub api_key_keychain_id: Option<String>,
    /// Custom API endpoint (for self-hosted or compatible APIs).
    pub base_url: Option<String>,
    /// Model identifier.
    pub model: String,
}

/// Background sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Whether background sync is enabled.
    pub enabled: bool,
    /// Sync interval in seconds.
    pub interval_seconds: u64,
    /// Most recent inbox messages fetched per sync.
    pub max_messages_per_sync: u32,
    /// Wait after the first failure; doubles per consecutive failure.
    pub backoff_base_seconds: u64,
    /// Upper bound on the failure wait.
    pub backoff_max_seconds: u64,
    /// The scheduler gives up after this many failures in a row.
    pub max_consecutive_failures: u32,
    /// Timeout for a single external call.
    pub request_timeout_seconds: u64,
    /// Timeout for a whole sync.
    pub sync_timeout_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 300,
            max_messages_per_sync: 30,
            backoff_base_seconds: 30,
            backoff_max_seconds: 1800,
            max_consecutive_failures: 5,
            request_timeout_seconds: 30,
            sync_timeout_seconds: 600,
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_seconds)
    }
}

/// Which mail source to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProviderKind {
    #[default]
    Gmail,
    Imap,
}

/// Mail source configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub provider: MailProviderKind,
    pub gmail: GmailSettings,
    /// Required when `provider` is `imap`.
    pub imap: Option<ImapSettings>,
}

/// OAuth client registration for the Gmail API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    pub client_id: String,
    /// Keychain identifier for the OAuth client secret.
    pub client_secret_keychain_id: String,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret_keychain_id: KeychainAccess::gmail_client_secret_key(),
        }
    }
}

/// IMAP/SMTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImapSettings {
    /// IMAP server hostname.
    pub imap_host: String,
    /// IMAP server port (typically 993 for TLS).
    pub imap_port: u16,
    /// SMTP server hostname.
    pub smtp_host: String,
    /// SMTP server port (typically 465 for TLS, 587 for STARTTLS).
    pub smtp_port: u16,
    /// Direct TLS for SMTP (true) or STARTTLS (false).
    pub use_tls: bool,
}

impl ImapSettings {
    /// Typical implicit-TLS setup.
    pub fn tls(imap_host: impl Into<String>, smtp_host: impl Into<String>) -> Self {
        Self {
            imap_host: imap_host.into(),
            imap_port: 993,
            smtp_host: smtp_host.into(),
            smtp_port: 465,
            use_tls: true,
        }
    }
}

/// Reply drafting style.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DraftSettings {
    /// Language replies are written in.
    pub language: String,
    /// Opening line used when a reply falls back to the bare template.
    pub greeting: String,
    /// Closing line every reply ends with.
    pub signature: String,
    pub max_reply_sentences: u32,
    /// Previously sent replies shown to the model as style examples.
    pub history_examples: u32,
    /// Reply patterns below this confidence are not offered to the model.
    pub min_pattern_confidence: f64,
}

impl Default for DraftSettings {
    fn default() -> Self {
        Self {
            language: "Slovak".to_string(),
            greeting: "Dobrý deň,".to_string(),
            signature: "S pozdravom".to_string(),
            max_reply_sentences: 8,
            history_examples: 5,
            min_pattern_confidence: 0.7,
        }
    }
}

/// Database location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Overrides the default `<data_dir>/triage.db`.
    pub database_path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.ai.enabled);
        assert!(settings.ai.active_provider().is_some());
        assert_eq!(settings.ai.classification_temperature, 0.2);
        assert_eq!(settings.ai.draft_temperature, 0.3);
        assert_eq!(settings.sync.interval(), Duration::from_secs(300));
        assert_eq!(settings.sync.max_messages_per_sync, 30);
        assert!(settings.sync.sync_timeout() > settings.sync.request_timeout());
        assert_eq!(settings.mail.provider, MailProviderKind::Gmail);
        assert_eq!(settings.drafting.signature, "S pozdravom");
        assert_eq!(settings.drafting.max_reply_sentences, 8);
    }

    #[test]
    fn mail_provider_serialization() {
        let json = serde_json::to_string(&MailProviderKind::Imap).unwrap();
        assert_eq!(json, "\"imap\"");

        let kind: MailProviderKind = serde_json::from_str("\"gmail\"").unwrap();
        assert_eq!(kind, MailProviderKind::Gmail);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"sync": {"interval_seconds": 60}, "drafting": {"language": "English"}}"#)
                .unwrap();
        assert_eq!(settings.sync.interval_seconds, 60);
        assert_eq!(settings.sync.backoff_max_seconds, 1800);
        assert_eq!(settings.drafting.language, "English");
        assert_eq!(settings.drafting.signature, "S pozdravom");
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.sync.interval_seconds, 300);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.mail.provider = MailProviderKind::Imap;
        settings.mail.imap = Some(ImapSettings::tls("imap.example.sk", "smtp.example.sk"));
        settings.ai.default_provider = "ollama".to_string();
        settings.ai.providers.insert(
            "ollama".to_string(),
            ProviderSettings {
                api_key_keychain_id: None,
                base_url: None,
                model: "llama3.1".to_string(),
            },
        );
        settings.storage.database_path = Some(dir.path().join("triage.db"));

        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();

        assert_eq!(loaded.mail.provider, MailProviderKind::Imap);
        assert_eq!(loaded.mail.imap, settings.mail.imap);
        assert_eq!(loaded.ai.active_provider().unwrap().model, "llama3.1");
        assert_eq!(loaded.database_path().unwrap(), dir.path().join("triage.db"));
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
