//! Configuration and settings management.
//!
//! Settings are stored in the user's config directory as JSON. Secrets are
//! referenced by keychain id and read through
//! [`KeychainAccess`](crate::storage::KeychainAccess).

mod settings;

pub use settings::{
    config_path, AiSettings, ConfigError, DraftSettings, GmailSettings, ImapSettings,
    MailProviderKind, MailSettings, ProviderSettings, Settings, StorageSettings, SyncSettings,
};
