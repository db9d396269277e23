//! Persistence: SQLite for triage state, the OS keychain for secrets.
//!
//! All database access goes through [`Database`], which runs rusqlite on the
//! blocking pool. Query functions live in [`queries`], one module per table,
//! and every one of them takes the owning user's id.

mod database;
mod keychain;
pub mod queries;
mod schema;

pub use database::{Database, DatabaseError, Result};
pub use keychain::{KeychainAccess, KeychainError};

use std::path::Path;

/// What the daemon opens at startup: the triage database and the keychain
/// holding backend secrets.
#[derive(Debug, Clone)]
pub struct StorageLayer {
    db: Database,
    keychain: KeychainAccess,
}

impl StorageLayer {
    /// Opens the database at `db_path` with the default keychain service.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(db_path).await?, KeychainAccess::new()))
    }

    /// Creates a storage layer from already opened parts.
    pub fn new(db: Database, keychain: KeychainAccess) -> Self {
        Self { db, keychain }
    }

    /// Returns the database handle.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Returns the keychain access.
    pub fn keychain(&self) -> &KeychainAccess {
        &self.keychain
    }
}
