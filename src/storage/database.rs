//! SQLite connection wrapper.
//!
//! One connection behind an async mutex; every call hops onto the blocking
//! pool so rusqlite never stalls the runtime. The schema version lives in
//! `PRAGMA user_version` and only pending migrations run on open.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use super::schema;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration {version} failed: {reason}")]
    MigrationFailed { version: usize, reason: String },

    #[error("blocking task failed: {0}")]
    TaskFailed(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Runs `f` on the blocking pool.
async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
}

/// Shared handle to the triage database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database file and its parent directory, then
    /// applies pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
            // Scheduled and manual syncs share the file.
            conn.busy_timeout(Duration::from_secs(5))?;
            Ok(conn)
        })
        .await?;

        Self::migrated(conn).await
    }

    /// Opens a private in-memory database with the full schema, for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = blocking(|| {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(conn)
        })
        .await?;

        Self::migrated(conn).await
    }

    async fn migrated(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn_mut(migrate).await?;
        Ok(db)
    }

    /// Current schema version.
    pub async fn schema_version(&self) -> Result<usize> {
        self.with_conn(user_version).await
    }

    /// Runs `f` with the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        blocking(move || f(&conn.blocking_lock())).await
    }

    /// Like [`with_conn`](Self::with_conn), for work that needs `&mut`,
    /// such as opening a transaction by hand.
    pub async fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        blocking(move || f(&mut conn.blocking_lock())).await
    }

    /// Runs `f` inside a transaction: committed on `Ok`, rolled back on
    /// `Err`.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_conn_mut(move |conn| {
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

fn user_version(conn: &Connection) -> Result<usize> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(usize::try_from(version).unwrap_or(0))
}

/// Applies every migration newer than `user_version`, each in its own
/// transaction together with the version bump.
fn migrate(conn: &mut Connection) -> Result<()> {
    let current = user_version(conn)?;
    for (index, sql) in schema::all_migrations().into_iter().enumerate().skip(current) {
        let version = index + 1;
        let fail = |e: rusqlite::Error| DatabaseError::MigrationFailed {
            version,
            reason: e.to_string(),
        };
        let tx = conn.transaction()?;
        tx.execute_batch(sql).map_err(fail)?;
        tx.pragma_update(None, "user_version", version as i64)
            .map_err(fail)?;
        tx.commit()?;
    }
    Ok(())
}
