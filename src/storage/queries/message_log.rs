//! Audit log writes and reads.

use chrono::Utc;
use rusqlite::params;

use super::{from_db_time, to_db_time};
use crate::domain::{new_id, LogEntry, LogKind, UserId};
use crate::storage::database::{Database, Result};

/// Appends an entry.
pub async fn append(db: &Database, user_id: &UserId, kind: LogKind, subject: &str) -> Result<()> {
    let user_id = user_id.clone();
    let subject = subject.to_string();

    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO message_log (id, user_id, kind, subject, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![new_id(), user_id.0, kind.as_str(), subject, to_db_time(&Utc::now())],
        )?;
        Ok(())
    })
    .await
}

/// Most recent entries first.
pub async fn recent(db: &Database, user_id: &UserId, limit: u32) -> Result<Vec<LogEntry>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, kind, subject, created_at FROM message_log
            WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![user_id.0, limit], |row| {
            let kind: String = row.get(2)?;
            let created_at: String = row.get(4)?;
            let kind = kind.parse::<LogKind>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
            })?;
            Ok(LogEntry {
                id: row.get(0)?,
                user_id: UserId(row.get(1)?),
                kind,
                subject: row.get(3)?,
                created_at: from_db_time(&created_at),
            })
        })?;
        let entries: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(entries?)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::test_support::setup_db_with_user;

    #[tokio::test]
    async fn append_and_read_back() {
        let (db, user) = setup_db_with_user().await;

        append(&db, &user, LogKind::Received, "Opening hours").await.unwrap();
        append(&db, &user, LogKind::AutoReply, "Re: Opening hours").await.unwrap();

        let entries = recent(&db, &user, 10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, LogKind::AutoReply);
        assert_eq!(entries[1].subject, "Opening hours");
    }
}
