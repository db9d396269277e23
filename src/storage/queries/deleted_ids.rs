//! External ids the user deleted; sync must never re-import them.

use std::collections::HashSet;

use chrono::Utc;
use rusqlite::params;

use super::to_db_time;
use crate::domain::{ExternalMessageId, UserId};
use crate::storage::database::{Database, Result};

/// Records an external id. Re-recording is a no-op.
pub async fn insert(db: &Database, user_id: &UserId, external_id: &ExternalMessageId) -> Result<()> {
    let user_id = user_id.clone();
    let external_id = external_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO deleted_external_ids (user_id, external_id, deleted_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, external_id) DO NOTHING
            "#,
            params![user_id.0, external_id.0, to_db_time(&Utc::now())],
        )?;
        Ok(())
    })
    .await
}

/// All external ids the user deleted.
pub async fn list(db: &Database, user_id: &UserId) -> Result<HashSet<ExternalMessageId>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let mut stmt =
            conn.prepare("SELECT external_id FROM deleted_external_ids WHERE user_id = ?1")?;
        let rows = stmt.query_map([&user_id.0], |row| row.get::<_, String>(0))?;
        let ids: std::result::Result<HashSet<_>, _> =
            rows.map(|r| r.map(ExternalMessageId)).collect();
        Ok(ids?)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::test_support::setup_db_with_user;

    #[tokio::test]
    async fn insert_twice_is_absorbed() {
        let (db, user) = setup_db_with_user().await;
        let id = ExternalMessageId::from("18c2f");

        insert(&db, &user, &id).await.unwrap();
        insert(&db, &user, &id).await.unwrap();

        let ids = list(&db, &user).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&id));
    }
}
