//! User rows: profile, policy flags and the mail credential.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{from_db_time, to_db_time};
use crate::domain::{MailCredential, User, UserId};
use crate::storage::database::{Database, Result};

const USER_COLUMNS: &str = r#"
    id, email, display_name, ai_processing_enabled, auto_reply_enabled,
    mail_connected, mail_credential, mail_address, created_at, updated_at
"#;

/// Inserts a new user.
pub async fn insert(db: &Database, user: &User) -> Result<()> {
    let user = user.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO users (
                id, email, display_name, ai_processing_enabled, auto_reply_enabled,
                mail_connected, mail_credential, mail_address, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                user.id.0,
                user.email,
                user.display_name,
                user.ai_processing_enabled as i32,
                user.auto_reply_enabled as i32,
                user.credential.is_some() as i32,
                user.credential.as_ref().map(|c| c.0.clone()),
                user.mail_address,
                to_db_time(&user.created_at),
                to_db_time(&user.updated_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a user by id.
pub async fn get_by_id(db: &Database, user_id: &UserId) -> Result<Option<User>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let user = stmt.query_row([&user_id.0], row_to_user).optional()?;
        Ok(user)
    })
    .await
}

/// Lists users with an active mail credential.
pub async fn list_connected(db: &Database) -> Result<Vec<User>> {
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE mail_connected = 1 ORDER BY created_at ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_user)?;
        let users: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(users?)
    })
    .await
}

/// Stores a credential and marks the mail source connected.
pub async fn connect_mail(
    db: &Database,
    user_id: &UserId,
    credential: &MailCredential,
    mail_address: Option<&str>,
) -> Result<bool> {
    let user_id = user_id.clone();
    let credential = credential.clone();
    let mail_address = mail_address.map(str::to_string);

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE users
            SET mail_connected = 1, mail_credential = ?1, mail_address = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![credential.0, mail_address, to_db_time(&Utc::now()), user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// Drops the stored credential.
///
/// Used both for an explicit disconnect and when the mail source rejects the
/// credential; a revoked token must not be retried.
pub async fn invalidate_credential(db: &Database, user_id: &UserId) -> Result<bool> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE users
            SET mail_connected = 0, mail_credential = NULL, updated_at = ?1
            WHERE id = ?2
            "#,
            params![to_db_time(&Utc::now()), user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// Updates the processing policy flags.
pub async fn set_policy(
    db: &Database,
    user_id: &UserId,
    ai_processing_enabled: bool,
    auto_reply_enabled: bool,
) -> Result<bool> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE users
            SET ai_processing_enabled = ?1, auto_reply_enabled = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
            params![
                ai_processing_enabled as i32,
                auto_reply_enabled as i32,
                to_db_time(&Utc::now()),
                user_id.0
            ],
        )?;
        Ok(changed > 0)
    })
    .await
}

fn row_to_user(row: &Row<'_>) -> std::result::Result<User, rusqlite::Error> {
    let connected = row.get::<_, i32>(5)? != 0;
    let credential: Option<String> = row.get(6)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok(User {
        id: UserId(row.get(0)?),
        email: row.get(1)?,
        display_name: row.get(2)?,
        ai_processing_enabled: row.get::<_, i32>(3)? != 0,
        auto_reply_enabled: row.get::<_, i32>(4)? != 0,
        credential: credential.filter(|_| connected).map(MailCredential),
        mail_address: row.get(7)?,
        created_at: from_db_time(&created_at),
        updated_at: from_db_time(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_get_user() {
        let db = Database::open_in_memory().await.unwrap();
        let user = User::new("jana@example.sk").with_display_name("Jana");

        insert(&db, &user).await.unwrap();

        let loaded = get_by_id(&db, &user.id).await.unwrap().unwrap();
        assert_eq!(loaded.email, "jana@example.sk");
        assert_eq!(loaded.display_name.as_deref(), Some("Jana"));
        assert!(loaded.ai_processing_enabled);
        assert!(!loaded.auto_reply_enabled);
        assert!(loaded.credential.is_none());
    }

    #[tokio::test]
    async fn get_missing_user_returns_none() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(get_by_id(&db, &UserId::from("ghost")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connect_then_invalidate() {
        let db = Database::open_in_memory().await.unwrap();
        let user = User::new("jana@example.sk");
        insert(&db, &user).await.unwrap();

        let cred = MailCredential::new("refresh-token");
        assert!(connect_mail(&db, &user.id, &cred, Some("jana@gmail.com"))
            .await
            .unwrap());

        let loaded = get_by_id(&db, &user.id).await.unwrap().unwrap();
        assert_eq!(loaded.credential, Some(cred));
        assert_eq!(loaded.mail_address.as_deref(), Some("jana@gmail.com"));
        assert_eq!(list_connected(&db).await.unwrap().len(), 1);

        invalidate_credential(&db, &user.id).await.unwrap();

        let loaded = get_by_id(&db, &user.id).await.unwrap().unwrap();
        assert!(loaded.credential.is_none());
        assert!(list_connected(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_policy_flags() {
        let db = Database::open_in_memory().await.unwrap();
        let user = User::new("jana@example.sk");
        insert(&db, &user).await.unwrap();

        set_policy(&db, &user.id, false, true).await.unwrap();

        let loaded = get_by_id(&db, &user.id).await.unwrap().unwrap();
        assert!(!loaded.ai_processing_enabled);
        assert!(loaded.auto_reply_enabled);
    }
}
