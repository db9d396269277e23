//! Consent records, one row per user and consent type.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{from_db_time_opt, to_db_time};
use crate::domain::{Consent, ConsentType, UserId};
use crate::storage::database::{Database, Result};

/// Grants a consent, creating the row if needed.
pub async fn grant(db: &Database, user_id: &UserId, consent_type: ConsentType) -> Result<()> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO consents (user_id, consent_type, granted, granted_at, revoked_at)
            VALUES (?1, ?2, 1, ?3, NULL)
            ON CONFLICT(user_id, consent_type)
            DO UPDATE SET granted = 1, granted_at = excluded.granted_at, revoked_at = NULL
            "#,
            params![user_id.0, consent_type.as_str(), to_db_time(&Utc::now())],
        )?;
        Ok(())
    })
    .await
}

/// Revokes a consent. Revoking something never granted records the refusal.
pub async fn revoke(db: &Database, user_id: &UserId, consent_type: ConsentType) -> Result<()> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO consents (user_id, consent_type, granted, granted_at, revoked_at)
            VALUES (?1, ?2, 0, NULL, ?3)
            ON CONFLICT(user_id, consent_type)
            DO UPDATE SET granted = 0, revoked_at = excluded.revoked_at
            "#,
            params![user_id.0, consent_type.as_str(), to_db_time(&Utc::now())],
        )?;
        Ok(())
    })
    .await
}

/// Whether the consent is currently granted. Missing rows mean no.
pub async fn is_granted(db: &Database, user_id: &UserId, consent_type: ConsentType) -> Result<bool> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let granted: Option<i32> = conn
            .query_row(
                "SELECT granted FROM consents WHERE user_id = ?1 AND consent_type = ?2",
                params![user_id.0, consent_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(granted.unwrap_or(0) != 0)
    })
    .await
}

/// All the user's consent records.
pub async fn list(db: &Database, user_id: &UserId) -> Result<Vec<Consent>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, consent_type, granted, granted_at, revoked_at
            FROM consents WHERE user_id = ?1 ORDER BY consent_type
            "#,
        )?;
        let rows = stmt.query_map([&user_id.0], row_to_consent)?;
        let consents: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(consents?)
    })
    .await
}

fn row_to_consent(row: &Row<'_>) -> std::result::Result<Consent, rusqlite::Error> {
    let consent_type: String = row.get(1)?;
    let consent_type = consent_type.parse::<ConsentType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Consent {
        user_id: UserId(row.get(0)?),
        consent_type,
        granted: row.get::<_, i32>(2)? != 0,
        granted_at: from_db_time_opt(row.get(3)?),
        revoked_at: from_db_time_opt(row.get(4)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::test_support::setup_db_with_user;

    #[tokio::test]
    async fn missing_consent_is_not_granted() {
        let (db, user) = setup_db_with_user().await;
        assert!(!is_granted(&db, &user, ConsentType::AiProcessing).await.unwrap());
    }

    #[tokio::test]
    async fn grant_then_revoke() {
        let (db, user) = setup_db_with_user().await;

        grant(&db, &user, ConsentType::AiProcessing).await.unwrap();
        assert!(is_granted(&db, &user, ConsentType::AiProcessing).await.unwrap());
        assert!(!is_granted(&db, &user, ConsentType::EmailAccess).await.unwrap());

        revoke(&db, &user, ConsentType::AiProcessing).await.unwrap();
        assert!(!is_granted(&db, &user, ConsentType::AiProcessing).await.unwrap());

        let all = list(&db, &user).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].granted_at.is_some());
        assert!(all[0].revoked_at.is_some());
    }

    #[tokio::test]
    async fn regrant_clears_revocation() {
        let (db, user) = setup_db_with_user().await;

        revoke(&db, &user, ConsentType::TermsAccepted).await.unwrap();
        grant(&db, &user, ConsentType::TermsAccepted).await.unwrap();

        let all = list(&db, &user).await.unwrap();
        assert!(all[0].granted);
        assert!(all[0].revoked_at.is_none());
    }
}
