//! FAQ template CRUD and counters.
//!
//! Counters are only ever changed with relative `c = c + 1` updates so that
//! concurrent syncs and interactive sends cannot lose increments.

use std::collections::HashSet;

use rusqlite::{params, OptionalExtension, Row};

use super::{from_db_time, to_db_time};
use crate::domain::{FaqId, FaqTemplate, UserId};
use crate::storage::database::{Database, Result};

const FAQ_COLUMNS: &str = r#"
    id, user_id, question_pattern, response_template, auto_send,
    usage_count, times_edited, times_rejected, created_at
"#;

/// Inserts a new template.
pub async fn insert(db: &Database, faq: &FaqTemplate) -> Result<()> {
    let faq = faq.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO faqs (
                id, user_id, question_pattern, response_template, auto_send,
                usage_count, times_edited, times_rejected, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                faq.id.0,
                faq.user_id.0,
                faq.question_pattern,
                faq.response_template,
                faq.auto_send as i32,
                faq.usage_count,
                faq.times_edited,
                faq.times_rejected,
                to_db_time(&faq.created_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves one of the user's templates.
pub async fn get(db: &Database, user_id: &UserId, faq_id: &FaqId) -> Result<Option<FaqTemplate>> {
    let user_id = user_id.clone();
    let faq_id = faq_id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {FAQ_COLUMNS} FROM faqs WHERE id = ?1 AND user_id = ?2");
        let mut stmt = conn.prepare(&sql)?;
        let faq = stmt
            .query_row([&faq_id.0, &user_id.0], row_to_faq)
            .optional()?;
        Ok(faq)
    })
    .await
}

/// Lists the user's templates, most used first.
pub async fn list(db: &Database, user_id: &UserId) -> Result<Vec<FaqTemplate>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {FAQ_COLUMNS} FROM faqs WHERE user_id = ?1 \
             ORDER BY usage_count DESC, created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&user_id.0], row_to_faq)?;
        let faqs: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(faqs?)
    })
    .await
}

/// Ids of the user's templates flagged for auto-send.
pub async fn auto_send_ids(db: &Database, user_id: &UserId) -> Result<HashSet<FaqId>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare("SELECT id FROM faqs WHERE user_id = ?1 AND auto_send = 1")?;
        let rows = stmt.query_map([&user_id.0], |row| row.get::<_, String>(0))?;
        let ids: std::result::Result<HashSet<_>, _> = rows.map(|r| r.map(FaqId)).collect();
        Ok(ids?)
    })
    .await
}

/// Replaces the intent and answer of a template.
pub async fn update_content(
    db: &Database,
    user_id: &UserId,
    faq_id: &FaqId,
    question_pattern: &str,
    response_template: &str,
) -> Result<bool> {
    let user_id = user_id.clone();
    let faq_id = faq_id.clone();
    let question_pattern = question_pattern.to_string();
    let response_template = response_template.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE faqs SET question_pattern = ?1, response_template = ?2
            WHERE id = ?3 AND user_id = ?4
            "#,
            params![question_pattern, response_template, faq_id.0, user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// Turns auto-send on or off.
pub async fn set_auto_send(
    db: &Database,
    user_id: &UserId,
    faq_id: &FaqId,
    auto_send: bool,
) -> Result<bool> {
    let user_id = user_id.clone();
    let faq_id = faq_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "UPDATE faqs SET auto_send = ?1 WHERE id = ?2 AND user_id = ?3",
            params![auto_send as i32, faq_id.0, user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// Deletes a template. Messages pointing at it lose the reference.
pub async fn delete(db: &Database, user_id: &UserId, faq_id: &FaqId) -> Result<bool> {
    let user_id = user_id.clone();
    let faq_id = faq_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "DELETE FROM faqs WHERE id = ?1 AND user_id = ?2",
            [&faq_id.0, &user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// `usage_count + 1`. Called once on a validated match and once per send.
pub async fn increment_usage(db: &Database, user_id: &UserId, faq_id: &FaqId) -> Result<bool> {
    let user_id = user_id.clone();
    let faq_id = faq_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "UPDATE faqs SET usage_count = usage_count + 1 WHERE id = ?1 AND user_id = ?2",
            [&faq_id.0, &user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// Records a send of an edited draft: both counters go up and the edited
/// text becomes the new template.
pub async fn record_edited_send(
    db: &Database,
    user_id: &UserId,
    faq_id: &FaqId,
    edited_text: &str,
) -> Result<bool> {
    let user_id = user_id.clone();
    let faq_id = faq_id.clone();
    let edited_text = edited_text.to_string();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE faqs
            SET times_edited = times_edited + 1,
                usage_count = usage_count + 1,
                response_template = ?1
            WHERE id = ?2 AND user_id = ?3
            "#,
            params![edited_text, faq_id.0, user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// `times_rejected + 1`. The template stays as it is.
pub async fn increment_rejected(db: &Database, user_id: &UserId, faq_id: &FaqId) -> Result<bool> {
    let user_id = user_id.clone();
    let faq_id = faq_id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "UPDATE faqs SET times_rejected = times_rejected + 1 WHERE id = ?1 AND user_id = ?2",
            [&faq_id.0, &user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

fn row_to_faq(row: &Row<'_>) -> std::result::Result<FaqTemplate, rusqlite::Error> {
    let created_at: String = row.get(8)?;

    Ok(FaqTemplate {
        id: FaqId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        question_pattern: row.get(2)?,
        response_template: row.get(3)?,
        auto_send: row.get::<_, i32>(4)? != 0,
        usage_count: row.get(5)?,
        times_edited: row.get(6)?,
        times_rejected: row.get(7)?,
        created_at: from_db_time(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queries::test_support::setup_db_with_user;

    #[tokio::test]
    async fn insert_get_and_list() {
        let (db, user) = setup_db_with_user().await;
        let mut popular = FaqTemplate::new(user.clone(), "opening hours", "Mon-Fri 8-16");
        popular.usage_count = 5;
        let fresh = FaqTemplate::new(user.clone(), "parking", "Free parking behind the building");

        insert(&db, &fresh).await.unwrap();
        insert(&db, &popular).await.unwrap();

        let loaded = get(&db, &user, &popular.id).await.unwrap().unwrap();
        assert_eq!(loaded.response_template, "Mon-Fri 8-16");

        let all = list(&db, &user).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, popular.id);
    }

    #[tokio::test]
    async fn other_users_cannot_see_template() {
        let (db, user) = setup_db_with_user().await;
        let faq = FaqTemplate::new(user.clone(), "q", "a");
        insert(&db, &faq).await.unwrap();

        let stranger = UserId::from("someone-else");
        assert!(get(&db, &stranger, &faq.id).await.unwrap().is_none());
        assert!(!increment_usage(&db, &stranger, &faq.id).await.unwrap());
        assert!(!delete(&db, &stranger, &faq.id).await.unwrap());
    }

    #[tokio::test]
    async fn counters_are_relative() {
        let (db, user) = setup_db_with_user().await;
        let faq = FaqTemplate::new(user.clone(), "opening hours", "Mon-Fri 8-16");
        insert(&db, &faq).await.unwrap();

        increment_usage(&db, &user, &faq.id).await.unwrap();
        increment_usage(&db, &user, &faq.id).await.unwrap();
        increment_rejected(&db, &user, &faq.id).await.unwrap();
        record_edited_send(&db, &user, &faq.id, "Mon-Fri 8-17")
            .await
            .unwrap();

        let loaded = get(&db, &user, &faq.id).await.unwrap().unwrap();
        assert_eq!(loaded.usage_count, 3);
        assert_eq!(loaded.times_rejected, 1);
        assert_eq!(loaded.times_edited, 1);
        assert_eq!(loaded.response_template, "Mon-Fri 8-17");
    }

    #[tokio::test]
    async fn auto_send_flag() {
        let (db, user) = setup_db_with_user().await;
        let faq = FaqTemplate::new(user.clone(), "q", "a");
        insert(&db, &faq).await.unwrap();
        assert!(auto_send_ids(&db, &user).await.unwrap().is_empty());

        set_auto_send(&db, &user, &faq.id, true).await.unwrap();

        let ids = auto_send_ids(&db, &user).await.unwrap();
        assert!(ids.contains(&faq.id));
    }

    #[tokio::test]
    async fn update_and_delete() {
        let (db, user) = setup_db_with_user().await;
        let faq = FaqTemplate::new(user.clone(), "q", "a");
        insert(&db, &faq).await.unwrap();

        assert!(update_content(&db, &user, &faq.id, "q2", "a2").await.unwrap());
        let loaded = get(&db, &user, &faq.id).await.unwrap().unwrap();
        assert_eq!(loaded.question_pattern, "q2");

        assert!(delete(&db, &user, &faq.id).await.unwrap());
        assert!(get(&db, &user, &faq.id).await.unwrap().is_none());
    }
}
