//! Learned reply patterns.

use chrono::Utc;
use rusqlite::{params, Row};

use super::{from_db_time, to_db_time};
use crate::domain::{ReplyPattern, ReplyPatternId, ReplyPatternUpdate, UserId};
use crate::storage::database::{Database, Result};

const PATTERN_COLUMNS: &str = r#"
    id, user_id, email_pattern, reply_template, auto_send, confidence_score,
    times_used, times_edited, times_rejected, created_at, updated_at
"#;

/// Inserts a pattern.
pub async fn insert(db: &Database, pattern: &ReplyPattern) -> Result<()> {
    let pattern = pattern.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO reply_patterns (
                id, user_id, email_pattern, reply_template, auto_send, confidence_score,
                times_used, times_edited, times_rejected, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                pattern.id.0,
                pattern.user_id.0,
                pattern.email_pattern,
                pattern.reply_template,
                pattern.auto_send as i32,
                pattern.confidence_score,
                pattern.times_used,
                pattern.times_edited,
                pattern.times_rejected,
                to_db_time(&pattern.created_at),
                to_db_time(&pattern.updated_at),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Lists the user's patterns, most confident and most used first.
pub async fn list(db: &Database, user_id: &UserId) -> Result<Vec<ReplyPattern>> {
    list_filtered(db, user_id, 0.0).await
}

/// Lists patterns whose confidence is at least `min_confidence`.
pub async fn list_confident(
    db: &Database,
    user_id: &UserId,
    min_confidence: f64,
) -> Result<Vec<ReplyPattern>> {
    list_filtered(db, user_id, min_confidence).await
}

async fn list_filtered(
    db: &Database,
    user_id: &UserId,
    min_confidence: f64,
) -> Result<Vec<ReplyPattern>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {PATTERN_COLUMNS} FROM reply_patterns \
             WHERE user_id = ?1 AND confidence_score >= ?2 \
             ORDER BY confidence_score DESC, times_used DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.0, min_confidence], row_to_pattern)?;
        let patterns: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(patterns?)
    })
    .await
}

/// Applies a partial update. Returns whether a row changed.
pub async fn update(
    db: &Database,
    user_id: &UserId,
    id: &ReplyPatternId,
    update: &ReplyPatternUpdate,
) -> Result<bool> {
    let user_id = user_id.clone();
    let id = id.clone();
    let update = update.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            r#"
            UPDATE reply_patterns
            SET auto_send = COALESCE(?1, auto_send),
                reply_template = COALESCE(?2, reply_template),
                updated_at = ?3
            WHERE id = ?4 AND user_id = ?5
            "#,
            params![
                update.auto_send.map(|b| b as i32),
                update.reply_template,
                to_db_time(&Utc::now()),
                id.0,
                user_id.0,
            ],
        )?;
        Ok(changed > 0)
    })
    .await
}

/// Deletes a pattern.
pub async fn delete(db: &Database, user_id: &UserId, id: &ReplyPatternId) -> Result<bool> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let changed = conn.execute(
            "DELETE FROM reply_patterns WHERE id = ?1 AND user_id = ?2",
            [&id.0, &user_id.0],
        )?;
        Ok(changed > 0)
    })
    .await
}

fn row_to_pattern(row: &Row<'_>) -> std::result::Result<ReplyPattern, rusqlite::Error> {
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(ReplyPattern {
        id: ReplyPatternId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        email_pattern: row.get(2)?,
        reply_template: row.get(3)?,
        auto_send: row.get::<_, i32>(4)? != 0,
        confidence_score: row.get(5)?,
        times_used: row.get(6)?,
        times_edited: row.get(7)?,
        times_rejected: row.get(8)?,
        created_at: from_db_time(&created_at),
        updated_at: from_db_time(&updated_at),
    })
}

#[cfg(test)]
pub(crate) fn sample(user_id: &UserId, confidence: f64, times_used: u32) -> ReplyPattern {
    let now = Utc::now();
    ReplyPattern {
        id: ReplyPatternId(crate::domain::new_id()),
        user_id: user_id.clone(),
        email_pattern: "price enquiries".to_string(),
        reply_template: "Our prices are listed at https://example.sk/cennik".to_string(),
        auto_send: false,
        confidence_score: confidence,
        times_used,
        times_edited: 0,
        times_rejected: 0,
        created_at: now,
        updated_at: now,
    }
}
