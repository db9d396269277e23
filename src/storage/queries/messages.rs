//! Message rows: idempotent insert, reply-state compare-and-set, listing,
//! search and dashboard figures.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};

use super::{from_db_time, from_db_time_opt, placeholders, to_db_time};
use crate::domain::{
    new_id, Address, Category, ExternalMessageId, ExternalThreadId, FaqId, FollowUp,
    InboxStats, Message, MessageId, NewMessage, ReplyStatus, SentReply, UserId,
};
use crate::storage::database::{Database, Result};

const MESSAGE_COLUMNS: &str = r#"
    m.id, m.user_id, m.external_id, m.external_thread_id, m.from_address, m.from_name,
    m.subject, m.body_text, m.body_html, m.received_at, m.summary, m.category,
    m.matched_faq_id, m.drafted_reply, m.reply_status, m.reply_sent_at,
    m.reply_edited_text, m.is_read,
    CASE WHEN m.external_thread_id IS NULL THEN 1 ELSE (
        SELECT COUNT(*) FROM messages t
        WHERE t.user_id = m.user_id AND t.external_thread_id = m.external_thread_id
    ) END AS thread_count
"#;

/// Fields written alongside a reply-state change.
#[derive(Debug, Clone, Default)]
pub struct ReplyUpdate {
    pub sent_at: Option<DateTime<Utc>>,
    pub edited_text: Option<String>,
}

/// Inserts a message unless the user already has one with the same external id.
///
/// Returns the new id when a row was created and `None` when the insert was
/// absorbed by the `(user_id, external_id)` constraint. Callers must only
/// trigger side effects such as auto-send for created rows.
pub async fn insert_if_absent(db: &Database, message: &NewMessage) -> Result<Option<MessageId>> {
    let message = message.clone();

    db.with_conn(move |conn| {
        let id = new_id();
        let changed = conn.execute(
            r#"
            INSERT INTO messages (
                id, user_id, external_id, external_thread_id, from_address, from_name,
                subject, body_text, body_html, received_at, summary, category,
                matched_faq_id, drafted_reply, reply_status, is_read, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, 0, ?16
            )
            ON CONFLICT(user_id, external_id) DO NOTHING
            "#,
            params![
                id,
                message.user_id.0,
                message.external_id.as_ref().map(|e| &e.0),
                message.external_thread_id.as_ref().map(|t| &t.0),
                message.from.email,
                message.from.name,
                message.subject,
                message.body_text,
                message.body_html,
                to_db_time(&message.received_at),
                message.classification.summary,
                message.classification.category.as_str(),
                message.classification.matched_faq_id.as_ref().map(|f| &f.0),
                message.drafted_reply,
                message.reply_status.as_str(),
                to_db_time(&Utc::now()),
            ],
        )?;
        Ok((changed > 0).then_some(MessageId(id)))
    })
    .await
}

/// Retrieves one of the user's messages.
pub async fn get(db: &Database, user_id: &UserId, id: &MessageId) -> Result<Option<Message>> {
    let user_id = user_id.clone();
    let id = id.clone();

    db.with_conn(move |conn| {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1 AND m.user_id = ?2");
        let mut stmt = conn.prepare(&sql)?;
        let message = stmt
            .query_row([&id.0, &user_id.0], row_to_message)
            .optional()?;
        Ok(message)
    })
    .await
}

/// Lists the user's messages, newest first.
pub async fn list(db: &Database, user_id: &UserId, limit: u32) -> Result<Vec<Message>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.user_id = ?1 \
             ORDER BY m.received_at DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![user_id.0, limit], row_to_message)?;
        let messages: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(messages?)
    })
    .await
}

/// External ids of all the user's stored messages.
pub async fn external_ids(db: &Database, user_id: &UserId) -> Result<HashSet<ExternalMessageId>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            "SELECT external_id FROM messages WHERE user_id = ?1 AND external_id IS NOT NULL",
        )?;
        let rows = stmt.query_map([&user_id.0], |row| row.get::<_, String>(0))?;
        let ids: std::result::Result<HashSet<_>, _> =
            rows.map(|r| r.map(ExternalMessageId)).collect();
        Ok(ids?)
    })
    .await
}

/// Moves a message's reply to `to` if its current state allows it.
///
/// The allowed source states go into the `WHERE` clause, so two flows racing
/// on the same message cannot both win. Returns whether the row changed.
pub async fn transition(
    db: &Database,
    user_id: &UserId,
    id: &MessageId,
    to: ReplyStatus,
    update: ReplyUpdate,
) -> Result<bool> {
    let user_id = user_id.clone();
    let id = id.clone();
    let sources = ReplyStatus::allowed_sources(to);
    if sources.is_empty() {
        return Ok(false);
    }

    db.with_conn(move |conn| {
        let sql = format!(
            r#"
            UPDATE messages
            SET reply_status = ?,
                reply_sent_at = COALESCE(?, reply_sent_at),
                reply_edited_text = COALESCE(?, reply_edited_text)
            WHERE id = ? AND user_id = ? AND reply_status IN {}
            "#,
            placeholders(sources.len())
        );
        let mut values: Vec<Option<String>> = vec![
            Some(to.as_str().to_string()),
            update.sent_at.as_ref().map(to_db_time),
            update.edited_text,
            Some(id.0),
            Some(user_id.0),
        ];
        values.extend(sources.iter().map(|s| Some(s.as_str().to_string())));

        let changed = conn.execute(&sql, params_from_iter(values))?;
        Ok(changed > 0)
    })
    .await
}

/// Moves `auto_pending` rows stored before `stored_before` back to `pending`.
///
/// An auto-reply settles well within its send timeout, so an older
/// `auto_pending` row belongs to a sync that was interrupted after storing it.
/// Returns how many rows were released.
pub async fn release_stale_auto_pending(
    db: &Database,
    user_id: &UserId,
    stored_before: DateTime<Utc>,
) -> Result<usize> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let released = conn.execute(
            "UPDATE messages SET reply_status = ?1 \
             WHERE user_id = ?2 AND reply_status = ?3 AND created_at < ?4",
            params![
                ReplyStatus::Pending.as_str(),
                user_id.0,
                ReplyStatus::AutoPending.as_str(),
                to_db_time(&stored_before),
            ],
        )?;
        Ok(released)
    })
    .await
}

/// Marks messages as read. Returns how many rows changed.
pub async fn mark_read(db: &Database, user_id: &UserId, ids: &[MessageId]) -> Result<usize> {
    let user_id = user_id.clone();
    let ids = ids.to_vec();

    db.transaction(move |tx| {
        let mut changed = 0;
        for id in &ids {
            changed += tx.execute(
                "UPDATE messages SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                [&id.0, &user_id.0],
            )?;
        }
        Ok(changed)
    })
    .await
}

/// Deletes messages, remembering their external ids so sync never brings
/// them back. Returns how many messages were deleted.
pub async fn delete_and_remember(
    db: &Database,
    user_id: &UserId,
    ids: &[MessageId],
) -> Result<usize> {
    let user_id = user_id.clone();
    let ids = ids.to_vec();

    db.transaction(move |tx| {
        let now = to_db_time(&Utc::now());
        let mut deleted = 0;
        for id in &ids {
            tx.execute(
                r#"
                INSERT INTO deleted_external_ids (user_id, external_id, deleted_at)
                SELECT user_id, external_id, ?3 FROM messages
                WHERE id = ?1 AND user_id = ?2 AND external_id IS NOT NULL
                ON CONFLICT(user_id, external_id) DO NOTHING
                "#,
                params![id.0, user_id.0, now],
            )?;
            deleted += tx.execute(
                "DELETE FROM messages WHERE id = ?1 AND user_id = ?2",
                [&id.0, &user_id.0],
            )?;
        }
        Ok(deleted)
    })
    .await
}

/// Full-text search over subject, sender, summary and body.
///
/// Each whitespace-separated term is quoted, so user input can never be
/// parsed as FTS syntax. When the index finds nothing the search falls back
/// to a substring match on subject, sender and summary.
pub async fn search(
    db: &Database,
    user_id: &UserId,
    query: &str,
    category: Option<Category>,
    limit: u32,
) -> Result<Vec<Message>> {
    let user_id = user_id.clone();
    let fts_query = fts_query(query);
    let like_pattern = like_pattern(query);

    db.with_conn(move |conn| {
        let category_clause = if category.is_some() {
            "AND m.category = ?3"
        } else {
            "AND ?3 IS NULL"
        };
        let category = category.map(|c| c.as_str());

        if let Some(fts_query) = fts_query {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m \
                 WHERE m.rowid IN (SELECT rowid FROM messages_fts WHERE messages_fts MATCH ?1) \
                 AND m.user_id = ?2 {category_clause} \
                 ORDER BY m.received_at DESC LIMIT ?4"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![fts_query, user_id.0, category, limit],
                row_to_message,
            )?;
            let found: Vec<Message> = rows.collect::<std::result::Result<_, _>>()?;
            if !found.is_empty() {
                return Ok(found);
            }
        }

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages m \
             WHERE (m.subject LIKE ?1 ESCAPE '\\' OR m.from_address LIKE ?1 ESCAPE '\\' \
                    OR m.summary LIKE ?1 ESCAPE '\\') \
             AND m.user_id = ?2 {category_clause} \
             ORDER BY m.received_at DESC LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![like_pattern, user_id.0, category, limit],
            row_to_message,
        )?;
        let found: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(found?)
    })
    .await
}

/// Unread messages that still need attention: no reply sent and not spam.
pub async fn unread_count(db: &Database, user_id: &UserId) -> Result<u32> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let count: u32 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE user_id = ?1
              AND is_read = 0
              AND reply_status NOT IN ('sent', 'edited_sent', 'auto_sent')
              AND category != 'SPAM'
            "#,
            [&user_id.0],
            |row| row.get(0),
        )?;
        Ok(count)
    })
    .await
}

/// Computes dashboard figures as of `now`.
pub async fn stats(db: &Database, user_id: &UserId, now: DateTime<Utc>) -> Result<InboxStats> {
    let user_id = user_id.clone();
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(now);
    let month_ago = now - Duration::days(30);
    let follow_up_cutoff = now - Duration::days(3);

    db.with_conn(move |conn| {
        let (new_today, urgent_pending, waiting_reply): (u32, u32, u32) = conn.query_row(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN received_at >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN category = 'URGENT' AND reply_status = 'pending'
                    THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN reply_status IN ('pending', 'auto_pending')
                    AND category != 'SPAM' THEN 1 ELSE 0 END), 0)
            FROM messages WHERE user_id = ?1
            "#,
            params![user_id.0, to_db_time(&midnight)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let mut stmt = conn.prepare(
            r#"
            SELECT received_at, reply_sent_at FROM messages
            WHERE user_id = ?1 AND reply_sent_at IS NOT NULL AND received_at >= ?2
            "#,
        )?;
        let minutes: Vec<i64> = stmt
            .query_map(params![user_id.0, to_db_time(&month_ago)], |row| {
                let received: String = row.get(0)?;
                let sent: String = row.get(1)?;
                Ok((from_db_time(&sent) - from_db_time(&received)).num_minutes())
            })?
            .collect::<std::result::Result<_, _>>()?;
        let avg_response_minutes = (!minutes.is_empty()).then(|| {
            (minutes.iter().sum::<i64>() as f64 / minutes.len() as f64).round() as i64
        });

        let mut stmt = conn.prepare(
            r#"
            SELECT e.id, e.from_address, e.subject, e.reply_sent_at
            FROM messages e
            WHERE e.user_id = ?1
              AND e.reply_status IN ('sent', 'edited_sent')
              AND e.reply_sent_at IS NOT NULL
              AND e.reply_sent_at < ?2
              AND NOT EXISTS (
                  SELECT 1 FROM messages e2
                  WHERE e2.user_id = ?1
                    AND e2.external_thread_id IS NOT NULL
                    AND e2.external_thread_id = e.external_thread_id
                    AND e2.received_at > e.reply_sent_at
              )
            ORDER BY e.reply_sent_at ASC
            LIMIT 10
            "#,
        )?;
        let follow_ups: Vec<FollowUp> = stmt
            .query_map(params![user_id.0, to_db_time(&follow_up_cutoff)], |row| {
                let sent: String = row.get(3)?;
                let reply_sent_at = from_db_time(&sent);
                Ok(FollowUp {
                    message_id: MessageId(row.get(0)?),
                    from_address: row.get(1)?,
                    subject: row.get(2)?,
                    reply_sent_at,
                    days_waiting: (now - reply_sent_at).num_days(),
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        Ok(InboxStats {
            new_today,
            urgent_pending,
            waiting_reply,
            avg_response_minutes,
            follow_ups,
        })
    })
    .await
}

/// Most recent replies the user sent, newest first.
pub async fn sent_history(db: &Database, user_id: &UserId, limit: u32) -> Result<Vec<SentReply>> {
    let user_id = user_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT subject, body_text, COALESCE(reply_edited_text, drafted_reply)
            FROM messages
            WHERE user_id = ?1
              AND reply_status IN ('sent', 'edited_sent', 'auto_sent')
              AND COALESCE(reply_edited_text, drafted_reply) IS NOT NULL
            ORDER BY reply_sent_at DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![user_id.0, limit], |row| {
            Ok(SentReply {
                subject: row.get(0)?,
                original_body: row.get(1)?,
                reply: row.get(2)?,
            })
        })?;
        let replies: std::result::Result<Vec<_>, _> = rows.collect();
        Ok(replies?)
    })
    .await
}

fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" "))
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn row_to_message(row: &Row<'_>) -> std::result::Result<Message, rusqlite::Error> {
    let external_id: Option<String> = row.get(2)?;
    let external_thread_id: Option<String> = row.get(3)?;
    let received_at: String = row.get(9)?;
    let category: String = row.get(11)?;
    let matched_faq_id: Option<String> = row.get(12)?;
    let reply_status: String = row.get(14)?;
    let reply_status = reply_status
        .parse::<ReplyStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(14, Type::Text, e.into()))?;

    Ok(Message {
        id: MessageId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        external_id: external_id.map(ExternalMessageId),
        external_thread_id: external_thread_id.map(ExternalThreadId),
        from: Address {
            email: row.get(4)?,
            name: row.get(5)?,
        },
        subject: row.get(6)?,
        body_text: row.get(7)?,
        body_html: row.get(8)?,
        received_at: from_db_time(&received_at),
        summary: row.get(10)?,
        category: Category::parse_lenient(&category),
        matched_faq_id: matched_faq_id.map(FaqId),
        drafted_reply: row.get(13)?,
        reply_status,
        reply_sent_at: from_db_time_opt(row.get(15)?),
        reply_edited_text: row.get(16)?,
        is_read: row.get::<_, i32>(17)? != 0,
        thread_count: row.get(18)?,
    })
}
