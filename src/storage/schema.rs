//! SQL schema definitions as const strings.
//!
//! Dates are RFC 3339 text, booleans are INTEGER 0/1.

/// SQL to create the users table.
pub const CREATE_USERS: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    display_name TEXT,
    ai_processing_enabled INTEGER NOT NULL DEFAULT 1,
    auto_reply_enabled INTEGER NOT NULL DEFAULT 0,
    mail_connected INTEGER NOT NULL DEFAULT 0,
    mail_credential TEXT,
    mail_address TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the FAQ templates table.
pub const CREATE_FAQS: &str = r#"
CREATE TABLE IF NOT EXISTS faqs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    question_pattern TEXT NOT NULL,
    response_template TEXT NOT NULL,
    auto_send INTEGER NOT NULL DEFAULT 0,
    usage_count INTEGER NOT NULL DEFAULT 0,
    times_edited INTEGER NOT NULL DEFAULT 0,
    times_rejected INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create FAQ indexes.
pub const CREATE_FAQ_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_faqs_user ON faqs(user_id, usage_count DESC)
"#;

/// SQL to create the messages table.
///
/// `UNIQUE(user_id, external_id)` makes sync inserts idempotent. Manual
/// messages have a NULL external id and never collide.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    external_id TEXT,
    external_thread_id TEXT,
    from_address TEXT NOT NULL,
    from_name TEXT,
    subject TEXT NOT NULL,
    body_text TEXT NOT NULL,
    body_html TEXT,
    received_at TEXT NOT NULL,
    summary TEXT,
    category TEXT NOT NULL DEFAULT 'NORMAL',
    matched_faq_id TEXT REFERENCES faqs(id) ON DELETE SET NULL,
    drafted_reply TEXT,
    reply_status TEXT NOT NULL DEFAULT 'pending',
    reply_sent_at TEXT,
    reply_edited_text TEXT,
    is_read INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(user_id, external_id)
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_user_received ON messages(user_id, received_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(user_id, external_thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(user_id, reply_status);
CREATE INDEX IF NOT EXISTS idx_messages_faq ON messages(matched_faq_id)
"#;

/// SQL to create the set of external ids the user deleted.
pub const CREATE_DELETED_EXTERNAL_IDS: &str = r#"
CREATE TABLE IF NOT EXISTS deleted_external_ids (
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    external_id TEXT NOT NULL,
    deleted_at TEXT NOT NULL,
    PRIMARY KEY (user_id, external_id)
)
"#;

/// SQL to create the learned reply patterns table.
pub const CREATE_REPLY_PATTERNS: &str = r#"
CREATE TABLE IF NOT EXISTS reply_patterns (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    email_pattern TEXT NOT NULL,
    reply_template TEXT NOT NULL,
    auto_send INTEGER NOT NULL DEFAULT 0,
    confidence_score REAL NOT NULL DEFAULT 0.0,
    times_used INTEGER NOT NULL DEFAULT 0,
    times_edited INTEGER NOT NULL DEFAULT 0,
    times_rejected INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the consents table.
pub const CREATE_CONSENTS: &str = r#"
CREATE TABLE IF NOT EXISTS consents (
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    consent_type TEXT NOT NULL,
    granted INTEGER NOT NULL DEFAULT 0,
    granted_at TEXT,
    revoked_at TEXT,
    PRIMARY KEY (user_id, consent_type)
)
"#;

/// SQL to create the audit log of received and sent mail.
pub const CREATE_MESSAGE_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS message_log (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    subject TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_log_user ON message_log(user_id, created_at DESC)
"#;

/// SQL to create the FTS5 virtual table for message search.
pub const CREATE_MESSAGES_FTS: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    subject,
    from_address,
    summary,
    body_text,
    content='messages',
    content_rowid='rowid'
)
"#;

/// SQL to keep the FTS index in sync with the messages table.
pub const CREATE_MESSAGES_FTS_TRIGGERS: &str = r#"
CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, subject, from_address, summary, body_text)
    VALUES (NEW.rowid, NEW.subject, NEW.from_address, NEW.summary, NEW.body_text);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, from_address, summary, body_text)
    VALUES ('delete', OLD.rowid, OLD.subject, OLD.from_address, OLD.summary, OLD.body_text);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE OF subject, from_address, summary, body_text ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, subject, from_address, summary, body_text)
    VALUES ('delete', OLD.rowid, OLD.subject, OLD.from_address, OLD.summary, OLD.body_text);
    INSERT INTO messages_fts(rowid, subject, from_address, summary, body_text)
    VALUES (NEW.rowid, NEW.subject, NEW.from_address, NEW.summary, NEW.body_text);
END
"#;

/// Returns all migrations in the order they must be applied.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_USERS,
        CREATE_FAQS,
        CREATE_FAQ_INDEXES,
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_DELETED_EXTERNAL_IDS,
        CREATE_REPLY_PATTERNS,
        CREATE_CONSENTS,
        CREATE_MESSAGE_LOG,
        CREATE_MESSAGES_FTS,
        CREATE_MESSAGES_FTS_TRIGGERS,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faqs_precede_messages() {
        let migrations = all_migrations();
        let faqs = migrations.iter().position(|m| *m == CREATE_FAQS).unwrap();
        let messages = migrations.iter().position(|m| *m == CREATE_MESSAGES).unwrap();
        assert!(faqs < messages);
    }

    #[test]
    fn messages_are_unique_per_user_and_external_id() {
        assert!(CREATE_MESSAGES.contains("UNIQUE(user_id, external_id)"));
    }

    #[test]
    fn deleted_faq_clears_message_reference() {
        assert!(CREATE_MESSAGES.contains("REFERENCES faqs(id) ON DELETE SET NULL"));
    }

    #[test]
    fn fts_uses_external_content() {
        assert!(CREATE_MESSAGES_FTS.contains("content='messages'"));
        assert!(CREATE_MESSAGES_FTS_TRIGGERS.contains("messages_ai"));
        assert!(CREATE_MESSAGES_FTS_TRIGGERS.contains("messages_ad"));
        assert!(CREATE_MESSAGES_FTS_TRIGGERS.contains("messages_au"));
    }
}
