//! Message domain types.
//!
//! A [`Message`] is one inbound email together with everything the triage
//! pipeline derived from it: summary, category, matched FAQ, drafted reply
//! and where the reply stands in its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{ExternalMessageId, ExternalThreadId, FaqId, MessageId, ReplyStatus, UserId};

/// Triage category assigned to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Needs attention right away.
    Urgent,
    /// Carries a deadline but is not an emergency.
    TimeSensitive,
    /// Answered by one of the user's FAQ templates.
    Faq,
    /// Everything else worth reading.
    Normal,
    /// Unsolicited or promotional mail.
    Spam,
}

impl Category {
    /// All categories, in display order.
    pub const ALL: [Category; 5] = [
        Category::Urgent,
        Category::TimeSensitive,
        Category::Faq,
        Category::Normal,
        Category::Spam,
    ];

    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Urgent => "URGENT",
            Category::TimeSensitive => "TIME_SENSITIVE",
            Category::Faq => "FAQ",
            Category::Normal => "NORMAL",
            Category::Spam => "SPAM",
        }
    }

    /// Parses a category, mapping anything unrecognised to `Normal`.
    ///
    /// Model output and legacy rows both pass through here, so the parse is
    /// case-insensitive and tolerates surrounding whitespace.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or(Category::Normal)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a known category.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "Jana Nováková").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Returns "Name <email>" when a name is present, otherwise the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// What the classifier concluded about a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// One-sentence summary, if the model produced one.
    pub summary: Option<String>,
    /// Triage category.
    pub category: Category,
    /// FAQ this message asks about. Always refers to an FAQ the caller supplied.
    pub matched_faq_id: Option<FaqId>,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            summary: None,
            category: Category::Normal,
            matched_faq_id: None,
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Internal identifier.
    pub id: MessageId,
    /// Owning user.
    pub user_id: UserId,
    /// Source identifier; `None` for manually created messages.
    pub external_id: Option<ExternalMessageId>,
    /// Source conversation identifier.
    pub external_thread_id: Option<ExternalThreadId>,
    /// Sender.
    pub from: Address,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body_text: String,
    /// HTML body, when the source had one.
    pub body_html: Option<String>,
    /// When the message arrived.
    pub received_at: DateTime<Utc>,
    /// Short summary produced during classification.
    pub summary: Option<String>,
    /// Triage category.
    pub category: Category,
    /// Matched FAQ template.
    pub matched_faq_id: Option<FaqId>,
    /// Reply prepared for review or auto-send.
    pub drafted_reply: Option<String>,
    /// Reply lifecycle state.
    pub reply_status: ReplyStatus,
    /// When a reply went out.
    pub reply_sent_at: Option<DateTime<Utc>>,
    /// Text actually sent when the user edited the draft.
    pub reply_edited_text: Option<String>,
    /// Whether the user has opened the message.
    pub is_read: bool,
    /// Number of stored messages in the same conversation.
    #[serde(default)]
    pub thread_count: u32,
}

/// A message about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    /// Owning user.
    pub user_id: UserId,
    /// Source identifier; `None` for manually created messages.
    pub external_id: Option<ExternalMessageId>,
    /// Source conversation identifier.
    pub external_thread_id: Option<ExternalThreadId>,
    /// Sender.
    pub from: Address,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body_text: String,
    /// HTML body.
    pub body_html: Option<String>,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
    /// Classification result.
    pub classification: Classification,
    /// Drafted reply.
    pub drafted_reply: Option<String>,
    /// Initial lifecycle state (`Pending` or `AutoPending`).
    pub reply_status: ReplyStatus,
}

/// A reply the user already sent, used as a style example when drafting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentReply {
    /// Subject of the message that was answered.
    pub subject: String,
    /// Body of the message that was answered.
    pub original_body: String,
    /// What went out.
    pub reply: String,
}

/// Content the classifier and drafter look at.
#[derive(Debug, Clone, Copy)]
pub struct MessageContent<'a> {
    /// Sender address.
    pub from: &'a Address,
    /// Subject line.
    pub subject: &'a str,
    /// Plain text body.
    pub body: &'a str,
}
