//! FAQ templates and learned reply patterns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FaqId, ReplyPatternId, UserId};

/// A reusable answer to a recurring question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaqTemplate {
    /// Unique identifier.
    pub id: FaqId,
    /// Owning user.
    pub user_id: UserId,
    /// The intent this template answers, in the user's words.
    pub question_pattern: String,
    /// The answer; facts in it are authoritative for drafting.
    pub response_template: String,
    /// Whether matches may be answered without review.
    pub auto_send: bool,
    /// Times matched plus times sent.
    pub usage_count: u32,
    /// Times the user edited a draft based on this template.
    pub times_edited: u32,
    /// Times the user rejected a draft based on this template.
    pub times_rejected: u32,
    /// When the template was created.
    pub created_at: DateTime<Utc>,
}

impl FaqTemplate {
    /// Creates a template with zeroed counters and auto-send off.
    pub fn new(
        user_id: UserId,
        question_pattern: impl Into<String>,
        response_template: impl Into<String>,
    ) -> Self {
        Self {
            id: FaqId(super::new_id()),
            user_id,
            question_pattern: question_pattern.into(),
            response_template: response_template.into(),
            auto_send: false,
            usage_count: 0,
            times_edited: 0,
            times_rejected: 0,
            created_at: Utc::now(),
        }
    }
}

/// A reply style learned from the user's sent mail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPattern {
    pub id: ReplyPatternId,
    pub user_id: UserId,
    /// Description of the messages this pattern applies to.
    pub email_pattern: String,
    /// Representative reply.
    pub reply_template: String,
    pub auto_send: bool,
    /// Between 0 and 1.
    pub confidence_score: f64,
    pub times_used: u32,
    pub times_edited: u32,
    pub times_rejected: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReplyPattern {
    /// Creates a pattern that has never been used.
    pub fn new(
        user_id: UserId,
        email_pattern: impl Into<String>,
        reply_template: impl Into<String>,
        confidence_score: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReplyPatternId(super::new_id()),
            user_id,
            email_pattern: email_pattern.into(),
            reply_template: reply_template.into(),
            auto_send: false,
            confidence_score: confidence_score.clamp(0.0, 1.0),
            times_used: 0,
            times_edited: 0,
            times_rejected: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a reply pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyPatternUpdate {
    pub auto_send: Option<bool>,
    pub reply_template: Option<String>,
}

impl ReplyPatternUpdate {
    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.auto_send.is_none() && self.reply_template.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_faq_starts_clean() {
        let faq = FaqTemplate::new(UserId::from("u1"), "opening hours", "Mon-Fri 8-16");
        assert!(!faq.auto_send);
        assert_eq!(faq.usage_count, 0);
        assert_eq!(faq.times_edited, 0);
        assert_eq!(faq.times_rejected, 0);
    }

    #[test]
    fn empty_pattern_update() {
        assert!(ReplyPatternUpdate::default().is_empty());
        let update = ReplyPatternUpdate {
            auto_send: Some(true),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
