//! Dashboard figures for one user's inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageId;

/// A reply that went out a while ago and has had no answer since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub message_id: MessageId,
    pub from_address: String,
    pub subject: String,
    pub reply_sent_at: DateTime<Utc>,
    pub days_waiting: i64,
}

/// Inbox overview.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboxStats {
    /// Messages received since local midnight (UTC).
    pub new_today: u32,
    /// Urgent messages still waiting for review.
    pub urgent_pending: u32,
    /// Non-spam messages whose reply has not gone out.
    pub waiting_reply: u32,
    /// Mean minutes between arrival and reply over the last 30 days.
    pub avg_response_minutes: Option<i64>,
    pub follow_ups: Vec<FollowUp>,
}

impl InboxStats {
    /// Human-friendly rendering of the average response time.
    pub fn avg_response_display(&self) -> String {
        match self.avg_response_minutes {
            None => "-".to_string(),
            Some(m) if m < 60 => format!("{m}min"),
            Some(m) if m < 1440 => format!("{}h", (m as f64 / 60.0).round() as i64),
            Some(m) => format!("{}d", (m as f64 / 1440.0).round() as i64),
        }
    }
}
