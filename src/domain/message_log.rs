//! Audit trail of ingested and outgoing mail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::UserId;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    Received,
    Sent,
    AutoReply,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Received => "RECEIVED",
            LogKind::Sent => "SENT",
            LogKind::AutoReply => "AUTO_REPLY",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECEIVED" => Ok(LogKind::Received),
            "SENT" => Ok(LogKind::Sent),
            "AUTO_REPLY" => Ok(LogKind::AutoReply),
            other => Err(format!("unknown log kind: {other}")),
        }
    }
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub user_id: UserId,
    pub kind: LogKind,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}
