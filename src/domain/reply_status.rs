//! Reply lifecycle state machine.
//!
//! ```text
//! pending ──► sent | edited_sent | rejected | auto_pending
//! auto_pending ──► auto_sent | pending
//! ```
//!
//! `sent`, `edited_sent`, `auto_sent` and `rejected` are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a message's reply stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Waiting for the user to review the draft.
    Pending,
    /// Queued for automatic sending.
    AutoPending,
    /// Sent as drafted by the user.
    Sent,
    /// Sent after the user edited the draft.
    EditedSent,
    /// Sent automatically.
    AutoSent,
    /// User discarded the draft.
    Rejected,
}

/// Attempted a transition the lifecycle does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid reply transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: ReplyStatus,
    pub to: ReplyStatus,
}

impl ReplyStatus {
    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Pending => "pending",
            ReplyStatus::AutoPending => "auto_pending",
            ReplyStatus::Sent => "sent",
            ReplyStatus::EditedSent => "edited_sent",
            ReplyStatus::AutoSent => "auto_sent",
            ReplyStatus::Rejected => "rejected",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// Whether a reply has gone out.
    pub fn is_sent(&self) -> bool {
        matches!(
            self,
            ReplyStatus::Sent | ReplyStatus::EditedSent | ReplyStatus::AutoSent
        )
    }

    /// States reachable from this one.
    pub fn allowed_targets(&self) -> &'static [ReplyStatus] {
        match self {
            ReplyStatus::Pending => &[
                ReplyStatus::Sent,
                ReplyStatus::EditedSent,
                ReplyStatus::Rejected,
                ReplyStatus::AutoPending,
            ],
            ReplyStatus::AutoPending => &[ReplyStatus::AutoSent, ReplyStatus::Pending],
            ReplyStatus::Sent
            | ReplyStatus::EditedSent
            | ReplyStatus::AutoSent
            | ReplyStatus::Rejected => &[],
        }
    }

    /// States from which `target` may be entered.
    ///
    /// Used as the `IN (...)` guard of compare-and-set updates.
    pub fn allowed_sources(target: ReplyStatus) -> Vec<ReplyStatus> {
        ALL_STATUSES
            .into_iter()
            .filter(|s| s.allowed_targets().contains(&target))
            .collect()
    }

    /// Checks that moving to `to` is allowed.
    pub fn transition(self, to: ReplyStatus) -> Result<ReplyStatus, TransitionError> {
        if self.allowed_targets().contains(&to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}

const ALL_STATUSES: [ReplyStatus; 6] = [
    ReplyStatus::Pending,
    ReplyStatus::AutoPending,
    ReplyStatus::Sent,
    ReplyStatus::EditedSent,
    ReplyStatus::AutoSent,
    ReplyStatus::Rejected,
];

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATUSES
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown reply status: {s}"))
    }
}
