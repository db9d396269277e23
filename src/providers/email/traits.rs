//! Mail source trait definition.
//!
//! This module defines the [`MailSource`] trait which abstracts over the
//! mailbox backends (Gmail API, IMAP/SMTP). The sync pipeline only ever
//! lists recent inbox messages and sends replies, so the surface is small.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Address, ExternalMessageId, ExternalThreadId, MailCredential};

/// Result type alias for mail source operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during mail source operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Authentication failed or credentials expired.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider-specific error.
    #[error("provider error: {0}")]
    Provider(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Whether the stored credential is no longer usable.
    ///
    /// Callers invalidate the credential instead of retrying.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ProviderError::Authentication(_))
    }
}

/// A message as fetched from the remote mailbox, before triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedMessage {
    pub external_id: ExternalMessageId,
    pub external_thread_id: Option<ExternalThreadId>,
    pub from: Address,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// A reply ready to hand to a mail source.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingReply {
    /// Recipient, the original sender.
    pub to: Address,
    /// Already prefixed with `Re:`.
    pub subject: String,
    pub body: String,
    /// Provider thread to append the reply to.
    pub thread_id: Option<ExternalThreadId>,
    /// External id of the message being answered, used to look up its
    /// `Message-ID` for the `In-Reply-To` and `References` headers.
    pub in_reply_to: Option<ExternalMessageId>,
}

/// Backend that can list a user's inbox and send replies on their behalf.
///
/// Implementations are stateless with respect to users: every call carries
/// the credential it should act with.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Lists up to `max` of the most recent inbox messages.
    async fn list_recent(&self, credential: &MailCredential, max: u32)
        -> Result<Vec<FetchedMessage>>;

    /// Sends a reply and returns the provider's id for the sent message.
    async fn send(&self, credential: &MailCredential, reply: &OutgoingReply) -> Result<String>;

    /// Resolves the mailbox address the credential belongs to.
    async fn get_profile(&self, credential: &MailCredential) -> Result<String>;
}

/// `Re: <subject>`, unless the subject already carries the prefix.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    let prefixed = trimmed
        .get(..3)
        .is_some_and(|head| head.eq_ignore_ascii_case("re:"));
    if prefixed {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

/// Truncates `text` to at most `max` characters on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Stored body text limit.
pub(crate) const MAX_BODY_TEXT_CHARS: usize = 5_000;
/// Stored HTML body limit.
pub(crate) const MAX_BODY_HTML_CHARS: usize = 100_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display() {
        let err = ProviderError::Authentication("invalid_grant".to_string());
        assert_eq!(err.to_string(), "authentication failed: invalid_grant");

        let err = ProviderError::RateLimited {
            retry_after_secs: Some(60),
        };
        assert_eq!(
            err.to_string(),
            "rate limit exceeded, retry after Some(60) seconds"
        );
    }

    #[test]
    fn only_authentication_is_auth_failure() {
        assert!(ProviderError::Authentication("x".into()).is_auth_failure());
        assert!(!ProviderError::Connection("x".into()).is_auth_failure());
        assert!(!ProviderError::NotFound("x".into()).is_auth_failure());
        assert!(!ProviderError::RateLimited {
            retry_after_secs: None
        }
        .is_auth_failure());
    }

    #[test]
    fn reply_subject_prefixes_once() {
        assert_eq!(reply_subject("Otváracie hodiny"), "Re: Otváracie hodiny");
        assert_eq!(reply_subject("Re: Otváracie hodiny"), "Re: Otváracie hodiny");
        assert_eq!(reply_subject("RE: ping"), "RE: ping");
        assert_eq!(reply_subject(""), "Re: ");
        assert_eq!(reply_subject("ččč"), "Re: ččč");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("čučoriedka", 3), "čuč");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
