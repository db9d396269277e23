//! Sends replies to stored messages through the mail source.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{MailCredential, Message};
use crate::providers::email::{reply_subject, MailSource, OutgoingReply, ProviderError};

/// Errors from sending a reply.
#[derive(Debug, Error)]
pub enum SendError {
    /// The mail source rejected the credential. It must not be retried.
    #[error("mail credential rejected: {0}")]
    AuthExpired(ProviderError),

    /// Any other send failure.
    #[error("send failed: {0}")]
    Failed(ProviderError),

    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

impl SendError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, SendError::AuthExpired(_))
    }
}

impl From<ProviderError> for SendError {
    fn from(e: ProviderError) -> Self {
        if e.is_auth_failure() {
            SendError::AuthExpired(e)
        } else {
            SendError::Failed(e)
        }
    }
}

/// Reply sending with a per-call timeout.
#[derive(Clone)]
pub struct ReplySender {
    source: Arc<dyn MailSource>,
    timeout: Duration,
}

impl ReplySender {
    pub fn new(source: Arc<dyn MailSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Sends `text` as a reply to `message`, returning the source's id for
    /// the sent mail.
    pub async fn send(
        &self,
        credential: &MailCredential,
        message: &Message,
        text: &str,
    ) -> Result<String, SendError> {
        let reply = build_reply(message, text);
        match tokio::time::timeout(self.timeout, self.source.send(credential, &reply)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SendError::Timeout(self.timeout)),
        }
    }
}

/// Threads the reply onto the original conversation where the source
/// supports it.
pub fn build_reply(message: &Message, text: &str) -> OutgoingReply {
    OutgoingReply {
        to: message.from.clone(),
        subject: reply_subject(&message.subject),
        body: text.to_string(),
        thread_id: message.external_thread_id.clone(),
        in_reply_to: message.external_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Address, Category, ExternalMessageId, ExternalThreadId, MessageId, ReplyStatus, UserId,
    };
    use crate::providers::email::MockMailSource;
    use crate::services::test_support::{base_time, credential};
    use pretty_assertions::assert_eq;

    fn stored_message() -> Message {
        Message {
            id: MessageId::from("m1"),
            user_id: UserId::from("u1"),
            external_id: Some(ExternalMessageId::from("gm-1")),
            external_thread_id: Some(ExternalThreadId::from("th-1")),
            from: Address::with_name("jana@example.sk", "Jana"),
            subject: "Otváracie hodiny".to_string(),
            body_text: "Kedy máte otvorené?".to_string(),
            body_html: None,
            received_at: base_time(),
            summary: None,
            category: Category::Faq,
            matched_faq_id: None,
            drafted_reply: Some("8–16".to_string()),
            reply_status: ReplyStatus::Pending,
            reply_sent_at: None,
            reply_edited_text: None,
            is_read: false,
            thread_count: 1,
        }
    }

    #[test]
    fn reply_targets_sender_and_thread() {
        let reply = build_reply(&stored_message(), "Otvorené 8–16.");
        assert_eq!(reply.to.email, "jana@example.sk");
        assert_eq!(reply.subject, "Re: Otváracie hodiny");
        assert_eq!(reply.thread_id, Some(ExternalThreadId::from("th-1")));
        assert_eq!(reply.in_reply_to, Some(ExternalMessageId::from("gm-1")));
    }

    #[tokio::test]
    async fn auth_failure_is_reported_as_expired() {
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .returning(|_, _| Err(ProviderError::Authentication("invalid_grant".into())));
        let sender = ReplySender::new(Arc::new(source), Duration::from_secs(5));

        let err = sender
            .send(&credential(), &stored_message(), "text")
            .await
            .unwrap_err();

        assert!(err.is_auth_expired());
    }

    #[tokio::test]
    async fn other_failures_are_plain() {
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .returning(|_, _| Err(ProviderError::Connection("reset".into())));
        let sender = ReplySender::new(Arc::new(source), Duration::from_secs(5));

        let err = sender
            .send(&credential(), &stored_message(), "text")
            .await
            .unwrap_err();

        assert!(matches!(err, SendError::Failed(ProviderError::Connection(_))));
    }

    #[tokio::test]
    async fn success_returns_sent_id() {
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .withf(|_, reply| reply.body == "Otvorené 8–16.")
            .times(1)
            .returning(|_, _| Ok("sent-1".to_string()));
        let sender = ReplySender::new(Arc::new(source), Duration::from_secs(5));

        let id = sender
            .send(&credential(), &stored_message(), "Otvorené 8–16.")
            .await
            .unwrap();

        assert_eq!(id, "sent-1");
    }
}
