//! Message service: the operations a user performs on their inbox.
//!
//! Provides listing, search and dashboard figures, plus the reply actions
//! (send, edit-and-send, reject) that drive the reply state machine and feed
//! back into FAQ counters.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    Address, Category, InboxStats, LogKind, Message, MessageContent, MessageId, NewMessage,
    ReplyStatus, TransitionError, UserId,
};
use crate::services::reply_sender::{ReplySender, SendError};
use crate::services::triage::Triage;
use crate::storage::queries::messages::ReplyUpdate;
use crate::storage::{queries, Database, DatabaseError};

/// Default page size for [`MessageService::list`].
pub const DEFAULT_LIST_LIMIT: u32 = 100;

/// Default and maximum result counts for [`MessageService::search`].
pub const DEFAULT_SEARCH_LIMIT: u32 = 20;
pub const MAX_SEARCH_LIMIT: u32 = 50;

/// Errors from message operations.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("message not found: {0}")]
    NotFound(MessageId),

    #[error("user not found: {0}")]
    UserNotFound(UserId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Neither a supplied text nor a draft.
    #[error("no reply text")]
    NoReplyText,

    /// The mail credential was rejected and has been invalidated.
    #[error("mail credential expired for user {0}")]
    AuthExpired(UserId),

    #[error("send failed: {0}")]
    SendFailed(String),

    /// Another reply to the same message is being delivered.
    #[error("a reply to message {0} is already being sent")]
    SendInProgress(MessageId),

    #[error("search query is empty")]
    InvalidQuery,

    #[error("storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type for message operations.
pub type ReplyResult<T> = Result<T, ReplyError>;

/// How to answer a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendReply {
    /// Text to send. `None` sends the draft as it is.
    pub text: Option<String>,
    /// Also turn on auto-send for the matched FAQ.
    #[serde(default)]
    pub automate: bool,
}

impl SendReply {
    /// Sends the stored draft unchanged.
    pub fn draft() -> Self {
        Self::default()
    }

    /// Sends `text` instead of the draft.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            automate: false,
        }
    }

    /// Also turns on auto-send for the matched FAQ once this reply is out.
    pub fn and_automate(mut self) -> Self {
        self.automate = true;
        self
    }
}

/// Messages whose reply is being delivered, shared by clones of the service.
type InFlight = Arc<Mutex<HashSet<MessageId>>>;

/// Holds a message in [`InFlight`] until dropped.
struct SendClaim {
    in_flight: InFlight,
    id: MessageId,
}

impl SendClaim {
    fn take(in_flight: &InFlight, id: &MessageId) -> Option<Self> {
        let mut claimed = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        claimed.insert(id.clone()).then(|| Self {
            in_flight: in_flight.clone(),
            id: id.clone(),
        })
    }
}

impl Drop for SendClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Inbox operations for users.
#[derive(Clone)]
pub struct MessageService {
    db: Database,
    triage: Triage,
    sender: ReplySender,
    in_flight: InFlight,
}

impl MessageService {
    pub fn new(db: Database, triage: Triage, sender: ReplySender) -> Self {
        Self {
            db,
            triage,
            sender,
            in_flight: InFlight::default(),
        }
    }

    /// Messages newest first, each with its thread count.
    pub async fn list(&self, user_id: &UserId, limit: Option<u32>) -> ReplyResult<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        Ok(queries::messages::list(&self.db, user_id, limit).await?)
    }

    /// Returns one of the user's messages, or [`ReplyError::NotFound`].
    pub async fn get(&self, user_id: &UserId, id: &MessageId) -> ReplyResult<Message> {
        queries::messages::get(&self.db, user_id, id)
            .await?
            .ok_or_else(|| ReplyError::NotFound(id.clone()))
    }

    /// Stores a message that did not come from the mail source.
    ///
    /// It is triaged like a synced message but always starts as `pending`,
    /// and without an external id it can never be auto-sent.
    pub async fn create_manual(
        &self,
        user_id: &UserId,
        from: Address,
        subject: &str,
        body: &str,
    ) -> ReplyResult<Message> {
        let user = queries::users::get_by_id(&self.db, user_id)
            .await?
            .ok_or_else(|| ReplyError::UserNotFound(user_id.clone()))?;

        let ctx = self.triage.context(&self.db, &user).await?;
        let content = MessageContent {
            from: &from,
            subject,
            body,
        };
        let triaged = self.triage.run(user_id, content, &ctx).await;

        let new_message = NewMessage {
            user_id: user_id.clone(),
            external_id: None,
            external_thread_id: None,
            from,
            subject: subject.to_string(),
            body_text: body.to_string(),
            body_html: None,
            received_at: Utc::now(),
            classification: triaged.classification,
            drafted_reply: triaged.draft,
            reply_status: ReplyStatus::Pending,
        };
        let id = queries::messages::insert_if_absent(&self.db, &new_message)
            .await?
            .ok_or_else(|| {
                DatabaseError::Corrupt("manual message insert was ignored".to_string())
            })?;
        queries::message_log::append(&self.db, user_id, LogKind::Received, subject).await?;

        self.get(user_id, &id).await
    }

    /// Sends a reply and records what the user did with the draft.
    ///
    /// The state is only changed after the mail went out; a failed send
    /// leaves the message as it was. Sending text that differs from the
    /// draft counts as an edit and replaces the matched FAQ's template.
    ///
    /// A message is claimed for the whole call, so a second send racing
    /// through this service fails with [`ReplyError::SendInProgress`]
    /// instead of mailing the sender twice. Claims are per process; the
    /// compare-and-set on the state still decides between processes.
    pub async fn send_reply(
        &self,
        user_id: &UserId,
        id: &MessageId,
        request: SendReply,
    ) -> ReplyResult<Message> {
        let _claim = SendClaim::take(&self.in_flight, id)
            .ok_or_else(|| ReplyError::SendInProgress(id.clone()))?;
        let message = self.get(user_id, id).await?;

        let text = match (&request.text, &message.drafted_reply) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (None, Some(draft)) if !draft.trim().is_empty() => draft.clone(),
            _ => return Err(ReplyError::NoReplyText),
        };
        let edited = request.text.is_some() && message.drafted_reply.as_deref() != Some(text.as_str());
        let target = if edited {
            ReplyStatus::EditedSent
        } else {
            ReplyStatus::Sent
        };
        message.reply_status.transition(target)?;

        if message.external_id.is_some() {
            self.deliver(user_id, &message, &text).await?;
        }

        let update = ReplyUpdate {
            sent_at: Some(Utc::now()),
            edited_text: edited.then(|| text.clone()),
        };
        self.apply_transition(user_id, &message, target, update).await?;
        queries::message_log::append(&self.db, user_id, LogKind::Sent, &message.subject).await?;

        if let Some(faq_id) = &message.matched_faq_id {
            if edited {
                queries::faqs::record_edited_send(&self.db, user_id, faq_id, &text).await?;
            } else {
                queries::faqs::increment_usage(&self.db, user_id, faq_id).await?;
            }
            if request.automate {
                queries::faqs::set_auto_send(&self.db, user_id, faq_id, true).await?;
            }
        }

        tracing::info!(user_id = %user_id, message_id = %id, edited, "Reply sent");
        self.get(user_id, id).await
    }

    /// Discards the draft. The matched FAQ counts a rejection.
    pub async fn reject(&self, user_id: &UserId, id: &MessageId) -> ReplyResult<Message> {
        let message = self.get(user_id, id).await?;
        message.reply_status.transition(ReplyStatus::Rejected)?;
        self.apply_transition(user_id, &message, ReplyStatus::Rejected, ReplyUpdate::default())
            .await?;

        if let Some(faq_id) = &message.matched_faq_id {
            queries::faqs::increment_rejected(&self.db, user_id, faq_id).await?;
        }

        self.get(user_id, id).await
    }

    /// Marks messages as read and returns how many changed. Ids of other
    /// users' messages are ignored.
    pub async fn mark_read(&self, user_id: &UserId, ids: &[MessageId]) -> ReplyResult<usize> {
        Ok(queries::messages::mark_read(&self.db, user_id, ids).await?)
    }

    /// Deletes messages for good: sync will not fetch them again.
    pub async fn delete(&self, user_id: &UserId, ids: &[MessageId]) -> ReplyResult<usize> {
        Ok(queries::messages::delete_and_remember(&self.db, user_id, ids).await?)
    }

    /// Full-text search, optionally within one category.
    ///
    /// The limit defaults to [`DEFAULT_SEARCH_LIMIT`] and is capped at
    /// [`MAX_SEARCH_LIMIT`]. A blank query is [`ReplyError::InvalidQuery`].
    pub async fn search(
        &self,
        user_id: &UserId,
        query: &str,
        category: Option<Category>,
        limit: Option<u32>,
    ) -> ReplyResult<Vec<Message>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ReplyError::InvalidQuery);
        }
        let limit = limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        Ok(queries::messages::search(&self.db, user_id, query, category, limit).await?)
    }

    /// Unread messages still waiting for an answer, spam excluded.
    pub async fn unread_count(&self, user_id: &UserId) -> ReplyResult<u32> {
        Ok(queries::messages::unread_count(&self.db, user_id).await?)
    }

    /// Dashboard figures as of now.
    pub async fn stats(&self, user_id: &UserId) -> ReplyResult<InboxStats> {
        Ok(queries::messages::stats(&self.db, user_id, Utc::now()).await?)
    }

    async fn deliver(&self, user_id: &UserId, message: &Message, text: &str) -> ReplyResult<()> {
        let user = queries::users::get_by_id(&self.db, user_id)
            .await?
            .ok_or_else(|| ReplyError::UserNotFound(user_id.clone()))?;
        let Some(credential) = user.credential else {
            return Err(ReplyError::AuthExpired(user_id.clone()));
        };

        match self.sender.send(&credential, message, text).await {
            Ok(_) => Ok(()),
            Err(SendError::AuthExpired(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Mail credential rejected, invalidating");
                queries::users::invalidate_credential(&self.db, user_id).await?;
                Err(ReplyError::AuthExpired(user_id.clone()))
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, message_id = %message.id, error = %e, "Reply not sent");
                Err(ReplyError::SendFailed(e.to_string()))
            }
        }
    }

    /// Compare-and-set on the stored state. Losing the race reports the
    /// state the winner left behind.
    async fn apply_transition(
        &self,
        user_id: &UserId,
        message: &Message,
        to: ReplyStatus,
        update: ReplyUpdate,
    ) -> ReplyResult<()> {
        let moved = queries::messages::transition(&self.db, user_id, &message.id, to, update).await?;
        if moved {
            return Ok(());
        }
        let current = self.get(user_id, &message.id).await?;
        Err(TransitionError {
            from: current.reply_status,
            to,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Classification, ExternalMessageId, FaqTemplate, User};
    use crate::providers::email::{MockMailSource, ProviderError};
    use crate::services::test_support::{
        base_time, classification_json, connected_user, opening_hours_faq, triage, ScriptedLlm,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::assert_err;

    fn service(db: &Database, source: MockMailSource, llm: Arc<ScriptedLlm>) -> MessageService {
        MessageService::new(
            db.clone(),
            triage(db, llm),
            ReplySender::new(Arc::new(source), Duration::from_secs(5)),
        )
    }

    fn sending_source() -> MockMailSource {
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .returning(|_, _| Ok("sent-id".to_string()));
        source
    }

    async fn seed(db: &Database, user: &User, faq: Option<&FaqTemplate>, draft: &str) -> MessageId {
        let new_message = NewMessage {
            user_id: user.id.clone(),
            external_id: Some(ExternalMessageId(crate::domain::new_id())),
            external_thread_id: None,
            from: Address::new("jana@example.sk"),
            subject: "Otváracie hodiny".to_string(),
            body_text: "Kedy máte otvorené?".to_string(),
            body_html: None,
            received_at: base_time(),
            classification: Classification {
                summary: None,
                category: if faq.is_some() { Category::Faq } else { Category::Normal },
                matched_faq_id: faq.map(|f| f.id.clone()),
            },
            drafted_reply: Some(draft.to_string()),
            reply_status: ReplyStatus::Pending,
        };
        queries::messages::insert_if_absent(db, &new_message)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn racing_sends_deliver_once() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let id = seed(&db, &user, None, "Otvorené 8–16.").await;
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .times(1)
            .returning(|_, _| Ok("sent-id".to_string()));
        let service = service(&db, source, Arc::new(ScriptedLlm::new()));
        let other = service.clone();

        let (first, second) = tokio::join!(
            service.send_reply(&user.id, &id, SendReply::draft()),
            other.send_reply(&user.id, &id, SendReply::draft()),
        );

        assert_eq!(first.unwrap().reply_status, ReplyStatus::Sent);
        assert!(matches!(second, Err(ReplyError::SendInProgress(_))));
        let again = service.send_reply(&user.id, &id, SendReply::draft()).await;
        assert!(matches!(again, Err(ReplyError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn sending_the_draft_counts_usage() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let faq = opening_hours_faq(&db, &user, false).await;
        let id = seed(&db, &user, Some(&faq), "Otvorené 8–16.").await;
        let service = service(&db, sending_source(), Arc::new(ScriptedLlm::new()));

        let message = service.send_reply(&user.id, &id, SendReply::draft()).await.unwrap();

        assert_eq!(message.reply_status, ReplyStatus::Sent);
        assert!(message.reply_sent_at.is_some());
        assert_eq!(message.reply_edited_text, None);
        let faq = queries::faqs::get(&db, &user.id, &faq.id).await.unwrap().unwrap();
        assert_eq!(faq.usage_count, 1);
        assert_eq!(faq.times_edited, 0);
    }

    #[tokio::test]
    async fn edited_reply_becomes_the_template() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let faq = opening_hours_faq(&db, &user, false).await;
        let id = seed(&db, &user, Some(&faq), "Otvorené 8–16.").await;
        let service = service(&db, sending_source(), Arc::new(ScriptedLlm::new()));

        let message = service
            .send_reply(&user.id, &id, SendReply::text("Otvorené 8–17.").and_automate())
            .await
            .unwrap();

        assert_eq!(message.reply_status, ReplyStatus::EditedSent);
        assert_eq!(message.reply_edited_text.as_deref(), Some("Otvorené 8–17."));
        let faq = queries::faqs::get(&db, &user.id, &faq.id).await.unwrap().unwrap();
        assert_eq!(faq.response_template, "Otvorené 8–17.");
        assert_eq!(faq.times_edited, 1);
        assert_eq!(faq.usage_count, 1);
        assert!(faq.auto_send);
    }

    #[tokio::test]
    async fn supplied_text_equal_to_draft_is_not_an_edit() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let id = seed(&db, &user, None, "Ďakujeme.").await;
        let service = service(&db, sending_source(), Arc::new(ScriptedLlm::new()));

        let message = service
            .send_reply(&user.id, &id, SendReply::text("Ďakujeme."))
            .await
            .unwrap();

        assert_eq!(message.reply_status, ReplyStatus::Sent);
    }

    #[tokio::test]
    async fn failed_send_leaves_state_alone() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let faq = opening_hours_faq(&db, &user, false).await;
        let id = seed(&db, &user, Some(&faq), "Otvorené 8–16.").await;
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .returning(|_, _| Err(ProviderError::RateLimited { retry_after_secs: Some(60) }));
        let service = service(&db, source, Arc::new(ScriptedLlm::new()));

        let err = service.send_reply(&user.id, &id, SendReply::draft()).await.unwrap_err();

        assert!(matches!(err, ReplyError::SendFailed(_)));
        let message = service.get(&user.id, &id).await.unwrap();
        assert_eq!(message.reply_status, ReplyStatus::Pending);
        let faq = queries::faqs::get(&db, &user.id, &faq.id).await.unwrap().unwrap();
        assert_eq!(faq.usage_count, 0);
    }

    #[tokio::test]
    async fn rejected_credential_is_invalidated_on_send() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let id = seed(&db, &user, None, "Ďakujeme.").await;
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .returning(|_, _| Err(ProviderError::Authentication("invalid_grant".into())));
        let service = service(&db, source, Arc::new(ScriptedLlm::new()));

        let err = service.send_reply(&user.id, &id, SendReply::draft()).await.unwrap_err();

        assert!(matches!(err, ReplyError::AuthExpired(_)));
        let user = queries::users::get_by_id(&db, &user.id).await.unwrap().unwrap();
        assert_eq!(user.credential, None);
    }

    #[tokio::test]
    async fn terminal_states_cannot_be_left() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let faq = opening_hours_faq(&db, &user, false).await;
        let id = seed(&db, &user, Some(&faq), "Otvorené 8–16.").await;
        let mut source = MockMailSource::new();
        source
            .expect_send()
            .times(1)
            .returning(|_, _| Ok("sent-id".to_string()));
        let service = service(&db, source, Arc::new(ScriptedLlm::new()));

        service.send_reply(&user.id, &id, SendReply::draft()).await.unwrap();
        let again = service.send_reply(&user.id, &id, SendReply::draft()).await;
        let reject = service.reject(&user.id, &id).await;

        assert!(matches!(again, Err(ReplyError::InvalidTransition(_))));
        assert!(matches!(reject, Err(ReplyError::InvalidTransition(_))));
        let faq = queries::faqs::get(&db, &user.id, &faq.id).await.unwrap().unwrap();
        assert_eq!(faq.usage_count, 1);
        assert_eq!(faq.times_rejected, 0);
    }

    #[tokio::test]
    async fn reject_counts_against_the_faq() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let faq = opening_hours_faq(&db, &user, false).await;
        let id = seed(&db, &user, Some(&faq), "Otvorené 8–16.").await;
        let service = service(&db, MockMailSource::new(), Arc::new(ScriptedLlm::new()));

        let message = service.reject(&user.id, &id).await.unwrap();

        assert_eq!(message.reply_status, ReplyStatus::Rejected);
        let stored = queries::faqs::get(&db, &user.id, &faq.id).await.unwrap().unwrap();
        assert_eq!(stored.times_rejected, 1);
        assert_eq!(stored.response_template, faq.response_template);
    }

    #[tokio::test]
    async fn blank_text_without_draft_is_refused() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let id = seed(&db, &user, None, "  ").await;
        let service = service(&db, MockMailSource::new(), Arc::new(ScriptedLlm::new()));

        let err = service.send_reply(&user.id, &id, SendReply::draft()).await.unwrap_err();

        assert!(matches!(err, ReplyError::NoReplyText));
    }

    #[tokio::test]
    async fn manual_message_is_triaged_but_never_auto_sent() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        queries::users::set_policy(&db, &user.id, true, true).await.unwrap();
        let faq = opening_hours_faq(&db, &user, true).await;
        let llm = Arc::new(
            ScriptedLlm::new()
                .reply(classification_json("FAQ", Some(faq.id.as_str())))
                .reply("Dobrý deň, otvorené máme 8–16. S pozdravom"),
        );
        // No send expectation: any send call would fail the test.
        let service = service(&db, MockMailSource::new(), llm);

        let message = service
            .create_manual(&user.id, Address::new("jana@example.sk"), "Hodiny", "Kedy?")
            .await
            .unwrap();

        assert_eq!(message.external_id, None);
        assert_eq!(message.category, Category::Faq);
        assert_eq!(message.reply_status, ReplyStatus::Pending);
        assert!(message.drafted_reply.is_some());

        let sent = service.send_reply(&user.id, &message.id, SendReply::draft()).await.unwrap();
        assert_eq!(sent.reply_status, ReplyStatus::Sent);
    }

    #[tokio::test]
    async fn search_validates_query() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        seed(&db, &user, None, "x").await;
        let service = service(&db, MockMailSource::new(), Arc::new(ScriptedLlm::new()));

        assert_err!(service.search(&user.id, "   ", None, None).await);
        let found = service
            .search(&user.id, "hodiny", None, Some(500))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn deleted_messages_are_remembered() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let id = seed(&db, &user, None, "x").await;
        let external = external_id_of(&db, &user, &id).await;
        let service = service(&db, MockMailSource::new(), Arc::new(ScriptedLlm::new()));

        assert_eq!(service.delete(&user.id, &[id.clone()]).await.unwrap(), 1);

        assert!(matches!(
            service.get(&user.id, &id).await,
            Err(ReplyError::NotFound(_))
        ));
        let deleted = queries::deleted_ids::list(&db, &user.id).await.unwrap();
        assert!(deleted.contains(&external));
    }

    async fn external_id_of(db: &Database, user: &User, id: &MessageId) -> ExternalMessageId {
        queries::messages::get(db, &user.id, id)
            .await
            .unwrap()
            .unwrap()
            .external_id
            .unwrap()
    }
}
