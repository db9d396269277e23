//! Sync service: fetch, dedup, triage, store and auto-answer.
//!
//! The [`SyncService`] pulls the most recent inbox messages for one user,
//! drops those already stored or deleted, classifies and drafts the rest, and
//! sends auto-replies for FAQ matches the user has approved for it.
//!
//! Running two syncs for the same user at once is safe: rows are inserted
//! with a conflict-ignoring insert and only a sync that actually created a
//! row may auto-send for it.
//!
//! An auto-reply is sent and settled on a task of its own, so timing out or
//! cancelling a sync never strands a row in `auto_pending`. Rows a crash
//! left there are released to `pending` at the start of the next sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::config::SyncSettings;
use crate::domain::{
    LogKind, MailCredential, MessageContent, MessageId, NewMessage, ReplyStatus, User, UserId,
};
use crate::providers::email::{FetchedMessage, MailSource, ProviderError};
use crate::services::reply_sender::ReplySender;
use crate::services::triage::{Triage, TriageContext};
use crate::storage::queries::messages::ReplyUpdate;
use crate::storage::{queries, Database, DatabaseError};

/// Errors that abort a sync.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// No usable mail credential. The user has to reconnect.
    #[error("mail credential expired for user {0}")]
    AuthExpired(UserId),

    #[error("fetch failed: {0}")]
    Fetch(ProviderError),

    #[error("sync timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Database(#[from] DatabaseError),
}

impl SyncError {
    /// Retrying will not help until the user reconnects.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, SyncError::AuthExpired(_))
    }
}

/// Result of a sync operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Messages stored by this call.
    pub synced_count: usize,
    /// Stored messages with a validated FAQ match.
    pub faq_matched_count: usize,
    /// Replies sent automatically.
    pub auto_sent_count: usize,
    /// Messages the source returned.
    pub total_fetched: usize,
    /// Fetched messages that were already stored or deleted.
    pub already_exists_count: usize,
    /// Duration of the sync operation.
    pub duration_ms: u64,
}

/// Status of the last sync for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Sync has never run.
    Never,
    /// Sync is currently in progress.
    InProgress,
    /// Last sync completed successfully.
    Success,
    /// Last sync failed.
    Failed,
}

/// Event emitted by the sync service.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started(UserId),
    Completed(UserId, SyncResult),
    Failed(UserId, String),
}

/// What happened to one fetched message.
enum Processed {
    /// Another sync stored it first.
    Duplicate,
    Stored { faq_matched: bool, auto_sent: bool },
}

enum AutoSend {
    Sent,
    RolledBack,
    /// The credential was rejected and has been invalidated.
    AuthExpired,
}

/// Sync service for the triage pipeline.
///
/// One instance serves every user; the credential is read from storage at
/// the start of each call.
pub struct SyncService {
    db: Database,
    source: Arc<dyn MailSource>,
    triage: Triage,
    auto_reply: AutoReply,
    settings: SyncSettings,
    /// Current sync status by user.
    status: RwLock<HashMap<UserId, SyncStatus>>,
    /// Event sender for sync events.
    event_sender: broadcast::Sender<SyncEvent>,
}

impl SyncService {
    pub fn new(
        db: Database,
        source: Arc<dyn MailSource>,
        triage: Triage,
        settings: SyncSettings,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        let auto_reply = AutoReply {
            db: db.clone(),
            sender: ReplySender::new(source.clone(), settings.request_timeout()),
        };
        Self {
            db,
            source,
            triage,
            auto_reply,
            settings,
            status: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_sender.subscribe()
    }

    /// Gets the sync status for a user.
    pub async fn status(&self, user_id: &UserId) -> SyncStatus {
        let status = self.status.read().await;
        status.get(user_id).copied().unwrap_or(SyncStatus::Never)
    }

    /// Synchronizes one user's inbox.
    ///
    /// Bounded by the configured sync timeout. Rows stored before a timeout
    /// stay in place.
    pub async fn sync(&self, user_id: &UserId) -> Result<SyncResult, SyncError> {
        let start = Instant::now();

        {
            let mut status = self.status.write().await;
            status.insert(user_id.clone(), SyncStatus::InProgress);
        }
        let _ = self.event_sender.send(SyncEvent::Started(user_id.clone()));
        tracing::info!(user_id = %user_id, "Sync started");

        let limit = self.settings.sync_timeout();
        let result = match tokio::time::timeout(limit, self.do_sync(user_id)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(limit)),
        };

        {
            let mut status = self.status.write().await;
            let value = if result.is_ok() {
                SyncStatus::Success
            } else {
                SyncStatus::Failed
            };
            status.insert(user_id.clone(), value);
        }

        match result {
            Ok(mut sync_result) => {
                sync_result.duration_ms = start.elapsed().as_millis() as u64;
                tracing::info!(
                    user_id = %user_id,
                    fetched = sync_result.total_fetched,
                    synced = sync_result.synced_count,
                    faq_matched = sync_result.faq_matched_count,
                    auto_sent = sync_result.auto_sent_count,
                    duration_ms = sync_result.duration_ms,
                    "Sync finished"
                );
                let _ = self
                    .event_sender
                    .send(SyncEvent::Completed(user_id.clone(), sync_result.clone()));
                Ok(sync_result)
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Sync failed");
                let _ = self
                    .event_sender
                    .send(SyncEvent::Failed(user_id.clone(), e.to_string()));
                Err(e)
            }
        }
    }

    async fn do_sync(&self, user_id: &UserId) -> Result<SyncResult, SyncError> {
        let user = queries::users::get_by_id(&self.db, user_id)
            .await?
            .ok_or_else(|| SyncError::UserNotFound(user_id.clone()))?;
        self.release_interrupted(user_id).await?;
        let Some(credential) = user.credential.clone() else {
            return Err(SyncError::AuthExpired(user_id.clone()));
        };

        let fetched = self.fetch(&user, &credential).await?;
        let total_fetched = fetched.len();

        let mut known = queries::messages::external_ids(&self.db, user_id).await?;
        known.extend(queries::deleted_ids::list(&self.db, user_id).await?);
        let mut fresh: Vec<FetchedMessage> = fetched
            .into_iter()
            .filter(|m| !known.contains(&m.external_id))
            .collect();
        fresh.sort_by_key(|m| m.received_at);
        tracing::debug!(
            user_id = %user_id,
            fetched = total_fetched,
            known = known.len(),
            new = fresh.len(),
            "Dedup done"
        );

        let ctx = self.triage.context(&self.db, &user).await?;

        let mut result = SyncResult {
            total_fetched,
            already_exists_count: total_fetched - fresh.len(),
            ..SyncResult::default()
        };
        let mut may_auto_send = true;

        for message in &fresh {
            match self
                .process_one(&user, &credential, message, &ctx, &mut may_auto_send)
                .await
            {
                Ok(Processed::Duplicate) => result.already_exists_count += 1,
                Ok(Processed::Stored {
                    faq_matched,
                    auto_sent,
                }) => {
                    result.synced_count += 1;
                    result.faq_matched_count += usize::from(faq_matched);
                    result.auto_sent_count += usize::from(auto_sent);
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        external_id = %message.external_id,
                        error = %e,
                        "Failed to process message, skipping"
                    );
                }
            }
        }

        Ok(result)
    }

    /// Returns rows an earlier, interrupted sync left in `auto_pending` to
    /// `pending` so a human can act on them.
    async fn release_interrupted(&self, user_id: &UserId) -> Result<(), SyncError> {
        // Twice the send timeout: anything younger may still be settling.
        let grace = chrono::Duration::from_std(self.settings.request_timeout() * 2)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let released =
            queries::messages::release_stale_auto_pending(&self.db, user_id, Utc::now() - grace)
                .await?;
        if released > 0 {
            tracing::warn!(user_id = %user_id, released, "Released interrupted auto-replies to pending");
        }
        Ok(())
    }

    async fn fetch(
        &self,
        user: &User,
        credential: &MailCredential,
    ) -> Result<Vec<FetchedMessage>, SyncError> {
        let limit = self.settings.request_timeout();
        let call = self
            .source
            .list_recent(credential, self.settings.max_messages_per_sync);

        match tokio::time::timeout(limit, call).await {
            Ok(Ok(messages)) => Ok(messages),
            Ok(Err(e)) if e.is_auth_failure() => {
                self.invalidate_credential(&user.id, &e).await;
                Err(SyncError::AuthExpired(user.id.clone()))
            }
            Ok(Err(e)) => Err(SyncError::Fetch(e)),
            Err(_) => Err(SyncError::Timeout(limit)),
        }
    }

    async fn invalidate_credential(&self, user_id: &UserId, cause: &ProviderError) {
        tracing::warn!(user_id = %user_id, error = %cause, "Mail credential rejected, invalidating");
        if let Err(e) = queries::users::invalidate_credential(&self.db, user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to invalidate credential");
        }
    }

    async fn process_one(
        &self,
        user: &User,
        credential: &MailCredential,
        fetched: &FetchedMessage,
        ctx: &TriageContext,
        may_auto_send: &mut bool,
    ) -> Result<Processed, DatabaseError> {
        let content = MessageContent {
            from: &fetched.from,
            subject: &fetched.subject,
            body: &fetched.body_text,
        };
        let triaged = self.triage.run(&user.id, content, ctx).await;
        let should_auto_send = triaged.should_auto_send(ctx);
        let faq_matched = triaged.faq.is_some();

        let new_message = NewMessage {
            user_id: user.id.clone(),
            external_id: Some(fetched.external_id.clone()),
            external_thread_id: fetched.external_thread_id.clone(),
            from: fetched.from.clone(),
            subject: fetched.subject.clone(),
            body_text: fetched.body_text.clone(),
            body_html: fetched.body_html.clone(),
            received_at: fetched.received_at,
            classification: triaged.classification,
            drafted_reply: triaged.draft,
            reply_status: if should_auto_send {
                ReplyStatus::AutoPending
            } else {
                ReplyStatus::Pending
            },
        };

        let Some(message_id) = queries::messages::insert_if_absent(&self.db, &new_message).await?
        else {
            return Ok(Processed::Duplicate);
        };
        let logged =
            queries::message_log::append(&self.db, &user.id, LogKind::Received, &fetched.subject)
                .await;
        if let Err(e) = logged {
            if should_auto_send {
                self.auto_reply.release(&user.id, &message_id).await;
            }
            return Err(e);
        }

        if !should_auto_send {
            return Ok(Processed::Stored {
                faq_matched,
                auto_sent: false,
            });
        }

        let auto_sent = if *may_auto_send {
            let outcome = self
                .auto_reply
                .clone()
                .detached(user.id.clone(), credential.clone(), message_id)
                .await?;
            match outcome {
                AutoSend::Sent => true,
                AutoSend::RolledBack => false,
                AutoSend::AuthExpired => {
                    *may_auto_send = false;
                    false
                }
            }
        } else {
            self.auto_reply.release(&user.id, &message_id).await;
            false
        };

        Ok(Processed::Stored {
            faq_matched,
            auto_sent,
        })
    }
}

/// Sends and settles auto-replies.
///
/// Owns its handles so a send can finish on a task of its own after the sync
/// that started it has been dropped.
#[derive(Clone)]
struct AutoReply {
    db: Database,
    sender: ReplySender,
}

impl AutoReply {
    /// Sends and settles on a spawned task. Dropping the returned future does
    /// not stop the task, so the row always ends up `auto_sent` or `pending`.
    async fn detached(
        self,
        user_id: UserId,
        credential: MailCredential,
        message_id: MessageId,
    ) -> Result<AutoSend, DatabaseError> {
        tokio::spawn(async move { self.settle(&user_id, &credential, &message_id).await })
            .await
            .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
    }

    async fn settle(
        &self,
        user_id: &UserId,
        credential: &MailCredential,
        message_id: &MessageId,
    ) -> Result<AutoSend, DatabaseError> {
        let outcome = self.send(user_id, credential, message_id).await;
        if outcome.is_err() {
            self.release(user_id, message_id).await;
        }
        outcome
    }

    /// Sends the drafted reply for a freshly stored `auto_pending` message.
    async fn send(
        &self,
        user_id: &UserId,
        credential: &MailCredential,
        message_id: &MessageId,
    ) -> Result<AutoSend, DatabaseError> {
        let Some(message) = queries::messages::get(&self.db, user_id, message_id).await? else {
            return Ok(AutoSend::RolledBack);
        };
        let Some(draft) = message.drafted_reply.as_deref() else {
            return self.roll_back(user_id, message_id).await;
        };

        match self.sender.send(credential, &message, draft).await {
            Ok(_) => {
                let update = ReplyUpdate {
                    sent_at: Some(Utc::now()),
                    edited_text: None,
                };
                let moved = queries::messages::transition(
                    &self.db,
                    user_id,
                    message_id,
                    ReplyStatus::AutoSent,
                    update,
                )
                .await?;
                if !moved {
                    return Ok(AutoSend::RolledBack);
                }
                if let Some(faq_id) = &message.matched_faq_id {
                    queries::faqs::increment_usage(&self.db, user_id, faq_id).await?;
                }
                queries::message_log::append(&self.db, user_id, LogKind::AutoReply, &message.subject)
                    .await?;
                tracing::info!(user_id = %user_id, message_id = %message_id, "Auto-reply sent");
                Ok(AutoSend::Sent)
            }
            Err(e) if e.is_auth_expired() => {
                tracing::warn!(user_id = %user_id, message_id = %message_id, error = %e, "Auto-reply rejected");
                self.roll_back(user_id, message_id).await?;
                if let Err(db_err) = queries::users::invalidate_credential(&self.db, user_id).await {
                    tracing::warn!(user_id = %user_id, error = %db_err, "Failed to invalidate credential");
                }
                Ok(AutoSend::AuthExpired)
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, message_id = %message_id, error = %e, "Auto-reply failed");
                self.roll_back(user_id, message_id).await
            }
        }
    }

    async fn roll_back(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
    ) -> Result<AutoSend, DatabaseError> {
        queries::messages::transition(
            &self.db,
            user_id,
            message_id,
            ReplyStatus::Pending,
            ReplyUpdate::default(),
        )
        .await?;
        Ok(AutoSend::RolledBack)
    }

    /// Best-effort roll back. A row this misses is released by the next sync.
    async fn release(&self, user_id: &UserId, message_id: &MessageId) {
        if let Err(e) = self.roll_back(user_id, message_id).await {
            tracing::warn!(user_id = %user_id, message_id = %message_id, error = %e, "Failed to release auto-reply");
        }
    }
}
