//! Fakes and fixtures shared by service tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::config::{AiSettings, DraftSettings};
use crate::domain::{Address, ExternalMessageId, ExternalThreadId, FaqTemplate, MailCredential, User};
use crate::providers::ai::{
    CompletionRequest, CompletionResponse, LlmError, LlmProvider, LlmResult,
};
use crate::providers::email::FetchedMessage;
use crate::services::{Classifier, ReplyDrafter, Triage};
use crate::storage::{queries, Database};

/// LLM fake that replays scripted answers in order and records requests.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<LlmResult<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(Ok(text.into()));
        self
    }

    pub fn fail(self, error: LlmError) -> Self {
        self.replies.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> LlmResult<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::NotConfigured("script exhausted".to_string())));
        next.map(CompletionResponse::finished)
    }

    fn model(&self) -> &str {
        "scripted-1"
    }
}

/// Classifier and drafter sharing one scripted backend.
pub fn triage(db: &Database, llm: Arc<ScriptedLlm>) -> Triage {
    let timeout = std::time::Duration::from_secs(5);
    let ai = AiSettings::default();
    let drafting = DraftSettings::default();
    Triage::new(
        Classifier::new(llm.clone(), db.clone(), &ai, &drafting, timeout),
        ReplyDrafter::new(llm, db.clone(), &ai, drafting, timeout),
    )
}

/// In-memory database with one user who has a connected mailbox and AI
/// consent.
pub async fn connected_user(db: &Database) -> User {
    let user = User::new("office@example.sk");
    queries::users::insert(db, &user).await.unwrap();
    queries::users::connect_mail(db, &user.id, &credential(), Some("office@example.sk"))
        .await
        .unwrap();
    queries::consents::grant(db, &user.id, crate::domain::ConsentType::AiProcessing)
        .await
        .unwrap();
    queries::users::get_by_id(db, &user.id).await.unwrap().unwrap()
}

pub fn credential() -> MailCredential {
    MailCredential::new("refresh-token")
}

pub async fn opening_hours_faq(db: &Database, user: &User, auto_send: bool) -> FaqTemplate {
    let mut faq = FaqTemplate::new(
        user.id.clone(),
        "Aké sú otváracie hodiny?",
        "Otvorené máme Po–Pia 8–16.",
    );
    faq.auto_send = auto_send;
    queries::faqs::insert(db, &faq).await.unwrap();
    faq
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
}

/// A fetched message `minutes` after [`base_time`].
pub fn fetched(id: &str, subject: &str, body: &str, minutes: i64) -> FetchedMessage {
    FetchedMessage {
        external_id: ExternalMessageId::from(id),
        external_thread_id: Some(ExternalThreadId::from(format!("thread-{id}"))),
        from: Address::with_name("jana@example.sk", "Jana"),
        subject: subject.to_string(),
        body_text: body.to_string(),
        body_html: None,
        received_at: base_time() + Duration::minutes(minutes),
    }
}

/// Classifier JSON for the given category and FAQ id.
pub fn classification_json(category: &str, faq_id: Option<&str>) -> String {
    serde_json::json!({
        "summary": "Pýta sa na otváracie hodiny.",
        "category": category,
        "faq_id": faq_id,
    })
    .to_string()
}
