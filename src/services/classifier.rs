//! Message classification.
//!
//! One model call per message yields a short summary, a category and an
//! optional FAQ match. Model output is never trusted as-is: the category is
//! normalised and the FAQ reference is checked against the caller's list.
//! Every failure degrades to [`Classification::default`].

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::{AiSettings, DraftSettings};
use crate::domain::{Category, Classification, FaqTemplate, MessageContent, UserId};
use crate::providers::ai::{CompletionRequest, LlmProvider};
use crate::storage::{queries, Database};

/// Body characters shown to the model.
const MAX_BODY_CHARS: usize = 2_000;

/// Classifies inbound messages for one backend.
#[derive(Clone)]
pub struct Classifier {
    provider: Arc<dyn LlmProvider>,
    db: Database,
    temperature: f32,
    language: String,
    timeout: Duration,
}

/// Model output before validation.
#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default, alias = "summary_sk")]
    summary: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "faq_matched_id")]
    faq_id: Option<String>,
}

impl Classifier {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        db: Database,
        ai: &AiSettings,
        drafting: &DraftSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            db,
            temperature: ai.classification_temperature,
            language: drafting.language.clone(),
            timeout,
        }
    }

    /// Classifies `input` against the user's FAQ list.
    ///
    /// On a validated FAQ match the template's `usage_count` goes up by one.
    pub async fn classify(
        &self,
        user_id: &UserId,
        input: MessageContent<'_>,
        faqs: &[FaqTemplate],
    ) -> Classification {
        let request = self.build_request(input, faqs);

        let text = match tokio::time::timeout(self.timeout, self.provider.complete(&request)).await
        {
            Ok(Ok(response)) => response.text,
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Classification failed, using default");
                return Classification::default();
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Classification timed out, using default");
                return Classification::default();
            }
        };

        let classification = match decode(&text) {
            Ok(raw) => resolve(raw, faqs),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Unreadable classification, using default");
                return Classification::default();
            }
        };

        if let Some(faq_id) = &classification.matched_faq_id {
            if let Err(e) = queries::faqs::increment_usage(&self.db, user_id, faq_id).await {
                tracing::warn!(user_id = %user_id, faq_id = %faq_id, error = %e, "Failed to count FAQ match");
            }
        }

        classification
    }

    fn build_request(&self, input: MessageContent<'_>, faqs: &[FaqTemplate]) -> CompletionRequest {
        CompletionRequest::new(system_prompt(&self.language, faqs), user_prompt(input))
            .with_temperature(self.temperature)
            .with_max_tokens(300)
            .with_json_output()
    }
}

fn system_prompt(language: &str, faqs: &[FaqTemplate]) -> String {
    let mut prompt = format!(
        "You triage a small business inbox. Answer with a JSON object with these fields:\n\
         \n\
         \"summary\": one sentence in {language}, at most 15 words, saying what the sender \
         wants or reports. Do not restate the email.\n\
         \n\
         \"category\": one of URGENT, TIME_SENSITIVE, FAQ, NORMAL, SPAM.\n\
         - URGENT: words like urgent, immediately, critical, or a threat or serious problem\n\
         - TIME_SENSITIVE: invoices, deadlines, due dates, meetings\n\
         - FAQ: the sender asks something one of the FAQ templates below answers\n\
         - NORMAL: ordinary correspondence without urgency\n\
         - SPAM: advertising, newsletters, unsolicited mail\n\
         \n\
         \"faq_id\": the id of the matching FAQ template when category is FAQ, otherwise null.\n"
    );

    if faqs.is_empty() {
        prompt.push_str("\nThere are no FAQ templates, so never use FAQ.\n");
    } else {
        prompt.push_str("\nFAQ templates (id | question):\n");
        for faq in faqs {
            prompt.push_str(&format!("- {} | {}\n", faq.id, faq.question_pattern));
        }
        prompt.push_str(
            "\nMatch on intent, not vocabulary: pick a template when the sender wants the \
             information it answers, however they phrase it. Shared keywords alone are not a \
             match. Only use ids from this list.\n",
        );
    }

    prompt.push_str("\nRespond with the JSON object only.");
    prompt
}

fn user_prompt(input: MessageContent<'_>) -> String {
    format!(
        "Subject: {}\nFrom: {}\nBody:\n{}",
        input.subject,
        input.from.display(),
        truncate(input.body, MAX_BODY_CHARS)
    )
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Removes a surrounding Markdown code fence, if any.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`) on the opening line.
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn decode(text: &str) -> Result<RawClassification, serde_json::Error> {
    serde_json::from_str(strip_code_fence(text))
}

/// Applies the category and FAQ-reference rules to raw model output.
fn resolve(raw: RawClassification, faqs: &[FaqTemplate]) -> Classification {
    let summary = raw
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut category = raw
        .category
        .as_deref()
        .map(Category::parse_lenient)
        .unwrap_or(Category::Normal);

    let matched_faq_id = raw
        .faq_id
        .as_deref()
        .map(str::trim)
        .and_then(|id| faqs.iter().find(|faq| faq.id.as_str() == id))
        .map(|faq| faq.id.clone());

    match (&matched_faq_id, category) {
        (Some(_), c) if c != Category::Faq => category = Category::Faq,
        (None, Category::Faq) => category = Category::Normal,
        _ => {}
    }

    Classification {
        summary,
        category,
        matched_faq_id,
    }
}
