//! Reply drafting.
//!
//! Messages that matched an FAQ are answered from the template. The model
//! only adapts the wording: a draft must carry exactly the template's facts,
//! and one that drops, changes or adds a number, address or link is thrown
//! away in favour of the bare template. Facts the sender wrote do not count,
//! so a price quoted back from the question cannot replace the template's.
//! Other messages get a free draft in the user's style, learned from replies
//! they already sent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AiSettings, DraftSettings};
use crate::domain::{
    Category, Classification, FaqTemplate, MessageContent, ReplyPattern, SentReply, UserId,
};
use crate::providers::ai::{CompletionRequest, LlmProvider};
use crate::services::classifier::truncate;
use crate::storage::{queries, Database};

/// Body characters shown to the model.
const MAX_BODY_CHARS: usize = 1_000;

/// Characters of each history example shown to the model.
const MAX_EXAMPLE_CHARS: usize = 400;

/// Style material for free drafts.
#[derive(Debug, Clone, Default)]
pub struct DraftHistory {
    /// Replies the user sent recently, newest first.
    pub sent: Vec<SentReply>,
    /// Reply patterns above the confidence threshold.
    pub patterns: Vec<ReplyPattern>,
}

/// Writes reply drafts.
#[derive(Clone)]
pub struct ReplyDrafter {
    provider: Arc<dyn LlmProvider>,
    db: Database,
    settings: DraftSettings,
    temperature: f32,
    timeout: Duration,
}

impl ReplyDrafter {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        db: Database,
        ai: &AiSettings,
        settings: DraftSettings,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            db,
            settings,
            temperature: ai.draft_temperature,
            timeout,
        }
    }

    /// Loads sent replies and confident reply patterns for `user_id`.
    ///
    /// Read failures leave the history empty; drafting still works without it.
    pub async fn load_history(&self, user_id: &UserId) -> DraftHistory {
        let sent = queries::messages::sent_history(&self.db, user_id, self.settings.history_examples)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to load sent history");
                Vec::new()
            });
        let patterns = queries::reply_patterns::list_confident(
            &self.db,
            user_id,
            self.settings.min_pattern_confidence,
        )
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to load reply patterns");
            Vec::new()
        });

        DraftHistory { sent, patterns }
    }

    /// Drafts a reply, or returns `None` when there is nothing to send.
    ///
    /// Spam is never drafted. With a matched `faq` the result always carries
    /// the template's content, either adapted or verbatim.
    pub async fn draft(
        &self,
        user_id: &UserId,
        input: MessageContent<'_>,
        classification: &Classification,
        faq: Option<&FaqTemplate>,
        history: &DraftHistory,
    ) -> Option<String> {
        if classification.category == Category::Spam {
            return None;
        }

        match faq {
            Some(faq) => Some(self.draft_from_template(user_id, input, faq).await),
            None => self.draft_free(user_id, input, history).await,
        }
    }

    async fn draft_from_template(
        &self,
        user_id: &UserId,
        input: MessageContent<'_>,
        faq: &FaqTemplate,
    ) -> String {
        let request = CompletionRequest::new(self.template_prompt(faq), message_prompt(input))
            .with_temperature(self.temperature)
            .with_max_tokens(500);

        let Some(draft) = self.complete(user_id, &request).await else {
            return template_reply(&self.settings, faq);
        };

        let drift = fact_drift(&draft, &faq.response_template);
        if !drift.is_empty() {
            tracing::warn!(
                user_id = %user_id,
                faq_id = %faq.id,
                missing = ?drift.missing,
                added = ?drift.added,
                "Draft does not match the template's facts, using template verbatim"
            );
            return template_reply(&self.settings, faq);
        }

        with_signature(&draft, &self.settings.signature)
    }

    async fn draft_free(
        &self,
        user_id: &UserId,
        input: MessageContent<'_>,
        history: &DraftHistory,
    ) -> Option<String> {
        let request = CompletionRequest::new(self.free_prompt(history), message_prompt(input))
            .with_temperature(self.temperature)
            .with_max_tokens(500);

        let draft = self.complete(user_id, &request).await?;
        Some(with_signature(&draft, &self.settings.signature))
    }

    /// Runs one completion. Errors, timeouts and blank output are all `None`.
    async fn complete(&self, user_id: &UserId, request: &CompletionRequest) -> Option<String> {
        match tokio::time::timeout(self.timeout, self.provider.complete(request)).await {
            Ok(Ok(response)) if response.is_truncated() => {
                tracing::warn!(user_id = %user_id, "Draft cut off at the token limit, discarding");
                None
            }
            Ok(Ok(response)) => {
                let text = response.text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user_id, error = %e, "Drafting failed");
                None
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "Drafting timed out");
                None
            }
        }
    }

    fn template_prompt(&self, faq: &FaqTemplate) -> String {
        let s = &self.settings;
        format!(
            "You answer an email on behalf of a small business, in {language}.\n\
             \n\
             The answer must be based on this approved template:\n\
             ---\n\
             {template}\n\
             ---\n\
             \n\
             Rules:\n\
             - Copy every fact of the template exactly: numbers, times, dates, prices, addresses, links.\n\
             - Do not add any other fact, not even one from the sender's email.\n\
             - You may adapt the wording to the question and address the sender directly.\n\
             - Start with \"{greeting}\" and end with \"{signature}\".\n\
             - At most {sentences} sentences.\n\
             \n\
             Write only the reply text.",
            language = s.language,
            template = faq.response_template,
            greeting = s.greeting,
            signature = s.signature,
            sentences = s.max_reply_sentences,
        )
    }

    fn free_prompt(&self, history: &DraftHistory) -> String {
        let s = &self.settings;
        let mut prompt = format!(
            "You draft a reply to an email on behalf of a small business, in {language}.\n\
             Be polite and concrete. Do not promise anything you cannot know, such as \
             prices, dates or availability; ask or say the owner will follow up instead.\n\
             Start with \"{greeting}\" and end with \"{signature}\". At most {sentences} sentences.\n",
            language = s.language,
            greeting = s.greeting,
            signature = s.signature,
            sentences = s.max_reply_sentences,
        );

        if !history.sent.is_empty() {
            prompt.push_str("\nReplies the owner sent before. Match their tone and length:\n");
            for example in &history.sent {
                prompt.push_str(&format!(
                    "\nEmail ({subject}):\n{body}\nReply:\n{reply}\n",
                    subject = example.subject,
                    body = truncate(&example.original_body, MAX_EXAMPLE_CHARS),
                    reply = truncate(&example.reply, MAX_EXAMPLE_CHARS),
                ));
            }
        }

        if !history.patterns.is_empty() {
            prompt.push_str("\nHow the owner usually answers:\n");
            for pattern in &history.patterns {
                prompt.push_str(&format!(
                    "- {}: {}\n",
                    pattern.email_pattern,
                    truncate(&pattern.reply_template, MAX_EXAMPLE_CHARS)
                ));
            }
        }

        prompt.push_str("\nWrite only the reply text.");
        prompt
    }
}

fn message_prompt(input: MessageContent<'_>) -> String {
    format!(
        "From: {}\nSubject: {}\n\n{}",
        input.from.display(),
        input.subject,
        truncate(input.body, MAX_BODY_CHARS)
    )
}

/// Greeting, template and signature, the reply used whenever an adapted
/// draft cannot be trusted.
pub(crate) fn template_reply(settings: &DraftSettings, faq: &FaqTemplate) -> String {
    format!(
        "{}\n\n{}\n\n{}",
        settings.greeting,
        faq.response_template.trim(),
        settings.signature
    )
}

/// Appends the signature unless the draft already carries it.
pub(crate) fn with_signature(draft: &str, signature: &str) -> String {
    let draft = draft.trim_end();
    if signature.is_empty() || draft.contains(signature) {
        draft.to_string()
    } else {
        format!("{draft}\n\n{signature}")
    }
}

/// Tokens that carry facts: anything with a digit or an `@`, and links.
///
/// Dash variants are folded to `-` and case is ignored, so `8–16` and `8-16`
/// are the same fact.
pub(crate) fn fact_tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| {
                    matches!(
                        c,
                        '.' | ',' | ';' | ':' | '!' | '?' | '(' | ')' | '[' | ']' | '"' | '\''
                            | '„' | '“' | '”' | '<' | '>'
                    )
                })
                .replace(['\u{2013}', '\u{2014}'], "-")
                .to_lowercase()
        })
        .filter(|token| {
            token.chars().any(|c| c.is_ascii_digit() || c == '@')
                || token.starts_with("http")
                || token.starts_with("www")
        })
        .collect()
}

/// How a draft's facts differ from its template's.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FactDrift {
    /// Template facts the draft dropped or changed, sorted.
    pub missing: Vec<String>,
    /// Draft facts the template does not have, sorted.
    pub added: Vec<String>,
}

impl FactDrift {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.added.is_empty()
    }
}

/// Compares the fact tokens of `draft` and `template`. Only an empty drift
/// may be sent in place of the template.
pub(crate) fn fact_drift(draft: &str, template: &str) -> FactDrift {
    let drafted = fact_tokens(draft);
    let approved = fact_tokens(template);

    FactDrift {
        missing: sorted_difference(&approved, &drafted),
        added: sorted_difference(&drafted, &approved),
    }
}

fn sorted_difference(a: &HashSet<String>, b: &HashSet<String>) -> Vec<String> {
    let mut facts: Vec<String> = a.difference(b).cloned().collect();
    facts.sort();
    facts
}
