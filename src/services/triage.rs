//! Per-message triage: classify, then draft.

use std::collections::HashSet;

use crate::domain::{
    Classification, ConsentType, FaqId, FaqTemplate, MessageContent, ProcessingPolicy, User,
    UserId,
};
use crate::services::classifier::Classifier;
use crate::services::reply_drafter::{DraftHistory, ReplyDrafter};
use crate::storage::{queries, Database, DatabaseError};

/// Everything triage needs to know about a user, loaded once per sync.
#[derive(Debug, Clone, Default)]
pub struct TriageContext {
    pub policy: ProcessingPolicy,
    /// The user's FAQ templates. The classifier may only reference these.
    pub faqs: Vec<FaqTemplate>,
    /// Templates with auto-send enabled.
    pub auto_send: HashSet<FaqId>,
    pub history: DraftHistory,
}

/// Outcome of triaging one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Triaged {
    pub classification: Classification,
    pub draft: Option<String>,
    /// The validated FAQ match, if any.
    pub faq: Option<FaqTemplate>,
}

impl Triaged {
    /// Whether this reply may go out without the user looking at it.
    pub fn should_auto_send(&self, ctx: &TriageContext) -> bool {
        ctx.policy.auto_reply_enabled
            && self.draft.is_some()
            && self
                .faq
                .as_ref()
                .is_some_and(|faq| ctx.auto_send.contains(&faq.id))
    }
}

/// Classifier and drafter behind one entry point.
#[derive(Clone)]
pub struct Triage {
    engines: Option<(Classifier, ReplyDrafter)>,
}

impl Triage {
    pub fn new(classifier: Classifier, drafter: ReplyDrafter) -> Self {
        Self {
            engines: Some((classifier, drafter)),
        }
    }

    /// Triage without an inference backend: every message gets the default
    /// classification and no draft, whatever the user's policy says.
    pub fn disabled() -> Self {
        Self { engines: None }
    }

    /// Loads the user's policy, FAQs and drafting history.
    ///
    /// AI is off when the user has not consented or triage runs without a
    /// backend. History is only read when AI is on.
    pub async fn context(&self, db: &Database, user: &User) -> Result<TriageContext, DatabaseError> {
        let consent = queries::consents::is_granted(db, &user.id, ConsentType::AiProcessing).await?;
        let mut policy = ProcessingPolicy::derive(user, consent);
        policy.ai_enabled &= self.engines.is_some();
        let faqs = queries::faqs::list(db, &user.id).await?;
        let auto_send = faqs
            .iter()
            .filter(|faq| faq.auto_send)
            .map(|faq| faq.id.clone())
            .collect();
        let history = match &self.engines {
            Some((_, drafter)) if policy.ai_enabled => drafter.load_history(&user.id).await,
            _ => DraftHistory::default(),
        };

        Ok(TriageContext {
            policy,
            faqs,
            auto_send,
            history,
        })
    }

    /// Classifies and drafts one message.
    ///
    /// With AI disabled the message gets the default classification and no
    /// draft, and no model is called.
    pub async fn run(
        &self,
        user_id: &UserId,
        input: MessageContent<'_>,
        ctx: &TriageContext,
    ) -> Triaged {
        let (classifier, drafter) = match &self.engines {
            Some(engines) if ctx.policy.ai_enabled => engines,
            _ => {
                return Triaged {
                    classification: Classification::default(),
                    draft: None,
                    faq: None,
                }
            }
        };

        let classification = classifier.classify(user_id, input, &ctx.faqs).await;
        let faq = classification
            .matched_faq_id
            .as_ref()
            .and_then(|id| ctx.faqs.iter().find(|faq| &faq.id == id))
            .cloned();
        let draft = drafter
            .draft(user_id, input, &classification, faq.as_ref(), &ctx.history)
            .await;

        Triaged {
            classification,
            draft,
            faq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, Category};
    use crate::services::test_support::{
        classification_json, connected_user, opening_hours_faq, triage, ScriptedLlm,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const BODY: &str = "Kedy máte otvorené?";

    #[tokio::test]
    async fn context_collects_auto_send_ids() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let auto = opening_hours_faq(&db, &user, true).await;
        let manual = opening_hours_faq(&db, &user, false).await;

        let ctx = triage(&db, Arc::new(ScriptedLlm::new()))
            .context(&db, &user)
            .await
            .unwrap();

        assert!(ctx.policy.ai_enabled);
        assert_eq!(ctx.faqs.len(), 2);
        assert!(ctx.auto_send.contains(&auto.id));
        assert!(!ctx.auto_send.contains(&manual.id));
    }

    #[tokio::test]
    async fn revoked_consent_skips_the_model() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        queries::consents::revoke(&db, &user.id, ConsentType::AiProcessing)
            .await
            .unwrap();
        let llm = Arc::new(ScriptedLlm::new().reply(classification_json("URGENT", None)));
        let triage = triage(&db, llm.clone());
        let from = Address::new("jana@example.sk");

        let ctx = triage.context(&db, &user).await.unwrap();
        let result = triage
            .run(&user.id, MessageContent { from: &from, subject: "?", body: BODY }, &ctx)
            .await;

        assert!(!ctx.policy.ai_enabled);
        assert_eq!(result.classification, Classification::default());
        assert_eq!(result.draft, None);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn faq_match_drafts_from_template_and_may_auto_send() {
        let db = Database::open_in_memory().await.unwrap();
        let mut user = connected_user(&db).await;
        queries::users::set_policy(&db, &user.id, true, true).await.unwrap();
        user.auto_reply_enabled = true;
        let faq = opening_hours_faq(&db, &user, true).await;
        let llm = Arc::new(
            ScriptedLlm::new()
                .reply(classification_json("FAQ", Some(faq.id.as_str())))
                .reply("Dobrý deň,\n\notvorené máme Po–Pia 8–16.\n\nS pozdravom"),
        );
        let triage = triage(&db, llm);
        let from = Address::new("jana@example.sk");

        let ctx = triage.context(&db, &user).await.unwrap();
        let result = triage
            .run(&user.id, MessageContent { from: &from, subject: "?", body: BODY }, &ctx)
            .await;

        assert_eq!(result.classification.category, Category::Faq);
        assert_eq!(result.faq.as_ref().map(|f| &f.id), Some(&faq.id));
        assert!(result.draft.as_deref().unwrap().contains("8–16"));
        assert!(result.should_auto_send(&ctx));
    }

    #[tokio::test]
    async fn disabled_triage_overrides_policy() {
        let db = Database::open_in_memory().await.unwrap();
        let user = connected_user(&db).await;
        let triage = Triage::disabled();
        let from = Address::new("jana@example.sk");

        let ctx = triage.context(&db, &user).await.unwrap();
        let result = triage
            .run(&user.id, MessageContent { from: &from, subject: "?", body: BODY }, &ctx)
            .await;

        assert!(!ctx.policy.ai_enabled);
        assert_eq!(result.classification.category, Category::Normal);
        assert_eq!(result.draft, None);
    }

    #[test]
    fn auto_send_needs_every_gate() {
        let faq = FaqTemplate::new(UserId::from("u"), "q", "a");
        let triaged = Triaged {
            classification: Classification::default(),
            draft: Some("Dobrý deň".to_string()),
            faq: Some(faq.clone()),
        };
        let mut ctx = TriageContext {
            policy: ProcessingPolicy {
                ai_enabled: true,
                auto_reply_enabled: true,
            },
            auto_send: [faq.id.clone()].into_iter().collect(),
            ..TriageContext::default()
        };
        assert!(triaged.should_auto_send(&ctx));

        ctx.policy.auto_reply_enabled = false;
        assert!(!triaged.should_auto_send(&ctx));
        ctx.policy.auto_reply_enabled = true;

        ctx.auto_send.clear();
        assert!(!triaged.should_auto_send(&ctx));
        ctx.auto_send.insert(faq.id.clone());

        let no_draft = Triaged {
            draft: None,
            ..triaged.clone()
        };
        assert!(!no_draft.should_auto_send(&ctx));

        let no_faq = Triaged {
            faq: None,
            ..triaged
        };
        assert!(!no_faq.should_auto_send(&ctx));
    }
}
