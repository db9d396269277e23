//! FAQ template management.

use thiserror::Error;

use crate::domain::{FaqId, FaqTemplate, UserId};
use crate::storage::{queries, Database, DatabaseError};

/// Errors from FAQ operations.
#[derive(Debug, Error)]
pub enum FaqError {
    /// Missing, or owned by another user.
    #[error("faq not found: {0}")]
    NotFound(FaqId),

    #[error("invalid faq: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type for FAQ operations.
pub type FaqResult<T> = Result<T, FaqError>;

/// CRUD over a user's FAQ templates.
#[derive(Clone)]
pub struct FaqService {
    db: Database,
}

impl FaqService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Most used first.
    pub async fn list(&self, user_id: &UserId) -> FaqResult<Vec<FaqTemplate>> {
        Ok(queries::faqs::list(&self.db, user_id).await?)
    }

    /// Returns one of the user's FAQs, or [`FaqError::NotFound`].
    pub async fn get(&self, user_id: &UserId, id: &FaqId) -> FaqResult<FaqTemplate> {
        queries::faqs::get(&self.db, user_id, id)
            .await?
            .ok_or_else(|| FaqError::NotFound(id.clone()))
    }

    /// Creates a template with auto-send off.
    pub async fn create(
        &self,
        user_id: &UserId,
        question_pattern: &str,
        response_template: &str,
    ) -> FaqResult<FaqTemplate> {
        let (question, answer) = validate(question_pattern, response_template)?;
        let faq = FaqTemplate::new(user_id.clone(), question, answer);
        queries::faqs::insert(&self.db, &faq).await?;
        tracing::info!(user_id = %user_id, faq_id = %faq.id, "FAQ created");
        Ok(faq)
    }

    pub async fn update(
        &self,
        user_id: &UserId,
        id: &FaqId,
        question_pattern: &str,
        response_template: &str,
    ) -> FaqResult<FaqTemplate> {
        let (question, answer) = validate(question_pattern, response_template)?;
        if !queries::faqs::update_content(&self.db, user_id, id, question, answer).await? {
            return Err(FaqError::NotFound(id.clone()));
        }
        self.get(user_id, id).await
    }

    /// Turns automatic answering on or off for one FAQ.
    pub async fn set_auto_send(
        &self,
        user_id: &UserId,
        id: &FaqId,
        auto_send: bool,
    ) -> FaqResult<FaqTemplate> {
        if !queries::faqs::set_auto_send(&self.db, user_id, id, auto_send).await? {
            return Err(FaqError::NotFound(id.clone()));
        }
        self.get(user_id, id).await
    }

    /// Deletes a template. Messages that matched it keep their category but
    /// lose the reference.
    pub async fn delete(&self, user_id: &UserId, id: &FaqId) -> FaqResult<()> {
        if !queries::faqs::delete(&self.db, user_id, id).await? {
            return Err(FaqError::NotFound(id.clone()));
        }
        Ok(())
    }
}

fn validate<'a>(question: &'a str, answer: &'a str) -> FaqResult<(&'a str, &'a str)> {
    let (question, answer) = (question.trim(), answer.trim());
    if question.is_empty() {
        return Err(FaqError::InvalidInput("question is empty".to_string()));
    }
    if answer.is_empty() {
        return Err(FaqError::InvalidInput("answer is empty".to_string()));
    }
    Ok((question, answer))
}
