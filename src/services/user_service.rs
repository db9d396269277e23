//! User service: profiles, mailbox connection, policy, consents and reply
//! patterns.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{
    Consent, ConsentType, MailCredential, ProcessingPolicy, ReplyPattern, ReplyPatternId,
    ReplyPatternUpdate, User, UserId,
};
use crate::providers::email::{MailSource, ProviderError};
use crate::storage::{queries, Database, DatabaseError};

/// Errors from user operations.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found: {0}")]
    NotFound(UserId),

    #[error("reply pattern not found: {0}")]
    PatternNotFound(ReplyPatternId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The mail source refused the credential or could not be reached.
    #[error("mail source error: {0}")]
    Provider(#[from] ProviderError),

    #[error("mail source timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type for user operations.
pub type UserResult<T> = Result<T, UserError>;

/// Account-level operations.
#[derive(Clone)]
pub struct UserService {
    db: Database,
    source: Arc<dyn MailSource>,
    timeout: Duration,
}

impl UserService {
    pub fn new(db: Database, source: Arc<dyn MailSource>, timeout: Duration) -> Self {
        Self {
            db,
            source,
            timeout,
        }
    }

    /// Registers a user. AI processing starts enabled but needs consent;
    /// auto-reply starts disabled.
    pub async fn create(&self, email: &str, display_name: Option<&str>) -> UserResult<User> {
        let email = email.trim();
        if !email.contains('@') {
            return Err(UserError::InvalidInput(format!("not an email address: {email:?}")));
        }

        let mut user = User::new(email);
        if let Some(name) = display_name.map(str::trim).filter(|n| !n.is_empty()) {
            user = user.with_display_name(name);
        }
        queries::users::insert(&self.db, &user).await?;
        tracing::info!(user_id = %user.id, "User created");
        Ok(user)
    }

    /// Returns the user, or [`UserError::NotFound`].
    pub async fn get(&self, user_id: &UserId) -> UserResult<User> {
        queries::users::get_by_id(&self.db, user_id)
            .await?
            .ok_or_else(|| UserError::NotFound(user_id.clone()))
    }

    /// Stores a mail credential after checking it against the source.
    ///
    /// The mailbox address comes from the source's profile, so a credential
    /// the source rejects is never stored.
    pub async fn connect_mail(
        &self,
        user_id: &UserId,
        credential: MailCredential,
    ) -> UserResult<User> {
        self.get(user_id).await?;

        let address = tokio::time::timeout(self.timeout, self.source.get_profile(&credential))
            .await
            .map_err(|_| UserError::Timeout(self.timeout))??;

        queries::users::connect_mail(&self.db, user_id, &credential, Some(&address)).await?;
        tracing::info!(user_id = %user_id, "Mailbox connected");
        self.get(user_id).await
    }

    /// Forgets the mail credential. Scheduled syncs for the user stop.
    pub async fn disconnect_mail(&self, user_id: &UserId) -> UserResult<User> {
        if !queries::users::invalidate_credential(&self.db, user_id).await? {
            return Err(UserError::NotFound(user_id.clone()));
        }
        tracing::info!(user_id = %user_id, "Mailbox disconnected");
        self.get(user_id).await
    }

    /// Sets the user's AI processing and auto-reply switches.
    pub async fn set_policy(
        &self,
        user_id: &UserId,
        ai_processing_enabled: bool,
        auto_reply_enabled: bool,
    ) -> UserResult<User> {
        let changed = queries::users::set_policy(
            &self.db,
            user_id,
            ai_processing_enabled,
            auto_reply_enabled,
        )
        .await?;
        if !changed {
            return Err(UserError::NotFound(user_id.clone()));
        }
        self.get(user_id).await
    }

    /// What the pipeline may currently do for the user.
    pub async fn policy(&self, user_id: &UserId) -> UserResult<ProcessingPolicy> {
        let user = self.get(user_id).await?;
        let consent =
            queries::consents::is_granted(&self.db, user_id, ConsentType::AiProcessing).await?;
        Ok(ProcessingPolicy::derive(&user, consent))
    }

    /// Records a consent. Granting it again refreshes the timestamp.
    pub async fn grant_consent(&self, user_id: &UserId, consent: ConsentType) -> UserResult<()> {
        self.get(user_id).await?;
        queries::consents::grant(&self.db, user_id, consent).await?;
        tracing::info!(user_id = %user_id, consent = %consent, "Consent granted");
        Ok(())
    }

    pub async fn revoke_consent(&self, user_id: &UserId, consent: ConsentType) -> UserResult<()> {
        self.get(user_id).await?;
        queries::consents::revoke(&self.db, user_id, consent).await?;
        tracing::info!(user_id = %user_id, consent = %consent, "Consent revoked");
        Ok(())
    }

    pub async fn list_consents(&self, user_id: &UserId) -> UserResult<Vec<Consent>> {
        Ok(queries::consents::list(&self.db, user_id).await?)
    }

    /// Most confident first, then most used.
    pub async fn list_reply_patterns(&self, user_id: &UserId) -> UserResult<Vec<ReplyPattern>> {
        Ok(queries::reply_patterns::list(&self.db, user_id).await?)
    }

    pub async fn add_reply_pattern(
        &self,
        user_id: &UserId,
        email_pattern: &str,
        reply_template: &str,
        confidence_score: f64,
    ) -> UserResult<ReplyPattern> {
        let (email_pattern, reply_template) = (email_pattern.trim(), reply_template.trim());
        if email_pattern.is_empty() || reply_template.is_empty() {
            return Err(UserError::InvalidInput(
                "pattern and reply must not be empty".to_string(),
            ));
        }
        self.get(user_id).await?;

        let pattern =
            ReplyPattern::new(user_id.clone(), email_pattern, reply_template, confidence_score);
        queries::reply_patterns::insert(&self.db, &pattern).await?;
        Ok(pattern)
    }

    pub async fn update_reply_pattern(
        &self,
        user_id: &UserId,
        id: &ReplyPatternId,
        update: ReplyPatternUpdate,
    ) -> UserResult<()> {
        if update.is_empty() {
            return Err(UserError::InvalidInput("nothing to update".to_string()));
        }
        if !queries::reply_patterns::update(&self.db, user_id, id, &update).await? {
            return Err(UserError::PatternNotFound(id.clone()));
        }
        Ok(())
    }

    /// Deletes one of the user's reply patterns.
    pub async fn delete_reply_pattern(&self, user_id: &UserId, id: &ReplyPatternId) -> UserResult<()> {
        if !queries::reply_patterns::delete(&self.db, user_id, id).await? {
            return Err(UserError::PatternNotFound(id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::email::MockMailSource;
    use pretty_assertions::assert_eq;

    async fn service(source: MockMailSource) -> UserService {
        let db = Database::open_in_memory().await.unwrap();
        UserService::new(db, Arc::new(source), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn create_validates_email() {
        let service = service(MockMailSource::new()).await;

        let user = service.create(" office@example.sk ", Some("Kancelária")).await.unwrap();
        assert_eq!(user.email, "office@example.sk");
        assert_eq!(user.display_name.as_deref(), Some("Kancelária"));
        assert!(!user.auto_reply_enabled);

        assert!(matches!(
            service.create("office", None).await,
            Err(UserError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn connect_resolves_address_from_source() {
        let mut source = MockMailSource::new();
        source
            .expect_get_profile()
            .returning(|_| Ok("shop@gmail.com".to_string()));
        let service = service(source).await;
        let user = service.create("owner@example.sk", None).await.unwrap();

        let user = service
            .connect_mail(&user.id, MailCredential::new("refresh"))
            .await
            .unwrap();

        assert_eq!(user.mail_address.as_deref(), Some("shop@gmail.com"));
        assert_eq!(user.credential, Some(MailCredential::new("refresh")));

        let user = service.disconnect_mail(&user.id).await.unwrap();
        assert_eq!(user.credential, None);
    }

    #[tokio::test]
    async fn rejected_credential_is_not_stored() {
        let mut source = MockMailSource::new();
        source
            .expect_get_profile()
            .returning(|_| Err(ProviderError::Authentication("invalid_grant".into())));
        let service = service(source).await;
        let user = service.create("owner@example.sk", None).await.unwrap();

        let err = service
            .connect_mail(&user.id, MailCredential::new("bad"))
            .await
            .unwrap_err();

        assert!(matches!(err, UserError::Provider(ProviderError::Authentication(_))));
        assert_eq!(service.get(&user.id).await.unwrap().credential, None);
    }

    #[tokio::test]
    async fn policy_requires_consent() {
        let service = service(MockMailSource::new()).await;
        let user = service.create("owner@example.sk", None).await.unwrap();

        assert!(!service.policy(&user.id).await.unwrap().ai_enabled);

        service.grant_consent(&user.id, ConsentType::AiProcessing).await.unwrap();
        service.set_policy(&user.id, true, true).await.unwrap();
        let policy = service.policy(&user.id).await.unwrap();
        assert!(policy.ai_enabled);
        assert!(policy.auto_reply_enabled);

        service.revoke_consent(&user.id, ConsentType::AiProcessing).await.unwrap();
        assert!(!service.policy(&user.id).await.unwrap().ai_enabled);
        let consents = service.list_consents(&user.id).await.unwrap();
        assert_eq!(consents.len(), 1);
        assert!(!consents[0].granted);
    }

    #[tokio::test]
    async fn reply_patterns_round_trip() {
        let service = service(MockMailSource::new()).await;
        let user = service.create("owner@example.sk", None).await.unwrap();
        let low = service
            .add_reply_pattern(&user.id, "poďakovanie", "Ďakujeme!", 0.5)
            .await
            .unwrap();
        let high = service
            .add_reply_pattern(&user.id, "cenník", "Cenník posielame v prílohe.", 0.9)
            .await
            .unwrap();

        let listed = service.list_reply_patterns(&user.id).await.unwrap();
        assert_eq!(listed[0].id, high.id);

        service
            .update_reply_pattern(
                &user.id,
                &low.id,
                ReplyPatternUpdate {
                    auto_send: Some(true),
                    reply_template: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            service
                .update_reply_pattern(&user.id, &low.id, ReplyPatternUpdate::default())
                .await,
            Err(UserError::InvalidInput(_))
        ));

        service.delete_reply_pattern(&user.id, &high.id).await.unwrap();
        let listed = service.list_reply_patterns(&user.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].auto_send);
        assert!(matches!(
            service.delete_reply_pattern(&user.id, &high.id).await,
            Err(UserError::PatternNotFound(_))
        ));
    }
}
