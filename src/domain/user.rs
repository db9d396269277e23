//! Users, their mail credential, consents and processing policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::UserId;

/// A user whose inbox is triaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub display_name: Option<String>,
    /// User-level switch for model processing. Also needs consent.
    pub ai_processing_enabled: bool,
    /// Whether FAQ matches flagged for auto-send may be answered automatically.
    pub auto_reply_enabled: bool,
    /// Active mail credential, if connected.
    pub credential: Option<MailCredential>,
    /// Address resolved from the mail source when connecting.
    pub mail_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Creates a user with AI processing on and auto-reply off.
    pub fn new(email: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: UserId(super::new_id()),
            email: email.into(),
            display_name: None,
            ai_processing_enabled: true,
            auto_reply_enabled: false,
            credential: None,
            mail_address: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Opaque secret a mail source uses to act on the user's behalf.
///
/// For Gmail this is an OAuth refresh token; for IMAP it is a JSON document
/// with username and password. The store never interprets it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailCredential(pub String);

impl MailCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MailCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MailCredential(<redacted>)")
    }
}

/// Kinds of consent a user can give.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    /// Message content may be sent to the inference backend.
    AiProcessing,
    EmailAccess,
    TermsAccepted,
    PrivacyPolicyAccepted,
}

impl ConsentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentType::AiProcessing => "ai_processing",
            ConsentType::EmailAccess => "email_access",
            ConsentType::TermsAccepted => "terms_accepted",
            ConsentType::PrivacyPolicyAccepted => "privacy_policy_accepted",
        }
    }
}

impl fmt::Display for ConsentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_processing" => Ok(ConsentType::AiProcessing),
            "email_access" => Ok(ConsentType::EmailAccess),
            "terms_accepted" => Ok(ConsentType::TermsAccepted),
            "privacy_policy_accepted" => Ok(ConsentType::PrivacyPolicyAccepted),
            other => Err(format!("unknown consent type: {other}")),
        }
    }
}

/// Current state of one consent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consent {
    pub user_id: UserId,
    pub consent_type: ConsentType,
    pub granted: bool,
    pub granted_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// What the pipeline may do for a user during one sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessingPolicy {
    /// Classification and drafting may call the model.
    pub ai_enabled: bool,
    /// Validated FAQ matches with auto-send may be answered automatically.
    pub auto_reply_enabled: bool,
}

impl ProcessingPolicy {
    /// Derives the policy from the user's flags and AI consent.
    pub fn derive(user: &User, ai_consent_granted: bool) -> Self {
        Self {
            ai_enabled: user.ai_processing_enabled && ai_consent_granted,
            auto_reply_enabled: user.auto_reply_enabled,
        }
    }
}
