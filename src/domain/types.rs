//! Identifier newtypes for triage entities.
//!
//! Internal ids are generated by this crate; external ids are whatever the
//! mail source hands back and are only ever compared, never parsed.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Returns the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Owner of messages, FAQs, patterns and consents.
    UserId
);

string_id!(
    /// Internal identifier of a stored message.
    MessageId
);

string_id!(
    /// Identifier assigned by the mail source (Gmail id, `INBOX:<uid>` for IMAP).
    ExternalMessageId
);

string_id!(
    /// Conversation identifier assigned by the mail source.
    ExternalThreadId
);

string_id!(
    /// Identifier of an FAQ template.
    FaqId
);

string_id!(
    /// Identifier of a learned reply pattern.
    ReplyPatternId
);

/// Generates a fresh random identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_display() {
        let id = UserId("user-1".to_string());
        assert_eq!(id.to_string(), "user-1");
    }

    #[test]
    fn external_id_equality() {
        let a = ExternalMessageId::from("18c2f");
        let b = ExternalMessageId::from("18c2f".to_string());
        assert_eq!(a, b);
    }

    #[test]
    fn faq_id_hash() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(FaqId::from("faq-1"));
        assert!(set.contains(&FaqId::from("faq-1")));
        assert!(!set.contains(&FaqId::from("faq-2")));
    }

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }
}
