//! Domain types for the triage pipeline.
//!
//! Users, messages and their classification, FAQ templates, reply patterns,
//! consents, and the reply lifecycle state machine.

mod faq;
mod message;
mod message_log;
mod reply_status;
mod stats;
mod types;
mod user;

pub use faq::{FaqTemplate, ReplyPattern, ReplyPatternUpdate};
pub use message::{
    Address, Category, Classification, Message, MessageContent, NewMessage, SentReply,
    UnknownCategory,
};
pub use message_log::{LogEntry, LogKind};
pub use reply_status::{ReplyStatus, TransitionError};
pub use stats::{FollowUp, InboxStats};
pub use types::{
    new_id, ExternalMessageId, ExternalThreadId, FaqId, MessageId, ReplyPatternId, UserId,
};
pub use user::{Consent, ConsentType, MailCredential, ProcessingPolicy, User};
