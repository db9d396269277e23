//! Business services layer.
//!
//! This module contains the services that run the triage pipeline and the
//! operations users perform on its results, coordinating between providers,
//! storage, and domain types.
//!
//! # Architecture
//!
//! ```text
//! SyncScheduler (one task per user)
//!          |
//!          v
//!     SyncService  ---> MailSource (fetch)
//!          |
//!          v
//!       Triage  ---> Classifier, ReplyDrafter ---> LlmProvider
//!          |
//!          v
//!   Storage (messages, FAQs)  <--- MessageService, FaqService, UserService
//!          |
//!          v
//!     ReplySender ---> MailSource (send)
//! ```
//!
//! # Services Overview
//!
//! - [`SyncService`]: Fetches, deduplicates, triages and stores new mail, and
//!   sends approved auto-replies
//! - [`SyncScheduler`]: Runs periodic syncs with backoff until cancelled
//! - [`Triage`]: Classification followed by drafting, under the user's policy
//! - [`MessageService`]: Inbox listing, search, stats and reply actions
//! - [`FaqService`]: FAQ template management
//! - [`UserService`]: Profiles, mailbox connection, consents and reply patterns

mod classifier;
mod faq_service;
mod message_service;
mod reply_drafter;
mod reply_sender;
mod scheduler;
mod sync_service;
mod triage;
mod user_service;

#[cfg(test)]
pub(crate) mod test_support;

pub use classifier::Classifier;
pub use faq_service::{FaqError, FaqResult, FaqService};
pub use message_service::{
    MessageService, ReplyError, ReplyResult, SendReply, DEFAULT_LIST_LIMIT, DEFAULT_SEARCH_LIMIT,
    MAX_SEARCH_LIMIT,
};
pub use reply_drafter::{DraftHistory, ReplyDrafter};
pub use reply_sender::{build_reply, ReplySender, SendError};
pub use scheduler::{
    backoff_delay, SchedulerConfig, SchedulerExit, SchedulerHandle, SyncScheduler,
};
pub use sync_service::{SyncError, SyncEvent, SyncResult, SyncService, SyncStatus};
pub use triage::{Triage, TriageContext, Triaged};
pub use user_service::{UserError, UserResult, UserService};
