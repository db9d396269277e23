//! Mail source implementations.
//!
//! This module contains the [`MailSource`] trait and its backends:
//!
//! - [`GmailSource`] - Gmail API with an OAuth refresh token per user
//! - [`ImapSource`] - Standard IMAP/SMTP with username and password
//!
//! Sources are shared across users. The credential travels with each call,
//! so one source instance serves every connected mailbox.

mod gmail;
mod imap;
mod traits;

pub use gmail::GmailSource;
pub use imap::{ImapCredentials, ImapSource};
pub use traits::{
    reply_subject, FetchedMessage, MailSource, OutgoingReply, ProviderError, Result,
};

#[cfg(test)]
pub use traits::MockMailSource;
