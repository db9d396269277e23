//! External service integrations.
//!
//! - [`email`] - Mail sources (Gmail API, IMAP/SMTP)
//! - [`ai`] - Inference backends (OpenAI-compatible, Anthropic, Ollama)

pub mod ai;
pub mod email;
