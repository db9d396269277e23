//! inbox-triage - AI-assisted email triage for small businesses
//!
//! This crate fetches new mail, classifies each message, matches it against
//! the owner's FAQ templates, drafts replies and sends approved FAQ answers
//! automatically. Replies the owner edits flow back into the templates.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;
