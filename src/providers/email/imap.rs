//! IMAP/SMTP mail source.
//!
//! Fetches the inbox over IMAP and sends replies over SMTP, for mailboxes
//! that are not behind the Gmail API.
//!
//! # Authentication
//!
//! The per-user [`MailCredential`] holds [`ImapCredentials`] as JSON. Each
//! call opens its own session; nothing is kept between syncs.
//!
//! # Protocol Details
//!
//! - Uses IMAP4rev1 (RFC 3501) via `async-imap` over rustls
//! - Uses SMTP with STARTTLS or direct TLS via `lettre`

use std::sync::Arc;

use async_imap::types::Fetch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::gmail::strip_html;
use super::traits::{truncate_chars, MAX_BODY_HTML_CHARS, MAX_BODY_TEXT_CHARS};
use super::{FetchedMessage, MailSource, OutgoingReply, ProviderError, Result};
use crate::config::ImapSettings;
use crate::domain::{Address, ExternalMessageId, ExternalThreadId, MailCredential};

const INBOX: &str = "INBOX";

/// Credentials carried in the user's [`MailCredential`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImapCredentials {
    /// Username (usually email address).
    pub username: String,
    /// Password or app-specific password.
    pub password: String,
    /// Display name for outgoing emails.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl ImapCredentials {
    /// Decodes the credential secret.
    pub fn from_credential(credential: &MailCredential) -> Result<Self> {
        serde_json::from_str(credential.secret())
            .map_err(|e| ProviderError::Authentication(format!("invalid credentials: {e}")))
    }

    /// Encodes these credentials as a [`MailCredential`].
    pub fn to_credential(&self) -> Result<MailCredential> {
        serde_json::to_string(self)
            .map(MailCredential::new)
            .map_err(|e| ProviderError::Internal(format!("serialize credentials: {e}")))
    }
}

/// Type alias for the IMAP session with TLS (using tokio-util compat layer).
type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// IMAP/SMTP mail source.
#[derive(Debug, Clone)]
pub struct ImapSource {
    settings: ImapSettings,
}

impl ImapSource {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }

    /// Returns the server configuration.
    pub fn settings(&self) -> &ImapSettings {
        &self.settings
    }

    /// Establishes TLS connection to the IMAP server with futures compat wrapper.
    async fn connect_tls(&self) -> Result<Compat<TlsStream<TcpStream>>> {
        let tcp_stream = TcpStream::connect((self.settings.imap_host.as_str(), self.settings.imap_port))
            .await
            .map_err(|e| ProviderError::Connection(format!("TCP connect failed: {e}")))?;

        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.settings.imap_host.clone())
            .map_err(|e| ProviderError::Connection(format!("invalid server name: {e}")))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| ProviderError::Connection(format!("TLS handshake failed: {e}")))?;

        Ok(tls_stream.compat())
    }

    async fn login(&self, credentials: &ImapCredentials) -> Result<ImapSession> {
        let client = async_imap::Client::new(self.connect_tls().await?);
        client
            .login(&credentials.username, &credentials.password)
            .await
            .map_err(|(e, _)| ProviderError::Authentication(format!("IMAP login failed: {e}")))
    }

    fn smtp_transport(&self, credentials: &ImapCredentials) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let smtp_credentials =
            SmtpCredentials::new(credentials.username.clone(), credentials.password.clone());

        let builder = if self.settings.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.settings.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.settings.smtp_host)
        }
        .map_err(|e| ProviderError::Connection(format!("SMTP relay error: {e}")))?;

        Ok(builder
            .credentials(smtp_credentials)
            .port(self.settings.smtp_port)
            .build())
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn list_recent(
        &self,
        credential: &MailCredential,
        max: u32,
    ) -> Result<Vec<FetchedMessage>> {
        let credentials = ImapCredentials::from_credential(credential)?;
        let mut session = self.login(&credentials).await?;

        session
            .select(INBOX)
            .await
            .map_err(|e| ProviderError::Connection(format!("SELECT failed: {e}")))?;

        let uids = session
            .uid_search("ALL")
            .await
            .map_err(|e| ProviderError::Connection(format!("SEARCH failed: {e}")))?;

        let uid_list = newest_uids(uids, max);
        let mut fetched = Vec::with_capacity(uid_list.len());

        if !uid_list.is_empty() {
            let uid_seq = uid_list
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");

            let mut stream = session
                .uid_fetch(&uid_seq, "(UID FLAGS BODY.PEEK[])")
                .await
                .map_err(|e| ProviderError::Connection(format!("FETCH failed: {e}")))?;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(fetch) => {
                        if let Some(message) = parse_fetch(&fetch) {
                            fetched.push(message);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Skipping unreadable IMAP message"),
                }
            }
        }

        if let Err(e) = session.logout().await {
            tracing::debug!(error = %e, "IMAP logout failed");
        }

        Ok(fetched)
    }

    async fn send(&self, credential: &MailCredential, reply: &OutgoingReply) -> Result<String> {
        let credentials = ImapCredentials::from_credential(credential)?;
        let message = build_message(&credentials, reply)?;

        let response = self
            .smtp_transport(&credentials)?
            .send(message)
            .await
            .map_err(classify_smtp_error)?;

        let message_id = response
            .message()
            .next()
            .map(str::to_string)
            .unwrap_or_else(|| format!("<sent-{}>", Utc::now().timestamp()));

        tracing::info!(message_id = %message_id, "Reply sent via SMTP");
        Ok(message_id)
    }

    async fn get_profile(&self, credential: &MailCredential) -> Result<String> {
        let credentials = ImapCredentials::from_credential(credential)?;
        let mut session = self.login(&credentials).await?;
        if let Err(e) = session.logout().await {
            tracing::debug!(error = %e, "IMAP logout failed");
        }
        Ok(credentials.username)
    }
}

/// The `max` highest UIDs, newest first.
fn newest_uids(uids: impl IntoIterator<Item = u32>, max: u32) -> Vec<u32> {
    let mut list: Vec<u32> = uids.into_iter().collect();
    list.sort_unstable_by(|a, b| b.cmp(a));
    list.truncate(max as usize);
    list
}

/// External id for a message in a folder. UIDs are only unique per folder.
fn external_id(folder: &str, uid: u32) -> ExternalMessageId {
    ExternalMessageId::from(format!("{folder}:{uid}"))
}

fn parse_fetch(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = fetch.uid?;
    parse_raw(fetch.body()?, external_id(INBOX, uid))
}

/// Parses a raw RFC 5322 message into a [`FetchedMessage`].
fn parse_raw(raw: &[u8], external_id: ExternalMessageId) -> Option<FetchedMessage> {
    let message = MessageParser::default().parse(raw)?;

    let from = message
        .from()
        .and_then(|addr| addr.as_list())
        .and_then(|list| list.first())
        .map(|addr| Address {
            email: addr.address().unwrap_or_default().to_string(),
            name: addr.name().map(str::to_string),
        })
        .unwrap_or_else(|| Address::new(""));

    let subject = message
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("(bez predmetu)")
        .to_string();

    let received_at = message
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let body_html = message.body_html(0).map(|s| s.to_string());
    let body_text = message
        .body_text(0)
        .map(|s| s.to_string())
        .or_else(|| body_html.as_deref().map(strip_html))
        .unwrap_or_default();

    // Replies are grouped by the root of the References chain.
    let thread_root = message
        .references()
        .as_text_list()
        .and_then(|refs| refs.first().map(|r| r.to_string()))
        .or_else(|| message.message_id().map(str::to_string));

    Some(FetchedMessage {
        external_id,
        external_thread_id: thread_root.map(ExternalThreadId::from),
        from,
        subject,
        body_text: truncate_chars(&body_text, MAX_BODY_TEXT_CHARS),
        body_html: body_html.map(|h| truncate_chars(&h, MAX_BODY_HTML_CHARS)),
        received_at,
    })
}

fn mailbox(email: &str, name: Option<&str>) -> Result<Mailbox> {
    let text = match name {
        Some(name) => format!("{name} <{email}>"),
        None => email.to_string(),
    };
    text.parse()
        .map_err(|e| ProviderError::InvalidRequest(format!("invalid address {email}: {e}")))
}

/// Builds the SMTP reply. The thread id doubles as the root `Message-ID`.
fn build_message(credentials: &ImapCredentials, reply: &OutgoingReply) -> Result<Message> {
    let mut builder = Message::builder()
        .from(mailbox(
            &credentials.username,
            credentials.display_name.as_deref(),
        )?)
        .to(mailbox(&reply.to.email, reply.to.name.as_deref())?)
        .subject(reply.subject.clone());

    if let Some(thread) = &reply.thread_id {
        let root = angle_id(thread.as_str());
        builder = builder.in_reply_to(root.clone()).references(root);
    }

    builder
        .header(ContentType::TEXT_PLAIN)
        .body(reply.body.clone())
        .map_err(|e| ProviderError::InvalidRequest(format!("failed to build message: {e}")))
}

/// Wraps a bare message id in angle brackets.
fn angle_id(id: &str) -> String {
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

fn classify_smtp_error(err: lettre::transport::smtp::Error) -> ProviderError {
    let text = err.to_string();
    if err.is_permanent() && (text.contains("535") || text.to_ascii_lowercase().contains("auth")) {
        ProviderError::Authentication(format!("SMTP login failed: {text}"))
    } else {
        ProviderError::Connection(format!("SMTP send failed: {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn credentials() -> ImapCredentials {
        ImapCredentials {
            username: "office@example.sk".to_string(),
            password: "app-password".to_string(),
            display_name: Some("Office".to_string()),
        }
    }

    #[test]
    fn credentials_roundtrip_through_secret() {
        let credential = credentials().to_credential().unwrap();
        let decoded = ImapCredentials::from_credential(&credential).unwrap();
        assert_eq!(decoded, credentials());
    }

    #[test]
    fn malformed_credential_is_auth_failure() {
        let err = ImapCredentials::from_credential(&MailCredential::new("not json")).unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[test]
    fn newest_uids_are_capped() {
        assert_eq!(newest_uids(vec![3, 10, 7, 1], 2), vec![10, 7]);
        assert!(newest_uids(Vec::<u32>::new(), 5).is_empty());
    }

    #[test]
    fn external_id_is_folder_scoped() {
        assert_eq!(external_id("INBOX", 42).as_str(), "INBOX:42");
    }

    #[test]
    fn parse_plain_message() {
        let raw = b"From: Jana <jana@example.sk>\r\n\
Subject: Kedy mate otvorene?\r\n\
Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n\
Message-ID: <root@example.sk>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Dobry den, kedy mate otvorene?\r\n";

        let parsed = parse_raw(raw, external_id(INBOX, 5)).unwrap();
        assert_eq!(parsed.external_id.as_str(), "INBOX:5");
        assert_eq!(parsed.from, Address::with_name("jana@example.sk", "Jana"));
        assert_eq!(parsed.subject, "Kedy mate otvorene?");
        assert!(parsed.body_text.starts_with("Dobry den"));
        assert_eq!(
            parsed.external_thread_id.unwrap().as_str(),
            "root@example.sk"
        );
        assert_eq!(parsed.received_at.to_rfc3339(), "2025-07-01T10:00:00+00:00");
    }

    #[test]
    fn parse_message_without_subject() {
        let raw = b"From: jana@example.sk\r\n\r\nhello\r\n";
        let parsed = parse_raw(raw, external_id(INBOX, 1)).unwrap();
        assert_eq!(parsed.subject, "(bez predmetu)");
        assert_eq!(parsed.from.email, "jana@example.sk");
    }

    #[test]
    fn build_reply_sets_threading_headers() {
        let reply = OutgoingReply {
            to: Address::with_name("jana@example.sk", "Jana"),
            subject: "Re: Hours".to_string(),
            body: "Open 8-16.".to_string(),
            thread_id: Some(ExternalThreadId::from("root@example.sk")),
            in_reply_to: Some(ExternalMessageId::from("INBOX:5")),
        };

        let message = build_message(&credentials(), &reply).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();

        assert!(formatted.contains("From: Office <office@example.sk>"));
        assert!(formatted.contains("To: Jana <jana@example.sk>"));
        assert!(formatted.contains("Subject: Re: Hours"));
        assert!(formatted.contains("In-Reply-To: <root@example.sk>"));
        assert!(formatted.contains("References: <root@example.sk>"));
    }

    #[test]
    fn build_reply_rejects_bad_recipient() {
        let reply = OutgoingReply {
            to: Address::new("not an address"),
            subject: "Re: x".to_string(),
            body: "y".to_string(),
            thread_id: None,
            in_reply_to: None,
        };
        assert!(matches!(
            build_message(&credentials(), &reply),
            Err(ProviderError::InvalidRequest(_))
        ));
    }
}
