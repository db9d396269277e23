//! Gmail API mail source.
//!
//! Lists inbox messages and sends replies through the Gmail REST API. The
//! per-user credential is an OAuth refresh token; every call exchanges it for
//! a short-lived access token first.
//!
//! # API Usage
//!
//! - `users.messages.list` / `users.messages.get` for the inbox
//! - `users.messages.send` for replies
//! - `users.getProfile` for the mailbox address

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::traits::{truncate_chars, MAX_BODY_HTML_CHARS, MAX_BODY_TEXT_CHARS};
use super::{FetchedMessage, MailSource, OutgoingReply, ProviderError, Result};
use crate::domain::{Address, ExternalMessageId, ExternalThreadId, MailCredential};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Subject used when the message has none.
const NO_SUBJECT: &str = "(bez predmetu)";

/// Gmail API message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
}

/// Message reference from a list call.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    payload: Option<GmailPart>,
    internal_date: Option<String>,
}

/// Gmail message part. The top-level payload has the same shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPart>>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

/// Gmail message body.
#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

/// `users.getProfile` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: Option<String>,
}

/// OAuth token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    raw: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

impl GmailPart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()?
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn decoded_data(&self) -> Option<String> {
        let data = self.body.as_ref()?.data.as_ref()?;
        let bytes = BASE64_URL_SAFE_NO_PAD
            .decode(data.trim_end_matches('='))
            .ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is(&self, mime: &str) -> bool {
        self.mime_type
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(mime))
    }
}

/// Gmail API mail source.
///
/// Holds the OAuth client registration; the user's refresh token arrives with
/// each call as their [`MailCredential`].
#[derive(Debug, Clone)]
pub struct GmailSource {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
}

impl GmailSource {
    /// Creates a source for the given OAuth client.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Rebuilds the HTTP client with a request timeout.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Result<Self> {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Internal(format!("http client: {e}")))?;
        Ok(self)
    }

    /// Exchanges the refresh token for an access token.
    async fn access_token(&self, credential: &MailCredential) -> Result<String> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", credential.secret()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(GOOGLE_TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_token_error(status, &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("parse token response: {e}")))?;
        Ok(token.access_token)
    }

    fn auth_headers(token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ProviderError::Internal(format!("invalid header: {e}")))?,
        );
        Ok(headers)
    }

    /// Makes an authenticated GET request to the Gmail API.
    async fn get<T: for<'de> Deserialize<'de>>(&self, token: &str, endpoint: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{GMAIL_API_BASE}{endpoint}"))
            .headers(Self::auth_headers(token)?)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        Self::handle_response(response).await
    }

    /// Makes an authenticated JSON POST request to the Gmail API.
    async fn post<T: for<'de> Deserialize<'de>, B: Serialize>(
        &self,
        token: &str,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{GMAIL_API_BASE}{endpoint}"))
            .headers(Self::auth_headers(token)?)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Internal(format!("parse response: {e}")))
    }

    async fn profile_address(&self, token: &str) -> Result<String> {
        let profile: ProfileResponse = self.get(token, "/profile").await?;
        profile
            .email_address
            .ok_or_else(|| ProviderError::Provider("profile has no email address".to_string()))
    }

    /// Looks up the RFC 5322 `Message-ID` of a stored message.
    async fn rfc822_message_id(&self, token: &str, id: &ExternalMessageId) -> Result<Option<String>> {
        let message: GmailMessage = self
            .get(
                token,
                &format!("/messages/{id}?format=metadata&metadataHeaders=Message-ID"),
            )
            .await?;
        Ok(message
            .payload
            .as_ref()
            .and_then(|p| p.header("Message-ID"))
            .map(str::to_string))
    }
}

#[async_trait]
impl MailSource for GmailSource {
    async fn list_recent(
        &self,
        credential: &MailCredential,
        max: u32,
    ) -> Result<Vec<FetchedMessage>> {
        let token = self.access_token(credential).await?;

        let list: MessageListResponse = self
            .get(&token, &format!("/messages?labelIds=INBOX&maxResults={max}"))
            .await?;

        let refs = list.messages.unwrap_or_default();
        let mut fetched = Vec::with_capacity(refs.len());
        for msg_ref in refs {
            let message: GmailMessage = self
                .get(&token, &format!("/messages/{}?format=full", msg_ref.id))
                .await?;
            fetched.push(to_fetched(message));
        }

        tracing::debug!(count = fetched.len(), "Fetched Gmail inbox");
        Ok(fetched)
    }

    async fn send(&self, credential: &MailCredential, reply: &OutgoingReply) -> Result<String> {
        let token = self.access_token(credential).await?;
        let from = self.profile_address(&token).await?;

        // Threading headers are best effort.
        let original_id = match &reply.in_reply_to {
            Some(id) => self
                .rfc822_message_id(&token, id)
                .await
                .unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "Original Message-ID lookup failed");
                    None
                }),
            None => None,
        };

        let raw = build_raw_message(&from, reply, original_id.as_deref());
        let encoded = BASE64_URL_SAFE_NO_PAD.encode(raw.as_bytes());

        let request = SendRequest {
            raw: &encoded,
            thread_id: reply.thread_id.as_ref().map(ExternalThreadId::as_str),
        };

        let response: SendResponse = match self.post(&token, "/messages/send", &request).await {
            Err(ProviderError::NotFound(_)) if request.thread_id.is_some() => {
                tracing::info!("Thread not found, sending reply as a new conversation");
                let fresh = SendRequest {
                    raw: &encoded,
                    thread_id: None,
                };
                self.post(&token, "/messages/send", &fresh).await?
            }
            other => other?,
        };

        let id = response.id.unwrap_or_default();
        tracing::info!(message_id = %id, "Reply sent via Gmail API");
        Ok(id)
    }

    async fn get_profile(&self, credential: &MailCredential) -> Result<String> {
        let token = self.access_token(credential).await?;
        self.profile_address(&token).await
    }
}

/// Maps a Gmail API error response to a [`ProviderError`].
///
/// 401 and insufficient-scope 403 mean the grant no longer covers what we
/// need, so both count as authentication failures.
fn classify_error(status: StatusCode, body: &str) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::Authentication(format!("unauthorized: {body}")),
        403 if is_scope_error(body) => {
            ProviderError::Authentication(format!("insufficient scope: {body}"))
        }
        404 => ProviderError::NotFound(body.to_string()),
        429 => ProviderError::RateLimited {
            retry_after_secs: None,
        },
        _ => ProviderError::Provider(format!("API error ({status}): {body}")),
    }
}

fn is_scope_error(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("insufficient") && (lower.contains("scope") || lower.contains("permission"))
}

/// Maps a failed token refresh to a [`ProviderError`].
fn classify_token_error(status: StatusCode, body: &str) -> ProviderError {
    if body.contains("invalid_grant") || status == StatusCode::UNAUTHORIZED {
        ProviderError::Authentication(format!("token refresh failed ({status}): {body}"))
    } else {
        classify_error(status, body)
    }
}

fn to_fetched(message: GmailMessage) -> FetchedMessage {
    let payload = message.payload.unwrap_or_default();

    let from = payload
        .header("From")
        .map(parse_address)
        .unwrap_or_else(|| Address::new(""));

    let subject = payload
        .header("Subject")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string();

    let received_at = payload
        .header("Date")
        .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| {
            message
                .internal_date
                .as_deref()
                .and_then(|d| d.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis)
        })
        .unwrap_or_else(Utc::now);

    let body_text = extract_body(&payload).unwrap_or_default();
    let body_html = extract_html(&payload);

    FetchedMessage {
        external_thread_id: Some(ExternalThreadId::from(
            message.thread_id.unwrap_or_else(|| message.id.clone()),
        )),
        external_id: ExternalMessageId::from(message.id),
        from,
        subject,
        body_text: truncate_chars(&body_text, MAX_BODY_TEXT_CHARS),
        body_html: body_html.map(|h| truncate_chars(&h, MAX_BODY_HTML_CHARS)),
        received_at,
    }
}

/// Parses an email address from a header value like "Name <email@example.com>".
fn parse_address(value: &str) -> Address {
    let value = value.trim();
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            let email = value[start + 1..end].trim().to_string();
            let name = value[..start].trim().trim_matches('"').trim();
            return Address {
                email,
                name: (!name.is_empty()).then(|| name.to_string()),
            };
        }
    }
    Address::new(value)
}

/// Plain-text body: `text/plain` first, then tag-stripped `text/html`, then
/// nested multiparts.
fn extract_body(part: &GmailPart) -> Option<String> {
    if part.is("text/plain") {
        if let Some(text) = part.decoded_data() {
            return Some(text);
        }
    }
    if part.parts.is_none() && part.is("text/html") {
        return part.decoded_data().map(|html| strip_html(&html));
    }

    let parts = part.parts.as_deref()?;
    parts
        .iter()
        .find(|p| p.is("text/plain"))
        .and_then(GmailPart::decoded_data)
        .or_else(|| {
            parts
                .iter()
                .find(|p| p.is("text/html"))
                .and_then(GmailPart::decoded_data)
                .map(|html| strip_html(&html))
        })
        .or_else(|| {
            parts
                .iter()
                .filter(|p| p.parts.is_some())
                .find_map(extract_body)
        })
}

/// Raw `text/html` body, if any part carries one.
fn extract_html(part: &GmailPart) -> Option<String> {
    if part.is("text/html") {
        if let Some(html) = part.decoded_data() {
            return Some(html);
        }
    }
    let parts = part.parts.as_deref()?;
    parts
        .iter()
        .find(|p| p.is("text/html"))
        .and_then(GmailPart::decoded_data)
        .or_else(|| {
            parts
                .iter()
                .filter(|p| p.parts.is_some())
                .find_map(extract_html)
        })
}

/// Drops tags and collapses whitespace.
pub(crate) fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64_STANDARD.encode(value.as_bytes()))
    }
}

/// Builds the RFC 5322 reply handed to `messages.send`.
fn build_raw_message(from: &str, reply: &OutgoingReply, original_id: Option<&str>) -> String {
    let mut lines = vec![
        format!("From: {from}"),
        format!("To: {}", reply.to.email),
        format!("Subject: {}", encode_header(&reply.subject)),
    ];

    if let Some(id) = original_id {
        lines.push(format!("In-Reply-To: {id}"));
        lines.push(format!("References: {id}"));
    }

    lines.push("MIME-Version: 1.0".to_string());
    lines.push("Content-Type: text/plain; charset=UTF-8".to_string());
    lines.push(String::new());
    lines.push(reply.body.clone());

    lines.join("\r\n")
}
