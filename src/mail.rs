//! Plain-text mail over the Gmail REST API.
//!
//! The OAuth credential is never obtained here: it must already sit in the
//! cache file, written by an earlier consent flow. An expired credential is
//! refreshed through its token endpoint and written back.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Error)]
pub enum MailError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("mail API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("credential cache i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("credential cache is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no cached credential at {}; authorize this client first", .0.display())]
    CredentialMissing(PathBuf),

    #[error("credential expired and has no refresh token; authorize this client again")]
    CredentialExpired,

    #[error("header `{name}` must not contain line breaks")]
    InvalidHeader { name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub sender: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl MailMessage {
    pub fn new(
        sender: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Render the message as RFC 5322 text with a UTF-8 plain-text body.
    pub fn to_rfc822(&self) -> Result<String, MailError> {
        for (name, value) in [("To", &self.to), ("From", &self.sender), ("Subject", &self.subject)] {
            if value.contains(['\r', '\n']) {
                return Err(MailError::InvalidHeader { name });
            }
        }
        Ok(format!(
            "Content-Type: text/plain; charset=\"utf-8\"\r\n\
             MIME-Version: 1.0\r\n\
             Content-Transfer-Encoding: 8bit\r\n\
             To: {}\r\n\
             From: {}\r\n\
             Subject: {}\r\n\
             \r\n\
             {}",
            self.to,
            self.sender,
            encode_word(&self.subject),
            self.body
        ))
    }

    /// URL-safe base64 of the rendered message, as the API's `raw` field.
    pub fn raw(&self) -> Result<String, MailError> {
        Ok(URL_SAFE.encode(self.to_rfc822()?))
    }
}

/// RFC 2047 encoded-word for non-ASCII header text.
fn encode_word(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?utf-8?b?{}?=", STANDARD.encode(value))
    }
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// Cached OAuth credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// `None` means the token does not expire.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl Credential {
    /// Usable at `now`, with a minute of slack for the request in flight.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at - Duration::seconds(60) > now,
        }
    }
}

/// Credential cache file, kept across runs.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    path: PathBuf,
}

impl CredentialCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the cache file does not exist yet.
    pub fn load(&self) -> Result<Option<Credential>, MailError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, credential: &Credential) -> Result<(), MailError> {
        let text = serde_json::to_string_pretty(credential)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Exchange the refresh token for a new access token.
pub async fn refresh(
    http: &reqwest::Client,
    credential: &Credential,
    now: DateTime<Utc>,
) -> Result<Credential, MailError> {
    let refresh_token = credential
        .refresh_token
        .as_deref()
        .ok_or(MailError::CredentialExpired)?;
    let response = http
        .post(&credential.token_uri)
        .form(&[
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await?;
    let token: TokenResponse = ensure_success(response).await?.json().await?;
    Ok(Credential {
        access_token: token.access_token,
        refresh_token: token
            .refresh_token
            .or_else(|| credential.refresh_token.clone()),
        expires_at: token.expires_in.map(|secs| now + Duration::seconds(secs)),
        ..credential.clone()
    })
}

/// Load the cached credential, refreshing and re-caching it when expired.
pub async fn load_credential(
    cache: &CredentialCache,
    http: &reqwest::Client,
) -> Result<Credential, MailError> {
    let credential = cache
        .load()?
        .ok_or_else(|| MailError::CredentialMissing(cache.path().to_path_buf()))?;
    let now = Utc::now();
    if credential.is_valid_at(now) {
        return Ok(credential);
    }
    tracing::info!(path = %cache.path().display(), "cached credential expired; refreshing");
    let refreshed = refresh(http, &credential, now).await?;
    cache.save(&refreshed)?;
    Ok(refreshed)
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, MailError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(MailError::Api {
        status: status.as_u16(),
        body,
    })
}

/// Delivery confirmation returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
    #[serde(rename = "threadId", default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Something that can deliver an already encoded message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_raw(&self, sender: &str, raw: &str) -> Result<SentMessage, MailError>;
}

pub struct GmailTransport {
    http: reqwest::Client,
    access_token: String,
    api_base: String,
}

impl GmailTransport {
    pub fn new(http: reqwest::Client, credential: &Credential) -> Self {
        Self {
            http,
            access_token: credential.access_token.clone(),
            api_base: GMAIL_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl MailTransport for GmailTransport {
    async fn send_raw(&self, sender: &str, raw: &str) -> Result<SentMessage, MailError> {
        let url = format!("{}/users/{}/messages/send", self.api_base, sender);
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

/// Encode and deliver `message` through `transport`.
pub async fn send<T: MailTransport + ?Sized>(
    transport: &T,
    message: &MailMessage,
) -> Result<SentMessage, MailError> {
    let raw = message.raw()?;
    match transport.send_raw(&message.sender, &raw).await {
        Ok(sent) => {
            tracing::info!(message_id = %sent.id, to = %message.to, "message sent");
            Ok(sent)
        }
        Err(e) => {
            tracing::error!(error = %e, to = %message.to, "message delivery failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one HTTP request with `status` and `body`; the handle yields
    /// the request as received.
    async fn serve_once(status: u16, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request_complete(&request) {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&request).into_owned()
        });
        (base, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..split]
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= split + 4 + length
    }

    fn http() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    struct RecordingTransport {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send_raw(&self, sender: &str, raw: &str) -> Result<SentMessage, MailError> {
            self.calls
                .lock()
                .unwrap()
                .push((sender.to_string(), raw.to_string()));
            Ok(SentMessage {
                id: "msg-1".to_string(),
                thread_id: Some("thread-1".to_string()),
            })
        }
    }

    fn credential(expires_at: Option<DateTime<Utc>>, refresh_token: Option<&str>) -> Credential {
        Credential {
            access_token: "access".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at,
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            token_uri: GOOGLE_TOKEN_URI.to_string(),
        }
    }

    #[test]
    fn test_raw_message_decodes_to_headers_and_body() {
        let message = MailMessage::new("from@gmail.com", "to@gmail.com", "Test subject", "Test body");
        let raw = message.raw().unwrap();
        assert!(!raw.contains('+') && !raw.contains('/'));

        let decoded = String::from_utf8(URL_SAFE.decode(raw).unwrap()).unwrap();
        assert!(decoded.contains("To: to@gmail.com\r\n"));
        assert!(decoded.contains("From: from@gmail.com\r\n"));
        assert!(decoded.contains("Subject: Test subject\r\n"));
        assert!(decoded.ends_with("\r\n\r\nTest body"));
    }

    #[test]
    fn test_non_ascii_subject_is_encoded() {
        let message = MailMessage::new("a@b.cz", "c@d.cz", "Rezervace schválena", "ok");
        let text = message.to_rfc822().unwrap();
        assert!(text.contains("Subject: =?utf-8?b?"));
        assert!(!text.contains("schválena"));
    }

    #[test]
    fn test_header_injection_rejected() {
        let message = MailMessage::new("a@b.cz", "c@d.cz\r\nBcc: evil@x.cz", "s", "b");
        assert!(matches!(
            message.raw(),
            Err(MailError::InvalidHeader { name: "To" })
        ));
    }

    #[test]
    fn test_credential_validity() {
        let now = Utc::now();
        assert!(credential(None, None).is_valid_at(now));
        assert!(credential(Some(now + Duration::hours(1)), None).is_valid_at(now));
        assert!(!credential(Some(now + Duration::seconds(30)), None).is_valid_at(now));
        assert!(!credential(Some(now - Duration::hours(1)), None).is_valid_at(now));
    }

    #[test]
    fn test_credential_cache_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("token.json"));
        assert_eq!(cache.load().unwrap(), None);

        let stored = credential(Some(Utc::now() + Duration::hours(1)), Some("refresh"));
        cache.save(&stored).unwrap();
        assert_eq!(cache.load().unwrap(), Some(stored));
    }

    #[test]
    fn test_credential_token_uri_defaults() {
        let parsed: Credential = serde_json::from_str(
            r#"{"access_token":"a","client_id":"c","client_secret":"s"}"#,
        )
        .unwrap();
        assert_eq!(parsed.token_uri, GOOGLE_TOKEN_URI);
        assert_eq!(parsed.refresh_token, None);
        assert!(parsed.is_valid_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_load_credential_requires_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("missing.json"));
        let err = load_credential(&cache, &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::CredentialMissing(_)));
    }

    #[tokio::test]
    async fn test_expired_credential_without_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("token.json"));
        cache
            .save(&credential(Some(Utc::now() - Duration::hours(2)), None))
            .unwrap();
        let err = load_credential(&cache, &reqwest::Client::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MailError::CredentialExpired));
    }

    #[tokio::test]
    async fn test_gmail_transport_posts_raw_message() {
        let (base, server) = serve_once(200, r#"{"id":"m-42","threadId":"t-9"}"#).await;
        let transport = GmailTransport::new(http(), &credential(None, None)).with_api_base(&base);
        let message = MailMessage::new("from@gmail.com", "to@gmail.com", "Hi", "Body");

        let sent = send(&transport, &message).await.unwrap();
        assert_eq!(
            sent,
            SentMessage {
                id: "m-42".to_string(),
                thread_id: Some("t-9".to_string()),
            }
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /users/from@gmail.com/messages/send "), "{request}");
        assert!(request.to_lowercase().contains("authorization: bearer access"));
        let expected = format!(r#""raw":"{}""#, message.raw().unwrap());
        assert!(request.contains(&expected), "{request}");
    }

    #[tokio::test]
    async fn test_gmail_transport_maps_error_status() {
        let (base, server) = serve_once(400, r#"{"error":"invalid raw message"}"#).await;
        let transport = GmailTransport::new(http(), &credential(None, None)).with_api_base(&base);
        let message = MailMessage::new("from@gmail.com", "to@gmail.com", "Hi", "Body");

        let err = send(&transport, &message).await.unwrap_err();
        match err {
            MailError::Api { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid"), "{body}");
            }
            other => panic!("expected an API error, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_credential_is_refreshed_and_cached() {
        let (base, server) = serve_once(200, r#"{"access_token":"fresh","expires_in":3600}"#).await;
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::new(dir.path().join("token.json"));
        let expired = Credential {
            token_uri: format!("{base}/token"),
            ..credential(Some(Utc::now() - Duration::hours(2)), Some("refresh"))
        };
        cache.save(&expired).unwrap();

        let refreshed = load_credential(&cache, &http()).await.unwrap();
        assert_eq!(refreshed.access_token, "fresh");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("refresh"));
        assert!(refreshed.is_valid_at(Utc::now()));
        assert_eq!(cache.load().unwrap(), Some(refreshed));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /token "), "{request}");
        assert!(request.contains("grant_type=refresh_token"));
        assert!(request.contains("refresh_token=refresh"));
    }

    #[tokio::test]
    async fn test_send_passes_sender_and_raw_to_transport() {
        let transport = RecordingTransport {
            calls: Mutex::new(Vec::new()),
        };
        let message = MailMessage::new("from@gmail.com", "to@gmail.com", "Hi", "Body");
        let sent = send(&transport, &message).await.unwrap();
        assert_eq!(sent.id, "msg-1");

        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "from@gmail.com");
        assert_eq!(calls[0].1, message.raw().unwrap());
    }
}
