use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::MaxConfig;

/// Identifier of a message created on the MAX side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum MaxApiError {
    /// The destination cannot represent this content at all. Never retried.
    #[error("unsupported content: {0}")]
    Unsupported(String),
    #[error("MAX API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("MAX API request failed: {0}")]
    Network(String),
    #[error("MAX API request timed out")]
    Timeout,
    /// Surfaced by the circuit breaker, not by the wire. Retryable.
    #[error("destination circuit is open")]
    CircuitOpen,
}

impl MaxApiError {
    /// Errors worth another attempt: the network, the clock, or the far end
    /// being temporarily unhappy. 429 and 5xx qualify, other statuses do not.
    pub fn is_transient(&self) -> bool {
        match self {
            MaxApiError::Network(_) | MaxApiError::Timeout | MaxApiError::CircuitOpen => true,
            MaxApiError::Status { status, .. } => *status == 429 || *status >= 500,
            MaxApiError::Unsupported(_) => false,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, MaxApiError::Unsupported(_))
    }
}

/// Destination-platform client. One method per send shape so callers never
/// pattern-match on stringly-typed payload dicts.
#[async_trait]
pub trait MaxClient: Send + Sync {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<SentMessage, MaxApiError>;

    async fn send_photo(
        &self,
        channel_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError>;

    async fn send_video(
        &self,
        channel_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError>;

    async fn send_document(
        &self,
        channel_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError>;

    async fn send_album(
        &self,
        channel_id: &str,
        urls: &[String],
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError>;
}

/// HTTP implementation over the MAX Bot API. Messages are created with
/// `POST /messages?chat_id=…`; attachments ride in the request body.
pub struct MaxHttpClient {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    message_id: serde_json::Value,
}

impl MaxHttpClient {
    pub fn new(config: &MaxConfig) -> Result<Self, MaxApiError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| MaxApiError::Network(format!("invalid MAX base url: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| MaxApiError::Network(e.to_string()))?;
        info!("initialized MAX client base_url={}", base_url);
        Ok(Self {
            http,
            base_url,
            token: config.bot_token.clone(),
        })
    }

    async fn post_message(
        &self,
        channel_id: &str,
        body: serde_json::Value,
    ) -> Result<SentMessage, MaxApiError> {
        let mut url = self
            .base_url
            .join("messages")
            .map_err(|e| MaxApiError::Network(e.to_string()))?;
        url.query_pairs_mut().append_pair("chat_id", channel_id);

        debug!("MAX send chat_id={}", channel_id);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // The API reports formats it cannot render with a dedicated
            // error code; everything else stays a plain status error.
            if status == StatusCode::BAD_REQUEST && body.contains("attachment.not.supported") {
                warn!("MAX rejected attachment as unsupported chat_id={}", channel_id);
                return Err(MaxApiError::Unsupported(body));
            }
            return Err(MaxApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: MessageResponse = response.json().await.map_err(map_reqwest_error)?;
        let message_id = match parsed.message_id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        debug!("MAX sent chat_id={} message_id={}", channel_id, message_id);
        Ok(SentMessage { message_id })
    }

    fn attachment_body(
        kind: &str,
        urls: &[String],
        caption: Option<&str>,
    ) -> serde_json::Value {
        let attachments: Vec<_> = urls
            .iter()
            .map(|url| json!({ "type": kind, "payload": { "url": url } }))
            .collect();
        json!({
            "text": caption.unwrap_or(""),
            "attachments": attachments,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> MaxApiError {
    if err.is_timeout() {
        MaxApiError::Timeout
    } else {
        MaxApiError::Network(err.to_string())
    }
}

#[async_trait]
impl MaxClient for MaxHttpClient {
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<SentMessage, MaxApiError> {
        self.post_message(channel_id, json!({ "text": text })).await
    }

    async fn send_photo(
        &self,
        channel_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        let urls = [url.to_string()];
        self.post_message(channel_id, Self::attachment_body("image", &urls, caption))
            .await
    }

    async fn send_video(
        &self,
        channel_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        let urls = [url.to_string()];
        self.post_message(channel_id, Self::attachment_body("video", &urls, caption))
            .await
    }

    async fn send_document(
        &self,
        channel_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        let urls = [url.to_string()];
        self.post_message(channel_id, Self::attachment_body("file", &urls, caption))
            .await
    }

    async fn send_album(
        &self,
        channel_id: &str,
        urls: &[String],
        caption: Option<&str>,
    ) -> Result<SentMessage, MaxApiError> {
        if urls.is_empty() {
            return Err(MaxApiError::Unsupported("album with no attachments".into()));
        }
        let body = Self::attachment_body("image", urls, caption);
        self.post_message(channel_id, body).await
    }
}
