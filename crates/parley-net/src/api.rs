//! REST message API.
//!
//! [`RemoteApi`] is the seam the sync layer talks through; [`HttpApi`] is the
//! reqwest implementation. JSON calls use the short request timeout, voice
//! uploads the long one.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use parley_shared::constants::{REQUEST_TIMEOUT_SECS, UPLOAD_TIMEOUT_SECS};
use parley_shared::protocol::{ReactionRequest, RemoteMessage, SendTextRequest, VoiceUpload};

use crate::error::NetError;

/// Supplies the bearer token attached to every request.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<Option<String>, NetError>;
}

/// A fixed token, or none for unauthenticated servers.
pub struct StaticToken(pub Option<String>);

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Result<Option<String>, NetError> {
        Ok(self.0.clone())
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Messages created after `since` (everything when `None`), oldest first.
    /// Entries that are not even structurally messages are dropped here;
    /// field validation is the caller's job.
    async fn fetch_messages(
        &self,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, NetError>;

    async fn send_text(&self, request: &SendTextRequest) -> Result<RemoteMessage, NetError>;

    async fn send_voice(&self, upload: &VoiceUpload) -> Result<RemoteMessage, NetError>;

    async fn send_reaction(&self, request: &ReactionRequest) -> Result<(), NetError>;
}

pub struct HttpApi {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl HttpApi {
    pub fn new(base_url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self, NetError> {
        // Reject malformed bases up front rather than on the first request.
        url::Url::parse(base_url)?;
        Ok(Self {
            http: Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            upload_timeout: Duration::from_secs(UPLOAD_TIMEOUT_SECS),
        })
    }

    pub fn with_timeouts(mut self, request: Duration, upload: Duration) -> Self {
        self.request_timeout = request;
        self.upload_timeout = upload;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn authorize(&self, builder: RequestBuilder) -> Result<RequestBuilder, NetError> {
        Ok(match self.credentials.bearer_token().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn message_response(response: Response) -> Result<RemoteMessage, NetError> {
        let body: serde_json::Value = response.error_for_status()?.json().await?;
        // Some server versions wrap the created message in `{ "message": … }`.
        let body = match body {
            serde_json::Value::Object(mut map) if map.get("message").is_some_and(|m| m.is_object()) => {
                map.remove("message").unwrap_or_default()
            }
            other => other,
        };
        serde_json::from_value(body).map_err(|e| NetError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn fetch_messages(
        &self,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, NetError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Millis, true)));
        }

        let request = self
            .http
            .get(format!("{}/messages", self.base_url))
            .query(&query)
            .timeout(self.request_timeout);
        let response = self.authorize(request).await?.send().await?;
        let entries: Vec<serde_json::Value> = response.error_for_status()?.json().await?;

        let total = entries.len();
        let messages: Vec<RemoteMessage> = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable message entry");
                    None
                }
            })
            .collect();
        debug!(total, decoded = messages.len(), "fetched messages");
        Ok(messages)
    }

    async fn send_text(&self, request: &SendTextRequest) -> Result<RemoteMessage, NetError> {
        let builder = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(request)
            .timeout(self.request_timeout);
        let response = self.authorize(builder).await?.send().await?;
        Self::message_response(response).await
    }

    async fn send_voice(&self, upload: &VoiceUpload) -> Result<RemoteMessage, NetError> {
        let path = Path::new(&upload.audio_path);
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "voice.m4a".to_string());

        let audio = Part::bytes(bytes).file_name(file_name).mime_str("audio/mp4")?;
        let mut form = Form::new()
            .text("username", upload.username.clone())
            .text("messageType", "voice")
            .text("duration", upload.duration.to_string())
            .text("clientId", upload.client_id.clone())
            .part("audio", audio);
        if let Some(reply_to) = &upload.reply_to {
            form = form.text("replyTo", reply_to.clone());
        }

        let builder = self
            .http
            .post(format!("{}/messages", self.base_url))
            .multipart(form)
            .timeout(self.upload_timeout);
        let response = self.authorize(builder).await?.send().await?;
        Self::message_response(response).await
    }

    async fn send_reaction(&self, request: &ReactionRequest) -> Result<(), NetError> {
        let builder = self
            .http
            .post(format!("{}/messages/reaction", self.base_url))
            .json(request)
            .timeout(self.request_timeout);
        self.authorize(builder)
            .await?
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
