//! HTTP client for the engagement platform API.
//!
//! One [`RestClient`] is built per account from its credential variant and
//! used for every call that account makes. Every response surfaces the
//! observed rate-limit headers so the executor can keep per-account windows
//! current.

use crate::ratelimit::RateLimitInfo;
use async_trait::async_trait;
use fw_core::types::{Credentials, Post};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Non-success status. Body and rate headers are retained for the
    /// classifier.
    #[error("API error (status {status}): {body}")]
    Status {
        status: u16,
        body: String,
        rate: RateLimitInfo,
    },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected response shape: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Response envelope and body types
// ---------------------------------------------------------------------------

/// A parsed body together with the rate-limit headers observed on the wire.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub body: T,
    pub rate: RateLimitInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    pub posts: Vec<Post>,
    pub newest_id: Option<String>,
    pub next_token: Option<String>,
}

/// Result of a like/repost call. `done` is false when the provider reports
/// the action as a no-op.
#[derive(Debug, Clone, Deserialize)]
pub struct EngagementResult {
    pub done: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostedReply {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
}

// ---------------------------------------------------------------------------
// PlatformApi
// ---------------------------------------------------------------------------

/// The platform operations the engine consumes.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn search(
        &self,
        query: &str,
        since_id: Option<&str>,
        max_results: u32,
    ) -> Result<ApiResponse<SearchPage>, ApiError>;

    async fn like(&self, user_id: &str, post_id: &str) -> Result<ApiResponse<EngagementResult>, ApiError>;

    async fn repost(&self, user_id: &str, post_id: &str)
        -> Result<ApiResponse<EngagementResult>, ApiError>;

    async fn reply(
        &self,
        text: &str,
        in_reply_to: &str,
        media_id: Option<&str>,
    ) -> Result<ApiResponse<PostedReply>, ApiError>;

    async fn me(&self) -> Result<ApiResponse<UserProfile>, ApiError>;
}

// ---------------------------------------------------------------------------
// RestClient
// ---------------------------------------------------------------------------

// Wire shapes. The provider wraps payloads in a `data` envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    data: Vec<Post>,
    #[serde(default)]
    meta: SearchMeta,
}

#[derive(Debug, Default, Deserialize)]
struct SearchMeta {
    newest_id: Option<String>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LikeBody {
    liked: bool,
}

#[derive(Debug, Deserialize)]
struct RepostBody {
    reposted: bool,
}

pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    bearer: String,
}

impl RestClient {
    /// Build a client for one account, pattern-matching the credential
    /// variant exactly once.
    pub fn new(
        base_url: impl Into<String>,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let bearer = match credentials {
            Credentials::Legacy { access_token, .. } => access_token.clone(),
            Credentials::Modern { access_token, .. } => access_token.clone(),
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            bearer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<ApiResponse<T>, ApiError> {
        let response = request.bearer_auth(&self.bearer).send().await?;
        let status = response.status();
        let rate = RateLimitInfo::from_headers(response.headers());
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
                rate,
            });
        }

        let body: T = serde_json::from_str(&text).map_err(|e| ApiError::Parse(e.to_string()))?;
        Ok(ApiResponse { body, rate })
    }
}

#[async_trait]
impl PlatformApi for RestClient {
    async fn search(
        &self,
        query: &str,
        since_id: Option<&str>,
        max_results: u32,
    ) -> Result<ApiResponse<SearchPage>, ApiError> {
        let mut params = vec![
            ("query".to_string(), query.to_string()),
            ("max_results".to_string(), max_results.to_string()),
        ];
        if let Some(since) = since_id {
            params.push(("since_id".to_string(), since.to_string()));
        }
        debug!(query, since_id = ?since_id, "platform search");
        let response: ApiResponse<SearchBody> = self
            .execute(self.http.get(self.url("/search")).query(&params))
            .await?;
        Ok(ApiResponse {
            body: SearchPage {
                posts: response.body.data,
                newest_id: response.body.meta.newest_id,
                next_token: response.body.meta.next_token,
            },
            rate: response.rate,
        })
    }

    async fn like(&self, user_id: &str, post_id: &str) -> Result<ApiResponse<EngagementResult>, ApiError> {
        let response: ApiResponse<Envelope<LikeBody>> = self
            .execute(
                self.http
                    .post(self.url("/likes"))
                    .json(&serde_json::json!({ "user_id": user_id, "post_id": post_id })),
            )
            .await?;
        Ok(ApiResponse {
            body: EngagementResult {
                done: response.body.data.liked,
            },
            rate: response.rate,
        })
    }

    async fn repost(
        &self,
        user_id: &str,
        post_id: &str,
    ) -> Result<ApiResponse<EngagementResult>, ApiError> {
        let response: ApiResponse<Envelope<RepostBody>> = self
            .execute(
                self.http
                    .post(self.url("/reposts"))
                    .json(&serde_json::json!({ "user_id": user_id, "post_id": post_id })),
            )
            .await?;
        Ok(ApiResponse {
            body: EngagementResult {
                done: response.body.data.reposted,
            },
            rate: response.rate,
        })
    }

    async fn reply(
        &self,
        text: &str,
        in_reply_to: &str,
        media_id: Option<&str>,
    ) -> Result<ApiResponse<PostedReply>, ApiError> {
        let mut payload = serde_json::json!({ "text": text, "in_reply_to": in_reply_to });
        if let Some(media) = media_id {
            payload["media_id"] = serde_json::Value::String(media.to_string());
        }
        let response: ApiResponse<Envelope<PostedReply>> = self
            .execute(self.http.post(self.url("/reply-post")).json(&payload))
            .await?;
        Ok(ApiResponse {
            body: response.body.data,
            rate: response.rate,
        })
    }

    async fn me(&self) -> Result<ApiResponse<UserProfile>, ApiError> {
        let response: ApiResponse<Envelope<UserProfile>> =
            self.execute(self.http.get(self.url("/me"))).await?;
        Ok(ApiResponse {
            body: response.body.data,
            rate: response.rate,
        })
    }
}
