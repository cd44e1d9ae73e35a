//! Token exchange for modern credentials.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fw_core::credentials::{RefreshError, RefreshedToken, TokenRefresher};
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime in seconds.
    expires_in: i64,
}

/// Exchanges a refresh token against the platform's OAuth token endpoint.
pub struct OAuthRefresher {
    http: reqwest::Client,
    token_url: String,
}

impl OAuthRefresher {
    pub fn new(token_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, RefreshError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RefreshError::Transient(e.to_string()))?;
        Ok(Self {
            http,
            token_url: token_url.into(),
        })
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn exchange(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .http
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RefreshError::Transient(e.to_string()))?;

        if !status.is_success() {
            // `invalid_grant` means the refresh token itself is dead; only
            // the operator can fix that by reconnecting the account.
            if status.as_u16() == 400 && text.contains("invalid_grant") || status.as_u16() == 401 {
                warn!(status = status.as_u16(), "token endpoint rejected refresh secret");
                return Err(RefreshError::Reauth);
            }
            return Err(RefreshError::Transient(format!(
                "token endpoint status {status}: {text}"
            )));
        }

        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| RefreshError::Transient(format!("token response parse: {e}")))?;
        debug!(expires_in = token.expires_in, "token exchange succeeded");
        Ok(RefreshedToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in.max(0)),
        })
    }
}
