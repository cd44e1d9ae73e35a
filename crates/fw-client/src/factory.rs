//! Per-account API client production and caching.
//!
//! Clients are cached with a TTL so credential rotation propagates without
//! rebuilding on every call. A per-account build lock keeps concurrent
//! callers from racing duplicate builds or duplicate refreshes.

use crate::rest::{PlatformApi, RestClient};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use fw_core::credentials::{CredentialError, CredentialStore, TokenRefresher};
use fw_core::types::AccountStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("client build failed: {0}")]
    Build(String),
}

impl ClientError {
    /// True when the account can only be fixed by operator reconnection.
    pub fn is_reauth_required(&self) -> bool {
        matches!(
            self,
            ClientError::Credential(
                CredentialError::ReauthRequired(_) | CredentialError::NotRefreshable(_)
            )
        )
    }
}

/// Hands out API clients for accounts.
///
/// A trait so the engine can run against scripted platforms in tests.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// A cached or freshly built client for this account.
    async fn client_for(&self, account_id: &str) -> Result<Arc<dyn PlatformApi>, ClientError>;

    /// Force a token refresh and rebuild, used on 401.
    async fn refresh_client(&self, account_id: &str) -> Result<Arc<dyn PlatformApi>, ClientError>;

    /// Drop any cached client for this account.
    fn invalidate(&self, account_id: &str);
}

struct CacheEntry {
    client: Arc<RestClient>,
    built_at: Instant,
}

pub struct ClientFactory {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    base_url: String,
    http_timeout: Duration,
    ttl: Duration,
    /// Proactive refresh window for modern tokens.
    refresh_window: ChronoDuration,
    cache: DashMap<String, CacheEntry>,
    build_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ClientFactory {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        base_url: impl Into<String>,
        http_timeout: Duration,
        ttl: Duration,
        refresh_window: ChronoDuration,
    ) -> Self {
        Self {
            store,
            refresher,
            base_url: base_url.into(),
            http_timeout,
            ttl,
            refresh_window,
            cache: DashMap::new(),
            build_locks: DashMap::new(),
        }
    }

    fn build_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.build_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cached(&self, account_id: &str) -> Option<Arc<RestClient>> {
        self.cache.get(account_id).and_then(|entry| {
            (entry.built_at.elapsed() < self.ttl).then(|| entry.client.clone())
        })
    }

    async fn build(&self, account_id: &str, force_refresh: bool) -> Result<Arc<RestClient>, ClientError> {
        let account = self.store.get(account_id).await?;
        if account.status == AccountStatus::RequiresReconnection {
            return Err(CredentialError::ReauthRequired(account_id.to_string()).into());
        }

        // Refresh modern tokens that are forced dead (401) or inside the
        // proactive window.
        let near_expiry = account
            .credentials
            .expires_at()
            .map(|expires| expires <= chrono::Utc::now() + self.refresh_window)
            .unwrap_or(false);
        let credentials = if account.credentials.is_modern() && (force_refresh || near_expiry) {
            self.store
                .refresh(account_id, self.refresher.as_ref(), force_refresh)
                .await?
        } else {
            account.credentials
        };

        let client = RestClient::new(&self.base_url, &credentials, self.http_timeout)
            .map_err(|e| ClientError::Build(e.to_string()))?;
        let client = Arc::new(client);
        self.cache.insert(
            account_id.to_string(),
            CacheEntry {
                client: client.clone(),
                built_at: Instant::now(),
            },
        );
        debug!(account_id, force_refresh, "api client built");
        Ok(client)
    }
}

#[async_trait]
impl ClientProvider for ClientFactory {
    async fn client_for(&self, account_id: &str) -> Result<Arc<dyn PlatformApi>, ClientError> {
        if let Some(client) = self.cached(account_id) {
            return Ok(client);
        }
        let lock = self.build_lock(account_id);
        let _guard = lock.lock().await;
        // Another caller may have built while we waited.
        if let Some(client) = self.cached(account_id) {
            return Ok(client);
        }
        Ok(self.build(account_id, false).await?)
    }

    async fn refresh_client(&self, account_id: &str) -> Result<Arc<dyn PlatformApi>, ClientError> {
        let lock = self.build_lock(account_id);
        let _guard = lock.lock().await;
        self.cache.remove(account_id);
        Ok(self.build(account_id, true).await?)
    }

    fn invalidate(&self, account_id: &str) {
        self.cache.remove(account_id);
        self.build_locks.remove(account_id);
    }
}
