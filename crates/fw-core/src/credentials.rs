//! Encrypted at-rest storage for account credentials, with token refresh
//! for the modern OAuth variant.
//!
//! The store owns persistence and atomic replacement; the actual HTTP token
//! exchange lives behind [`TokenRefresher`], implemented by the client
//! crate. Refreshes take a per-account lock so one slow exchange never
//! serializes unrelated accounts.

use crate::crypto::{self, BlobKey, CryptoError};
use crate::store::{self, StoreError};
use crate::types::{Account, AccountStatus, Credentials};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("account not found: {0}")]
    NotFound(String),
    #[error("account {0} requires reconnection")]
    ReauthRequired(String),
    #[error("refresh not applicable: account {0} uses legacy credentials")]
    NotRefreshable(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("credential blob is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("token exchange failed: {0}")]
    Exchange(String),
}

/// Outcome of a provider token exchange.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Some providers rotate the refresh token on every exchange.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The provider rejected the refresh secret; the operator must
    /// reconnect the account.
    #[error("provider requires re-authorization")]
    Reauth,
    /// A transport or transient provider failure; worth retrying later.
    #[error("transient refresh failure: {0}")]
    Transient(String),
}

/// Performs the HTTP token exchange for modern credentials.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<RefreshedToken, RefreshError>;
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

pub struct CredentialStore {
    path: PathBuf,
    key: BlobKey,
    accounts: RwLock<HashMap<String, Account>>,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialStore {
    /// Open the store, decrypting the blob at `path` when it exists.
    pub async fn open(path: impl Into<PathBuf>, key: BlobKey) -> Result<Self, CredentialError> {
        let path = path.into();
        let accounts = match tokio::fs::read(&path).await {
            Ok(blob) => {
                let plain = crypto::open(&key, &blob)?;
                let list: Vec<Account> = serde_json::from_slice(&plain)?;
                list.into_iter().map(|a| (a.id.clone(), a)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::from(e).into()),
        };
        info!(accounts = accounts.len(), path = %path.display(), "credential store opened");
        Ok(Self {
            path,
            key,
            accounts: RwLock::new(accounts),
            refresh_locks: DashMap::new(),
        })
    }

    async fn persist(&self, accounts: &HashMap<String, Account>) -> Result<(), CredentialError> {
        let mut list: Vec<&Account> = accounts.values().collect();
        list.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        let plain = serde_json::to_vec(&list)?;
        let blob = crypto::seal(&self.key, &plain)?;
        store::write_bytes_atomic(&self.path, &blob).await?;
        Ok(())
    }

    /// All accounts, ordered by `added_at` (stable tie-break by id).
    pub async fn list(&self) -> Vec<Account> {
        let accounts = self.accounts.read().await;
        let mut list: Vec<Account> = accounts.values().cloned().collect();
        list.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn get(&self, account_id: &str) -> Result<Account, CredentialError> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound(account_id.to_string()))
    }

    /// Add or replace an account, write-through.
    pub async fn upsert(&self, account: Account) -> Result<(), CredentialError> {
        let mut accounts = self.accounts.write().await;
        accounts.insert(account.id.clone(), account);
        self.persist(&accounts).await
    }

    /// Remove an account and its credential material.
    pub async fn remove(&self, account_id: &str) -> Result<(), CredentialError> {
        let mut accounts = self.accounts.write().await;
        if accounts.remove(account_id).is_none() {
            return Err(CredentialError::NotFound(account_id.to_string()));
        }
        self.refresh_locks.remove(account_id);
        self.persist(&accounts).await
    }

    /// Flag an account as needing operator re-authorization. The planner
    /// excludes such accounts until they are reconnected.
    pub async fn mark_requires_reconnection(&self, account_id: &str) -> Result<(), CredentialError> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(account_id)
            .ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?;
        if account.status != AccountStatus::RequiresReconnection {
            account.status = AccountStatus::RequiresReconnection;
            warn!(account_id, "account marked as requiring reconnection");
            self.persist(&accounts).await?;
        }
        Ok(())
    }

    fn refresh_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Exchange the refresh secret for a fresh access token and atomically
    /// replace the stored credentials.
    ///
    /// With `force` false (the proactive path) the exchange is skipped when
    /// the stored token is still comfortably valid; this is what coalesces
    /// concurrent callers: whoever loses the per-account lock race re-reads
    /// the already-replaced token. The 401 path passes `force` true because
    /// the provider has declared the token dead regardless of its claimed
    /// expiry.
    pub async fn refresh(
        &self,
        account_id: &str,
        refresher: &dyn TokenRefresher,
        force: bool,
    ) -> Result<Credentials, CredentialError> {
        let lock = self.refresh_lock(account_id);
        let _guard = lock.lock().await;

        let account = self.get(account_id).await?;
        let (refresh_token, old_expiry) = match &account.credentials {
            Credentials::Legacy { .. } => {
                return Err(CredentialError::NotRefreshable(account_id.to_string()))
            }
            Credentials::Modern {
                refresh_token,
                expires_at,
                ..
            } => (refresh_token.clone(), *expires_at),
        };

        if !force && old_expiry > Utc::now() + Duration::minutes(2) {
            return Ok(account.credentials);
        }

        let refreshed = match refresher.exchange(&refresh_token).await {
            Ok(token) => token,
            Err(RefreshError::Reauth) => {
                drop(_guard);
                self.mark_requires_reconnection(account_id).await?;
                return Err(CredentialError::ReauthRequired(account_id.to_string()));
            }
            Err(RefreshError::Transient(detail)) => {
                return Err(CredentialError::Exchange(detail));
            }
        };

        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(account_id)
            .ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?;
        if let Credentials::Modern {
            access_token,
            refresh_token,
            expires_at,
            ..
        } = &mut account.credentials
        {
            *access_token = refreshed.access_token;
            if let Some(rotated) = refreshed.refresh_token {
                *refresh_token = rotated;
            }
            *expires_at = refreshed.expires_at;
        }
        let updated = account.credentials.clone();
        self.persist(&accounts).await?;
        info!(account_id, expires_at = %refreshed.expires_at, "access token refreshed");
        Ok(updated)
    }

    /// Modern accounts whose access token expires within `window`.
    pub async fn expiring_within(&self, window: Duration, now: DateTime<Utc>) -> Vec<String> {
        self.accounts
            .read()
            .await
            .values()
            .filter(|account| account.is_active())
            .filter_map(|account| {
                account
                    .credentials
                    .expires_at()
                    .filter(|expires| *expires <= now + window)
                    .map(|_| account.id.clone())
            })
            .collect()
    }
}
