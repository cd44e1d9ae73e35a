//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fw_client::factory::{ClientError, ClientProvider};
use fw_client::mock::MockPlatform;
use fw_client::rest::PlatformApi;
use fw_core::credentials::CredentialError;
use fw_core::idempotency::IdempotencyLedger;
use fw_core::mutes::MuteRegistry;
use fw_core::quota::{KindWeights, QuotaLedger, QuotaState};
use fw_core::types::{Account, Credentials, PackQuota, Post};
use fw_engine::scanner::ScannedPost;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn added_at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0).unwrap()
}

pub fn account(id: &str, minute: u32) -> Account {
    let mut account = Account::new(
        id,
        format!("user_{id}"),
        Credentials::Modern {
            access_token: format!("token-{id}"),
            refresh_token: format!("refresh-{id}"),
            expires_at: Utc::now() + chrono::Duration::hours(4),
            scopes: vec!["read".into(), "write".into()],
        },
    );
    account.added_at = added_at(minute);
    account
}

pub fn post(id: &str, author: &str) -> Post {
    Post {
        id: id.into(),
        author_handle: author.into(),
        created_at: Utc::now(),
        text: format!("post {id} by {author}"),
        is_reply: false,
        is_repost: false,
        is_quote: false,
    }
}

pub fn scanned(id: &str, author: &str, scanned_by: &str) -> ScannedPost {
    ScannedPost {
        post: post(id, author),
        scanned_by: scanned_by.into(),
    }
}

pub fn quota_ledger(pack_total: u64, pack_used: u64, daily_limit: u64) -> QuotaLedger {
    QuotaLedger::new(
        pack_total,
        daily_limit,
        KindWeights::default(),
        Some(QuotaState {
            global_pack: PackQuota {
                total: pack_total,
                used: pack_used,
            },
            ..QuotaState::default()
        }),
    )
}

pub fn allocate(quota: &QuotaLedger, accounts: &[Account]) {
    let pairs: Vec<(String, DateTime<Utc>)> = accounts
        .iter()
        .map(|a| (a.id.clone(), a.added_at))
        .collect();
    quota.recompute_allocation(&pairs);
}

pub fn fresh_ledgers(daily_limit: u64) -> (QuotaLedger, IdempotencyLedger, MuteRegistry) {
    (
        quota_ledger(10_000, 0, daily_limit),
        IdempotencyLedger::new(None),
        MuteRegistry::new(None),
    )
}

/// ClientProvider that always hands out the same scripted platform.
pub struct MockClients {
    pub platform: Arc<MockPlatform>,
    pub refresh_calls: AtomicUsize,
    pub fail_refresh: bool,
}

impl MockClients {
    pub fn new(platform: Arc<MockPlatform>) -> Self {
        Self {
            platform,
            refresh_calls: AtomicUsize::new(0),
            fail_refresh: false,
        }
    }

    pub fn failing_refresh(platform: Arc<MockPlatform>) -> Self {
        Self {
            platform,
            refresh_calls: AtomicUsize::new(0),
            fail_refresh: true,
        }
    }
}

#[async_trait]
impl ClientProvider for MockClients {
    async fn client_for(&self, _account_id: &str) -> Result<Arc<dyn PlatformApi>, ClientError> {
        Ok(self.platform.clone())
    }

    async fn refresh_client(&self, account_id: &str) -> Result<Arc<dyn PlatformApi>, ClientError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh {
            return Err(ClientError::Credential(CredentialError::ReauthRequired(
                account_id.to_string(),
            )));
        }
        Ok(self.platform.clone())
    }

    fn invalidate(&self, _account_id: &str) {}
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn wait_until<F>(timeout: std::time::Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    check()
}
