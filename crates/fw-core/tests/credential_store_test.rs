use async_trait::async_trait;
use chrono::{Duration, Utc};
use fw_core::credentials::{
    CredentialError, CredentialStore, RefreshError, RefreshedToken, TokenRefresher,
};
use fw_core::crypto::BlobKey;
use fw_core::types::{Account, AccountStatus, Credentials};
use std::sync::atomic::{AtomicUsize, Ordering};

fn modern_account(id: &str, expires_in: Duration) -> Account {
    Account::new(
        id,
        format!("user_{id}"),
        Credentials::Modern {
            access_token: "old-access".into(),
            refresh_token: "refresh-secret".into(),
            expires_at: Utc::now() + expires_in,
            scopes: vec!["read".into(), "write".into()],
        },
    )
}

fn legacy_account(id: &str) -> Account {
    Account::new(
        id,
        format!("user_{id}"),
        Credentials::Legacy {
            app_key: "ak".into(),
            app_secret: "as".into(),
            access_token: "at".into(),
            access_secret: "ats".into(),
        },
    )
}

struct ScriptedRefresher {
    calls: AtomicUsize,
    outcome: fn() -> Result<RefreshedToken, RefreshError>,
}

impl ScriptedRefresher {
    fn ok() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome: || {
                Ok(RefreshedToken {
                    access_token: "new-access".into(),
                    refresh_token: Some("rotated-refresh".into()),
                    expires_at: Utc::now() + Duration::hours(2),
                })
            },
        }
    }

    fn reauth() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            outcome: || Err(RefreshError::Reauth),
        }
    }
}

#[async_trait]
impl TokenRefresher for ScriptedRefresher {
    async fn exchange(&self, _refresh_token: &str) -> Result<RefreshedToken, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.outcome)()
    }
}

#[tokio::test]
async fn blob_roundtrips_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.enc");
    let key = BlobKey::generate().unwrap();

    let store = CredentialStore::open(&path, key.clone()).await.unwrap();
    store.upsert(modern_account("a1", Duration::hours(2))).await.unwrap();
    store.upsert(legacy_account("a2")).await.unwrap();

    // On-disk bytes are ciphertext, not JSON.
    let raw = std::fs::read(&path).unwrap();
    assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());

    let reopened = CredentialStore::open(&path, key).await.unwrap();
    let accounts = reopened.list().await;
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0].id, "a1");
    assert!(accounts[1].credentials.expires_at().is_none());
}

#[tokio::test]
async fn wrong_key_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.enc");

    let store = CredentialStore::open(&path, BlobKey::generate().unwrap()).await.unwrap();
    store.upsert(legacy_account("a1")).await.unwrap();

    let result = CredentialStore::open(&path, BlobKey::generate().unwrap()).await;
    assert!(matches!(result, Err(CredentialError::Crypto(_))));
}

#[tokio::test]
async fn refresh_replaces_token_and_rotates_secret() {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::open(dir.path().join("credentials.enc"), BlobKey::generate().unwrap())
        .await
        .unwrap();
    store.upsert(modern_account("a1", Duration::minutes(1))).await.unwrap();

    let refresher = ScriptedRefresher::ok();
    let updated = store.refresh("a1", &refresher, false).await.unwrap();

    match updated {
        Credentials::Modern {
            access_token,
            refresh_token,
            ..
        } => {
            assert_eq!(access_token, "new-access");
            assert_eq!(refresh_token, "rotated-refresh");
        }
        Credentials::Legacy { .. } => panic!("expected modern credentials"),
    }
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proactive_refresh_skips_fresh_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::open(dir.path().join("credentials.enc"), BlobKey::generate().unwrap())
        .await
        .unwrap();
    store.upsert(modern_account("a1", Duration::hours(3))).await.unwrap();

    let refresher = ScriptedRefresher::ok();
    store.refresh("a1", &refresher, false).await.unwrap();
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);

    // A forced refresh (the 401 path) always exchanges.
    store.refresh("a1", &refresher, true).await.unwrap();
    assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reauth_marks_account_for_reconnection() {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::open(dir.path().join("credentials.enc"), BlobKey::generate().unwrap())
        .await
        .unwrap();
    store.upsert(modern_account("a1", Duration::minutes(1))).await.unwrap();

    let result = store.refresh("a1", &ScriptedRefresher::reauth(), false).await;
    assert!(matches!(result, Err(CredentialError::ReauthRequired(_))));

    let account = store.get("a1").await.unwrap();
    assert_eq!(account.status, AccountStatus::RequiresReconnection);
    assert!(!account.is_active());
}

#[tokio::test]
async fn legacy_accounts_are_not_refreshable() {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::open(dir.path().join("credentials.enc"), BlobKey::generate().unwrap())
        .await
        .unwrap();
    store.upsert(legacy_account("a1")).await.unwrap();

    let result = store.refresh("a1", &ScriptedRefresher::ok(), true).await;
    assert!(matches!(result, Err(CredentialError::NotRefreshable(_))));
}

#[tokio::test]
async fn expiring_within_reports_only_near_expiry_active_accounts() {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::open(dir.path().join("credentials.enc"), BlobKey::generate().unwrap())
        .await
        .unwrap();
    store.upsert(modern_account("soon", Duration::minutes(3))).await.unwrap();
    store.upsert(modern_account("later", Duration::hours(6))).await.unwrap();
    store.upsert(legacy_account("legacy")).await.unwrap();

    let due = store.expiring_within(Duration::minutes(5), Utc::now()).await;
    assert_eq!(due, vec!["soon".to_string()]);
}

#[tokio::test]
async fn remove_deletes_material() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials.enc");
    let key = BlobKey::generate().unwrap();
    let store = CredentialStore::open(&path, key.clone()).await.unwrap();
    store.upsert(legacy_account("a1")).await.unwrap();
    store.remove("a1").await.unwrap();
    assert!(matches!(store.get("a1").await, Err(CredentialError::NotFound(_))));

    let reopened = CredentialStore::open(&path, key).await.unwrap();
    assert!(reopened.list().await.is_empty());
}
