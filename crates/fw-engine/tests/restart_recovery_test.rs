mod common;

use chrono::Utc;
use common::*;
use fw_client::mock::MockPlatform;
use fw_client::reply::MockReplyProvider;
use fw_core::config::Config;
use fw_core::crypto::BlobKey;
use fw_core::idempotency::{IdempotencyLedger, IdempotencyMap};
use fw_core::receipts::ReceiptFilter;
use fw_core::store;
use fw_core::types::ActionKind;
use fw_engine::AutomationEngine;
use std::sync::Arc;

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.general.data_dir = dir.to_string_lossy().into_owned();
    config.quota.pack_total = 1000;
    config.quota.daily_limit = 10;
    config
}

async fn open_engine(dir: &std::path::Path) -> AutomationEngine {
    AutomationEngine::with_providers(
        test_config(dir),
        BlobKey::generate().unwrap(),
        Arc::new(MockClients::new(Arc::new(MockPlatform::new()))),
        Arc::new(MockReplyProvider::new()),
    )
    .await
    .unwrap()
}

/// A crash between consume and execute leaves a journaled intent with no
/// idempotency record. Restart must return the charge.
#[tokio::test]
async fn unfinished_intent_is_reverted_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    // Simulate the pre-crash state: quota charged, intent journaled,
    // nothing recorded as done.
    let quota = quota_ledger(1000, 0, 10);
    allocate(&quota, &[account("a4", 0)]);
    quota.begin("200", "a4", ActionKind::Like, Utc::now()).unwrap();
    store::write_json_atomic(&dir.path().join("quota.json"), &quota.to_persist())
        .await
        .unwrap();

    let engine = open_engine(dir.path()).await;

    let snap = engine.snapshot_quota();
    assert_eq!(snap.global_pack.used, 0, "orphaned charge must be reverted");
    engine.shutdown().await;

    // The revert is durable.
    let persisted: fw_core::quota::QuotaState =
        store::read_json(&dir.path().join("quota.json")).await.unwrap().unwrap();
    assert!(persisted.pending.is_empty());
    assert_eq!(persisted.global_pack.used, 0);
}

/// The mirror case: the action completed (idempotency holds the key) but
/// the settle never flushed. Restart keeps the charge.
#[tokio::test]
async fn completed_intent_is_settled_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    let quota = quota_ledger(1000, 0, 10);
    allocate(&quota, &[account("a4", 0)]);
    quota.begin("200", "a4", ActionKind::Like, Utc::now()).unwrap();
    store::write_json_atomic(&dir.path().join("quota.json"), &quota.to_persist())
        .await
        .unwrap();

    let idempotency = IdempotencyLedger::new(None);
    idempotency.record("200", "a4", ActionKind::Like, Utc::now());
    store::write_json_atomic(&dir.path().join("idempotency.json"), &idempotency.to_persist())
        .await
        .unwrap();

    let engine = open_engine(dir.path()).await;

    let snap = engine.snapshot_quota();
    assert_eq!(snap.global_pack.used, 1, "completed charge must stick");
    let persisted: fw_core::quota::QuotaState = {
        engine.shutdown().await;
        store::read_json(&dir.path().join("quota.json")).await.unwrap().unwrap()
    };
    assert!(persisted.pending.is_empty());
}

#[tokio::test]
async fn partial_trailing_receipt_is_truncated_on_open() {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(dir.path()).await.unwrap();
    tokio::fs::write(
        dir.path().join("actions.log.jsonl"),
        concat!(
            "{\"post_id\":\"1\",\"account_id\":\"a1\",\"kind\":\"like\",\"status\":\"ok\",\"timestamp\":\"2025-06-01T12:00:00Z\"}\n",
            "{\"post_id\":\"2\",\"account_id\":\"a1\",\"ki"
        ),
    )
    .await
    .unwrap();

    let engine = open_engine(dir.path()).await;
    let receipts = engine.export_receipts(&ReceiptFilter::default()).await.unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].post_id, "1");
}

#[tokio::test]
async fn ledgers_survive_shutdown_and_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let engine = open_engine(dir.path()).await;
        engine.add_account(account("a1", 0)).await.unwrap();
        engine.set_watchlist(&["alice".to_string(), "bob".to_string()]);
        engine.shutdown().await;
    }

    // Note: each engine run generates its own blob key in this test setup,
    // so reopen the persisted ledgers directly.
    let watchlist: Vec<String> =
        store::read_json(&dir.path().join("watchlist.json")).await.unwrap().unwrap();
    assert_eq!(watchlist, vec!["alice".to_string(), "bob".to_string()]);

    let idempotency: Option<IdempotencyMap> =
        store::read_json(&dir.path().join("idempotency.json")).await.unwrap();
    assert!(idempotency.is_some());
}
