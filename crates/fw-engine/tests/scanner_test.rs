mod common;

use common::*;
use fw_client::mock::MockPlatform;
use fw_client::ratelimit::RateLimitInfo;
use fw_client::rest::{ApiError, ApiResponse, SearchPage};
use fw_core::idempotency::IdempotencyLedger;
use fw_core::types::{ActionKind, Post};
use fw_engine::scanner::{ScanState, Scanner};
use fw_engine::RunSignal;
use std::sync::Arc;

fn page(posts: Vec<Post>) -> Result<ApiResponse<SearchPage>, ApiError> {
    let newest = posts
        .iter()
        .map(|p| p.id.clone())
        .max_by_key(|id| (id.len(), id.clone()));
    Ok(ApiResponse {
        body: SearchPage {
            posts,
            newest_id: newest,
            next_token: None,
        },
        rate: RateLimitInfo::default(),
    })
}

fn chunk(handles: &[&str]) -> Vec<String> {
    handles.iter().map(|h| h.to_string()).collect()
}

#[tokio::test]
async fn keeps_fresh_posts_and_drops_noise() {
    let platform = Arc::new(MockPlatform::new());
    let mut reply_post = post("101", "alice");
    reply_post.is_reply = true;
    let mut repost_post = post("102", "alice");
    repost_post.is_repost = true;
    platform.push_search(page(vec![post("100", "alice"), reply_post, repost_post]));
    let clients = MockClients::new(platform.clone());

    let scanner = Scanner::new(None);
    let idempotency = IdempotencyLedger::new(None);
    let accounts = vec![account("a1", 0)];
    let signal = RunSignal::new();

    let (posts, metrics) = scanner
        .scan(&[chunk(&["alice"])], &accounts, &clients, &idempotency, &signal)
        .await
        .unwrap();

    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].post.id, "100");
    assert_eq!(posts[0].scanned_by, "a1");
    assert_eq!(metrics.fetched, 3);
    assert_eq!(metrics.kept, 1);
    assert_eq!(metrics.dropped_replies, 1);
    assert_eq!(metrics.dropped_reposts, 1);
}

#[tokio::test]
async fn fully_covered_posts_are_filtered_before_planning() {
    let platform = Arc::new(MockPlatform::new());
    platform.push_search(page(vec![post("100", "alice"), post("101", "alice")]));
    let clients = MockClients::new(platform);

    let scanner = Scanner::new(None);
    let idempotency = IdempotencyLedger::new(None);
    let accounts = vec![account("a1", 0)];
    for kind in ActionKind::ALL {
        idempotency.record("100", "a1", kind, chrono::Utc::now());
    }

    let signal = RunSignal::new();
    let (posts, metrics) = scanner
        .scan(&[chunk(&["alice"])], &accounts, &clients, &idempotency, &signal)
        .await
        .unwrap();

    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].post.id, "101");
    assert_eq!(metrics.dropped_covered, 1);
}

#[tokio::test]
async fn duplicate_posts_across_chunks_are_counted_once() {
    let platform = Arc::new(MockPlatform::new());
    platform.push_search(page(vec![post("100", "alice")]));
    platform.push_search(page(vec![post("100", "alice")]));
    let clients = MockClients::new(platform);

    let scanner = Scanner::new(None);
    let idempotency = IdempotencyLedger::new(None);
    let accounts = vec![account("a1", 0), account("a2", 1)];
    let signal = RunSignal::new();

    let (posts, metrics) = scanner
        .scan(
            &[chunk(&["alice"]), chunk(&["bob"])],
            &accounts,
            &clients,
            &idempotency,
            &signal,
        )
        .await
        .unwrap();

    assert_eq!(posts.len(), 1);
    assert_eq!(metrics.dropped_duplicate, 1);
}

#[tokio::test]
async fn rotation_advances_and_high_water_mark_persists() {
    let platform = Arc::new(MockPlatform::new());
    platform.push_search(page(vec![post("105", "alice")]));
    let clients = MockClients::new(platform.clone());

    let scanner = Scanner::new(Some(ScanState {
        rotation_index: 1,
        since_id: Some("99".into()),
    }));
    let idempotency = IdempotencyLedger::new(None);
    let accounts = vec![account("a1", 0), account("a2", 1), account("a3", 2)];
    let signal = RunSignal::new();

    let (posts, _) = scanner
        .scan(&[chunk(&["alice"])], &accounts, &clients, &idempotency, &signal)
        .await
        .unwrap();

    // rotation_index 1 selects the second account as the scanning
    // credential for the first chunk.
    assert_eq!(posts[0].scanned_by, "a2");

    let state = scanner.to_persist();
    assert_eq!(state.rotation_index, 2);
    assert_eq!(state.since_id.as_deref(), Some("105"));
}

#[tokio::test]
async fn chunk_failures_do_not_abort_the_scan() {
    let platform = Arc::new(MockPlatform::new());
    platform.push_search(Err(ApiError::Timeout));
    platform.push_search(page(vec![post("200", "bob")]));
    let clients = MockClients::new(platform);

    let scanner = Scanner::new(None);
    let idempotency = IdempotencyLedger::new(None);
    let accounts = vec![account("a1", 0)];
    let signal = RunSignal::new();

    let (posts, metrics) = scanner
        .scan(
            &[chunk(&["alice"]), chunk(&["bob"])],
            &accounts,
            &clients,
            &idempotency,
            &signal,
        )
        .await
        .unwrap();

    assert_eq!(metrics.chunk_errors, 1);
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].post.id, "200");
}

#[tokio::test]
async fn empty_watchlist_makes_no_calls() {
    let platform = Arc::new(MockPlatform::new());
    let clients = MockClients::new(platform.clone());
    let scanner = Scanner::new(None);
    let idempotency = IdempotencyLedger::new(None);
    let signal = RunSignal::new();

    let (posts, metrics) = scanner
        .scan(&[], &[account("a1", 0)], &clients, &idempotency, &signal)
        .await
        .unwrap();

    assert!(posts.is_empty());
    assert_eq!(metrics.chunks, 0);
    assert_eq!(platform.calls_to("search"), 0);
}
