//! Turns surviving posts into deferred actions.
//!
//! The planner is deliberately deterministic apart from delay jitter: posts
//! are walked in ascending id order and accounts in the order they were
//! added, so two runs over the same ledgers plan the same action set.

use crate::scanner::ScannedPost;
use fw_client::reply::{ImagePolicy, ReplyTextProvider, StyleConfig};
use fw_core::idempotency::IdempotencyLedger;
use fw_core::mutes::MuteRegistry;
use fw_core::quota::QuotaLedger;
use fw_core::types::{Account, ActionKind, PlannedAction, Post, Priority};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info, warn};

/// Scheduled-delay thresholds for priority classification, in seconds.
const URGENT_WITHIN_SECS: i64 = 90;
const NORMAL_WITHIN_SECS: i64 = 300;

pub struct PlannerContext<'a> {
    pub quota: &'a QuotaLedger,
    pub idempotency: &'a IdempotencyLedger,
    pub mutes: &'a MuteRegistry,
    pub reply_provider: &'a dyn ReplyTextProvider,
    pub image_policy: &'a ImagePolicy,
    pub style: StyleConfig,
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

/// Plan actions for one batch of scanned posts.
///
/// Accounts that are inactive, muted, or were the scanning credential for a
/// post are skipped for that post. Every surviving candidate passes the
/// idempotency and quota gates before being scheduled.
pub async fn plan(
    scanned: &[ScannedPost],
    accounts: &[Account],
    ctx: &PlannerContext<'_>,
    now: DateTime<Utc>,
) -> Vec<PlannedAction> {
    let mut posts: Vec<&ScannedPost> = scanned.iter().collect();
    posts.sort_by(|a, b| id_order(&a.post.id, &b.post.id));

    let mut eligible: Vec<&Account> = accounts
        .iter()
        .filter(|account| account.is_active())
        .filter(|account| !ctx.mutes.is_muted(&account.id, now))
        .collect();
    eligible.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));

    // The scanning credential is not a target for the chunk it scanned --
    // unless it is the only account there is, in which case excluding it
    // would starve the whole pipeline.
    let sole_account = eligible.len() == 1;

    let mut actions = Vec::new();
    for scanned_post in posts {
        let post = &scanned_post.post;
        let mut reply_accounts: Vec<&Account> = Vec::new();

        for account in &eligible {
            if !sole_account && account.id == scanned_post.scanned_by {
                continue;
            }
            for kind in candidate_kinds(post) {
                if ctx.idempotency.contains(&post.id, &account.id, kind) {
                    continue;
                }
                if let Err(reason) = ctx.quota.can_consume(&account.id, kind) {
                    debug!(
                        account_id = %account.id,
                        post_id = %post.id,
                        kind = %kind,
                        reason = %reason,
                        "candidate skipped by quota"
                    );
                    continue;
                }
                if kind == ActionKind::Reply {
                    // Replies need a text slot; bind after batch generation.
                    reply_accounts.push(account);
                } else {
                    actions.push(schedule(post, account, kind, None, None, ctx, now));
                }
            }
        }

        if !reply_accounts.is_empty() {
            let batch: Vec<Post> = reply_accounts.iter().map(|_| post.clone()).collect();
            match ctx.reply_provider.generate(&batch, &ctx.style).await {
                Ok(texts) => {
                    // One text per account, in order; accounts beyond the
                    // generated texts lose their reply this cycle.
                    if texts.len() < reply_accounts.len() {
                        warn!(
                            post_id = %post.id,
                            wanted = reply_accounts.len(),
                            produced = texts.len(),
                            "reply batch came back short"
                        );
                    }
                    for (account, text) in reply_accounts.iter().zip(texts) {
                        let media = ctx.image_policy.draw();
                        actions.push(schedule(
                            post,
                            account,
                            ActionKind::Reply,
                            Some(text),
                            media,
                            ctx,
                            now,
                        ));
                    }
                }
                Err(e) => {
                    warn!(post_id = %post.id, error = %e, "reply generation failed, dropping replies for batch");
                }
            }
        }
    }

    // Stable sort keeps the deterministic post/account order inside each
    // priority band.
    actions.sort_by_key(|action| action.priority);
    info!(planned = actions.len(), posts = scanned.len(), "planning complete");
    actions
}

fn candidate_kinds(post: &Post) -> Vec<ActionKind> {
    let mut kinds = vec![ActionKind::Like];
    if !post.is_reply {
        kinds.push(ActionKind::Repost);
    }
    kinds.push(ActionKind::Reply);
    kinds
}

fn schedule(
    post: &Post,
    account: &Account,
    kind: ActionKind,
    reply_text: Option<String>,
    media_id: Option<String>,
    ctx: &PlannerContext<'_>,
    now: DateTime<Utc>,
) -> PlannedAction {
    let delay_secs = if ctx.max_delay_secs > ctx.min_delay_secs {
        rand::thread_rng().gen_range(ctx.min_delay_secs..=ctx.max_delay_secs)
    } else {
        ctx.min_delay_secs
    };
    let scheduled_at = now + Duration::seconds(delay_secs as i64);
    PlannedAction {
        post_id: post.id.clone(),
        account_id: account.id.clone(),
        kind,
        scheduled_at,
        priority: priority_for(delay_secs as i64),
        attempt_count: 0,
        reply_text,
        media_id,
    }
}

fn priority_for(delay_secs: i64) -> Priority {
    if delay_secs <= URGENT_WITHIN_SECS {
        Priority::Urgent
    } else if delay_secs <= NORMAL_WITHIN_SECS {
        Priority::Normal
    } else {
        Priority::Low
    }
}

/// Ascending numeric-string order for post ids.
fn id_order(a: &str, b: &str) -> std::cmp::Ordering {
    (a.len(), a).cmp(&(b.len(), b))
}
