//! Per-account action queues and the workers that drain them.
//!
//! One worker task per account guarantees serial execution within an
//! account; a shared semaphore caps how many accounts execute at once. The
//! worker loop re-validates mutes, idempotency, and quota at dispatch time,
//! charges quota through the pending-intent journal (flushed to disk before
//! the API call goes out), and turns every terminal outcome into a receipt.

use crate::shutdown::RunSignal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use fw_client::classifier::{classify, ErrorClass};
use fw_client::factory::ClientProvider;
use fw_client::ratelimit::{RateLimitInfo, RateLimitTracker};
use fw_client::rest::{ApiError, PlatformApi};
use fw_core::credentials::CredentialStore;
use fw_core::idempotency::IdempotencyLedger;
use fw_core::mutes::MuteRegistry;
use fw_core::quota::{DenyReason, QuotaError, QuotaLedger};
use fw_core::receipts::ReceiptLog;
use fw_core::store;
use fw_core::types::{ActionKind, ActionReceipt, MuteReason, PlannedAction, ReceiptStatus};
use rand::Rng;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Jitter added when an action is pushed past a mute window, in seconds.
const MUTE_RESCHEDULE_JITTER_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Queue plumbing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct QueuedItem {
    due: DateTime<Utc>,
    seq: u64,
    action: PlannedAction,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // FIFO by (due, enqueue order).
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Default)]
struct AccountQueue {
    heap: std::sync::Mutex<BinaryHeap<Reverse<QueuedItem>>>,
    notify: Notify,
}

impl AccountQueue {
    fn lock(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<QueuedItem>>> {
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, item: QueuedItem) {
        self.lock().push(Reverse(item));
        self.notify.notify_one();
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().peek().map(|Reverse(item)| item.due)
    }

    fn pop_due(&self, now: DateTime<Utc>) -> Option<QueuedItem> {
        let mut heap = self.lock();
        if heap.peek().is_some_and(|Reverse(item)| item.due <= now) {
            heap.pop().map(|Reverse(item)| item)
        } else {
            None
        }
    }

    fn drain(&self) -> Vec<QueuedItem> {
        let mut heap = self.lock();
        let mut items: Vec<QueuedItem> = std::mem::take(&mut *heap)
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(item)| item)
            .collect();
        // into_sorted_vec on Reverse yields descending due order.
        items.reverse();
        items
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

pub struct ExecutorDeps {
    pub quota: Arc<QuotaLedger>,
    pub idempotency: Arc<IdempotencyLedger>,
    pub mutes: Arc<MuteRegistry>,
    pub receipts: Arc<ReceiptLog>,
    pub clients: Arc<dyn ClientProvider>,
    pub credentials: Arc<CredentialStore>,
    pub rate: Arc<RateLimitTracker>,
    /// Destination for the pre-dispatch quota flush.
    pub quota_path: PathBuf,
    pub action_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    deps: Arc<ExecutorDeps>,
    queues: Arc<DashMap<String, Arc<AccountQueue>>>,
    workers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    semaphore: Arc<Semaphore>,
    seq: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    global_exhausted: Arc<AtomicBool>,
    signal: std::sync::Mutex<Option<RunSignal>>,
}

impl Executor {
    pub fn new(deps: ExecutorDeps, max_workers: usize) -> Self {
        Self {
            deps: Arc::new(deps),
            queues: Arc::new(DashMap::new()),
            workers: std::sync::Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            seq: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            global_exhausted: Arc::new(AtomicBool::new(false)),
            signal: std::sync::Mutex::new(None),
        }
    }

    /// Begin a run: remember the signal and spawn workers for every queue
    /// that already holds items.
    pub fn start(&self, signal: RunSignal) {
        *self.signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(signal);
        let accounts: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        for account_id in accounts {
            self.ensure_worker(&account_id);
        }
    }

    /// Forget the current run signal. Workers exit on their own once the
    /// signal is halted; queued items stay put for the next run.
    pub fn stop(&self) {
        *self.signal.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn current_signal(&self) -> Option<RunSignal> {
        self.signal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn queue(&self, account_id: &str) -> Arc<AccountQueue> {
        self.queues
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(AccountQueue::default()))
            .clone()
    }

    /// Add planned actions to their account queues, waking workers.
    pub fn enqueue(&self, actions: Vec<PlannedAction>) {
        let count = actions.len();
        for action in actions {
            let queue = self.queue(&action.account_id);
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let due = action.scheduled_at;
            queue.push(QueuedItem { due, seq, action });
        }
        if count > 0 {
            let accounts: Vec<String> =
                self.queues.iter().map(|entry| entry.key().clone()).collect();
            for account_id in accounts {
                self.ensure_worker(&account_id);
            }
            debug!(actions = count, "actions enqueued");
        }
    }

    fn ensure_worker(&self, account_id: &str) {
        let Some(signal) = self.current_signal() else {
            return;
        };
        if signal.is_halted() {
            return;
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = workers.get(account_id) {
            if !handle.is_finished() {
                return;
            }
        }
        let ctx = WorkerCtx {
            account_id: account_id.to_string(),
            queue: self.queue(account_id),
            deps: self.deps.clone(),
            semaphore: self.semaphore.clone(),
            in_flight: self.in_flight.clone(),
            global_exhausted: self.global_exhausted.clone(),
            signal,
        };
        let handle = tokio::spawn(worker_loop(ctx));
        workers.insert(account_id.to_string(), handle);
    }

    /// Drop every queued item for an account, with a receipt per item.
    pub async fn drop_account(&self, account_id: &str, error_class: &str) {
        if let Some((_, queue)) = self.queues.remove(account_id) {
            drain_with_receipts(
                &queue,
                &self.deps,
                ReceiptStatus::Cancelled,
                Some(error_class),
            )
            .await;
        }
        if let Some(handle) = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(account_id)
        {
            handle.abort();
        }
    }

    /// Clear the drain-everything flag once budget is available again
    /// (a new pack, or the daily reset).
    pub fn reset_global_exhausted(&self) {
        if !self.deps.quota.budget_exhausted() {
            self.global_exhausted.store(false, Ordering::Release);
        }
    }

    pub fn queue_sizes(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

struct WorkerCtx {
    account_id: String,
    queue: Arc<AccountQueue>,
    deps: Arc<ExecutorDeps>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    global_exhausted: Arc<AtomicBool>,
    signal: RunSignal,
}

async fn worker_loop(ctx: WorkerCtx) {
    debug!(account_id = %ctx.account_id, "worker started");
    loop {
        if ctx.signal.is_halted() {
            break;
        }
        if ctx.global_exhausted.load(Ordering::Acquire) {
            drain_with_receipts(
                &ctx.queue,
                &ctx.deps,
                ReceiptStatus::QuotaBlocked,
                Some("budget exhausted"),
            )
            .await;
        }

        let Some(due) = ctx.queue.next_due() else {
            tokio::select! {
                _ = ctx.queue.notify.notified() => {}
                _ = ctx.signal.halted() => break,
            }
            continue;
        };

        let now = Utc::now();
        if due > now {
            let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                // A new, earlier item arrived: re-evaluate.
                _ = ctx.queue.notify.notified() => continue,
                _ = ctx.signal.halted() => break,
            }
        }

        let Some(item) = ctx.queue.pop_due(Utc::now()) else {
            continue;
        };
        // Halt observed after popping: keep the item for the next run.
        if ctx.signal.is_halted() {
            ctx.queue.push(item);
            break;
        }

        let Ok(_permit) = ctx.semaphore.acquire().await else {
            break;
        };
        // Kept aside so a panicking iteration still gets a receipt.
        let action = item.action;
        let attempted = action.clone();
        ctx.in_flight.fetch_add(1, Ordering::AcqRel);
        let outcome = std::panic::AssertUnwindSafe(process(&ctx, action))
            .catch_unwind()
            .await;
        ctx.in_flight.fetch_sub(1, Ordering::AcqRel);

        if outcome.is_err() {
            error!(
                account_id = %ctx.account_id,
                post_id = %attempted.post_id,
                kind = %attempted.kind,
                "worker iteration panicked"
            );
            emit(
                &ctx.deps,
                receipt_for(&attempted, ReceiptStatus::Fatal).with_error_class("panic"),
            )
            .await;
        }
    }
    debug!(account_id = %ctx.account_id, "worker stopped");
}

/// One dispatch attempt for one action. Terminal paths write a receipt;
/// non-terminal paths requeue.
async fn process(ctx: &WorkerCtx, action: PlannedAction) {
    let deps = &ctx.deps;
    let now = Utc::now();

    // Mute re-check: push past the window rather than dropping.
    if let Some(record) = deps.mutes.active(&action.account_id, now) {
        let jitter = rand::thread_rng().gen_range(0..=MUTE_RESCHEDULE_JITTER_SECS);
        let due = record.until + ChronoDuration::seconds(jitter as i64);
        debug!(
            account_id = %action.account_id,
            post_id = %action.post_id,
            until = %due,
            "account muted, rescheduling"
        );
        requeue_at(ctx, action, due);
        return;
    }

    // Idempotency re-check.
    if deps
        .idempotency
        .contains(&action.post_id, &action.account_id, action.kind)
    {
        emit(
            deps,
            receipt_for(&action, ReceiptStatus::Duplicate).with_error_class("already_performed"),
        )
        .await;
        return;
    }

    // Charge quota and journal the intent.
    if let Err(QuotaError::Exceeded(reason)) =
        deps.quota
            .begin(&action.post_id, &action.account_id, action.kind, now)
    {
        emit(
            deps,
            receipt_for(&action, ReceiptStatus::QuotaBlocked).with_error_class(reason.to_string()),
        )
        .await;
        if matches!(reason, DenyReason::GlobalExhausted | DenyReason::DailyExhausted) {
            info!(reason = %reason, "budget exhausted, draining queues");
            ctx.global_exhausted.store(true, Ordering::Release);
            drain_with_receipts(
                &ctx.queue,
                deps,
                ReceiptStatus::QuotaBlocked,
                Some(&reason.to_string()),
            )
            .await;
        }
        return;
    }

    // The intent must be durable before the call leaves the process.
    if let Err(e) = flush_quota(deps).await {
        warn!(error = %e, "pending-intent flush failed, backing off");
        deps.quota
            .revert(&action.post_id, &action.account_id, action.kind);
        let due = Utc::now() + ChronoDuration::seconds(5);
        requeue_at(ctx, action, due);
        return;
    }

    dispatch(ctx, action).await;
}

/// Steps 5–7: client acquisition, the API call with watchdog timeout, and
/// outcome handling, with a single inline refresh-and-retry on 401.
async fn dispatch(ctx: &WorkerCtx, action: PlannedAction) {
    let deps = &ctx.deps;
    let mut refreshed = false;

    let mut client = match deps.clients.client_for(&action.account_id).await {
        Ok(client) => client,
        Err(e) => {
            warn!(account_id = %action.account_id, error = %e, "no client for account");
            deps.quota
                .revert(&action.post_id, &action.account_id, action.kind);
            emit(
                deps,
                receipt_for(&action, ReceiptStatus::AuthFailed).with_error_class("auth_fatal"),
            )
            .await;
            mark_unreachable(ctx, &action.account_id).await;
            return;
        }
    };

    loop {
        let call = execute_call(client.as_ref(), &action);
        let result = match tokio::time::timeout(deps.action_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    account_id = %action.account_id,
                    post_id = %action.post_id,
                    timeout_secs = deps.action_timeout.as_secs(),
                    "action watchdog fired"
                );
                Err(ApiError::Timeout)
            }
        };

        match result {
            Ok((rate, done)) => {
                deps.rate.observe(&action.account_id, &rate);
                let now = Utc::now();
                if done {
                    deps.rate.note_action(&action.account_id, now);
                    deps.idempotency
                        .record(&action.post_id, &action.account_id, action.kind, now);
                    deps.quota
                        .settle(&action.post_id, &action.account_id, action.kind);
                    emit(deps, receipt_for(&action, ReceiptStatus::Ok)).await;
                    info!(
                        account_id = %action.account_id,
                        post_id = %action.post_id,
                        kind = %action.kind,
                        "action executed"
                    );
                } else {
                    // The provider reports a no-op: someone already did it.
                    deps.quota
                        .revert(&action.post_id, &action.account_id, action.kind);
                    deps.idempotency
                        .record(&action.post_id, &action.account_id, action.kind, now);
                    emit(
                        deps,
                        receipt_for(&action, ReceiptStatus::Duplicate)
                            .with_error_class("already_performed"),
                    )
                    .await;
                }
                return;
            }
            Err(api_error) => {
                if let ApiError::Status { rate, .. } = &api_error {
                    deps.rate.observe(&action.account_id, rate);
                }
                match classify(&api_error, action.attempt_count, refreshed, Utc::now()) {
                    ErrorClass::Duplicate => {
                        deps.quota
                            .revert(&action.post_id, &action.account_id, action.kind);
                        deps.idempotency.record(
                            &action.post_id,
                            &action.account_id,
                            action.kind,
                            Utc::now(),
                        );
                        emit(
                            deps,
                            receipt_for(&action, ReceiptStatus::Duplicate)
                                .with_error_class("already_performed"),
                        )
                        .await;
                        return;
                    }
                    ErrorClass::RateLimited { mute, day_window } => {
                        deps.quota
                            .revert(&action.post_id, &action.account_id, action.kind);
                        let reason = if day_window {
                            MuteReason::RateLimit24h
                        } else {
                            MuteReason::RateLimitShort
                        };
                        let until =
                            deps.mutes
                                .mute(&action.account_id, mute, reason, Utc::now());
                        let jitter =
                            rand::thread_rng().gen_range(0..=MUTE_RESCHEDULE_JITTER_SECS);
                        requeue_at(ctx, action, until + ChronoDuration::seconds(jitter as i64));
                        return;
                    }
                    ErrorClass::AuthExpired => {
                        match deps.clients.refresh_client(&ctx.account_id).await {
                            Ok(fresh) => {
                                refreshed = true;
                                client = fresh;
                                continue;
                            }
                            Err(e) if e.is_reauth_required() => {
                                warn!(account_id = %ctx.account_id, error = %e, "refresh secret rejected");
                                auth_fatal(ctx, action).await;
                                return;
                            }
                            Err(e) => {
                                // The exchange itself hiccuped; try the
                                // whole action again later.
                                warn!(account_id = %ctx.account_id, error = %e, "refresh after 401 failed");
                                deps.quota.revert(
                                    &action.post_id,
                                    &action.account_id,
                                    action.kind,
                                );
                                let mut retry = action;
                                retry.attempt_count += 1;
                                let due = Utc::now() + ChronoDuration::seconds(30);
                                requeue_at(ctx, retry, due);
                                return;
                            }
                        }
                    }
                    ErrorClass::AuthFatal => {
                        auth_fatal(ctx, action).await;
                        return;
                    }
                    ErrorClass::Retryable { backoff } => {
                        deps.quota
                            .revert(&action.post_id, &action.account_id, action.kind);
                        let mut retry = action;
                        retry.attempt_count += 1;
                        let due = Utc::now()
                            + ChronoDuration::from_std(backoff)
                                .unwrap_or_else(|_| ChronoDuration::seconds(60));
                        debug!(
                            account_id = %retry.account_id,
                            post_id = %retry.post_id,
                            attempt = retry.attempt_count,
                            backoff_secs = backoff.as_secs(),
                            "retryable failure, requeued"
                        );
                        requeue_at(ctx, retry, due);
                        return;
                    }
                    ErrorClass::Fatal { detail } => {
                        deps.quota
                            .revert(&action.post_id, &action.account_id, action.kind);
                        emit(
                            deps,
                            receipt_for(&action, ReceiptStatus::Fatal).with_error_class(detail),
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }
}

/// Issue the platform call for this action kind.
async fn execute_call(
    client: &dyn PlatformApi,
    action: &PlannedAction,
) -> Result<(RateLimitInfo, bool), ApiError> {
    match action.kind {
        ActionKind::Like => {
            let response = client.like(&action.account_id, &action.post_id).await?;
            Ok((response.rate, response.body.done))
        }
        ActionKind::Repost => {
            let response = client.repost(&action.account_id, &action.post_id).await?;
            Ok((response.rate, response.body.done))
        }
        ActionKind::Reply => {
            let Some(text) = action.reply_text.as_deref() else {
                return Err(ApiError::Parse("reply action without bound text".into()));
            };
            let response = client
                .reply(text, &action.post_id, action.media_id.as_deref())
                .await?;
            Ok((response.rate, true))
        }
    }
}

async fn auth_fatal(ctx: &WorkerCtx, action: PlannedAction) {
    let deps = &ctx.deps;
    deps.quota
        .revert(&action.post_id, &action.account_id, action.kind);
    emit(
        deps,
        receipt_for(&action, ReceiptStatus::AuthFailed).with_error_class("auth_fatal"),
    )
    .await;
    mark_unreachable(ctx, &action.account_id).await;
}

/// Flag the account for reconnection and flush its queue.
async fn mark_unreachable(ctx: &WorkerCtx, account_id: &str) {
    if let Err(e) = ctx.deps.credentials.mark_requires_reconnection(account_id).await {
        warn!(account_id, error = %e, "could not mark account for reconnection");
    }
    ctx.deps.clients.invalidate(account_id);
    drain_with_receipts(
        &ctx.queue,
        &ctx.deps,
        ReceiptStatus::Cancelled,
        Some("auth_fatal"),
    )
    .await;
}

fn requeue_at(ctx: &WorkerCtx, action: PlannedAction, due: DateTime<Utc>) {
    // Sequence numbers keep growing, so a rescheduled item sorts after
    // anything already waiting at the same instant.
    static RESEQ: AtomicU64 = AtomicU64::new(1 << 32);
    let seq = RESEQ.fetch_add(1, Ordering::Relaxed);
    ctx.queue.push(QueuedItem { due, seq, action });
}

async fn drain_with_receipts(
    queue: &AccountQueue,
    deps: &ExecutorDeps,
    status: ReceiptStatus,
    error_class: Option<&str>,
) {
    let items = queue.drain();
    if items.is_empty() {
        return;
    }
    info!(count = items.len(), status = ?status, "draining account queue");
    for item in items {
        let mut receipt = receipt_for(&item.action, status);
        if let Some(class) = error_class {
            receipt = receipt.with_error_class(class);
        }
        emit(deps, receipt).await;
    }
}

fn receipt_for(action: &PlannedAction, status: ReceiptStatus) -> ActionReceipt {
    ActionReceipt::new(&action.post_id, &action.account_id, action.kind, status)
}

async fn emit(deps: &ExecutorDeps, receipt: ActionReceipt) {
    if let Err(e) = deps.receipts.append(&receipt).await {
        error!(error = %e, "receipt append failed");
    }
}

async fn flush_quota(deps: &ExecutorDeps) -> Result<(), fw_core::store::StoreError> {
    deps.quota.take_dirty();
    store::write_json_atomic(&deps.quota_path, &deps.quota.to_persist()).await
}
