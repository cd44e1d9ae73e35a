//! The tick loop: scan → plan → schedule, plus run lifecycle.
//!
//! `enable` starts a run with an immediate first tick; `disable` halts the
//! run signal, which stops new scans and wakes sleeping workers so they can
//! park. Queued actions survive across runs.

use crate::executor::Executor;
use crate::planner::{self, PlannerContext};
use crate::scanner::{ScanError, Scanner};
use crate::shutdown::RunSignal;
use chrono::{DateTime, Utc};
use fw_client::factory::ClientProvider;
use fw_client::reply::{ImagePolicy, ReplyTextProvider, StyleConfig};
use fw_core::config::ScheduleConfig;
use fw_core::credentials::CredentialStore;
use fw_core::idempotency::IdempotencyLedger;
use fw_core::mutes::MuteRegistry;
use fw_core::quota::QuotaLedger;
use fw_core::watchlist::WatchList;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::scanner::CHUNK_SIZE;

/// Where the supervisor currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scanning,
    Actioning,
}

/// Control-surface view of the engine.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub enabled: bool,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub in_flight: usize,
    pub queue_sizes_by_account: BTreeMap<String, usize>,
}

pub struct SupervisorDeps {
    pub credentials: Arc<CredentialStore>,
    pub quota: Arc<QuotaLedger>,
    pub idempotency: Arc<IdempotencyLedger>,
    pub mutes: Arc<MuteRegistry>,
    pub watchlist: Arc<WatchList>,
    pub scanner: Arc<Scanner>,
    pub executor: Arc<Executor>,
    pub clients: Arc<dyn ClientProvider>,
    pub reply_provider: Arc<dyn ReplyTextProvider>,
    pub image_policy: ImagePolicy,
    pub style: StyleConfig,
    pub schedule: ScheduleConfig,
    /// Proactive token refresh window, minutes before expiry.
    pub refresh_window_mins: u64,
}

struct Run {
    signal: RunSignal,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    deps: Arc<SupervisorDeps>,
    enabled: AtomicBool,
    run: std::sync::Mutex<Option<Run>>,
    last_tick: std::sync::Mutex<Option<DateTime<Utc>>>,
    phase: std::sync::Mutex<Phase>,
    first_scan_done: AtomicBool,
}

impl Supervisor {
    pub fn new(deps: SupervisorDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            enabled: AtomicBool::new(false),
            run: std::sync::Mutex::new(None),
            last_tick: std::sync::Mutex::new(None),
            phase: std::sync::Mutex::new(Phase::Idle),
            first_scan_done: AtomicBool::new(false),
        }
    }

    /// Start automation. Idempotent; the first tick fires immediately.
    pub fn enable(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        let signal = RunSignal::new();
        self.deps.executor.start(signal.clone());

        let this = self.clone();
        let loop_signal = signal.clone();
        let handle = tokio::spawn(async move {
            let poll = Duration::from_secs(this.deps.schedule.poll_interval_secs.max(1));
            let mut interval = tokio::time::interval(poll);
            // The interval's first tick is immediate; it backs the first
            // scan, and every later iteration waits a full period.
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = loop_signal.halted() => break,
                }
                if loop_signal.is_halted() {
                    break;
                }
                this.tick(&loop_signal).await;
            }
            info!("supervisor loop stopped");
        });

        *self.run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Run { signal, handle });
        info!("automation enabled");
    }

    /// Stop automation. In-flight actions finish; sleeping workers wake and
    /// park; queues are kept.
    pub fn disable(&self) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(run) = self.run.lock().unwrap_or_else(|e| e.into_inner()).take() {
            run.signal.halt();
            run.handle.abort();
        }
        self.deps.executor.stop();
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = Phase::Idle;
        info!("automation disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            enabled: self.is_enabled(),
            last_tick_at: *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()),
            in_flight: self.deps.executor.in_flight(),
            queue_sizes_by_account: self.deps.executor.queue_sizes(),
        }
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Stamp the tick, whatever its outcome. `status()` must reflect that
    /// the supervisor is alive even when a cycle bails out early.
    fn record_tick(&self, now: DateTime<Utc>) {
        *self.last_tick.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    /// One scan → plan → schedule cycle.
    pub async fn tick(&self, signal: &RunSignal) {
        let deps = &self.deps;
        let now = Utc::now();

        deps.quota.reset_if_new_day(now);
        deps.mutes.prune(now);
        deps.executor.reset_global_exhausted();

        let accounts = deps.credentials.list().await;
        let active: Vec<_> = accounts.iter().filter(|a| a.is_active()).cloned().collect();
        deps.quota.recompute_allocation(
            &active
                .iter()
                .map(|a| (a.id.clone(), a.added_at))
                .collect::<Vec<_>>(),
        );

        // Proactive token refresh for accounts near expiry. The factory
        // performs the actual exchange while building the client.
        let window = chrono::Duration::minutes(deps.refresh_window_mins as i64);
        for account_id in deps.credentials.expiring_within(window, now).await {
            if signal.is_halted() {
                self.record_tick(now);
                return;
            }
            if let Err(e) = deps.clients.client_for(&account_id).await {
                warn!(account_id = %account_id, error = %e, "proactive refresh failed");
                // A dead refresh secret flags the account; flush its queue.
                if !deps
                    .credentials
                    .get(&account_id)
                    .await
                    .map(|a| a.is_active())
                    .unwrap_or(false)
                {
                    deps.executor.drop_account(&account_id, "auth_fatal").await;
                }
            }
        }

        if deps.watchlist.is_empty() {
            info!("watch-list empty, nothing to scan");
            self.record_tick(now);
            return;
        }
        if active.is_empty() {
            warn!("no active accounts, skipping tick");
            self.record_tick(now);
            return;
        }

        // Scan, bounded by the first-scan or periodic timeout.
        self.set_phase(Phase::Scanning);
        let scan_timeout = if self.first_scan_done.load(Ordering::Acquire) {
            Duration::from_secs(deps.schedule.scan_timeout_secs)
        } else {
            Duration::from_secs(deps.schedule.first_scan_timeout_secs)
        };
        let chunks = deps.watchlist.chunks(CHUNK_SIZE);
        let scan = tokio::time::timeout(
            scan_timeout,
            deps.scanner.scan(
                &chunks,
                &active,
                deps.clients.as_ref(),
                &deps.idempotency,
                signal,
            ),
        )
        .await;
        self.first_scan_done.store(true, Ordering::Release);

        let scanned = match scan {
            Ok(Ok((posts, _metrics))) => posts,
            Ok(Err(ScanError::NoScanAccount)) => {
                warn!("scan skipped: no usable scanning account");
                self.set_phase(Phase::Idle);
                self.record_tick(now);
                return;
            }
            Err(_) => {
                warn!(timeout_secs = scan_timeout.as_secs(), "scan timed out");
                self.set_phase(Phase::Idle);
                self.record_tick(now);
                return;
            }
        };

        if signal.is_halted() {
            self.set_phase(Phase::Idle);
            self.record_tick(now);
            return;
        }

        // Plan and hand over to the account queues.
        self.set_phase(Phase::Actioning);
        let ctx = PlannerContext {
            quota: deps.quota.as_ref(),
            idempotency: deps.idempotency.as_ref(),
            mutes: deps.mutes.as_ref(),
            reply_provider: deps.reply_provider.as_ref(),
            image_policy: &deps.image_policy,
            style: deps.style.clone(),
            min_delay_secs: deps.schedule.min_delay_secs,
            max_delay_secs: deps.schedule.max_delay_secs,
        };
        let actions = planner::plan(&scanned, &active, &ctx, Utc::now()).await;
        deps.executor.enqueue(actions);

        self.record_tick(now);
        self.set_phase(Phase::Idle);
    }

    /// Disable, then wait for in-flight actions to land, up to `deadline`.
    pub async fn drain(&self, deadline: Duration) {
        self.disable();
        let start = tokio::time::Instant::now();
        while self.deps.executor.in_flight() > 0 {
            if start.elapsed() >= deadline {
                warn!(
                    in_flight = self.deps.executor.in_flight(),
                    "drain deadline reached with actions still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
