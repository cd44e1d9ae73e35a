//! The `AutomationEngine`: construction, startup recovery, the persistence
//! flusher, and the in-process control surface the host calls.

use crate::executor::{Executor, ExecutorDeps};
use crate::scanner::{ScanState, Scanner};
use crate::shutdown::RunSignal;
use crate::supervisor::{EngineStatus, Supervisor, SupervisorDeps};
use chrono::Utc;
use fw_client::factory::{ClientFactory, ClientProvider};
use fw_client::oauth::OAuthRefresher;
use fw_client::ratelimit::RateLimitTracker;
use fw_client::reply::{
    DisabledReplyProvider, HttpReplyProvider, ImagePolicy, ReplyTextProvider, StyleConfig,
};
use fw_core::config::Config;
use fw_core::credentials::{CredentialError, CredentialStore};
use fw_core::crypto::BlobKey;
use fw_core::idempotency::{IdempotencyLedger, IdempotencyMap};
use fw_core::mutes::MuteRegistry;
use fw_core::paths::DataPaths;
use fw_core::quota::{KindWeights, QuotaLedger, QuotaState};
use fw_core::receipts::{ReceiptFilter, ReceiptLog};
use fw_core::store::{self, StoreError};
use fw_core::types::{Account, ActionReceipt, MuteRecord, QuotaSnapshot};
use fw_core::watchlist::WatchList;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Flush cadence for dirty ledgers.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("initialization failed: {0}")]
    Init(String),
}

pub struct AutomationEngine {
    paths: DataPaths,
    credentials: Arc<CredentialStore>,
    quota: Arc<QuotaLedger>,
    idempotency: Arc<IdempotencyLedger>,
    mutes: Arc<MuteRegistry>,
    receipts: Arc<ReceiptLog>,
    watchlist: Arc<WatchList>,
    scanner: Arc<Scanner>,
    executor: Arc<Executor>,
    supervisor: Arc<Supervisor>,
    drain_deadline: Duration,
    flusher_signal: RunSignal,
    flusher: JoinHandle<()>,
}

impl AutomationEngine {
    /// Open the engine against the real platform: OAuth refresher, REST
    /// client factory, and the configured reply endpoint.
    pub async fn open(config: Config, key: BlobKey) -> Result<Self, EngineError> {
        let paths = DataPaths::new(config.data_dir());
        let credentials = Arc::new(CredentialStore::open(paths.credentials(), key).await?);

        let refresher = Arc::new(
            OAuthRefresher::new(
                &config.api.token_url,
                Duration::from_secs(config.api.timeout_secs),
            )
            .map_err(|e| EngineError::Init(e.to_string()))?,
        );
        let clients: Arc<dyn ClientProvider> = Arc::new(ClientFactory::new(
            credentials.clone(),
            refresher,
            &config.api.base_url,
            Duration::from_secs(config.api.timeout_secs),
            Duration::from_secs(config.api.client_cache_ttl_secs),
            chrono::Duration::minutes(config.api.refresh_window_mins as i64),
        ));

        let reply_provider: Arc<dyn ReplyTextProvider> = if config.reply.endpoint.is_empty() {
            Arc::new(DisabledReplyProvider)
        } else {
            Arc::new(
                HttpReplyProvider::new(
                    &config.reply.endpoint,
                    config.reply.api_key.clone(),
                    Duration::from_secs(config.api.timeout_secs),
                )
                .map_err(|e| EngineError::Init(e.to_string()))?,
            )
        };

        Self::assemble(config, paths, credentials, clients, reply_provider).await
    }

    /// Open the engine with injected platform and reply providers. This is
    /// the seam the integration tests run through.
    pub async fn with_providers(
        config: Config,
        key: BlobKey,
        clients: Arc<dyn ClientProvider>,
        reply_provider: Arc<dyn ReplyTextProvider>,
    ) -> Result<Self, EngineError> {
        let paths = DataPaths::new(config.data_dir());
        let credentials = Arc::new(CredentialStore::open(paths.credentials(), key).await?);
        Self::assemble(config, paths, credentials, clients, reply_provider).await
    }

    async fn assemble(
        config: Config,
        paths: DataPaths,
        credentials: Arc<CredentialStore>,
        clients: Arc<dyn ClientProvider>,
        reply_provider: Arc<dyn ReplyTextProvider>,
    ) -> Result<Self, EngineError> {
        tokio::fs::create_dir_all(paths.root()).await.map_err(StoreError::from)?;

        // Receipt log first: its recovery must happen before anything else
        // reads it, and the reconcile pass below depends on the ledgers.
        let receipts = Arc::new(ReceiptLog::open(paths.receipts()).await?);

        let idempotency = Arc::new(IdempotencyLedger::new(
            store::read_json::<IdempotencyMap>(&paths.idempotency()).await?,
        ));

        let quota = Arc::new(QuotaLedger::new(
            config.quota.pack_total,
            config.quota.daily_limit,
            KindWeights {
                like_pct: config.quota.like_pct,
                repost_pct: config.quota.repost_pct,
                reply_pct: config.quota.reply_pct,
            },
            store::read_json::<QuotaState>(&paths.quota()).await?,
        ));

        // Crash recovery: charges journaled before a dispatch that never
        // produced an idempotency record are returned to the budget.
        {
            let idempotency = idempotency.clone();
            quota.reconcile_pending(move |intent| {
                idempotency.contains(&intent.post_id, &intent.account_id, intent.kind)
            });
        }
        quota.reset_if_new_day(Utc::now());

        let mutes = Arc::new(MuteRegistry::new(
            store::read_json::<HashMap<String, MuteRecord>>(&paths.mutes()).await?,
        ));
        let watchlist = Arc::new(WatchList::new(
            store::read_json::<Vec<String>>(&paths.watchlist()).await?,
        ));
        let scanner = Arc::new(Scanner::new(
            store::read_json::<ScanState>(&paths.scan_state()).await?,
        ));
        let rate = Arc::new(RateLimitTracker::new());

        let executor = Arc::new(Executor::new(
            ExecutorDeps {
                quota: quota.clone(),
                idempotency: idempotency.clone(),
                mutes: mutes.clone(),
                receipts: receipts.clone(),
                clients: clients.clone(),
                credentials: credentials.clone(),
                rate: rate.clone(),
                quota_path: paths.quota(),
                action_timeout: Duration::from_secs(config.schedule.action_timeout_secs),
            },
            config.schedule.max_workers,
        ));

        let image_policy = if config.reply.images_enabled {
            ImagePolicy {
                enabled: true,
                probability: config.reply.image_probability,
                dir: paths.reply_images(),
            }
        } else {
            ImagePolicy::disabled()
        };

        let supervisor = Arc::new(Supervisor::new(SupervisorDeps {
            credentials: credentials.clone(),
            quota: quota.clone(),
            idempotency: idempotency.clone(),
            mutes: mutes.clone(),
            watchlist: watchlist.clone(),
            scanner: scanner.clone(),
            executor: executor.clone(),
            clients,
            reply_provider,
            image_policy,
            style: StyleConfig {
                style: config.reply.style.clone(),
                max_len: config.reply.max_len,
            },
            schedule: config.schedule.clone(),
            refresh_window_mins: config.api.refresh_window_mins,
        }));

        // Debounced write-behind for every dirty ledger.
        let flusher_signal = RunSignal::new();
        let flusher = spawn_flusher(
            flusher_signal.clone(),
            paths.clone(),
            quota.clone(),
            idempotency.clone(),
            mutes.clone(),
            watchlist.clone(),
            scanner.clone(),
        );

        info!(data_dir = %paths.root().display(), "automation engine ready");
        Ok(Self {
            paths,
            credentials,
            quota,
            idempotency,
            mutes,
            receipts,
            watchlist,
            scanner,
            executor,
            supervisor,
            drain_deadline: Duration::from_secs(config.schedule.drain_deadline_secs),
            flusher_signal,
            flusher,
        })
    }

    // -- control surface ----------------------------------------------------

    pub fn enable(&self) {
        self.supervisor.enable();
    }

    pub fn disable(&self) {
        self.supervisor.disable();
    }

    pub fn status(&self) -> EngineStatus {
        self.supervisor.status()
    }

    pub fn set_watchlist(&self, handles: &[String]) {
        self.watchlist.set(handles);
        info!(handles = self.watchlist.snapshot().len(), "watch-list updated");
    }

    pub fn watchlist(&self) -> Vec<String> {
        self.watchlist.snapshot()
    }

    /// Register an account. It joins allocation at the next tick boundary.
    pub async fn add_account(&self, account: Account) -> Result<(), EngineError> {
        self.credentials.upsert(account).await?;
        Ok(())
    }

    /// Remove an account: its queue drains with cancellation receipts and
    /// its credential material is deleted.
    pub async fn remove_account(&self, account_id: &str) -> Result<(), EngineError> {
        self.executor.drop_account(account_id, "account_removed").await;
        self.credentials.remove(account_id).await?;
        Ok(())
    }

    pub fn snapshot_quota(&self) -> QuotaSnapshot {
        self.quota.snapshot()
    }

    pub async fn export_receipts(
        &self,
        filter: &ReceiptFilter,
    ) -> Result<Vec<ActionReceipt>, EngineError> {
        Ok(self.receipts.export(filter).await?)
    }

    /// Receipt totals keyed by outcome class.
    pub async fn receipt_counts(&self) -> Result<std::collections::BTreeMap<String, u64>, EngineError> {
        Ok(self.receipts.counts_by_status().await?)
    }

    /// Admin reset of the idempotency ledger.
    pub fn reset_idempotency(&self) {
        self.idempotency.reset();
    }

    /// Graceful shutdown: stop ticking, drain in-flight work up to the
    /// configured deadline, stop the flusher, and persist everything.
    pub async fn shutdown(&self) {
        self.supervisor.drain(self.drain_deadline).await;
        self.flusher_signal.halt();
        if let Err(e) = self.flush_all().await {
            error!(error = %e, "final ledger flush failed");
        }
        info!("automation engine stopped");
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.quota.take_dirty();
        store::write_json_atomic(&self.paths.quota(), &self.quota.to_persist()).await?;
        self.idempotency.take_dirty();
        store::write_json_atomic(&self.paths.idempotency(), &self.idempotency.to_persist()).await?;
        self.mutes.take_dirty();
        store::write_json_atomic(&self.paths.mutes(), &self.mutes.to_persist()).await?;
        self.watchlist.take_dirty();
        store::write_json_atomic(&self.paths.watchlist(), &self.watchlist.to_persist()).await?;
        self.scanner.take_dirty();
        store::write_json_atomic(&self.paths.scan_state(), &self.scanner.to_persist()).await?;
        Ok(())
    }
}

impl Drop for AutomationEngine {
    fn drop(&mut self) {
        self.flusher_signal.halt();
        self.flusher.abort();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_flusher(
    signal: RunSignal,
    paths: DataPaths,
    quota: Arc<QuotaLedger>,
    idempotency: Arc<IdempotencyLedger>,
    mutes: Arc<MuteRegistry>,
    watchlist: Arc<WatchList>,
    scanner: Arc<Scanner>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = signal.halted() => break,
            }
            flush_dirty(&paths, &quota, &idempotency, &mutes, &watchlist, &scanner).await;
        }
    })
}

async fn flush_dirty(
    paths: &DataPaths,
    quota: &QuotaLedger,
    idempotency: &IdempotencyLedger,
    mutes: &MuteRegistry,
    watchlist: &WatchList,
    scanner: &Scanner,
) {
    if quota.take_dirty() {
        if let Err(e) = store::write_json_atomic(&paths.quota(), &quota.to_persist()).await {
            error!(error = %e, "quota flush failed");
        }
    }
    if idempotency.take_dirty() {
        if let Err(e) =
            store::write_json_atomic(&paths.idempotency(), &idempotency.to_persist()).await
        {
            error!(error = %e, "idempotency flush failed");
        }
    }
    if mutes.take_dirty() {
        if let Err(e) = store::write_json_atomic(&paths.mutes(), &mutes.to_persist()).await {
            error!(error = %e, "mute flush failed");
        }
    }
    if watchlist.take_dirty() {
        if let Err(e) = store::write_json_atomic(&paths.watchlist(), &watchlist.to_persist()).await
        {
            error!(error = %e, "watch-list flush failed");
        }
    }
    if scanner.take_dirty() {
        if let Err(e) = store::write_json_atomic(&paths.scan_state(), &scanner.to_persist()).await {
            error!(error = %e, "scan-state flush failed");
        }
    }
}
