use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use super::errors::{FailureKind, SymbolFailure, SyncError};
use super::retry_set::{FailureEntry, RetrySet};
use crate::config::{PersistFailurePolicy, SyncConfig};
use crate::database::repositories::TradeRepository;
use crate::database::StorageError;
use crate::market::{
    normalize_trades, parse_symbols, trade_history_path, MarketClient, PayloadShape, SymbolInfo, SYMBOLS_PATH,
};

/// A symbol still failing after the last retry pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AbandonedSymbol {
    pub symbol: String,
    pub currency: String,
    pub url: String,
    pub kind: FailureKind,
    pub retries: u32,
    pub last_error: String,
}

impl From<FailureEntry> for AbandonedSymbol {
    fn from(entry: FailureEntry) -> Self {
        Self {
            symbol: entry.symbol,
            currency: entry.currency,
            url: entry.url,
            kind: entry.kind,
            retries: entry.retries,
            last_error: entry.last_error,
        }
    }
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Symbols listed by the exchange
    pub symbols: usize,

    /// Distinct symbols whose trades were fetched and parsed, first attempt or retry
    pub fetched: usize,

    pub documents_written: usize,

    /// Writes that failed (duplicate-only batches excluded)
    pub persist_failures: usize,

    /// Symbols stored by a retry pass
    pub recovered: usize,

    pub drain_passes: u32,
    pub abandoned: Vec<AbandonedSymbol>,
}

impl CycleReport {
    /// Every symbol was stored
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty() && self.persist_failures == 0
    }
}

/// State of one cycle, shared by reference with its per-symbol tasks
struct CycleContext {
    cycle_id: Uuid,
    started_at: DateTime<Utc>,
    retry_set: RetrySet,
    fetched: DashSet<String>,
    documents_written: AtomicUsize,
    persist_failures: AtomicUsize,
    recovered: AtomicUsize,
}

impl CycleContext {
    fn new() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            started_at: Utc::now(),
            retry_set: RetrySet::new(),
            fetched: DashSet::new(),
            documents_written: AtomicUsize::new(0),
            persist_failures: AtomicUsize::new(0),
            recovered: AtomicUsize::new(0),
        }
    }

    fn into_report(self, symbols: usize, drain_passes: u32, abandoned: Vec<AbandonedSymbol>) -> CycleReport {
        CycleReport {
            cycle_id: self.cycle_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            symbols,
            fetched: self.fetched.len(),
            documents_written: self.documents_written.into_inner(),
            persist_failures: self.persist_failures.into_inner(),
            recovered: self.recovered.into_inner(),
            drain_passes,
            abandoned,
        }
    }
}

/// Held while a cycle runs; releases the flag on drop
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Trade synchronization job
///
/// Each cycle lists every symbol, fetches its recent trades concurrently, writes
/// them to the symbol's currency database and then retries failed symbols with
/// backoff until they succeed or run out of attempts.
#[derive(Clone)]
pub struct TradeSyncJob {
    client: Arc<dyn MarketClient>,
    repository: Arc<dyn TradeRepository>,
    config: SyncConfig,
    running: Arc<AtomicBool>,
}

impl TradeSyncJob {
    /// Create a new trade sync job
    pub fn new(client: Arc<dyn MarketClient>, repository: Arc<dyn TradeRepository>, config: SyncConfig) -> Self {
        Self {
            client,
            repository,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A cycle is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one cycle unless another is in progress
    pub async fn try_run_cycle(&self) -> Result<CycleReport, SyncError> {
        let _guard = CycleGuard::acquire(&self.running).ok_or(SyncError::CycleInProgress)?;
        self.sync_trades().await
    }

    /// Scheduler entry point: run one cycle and log how it went
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        match self.try_run_cycle().await {
            Ok(report) => {
                tracing::info!(
                    "Sync cycle {} finished: {}/{} symbols fetched, {} documents written, {} recovered, {} abandoned",
                    report.cycle_id,
                    report.fetched,
                    report.symbols,
                    report.documents_written,
                    report.recovered,
                    report.abandoned.len()
                );
                Some(report)
            }
            Err(SyncError::CycleInProgress) => {
                tracing::warn!("Previous sync cycle still running, skipping this trigger");
                None
            }
            Err(e) => {
                tracing::error!("Sync cycle aborted: {}", e);
                None
            }
        }
    }

    /// Run a cycle immediately (manual trigger)
    pub async fn run_now(&self) -> Result<CycleReport, SyncError> {
        tracing::info!("Manual trade sync triggered");
        self.try_run_cycle().await
    }

    /// Register this job with the scheduler
    ///
    /// Schedule: every `interval_secs` seconds
    pub async fn register(&self, scheduler: &JobScheduler) -> Result<(), Box<dyn std::error::Error>> {
        let interval = self.config.interval();
        let job_state = Arc::new(self.clone());

        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let job_state = Arc::clone(&job_state);

            Box::pin(async move {
                tracing::debug!("Trade sync job triggered");
                job_state.run_cycle().await;
            })
        })?;

        scheduler.add(job).await?;

        tracing::info!("Trade sync job registered (runs every {}s)", interval.as_secs());

        Ok(())
    }

    async fn sync_trades(&self) -> Result<CycleReport, SyncError> {
        let ctx = CycleContext::new();
        tracing::info!("Starting trade synchronization cycle {}", ctx.cycle_id);

        let symbols = self.enumerate_symbols().await?;
        tracing::info!("{} symbols to synchronize", symbols.len());

        self.fetch_all(&ctx, &symbols).await;
        let (drain_passes, abandoned) = self.drain_retries(&ctx).await;

        Ok(ctx.into_report(symbols.len(), drain_passes, abandoned))
    }

    async fn enumerate_symbols(&self) -> Result<Vec<SymbolInfo>, SyncError> {
        let body = self.client.get(SYMBOLS_PATH).await.map_err(SyncError::Enumeration)?;
        parse_symbols(&body).map_err(SyncError::SymbolParse)
    }

    /// Fetch and store every symbol; returns once all of them resolved
    async fn fetch_all(&self, ctx: &CycleContext, symbols: &[SymbolInfo]) -> usize {
        let resolved = stream::iter(symbols.iter().cloned())
            .map(|info| self.sync_symbol(ctx, info))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<()>>()
            .await
            .len();

        tracing::debug!(
            "Fetch phase complete: {} symbols resolved, {} queued for retry",
            resolved,
            ctx.retry_set.len()
        );
        resolved
    }

    async fn sync_symbol(&self, ctx: &CycleContext, info: SymbolInfo) {
        let path = trade_history_path(&info.symbol, self.config.trade_history_size);
        let url = self.client.resolve(&path);

        let trades = match self.fetch_trades(&url, PayloadShape::Latest).await {
            Ok(trades) => trades,
            Err(failure) => {
                tracing::warn!("{}: {}", info.symbol, failure);
                ctx.retry_set.record(&info, &url, &failure);
                return;
            }
        };
        ctx.fetched.insert(info.symbol.clone());

        if let Err(e) = self.persist(ctx, &info, trades).await {
            match self.config.persist_failure_policy {
                PersistFailurePolicy::Ignore => {
                    tracing::error!("{}: failed to store trades: {}", info.symbol, e);
                }
                PersistFailurePolicy::Retry => {
                    tracing::warn!("{}: failed to store trades, queued for retry: {}", info.symbol, e);
                    ctx.retry_set.record(&info, &url, &SymbolFailure::Persist(e));
                }
            }
        }
    }

    /// Retry failed symbols pass by pass; returns the passes run and the symbols given up on
    async fn drain_retries(&self, ctx: &CycleContext) -> (u32, Vec<AbandonedSymbol>) {
        let max_attempts = self.config.retry.max_attempts;
        let mut passes = 0;

        loop {
            if ctx.retry_set.is_empty() {
                tracing::info!("Synchronize success!");
                return (passes, Vec::new());
            }

            if passes >= max_attempts {
                let abandoned: Vec<AbandonedSymbol> =
                    ctx.retry_set.drain().into_iter().map(AbandonedSymbol::from).collect();
                for entry in &abandoned {
                    tracing::warn!(
                        "{}: giving up after {} retries ({}): {}",
                        entry.symbol,
                        entry.retries,
                        entry.url,
                        entry.last_error
                    );
                }
                return (passes, abandoned);
            }

            passes += 1;
            let entries = ctx.retry_set.snapshot();
            let delay = self.retry_delay(passes);
            tracing::info!(
                "Retry pass {}/{}: {} symbols after {}ms",
                passes,
                max_attempts,
                entries.len(),
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;

            stream::iter(entries)
                .map(|entry| self.retry_symbol(ctx, entry))
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect::<Vec<()>>()
                .await;
        }
    }

    async fn retry_symbol(&self, ctx: &CycleContext, entry: FailureEntry) {
        let trades = match self.fetch_trades(&entry.url, PayloadShape::Retry).await {
            Ok(trades) => trades,
            Err(failure) => {
                let retries = ctx
                    .retry_set
                    .record_retry_failure(&entry.symbol, &failure)
                    .unwrap_or(entry.retries + 1);
                tracing::debug!("{}: retry {} failed: {}", entry.symbol, retries, failure);
                return;
            }
        };
        ctx.fetched.insert(entry.symbol.clone());

        let info = SymbolInfo::new(entry.symbol.as_str(), entry.currency.as_str());
        match self.persist(ctx, &info, trades).await {
            Ok(()) => {
                ctx.retry_set.remove(&entry.symbol);
                ctx.recovered.fetch_add(1, Ordering::Relaxed);
                tracing::info!("{}: recovered after {} failed retries", entry.symbol, entry.retries);
            }
            Err(e) => match self.config.persist_failure_policy {
                PersistFailurePolicy::Ignore => {
                    ctx.retry_set.remove(&entry.symbol);
                    tracing::error!("{}: failed to store retried trades: {}", entry.symbol, e);
                }
                PersistFailurePolicy::Retry => {
                    let failure = SymbolFailure::Persist(e);
                    let retries = ctx
                        .retry_set
                        .record_retry_failure(&entry.symbol, &failure)
                        .unwrap_or(entry.retries + 1);
                    tracing::debug!("{}: retry {} failed: {}", entry.symbol, retries, failure);
                }
            },
        }
    }

    async fn fetch_trades(&self, url: &str, shape: PayloadShape) -> Result<Vec<Value>, SymbolFailure> {
        let body = self.client.get(url).await?;
        Ok(normalize_trades(&body, shape)?)
    }

    async fn persist(
        &self,
        ctx: &CycleContext,
        info: &SymbolInfo,
        trades: Vec<Value>,
    ) -> Result<(), StorageError> {
        let received = trades.len();
        match self
            .repository
            .insert_trades(&info.quote_currency, &info.symbol, trades)
            .await
        {
            Ok(written) => {
                ctx.documents_written.fetch_add(written, Ordering::Relaxed);
                tracing::debug!("{}: {} of {} trades stored", info.symbol, written, received);
                Ok(())
            }
            Err(e) => {
                ctx.persist_failures.fetch_add(1, Ordering::Relaxed);
                ctx.documents_written.fetch_add(e.inserted(), Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Backoff before a retry pass, plus random jitter
    fn retry_delay(&self, pass: u32) -> Duration {
        let retry = &self.config.retry;
        let jitter = if retry.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=retry.jitter_ms)
        };
        retry.backoff(pass) + Duration::from_millis(jitter)
    }
}
