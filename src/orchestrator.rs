//! Scan run state machine.
//!
//! `PENDING -> INGESTING -> VALIDATING -> SELECTING -> SCORING -> COMMITTED`,
//! with `FAILED` reachable from every non-terminal state. Results are written
//! in one `commit_run` call; a run that fails before it writes nothing.

use crate::calendar::{Clock, TradingCalendar};
use crate::config::{parse_symbol_list, ScreenerSettings};
use crate::errors::{CalendarError, PipelineError};
use crate::ingestion::{unscannable_reason, SnapshotIngestionService};
use crate::market_data::{MarketBiasSource, MarketDataSource};
use crate::models::{
    AdminOverride, ExclusionReason, RunState, RunStatus, ScanResult, SnapshotRecord, StrategyKind,
};
use crate::retry::Sleeper;
use crate::run_status::{RunProgress, RunRegistry};
use crate::scoring::apply_market_bias;
use crate::snapshot_store::{sort_results, SnapshotStore};
use crate::strategy::{create_selectors, ScoredCandidate, StrategySelector};
use crate::validation::validate_chain;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    /// Replaces the configured universe for this run only.
    pub universe_override: Option<Vec<String>>,
    /// Re-ingests symbols whose snapshot is already final.
    pub admin_override: Option<AdminOverride>,
    /// Defaults to the most recent closed session.
    pub trading_day: Option<NaiveDate>,
}

/// Pure validate/select/score output for a set of snapshots.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub exclusions: Vec<(String, ExclusionReason)>,
    pub candidates: Vec<(StrategyKind, ScoredCandidate)>,
}

pub struct ScanOrchestrator {
    settings: Arc<ScreenerSettings>,
    calendar: Arc<TradingCalendar>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    store: Arc<dyn SnapshotStore>,
    ingestion: SnapshotIngestionService,
    selectors: Arc<Vec<Box<dyn StrategySelector>>>,
    bias: Option<Arc<dyn MarketBiasSource>>,
    registry: RunRegistry,
}

impl ScanOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Arc<ScreenerSettings>,
        calendar: Arc<TradingCalendar>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        source: Arc<dyn MarketDataSource>,
        store: Arc<dyn SnapshotStore>,
        bias: Option<Arc<dyn MarketBiasSource>>,
    ) -> Self {
        let ingestion = SnapshotIngestionService::new(
            source,
            Arc::clone(&store),
            Arc::clone(&calendar),
            Arc::clone(&clock),
            Arc::clone(&sleeper),
            settings.pricing.clone(),
            settings.ingestion.clone(),
        );
        let selectors = Arc::new(create_selectors(&settings));
        Self {
            settings,
            calendar,
            clock,
            sleeper,
            store,
            ingestion,
            selectors,
            bias,
            registry: RunRegistry::new(),
        }
    }

    pub fn ingestion(&self) -> &SnapshotIngestionService {
        &self.ingestion
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Runs one scan to a terminal state. Run-level failures come back as a
    /// `FAILED` status; `Err` means the run could not even be registered.
    pub async fn trigger_run(&self, request: TriggerRequest) -> Result<RunStatus> {
        let universe = match request.universe_override.as_ref() {
            Some(symbols) => parse_symbol_list(&symbols.join(",")),
            None => self.settings.universe.clone(),
        };
        let run_id = Uuid::new_v4().to_string();
        let started_at = self.clock.now();
        let status = RunStatus {
            run_id: run_id.clone(),
            state: RunState::Pending,
            trading_day: None,
            started_at,
            finished_at: None,
            symbols_requested: universe.len(),
            symbols_ingested: 0,
            symbols_excluded: 0,
            exclusion_breakdown: BTreeMap::new(),
            cc_count: 0,
            pmcc_count: 0,
            duration_seconds: 0.0,
            error: None,
        };
        self.store
            .save_run_status(&status)
            .await
            .with_context(|| format!("failed to register run {}", run_id))?;
        let progress = self.registry.register(status);
        info!(
            "Run {} started for {} symbols (profile {})",
            run_id,
            universe.len(),
            self.settings.profile.label()
        );

        let outcome = self.execute(&progress, &universe, &request).await;
        let final_status = match outcome {
            Ok(status) => status,
            Err(err) => self.fail_run(&progress, started_at, &err).await,
        };
        self.registry.finish(&run_id);
        Ok(final_status)
    }

    async fn execute(
        &self,
        progress: &RunProgress,
        universe: &[String],
        request: &TriggerRequest,
    ) -> Result<RunStatus> {
        let run_id = progress.snapshot().run_id;
        let trading_day = self.resolve_trading_day(request.trading_day)?;
        progress.update(|status| status.trading_day = Some(trading_day));

        self.advance(progress, RunState::Ingesting).await?;
        let ingested = self
            .ingestion
            .ingest_universe(
                universe,
                trading_day,
                request.admin_override.as_ref(),
                &run_id,
            )
            .await?;

        self.advance(progress, RunState::Validating).await?;
        let mut exclusions: Vec<(String, ExclusionReason)> = Vec::new();
        let mut records: Vec<SnapshotRecord> = Vec::new();
        let symbols_ingested = ingested
            .iter()
            .filter(|ingestion| ingestion.record().is_some())
            .count();
        for ingestion in ingested {
            match ingestion.exclusion() {
                Some(reason) => exclusions.push((ingestion.symbol.clone(), reason)),
                None => {
                    if let Some(record) = ingestion.record() {
                        records.push(record.clone());
                    }
                }
            }
        }
        let (validated, chain_exclusions) = self.validate_records(records);
        exclusions.extend(chain_exclusions);
        for (symbol, reason) in &exclusions {
            debug!("Run {}: excluded {} ({})", run_id, symbol, reason);
        }
        let breakdown = exclusion_breakdown(&exclusions);
        progress.set_ingestion(symbols_ingested, exclusions.len(), breakdown);

        self.advance(progress, RunState::Selecting).await?;
        let selectors = Arc::clone(&self.selectors);
        let candidates = tokio::task::spawn_blocking(move || select_candidates(&selectors, &validated))
            .await
            .context("selection worker panicked")?;

        self.advance(progress, RunState::Scoring).await?;
        let bias_weight = self.fetch_bias_weight().await;
        let computed_at = self.clock.now();
        let results = build_results(&run_id, trading_day, computed_at, bias_weight, candidates);
        let cc_count = results
            .iter()
            .filter(|r| r.strategy == StrategyKind::CoveredCall)
            .count();
        progress.set_counts(cc_count, results.len() - cc_count);

        self.observe_stored_failure(progress).await?;
        self.ensure_not_cancelled(progress)?;
        let finished_at = self.clock.now();
        let mut committed = progress.snapshot();
        committed.state = RunState::Committed;
        committed.finished_at = Some(finished_at);
        committed.duration_seconds = duration_seconds(committed.started_at, finished_at);
        self.store
            .commit_run(&committed, &results)
            .await
            .map_err(|err| PipelineError::RunCommitFailed(format!("{:#}", err)))?;
        let published = committed.clone();
        progress.update(move |status| *status = published);

        info!(
            "Run {} committed for {}: {} covered calls, {} PMCCs, {} excluded, {:.1}s",
            committed.run_id,
            trading_day,
            committed.cc_count,
            committed.pmcc_count,
            committed.symbols_excluded,
            committed.duration_seconds
        );
        Ok(committed)
    }

    /// The requested day if it is a session, else the most recent closed one.
    pub fn resolve_trading_day(&self, requested: Option<NaiveDate>) -> Result<NaiveDate, PipelineError> {
        match requested {
            Some(day) => {
                if !self.calendar.is_trading_day(day)? {
                    return Err(CalendarError::NotATradingDay(day).into());
                }
                Ok(day)
            }
            None => Ok(self.calendar.last_trading_day(self.clock.now())?),
        }
    }

    fn ensure_not_cancelled(&self, progress: &RunProgress) -> Result<(), PipelineError> {
        match progress.cancelled_by() {
            Some(operator) => {
                let run_id = progress.snapshot().run_id;
                warn!("Run {} cancelled by {}", run_id, operator);
                Err(PipelineError::RunCancelled(run_id))
            }
            None => Ok(()),
        }
    }

    /// Another process may have failed the stored run.
    async fn observe_stored_failure(&self, progress: &RunProgress) -> Result<()> {
        let run_id = progress.snapshot().run_id;
        if let Some(stored) = self.store.load_run_status(&run_id).await? {
            if stored.state == RunState::Failed {
                progress.request_cancel("external");
            }
        }
        Ok(())
    }

    async fn advance(&self, progress: &RunProgress, next: RunState) -> Result<()> {
        self.observe_stored_failure(progress).await?;
        self.ensure_not_cancelled(progress)?;
        let current = progress.snapshot().state;
        if !current.can_transition_to(next) {
            return Err(anyhow!("illegal run transition {} -> {}", current, next));
        }
        progress.set_state(next);
        let status = progress.snapshot();
        info!("Run {}: {} -> {}", status.run_id, current, next);
        self.store
            .save_run_status(&status)
            .await
            .with_context(|| format!("failed to persist run {} state {}", status.run_id, next))
    }

    async fn fail_run(
        &self,
        progress: &RunProgress,
        started_at: DateTime<Utc>,
        err: &anyhow::Error,
    ) -> RunStatus {
        let finished_at = self.clock.now();
        progress.update(|status| {
            status.state = RunState::Failed;
            status.finished_at = Some(finished_at);
            status.duration_seconds = duration_seconds(started_at, finished_at);
            status.error = Some(format!("{:#}", err));
        });
        let status = progress.snapshot();
        error!("Run {} failed: {:#}", status.run_id, err);
        if let Err(save_err) = self.store.save_run_status(&status).await {
            error!(
                "Could not record failure of run {}: {:#}",
                status.run_id, save_err
            );
        }
        status
    }

    async fn fetch_bias_weight(&self) -> Option<f64> {
        let source = self.bias.as_ref()?;
        match source.fetch_bias_weight().await {
            Ok(weight) => weight,
            Err(err) => {
                warn!("Market bias unavailable, using neutral weight: {:#}", err);
                None
            }
        }
    }

    fn validate_records(
        &self,
        records: Vec<SnapshotRecord>,
    ) -> (Vec<SnapshotRecord>, Vec<(String, ExclusionReason)>) {
        let require_puts = self.selectors.iter().any(|selector| selector.requires_puts());
        let mut validated = Vec::with_capacity(records.len());
        let mut exclusions = Vec::new();
        for record in records {
            match validate_chain(&record.chain, &self.settings.pricing, require_puts) {
                Ok(()) => validated.push(record),
                Err(rejection) => exclusions.push((
                    record.symbol().to_string(),
                    ExclusionReason::ChainRejected(rejection),
                )),
            }
        }
        (validated, exclusions)
    }

    /// Validation, selection and scoring over stored snapshots, with no I/O.
    /// Same snapshots in, same evaluation out.
    pub fn evaluate(&self, records: &[SnapshotRecord]) -> Evaluation {
        let mut exclusions = Vec::new();
        let mut scannable = Vec::new();
        for record in records {
            match unscannable_reason(record) {
                Some(reason) => exclusions.push((record.symbol().to_string(), reason)),
                None => scannable.push(record.clone()),
            }
        }
        let (validated, chain_exclusions) = self.validate_records(scannable);
        exclusions.extend(chain_exclusions);
        exclusions.sort_by(|a, b| a.0.cmp(&b.0));
        Evaluation {
            exclusions,
            candidates: select_candidates(&self.selectors, &validated),
        }
    }

    pub async fn get_run_status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        if let Some(status) = self.registry.get(run_id) {
            return Ok(Some(status));
        }
        self.store.load_run_status(run_id).await
    }

    /// Marks a run `FAILED`. In-flight runs stop at their next stage boundary;
    /// a stored run left non-terminal is failed directly. Returns false for
    /// runs already terminal.
    pub async fn cancel_run(&self, run_id: &str, operator: &str) -> Result<bool> {
        if self.registry.request_cancel(run_id, operator) {
            info!("Cancellation of run {} requested by {}", run_id, operator);
            return Ok(true);
        }
        let Some(mut status) = self.store.load_run_status(run_id).await? else {
            return Err(anyhow!("Unknown run {}", run_id));
        };
        if status.state.is_terminal() {
            return Ok(false);
        }
        let finished_at = self.clock.now();
        status.state = RunState::Failed;
        status.finished_at = Some(finished_at);
        status.duration_seconds = duration_seconds(status.started_at, finished_at);
        status.error = Some(PipelineError::RunCancelled(run_id.to_string()).to_string());
        self.store.save_run_status(&status).await?;
        info!("Run {} marked FAILED by {}", run_id, operator);
        Ok(true)
    }

    /// Sleeps until each post-close scan instant and triggers a run, forever
    /// or until `max_runs` runs have finished. Returns the finished runs.
    pub async fn run_daily(&self, max_runs: Option<usize>) -> Result<Vec<RunStatus>> {
        let delay = self.settings.scan_delay_after_close;
        let mut cursor = self.clock.now();
        let mut completed = Vec::new();
        loop {
            let scan_at = self.calendar.next_scan_instant(cursor, delay)?;
            let now = self.clock.now();
            if scan_at > now {
                let wait = (scan_at - now).to_std().unwrap_or_default();
                info!("Next scan at {} (in {}s)", scan_at, wait.as_secs());
                self.sleeper.sleep(wait).await;
            }
            let trading_day = self.calendar.last_trading_day(scan_at)?;
            let status = self
                .trigger_run(TriggerRequest {
                    trading_day: Some(trading_day),
                    ..TriggerRequest::default()
                })
                .await?;
            info!(
                "Scheduled run {} for {} finished {}",
                status.run_id, trading_day, status.state
            );
            completed.push(status);
            if max_runs.is_some_and(|limit| completed.len() >= limit) {
                return Ok(completed);
            }
            cursor = scan_at;
        }
    }
}

fn duration_seconds(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> f64 {
    ((finished_at - started_at).num_milliseconds().max(0) as f64) / 1000.0
}

fn exclusion_breakdown(exclusions: &[(String, ExclusionReason)]) -> BTreeMap<String, usize> {
    let mut breakdown = BTreeMap::new();
    for (_, reason) in exclusions {
        *breakdown.entry(reason.code().to_string()).or_insert(0) += 1;
    }
    breakdown
}

/// Per-symbol, per-strategy selection fanned out over rayon. The output is
/// sorted by strategy then symbol so thread scheduling never shows.
fn select_candidates(
    selectors: &[Box<dyn StrategySelector>],
    records: &[SnapshotRecord],
) -> Vec<(StrategyKind, ScoredCandidate)> {
    let mut candidates: Vec<(StrategyKind, ScoredCandidate)> = records
        .par_iter()
        .flat_map_iter(|record| {
            selectors.iter().filter_map(move |selector| {
                let selection = selector.select(record);
                if selection.candidate.is_none() {
                    debug!(
                        "{} has no {} candidate: {:?}",
                        record.symbol(),
                        selector.kind(),
                        selection
                            .rejections
                            .iter()
                            .map(|(reason, count)| format!("{}={}", reason, count))
                            .collect::<Vec<_>>()
                    );
                }
                selection
                    .candidate
                    .map(|candidate| (selector.kind(), candidate))
            })
        })
        .collect();
    candidates.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| a.1.trade.symbol().cmp(b.1.trade.symbol()))
    });
    candidates
}

fn build_results(
    run_id: &str,
    trading_day: NaiveDate,
    computed_at: DateTime<Utc>,
    bias_weight: Option<f64>,
    candidates: Vec<(StrategyKind, ScoredCandidate)>,
) -> Vec<ScanResult> {
    let mut results: Vec<ScanResult> = candidates
        .into_iter()
        .map(|(strategy, candidate)| {
            let (final_score, weight) = apply_market_bias(candidate.base_score, bias_weight);
            ScanResult {
                run_id: run_id.to_string(),
                computed_at,
                strategy,
                symbol: candidate.trade.symbol().to_string(),
                trading_day,
                trade: candidate.trade,
                base_score: candidate.base_score,
                final_score,
                bias_weight: weight,
                breakdown: candidate.breakdown,
                warnings: candidate.warnings,
                is_valid: true,
            }
        })
        .collect();
    results.sort_by_key(|result| result.strategy);
    for strategy in StrategyKind::ALL {
        let start = results.partition_point(|r| r.strategy < strategy);
        let end = results.partition_point(|r| r.strategy <= strategy);
        sort_results(&mut results[start..end]);
    }
    results
}
