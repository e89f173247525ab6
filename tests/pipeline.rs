use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use dashmap::DashMap;
use screener::cache::ScanResultCache;
use screener::calendar::{FixedClock, TradingCalendar};
use screener::config::ScreenerSettings;
use screener::database::Database;
use screener::errors::SourceError;
use screener::market_data::{
    MarketBiasSource, MarketDataSource, RawOptionChain, RawOptionContract, RawStockQuote,
    StaticBias,
};
use screener::memory_store::MemorySnapshotStore;
use screener::models::{
    AdminOverride, AuditOutcome, EligibleTrade, IngestionAuditRecord, RunState, RunStatus,
    ScanResult, SnapshotRecord, StrategyKind,
};
use screener::orchestrator::{ScanOrchestrator, TriggerRequest};
use screener::retry::RecordingSleeper;
use screener::run_status::RunRegistry;
use screener::snapshot_store::{query_results, ResultQuery, SnapshotStore};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_postgres::Client;

const SMOKE_TEST_DB_NAME: &str = "screener_test_pipeline_smoke";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, 22).unwrap()
}

fn close() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 22, 21, 0, 0).unwrap()
}

fn after_close() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 22, 21, 35, 0).unwrap()
}

fn quote(symbol: &str, price: f64, trade_date: NaiveDate) -> RawStockQuote {
    RawStockQuote {
        symbol: Some(symbol.to_string()),
        previous_close: Some(price),
        previous_close_date: Some(trade_date),
        volume: Some(1_500_000.0),
        avg_volume: Some(2_000_000.0),
        market_cap: Some(10_000_000_000.0),
        iv_rank: Some(45.0),
        as_of: Some(close()),
        ..RawStockQuote::default()
    }
}

fn call(symbol: &str, strike: f64, dte: i64, bid: f64, ask: f64, delta: f64, oi: f64) -> RawOptionContract {
    RawOptionContract {
        contract_id: Some(format!("{}-{}-{}", symbol, dte, strike)),
        strike: Some(strike),
        expiry: Some(day() + ChronoDuration::days(dte)),
        option_type: Some("call".to_string()),
        bid: Some(bid),
        ask: Some(ask),
        volume: Some(100.0),
        open_interest: Some(oi),
        implied_volatility: Some(0.35),
        delta: Some(delta),
        ..RawOptionContract::default()
    }
}

fn chain(symbol: &str, trade_date: NaiveDate, contracts: Vec<RawOptionContract>) -> RawOptionChain {
    RawOptionChain {
        symbol: Some(symbol.to_string()),
        expiries: None,
        contracts: Some(contracts),
        trade_date: Some(trade_date),
        as_of: Some(close()),
    }
}

/// $55 stock, one 10-DTE $58 call worth selling, two ITM strikes that keep
/// the chain valid but can never be chosen.
fn xyz_chain() -> RawOptionChain {
    chain(
        "XYZ",
        day(),
        vec![
            call("XYZ", 58.0, 10, 1.20, 1.30, 0.30, 500.0),
            call("XYZ", 50.0, 10, 5.20, 5.40, 0.80, 400.0),
            call("XYZ", 52.0, 10, 3.50, 3.60, 0.70, 400.0),
        ],
    )
}

/// $100 stock with one ITM LEAP and one short call inside the delta band.
fn pmc_chain(leap_ask: f64) -> RawOptionChain {
    chain(
        "PMC",
        day(),
        vec![
            call("PMC", 80.0, 400, leap_ask - 0.10, leap_ask, 0.80, 600.0),
            call("PMC", 105.0, 30, 1.50, 1.60, 0.25, 800.0),
            call("PMC", 100.0, 30, 4.00, 4.20, 0.50, 900.0),
        ],
    )
}

#[derive(Default)]
struct ScriptedSource {
    quotes: DashMap<String, RawStockQuote>,
    chains: DashMap<String, RawOptionChain>,
    quote_failures: DashMap<String, VecDeque<SourceError>>,
    quote_calls: AtomicUsize,
    chain_calls: AtomicUsize,
    hold: Option<Arc<Notify>>,
}

impl ScriptedSource {
    fn with(self, symbol: &str, quote: RawStockQuote, chain: RawOptionChain) -> Self {
        self.quotes.insert(symbol.to_string(), quote);
        self.chains.insert(symbol.to_string(), chain);
        self
    }

    fn failing_quote(self, symbol: &str, failures: Vec<SourceError>) -> Self {
        self.quote_failures
            .insert(symbol.to_string(), failures.into_iter().collect());
        self
    }

    fn quote_calls(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_stock_quote(&self, symbol: &str) -> Result<RawStockQuote, SourceError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hold) = self.hold.as_ref() {
            hold.notified().await;
        }
        if let Some(mut failures) = self.quote_failures.get_mut(symbol) {
            if let Some(failure) = failures.pop_front() {
                return Err(failure);
            }
        }
        self.quotes
            .get(symbol)
            .map(|quote| quote.clone())
            .ok_or_else(|| SourceError::NotFound(symbol.to_string()))
    }

    async fn fetch_option_chain(&self, symbol: &str) -> Result<RawOptionChain, SourceError> {
        self.chain_calls.fetch_add(1, Ordering::SeqCst);
        self.chains
            .get(symbol)
            .map(|chain| chain.clone())
            .ok_or_else(|| SourceError::NotFound(symbol.to_string()))
    }
}

struct Harness {
    store: MemorySnapshotStore,
    source: Arc<ScriptedSource>,
    sleeper: Arc<RecordingSleeper>,
    clock: Arc<FixedClock>,
    orchestrator: Arc<ScanOrchestrator>,
}

fn settings(universe: &[&str], overrides: &[(&str, &str)]) -> ScreenerSettings {
    let mut map: HashMap<String, String> = HashMap::new();
    map.insert("SCAN_UNIVERSE".to_string(), universe.join(","));
    map.insert("INGEST_MIN_REQUEST_GAP_MS".to_string(), "0".to_string());
    map.insert("RETRY_JITTER_RATIO".to_string(), "0".to_string());
    for (key, value) in overrides {
        map.insert(key.to_string(), value.to_string());
    }
    ScreenerSettings::from_settings_map(&map).unwrap()
}

fn harness_with(
    source: ScriptedSource,
    settings: ScreenerSettings,
    bias: Option<Arc<dyn MarketBiasSource>>,
) -> Harness {
    init_logging();
    let store = MemorySnapshotStore::new();
    let source = Arc::new(source);
    let sleeper = Arc::new(RecordingSleeper::new());
    let clock = Arc::new(FixedClock::new(after_close()));
    let orchestrator = Arc::new(ScanOrchestrator::new(
        Arc::new(settings),
        Arc::new(TradingCalendar::bundled_nyse().unwrap()),
        clock.clone(),
        sleeper.clone(),
        source.clone(),
        Arc::new(store.clone()),
        bias,
    ));
    Harness {
        store,
        source,
        sleeper,
        clock,
        orchestrator,
    }
}

fn harness(source: ScriptedSource, universe: &[&str]) -> Harness {
    harness_with(source, settings(universe, &[]), None)
}

async fn results_for(store: &MemorySnapshotStore, strategy: StrategyKind) -> Vec<ScanResult> {
    query_results(store, &ResultQuery::latest(strategy))
        .await
        .unwrap()
        .results
}

/// Fields that must not change between runs over the same snapshots.
fn stable_view(results: &[ScanResult]) -> Vec<(String, EligibleTrade, f64, f64, String)> {
    results
        .iter()
        .map(|result| {
            (
                result.symbol.clone(),
                result.trade.clone(),
                result.base_score,
                result.final_score,
                serde_json::to_string(&result.breakdown).unwrap(),
            )
        })
        .collect()
}

#[tokio::test]
async fn end_to_end_covered_call_uses_bid_and_explains_score() {
    let source = ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain());
    let h = harness(source, &["XYZ"]);

    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed);
    assert_eq!(status.trading_day, Some(day()));
    assert_eq!(status.cc_count, 1);
    assert_eq!(status.pmcc_count, 0);
    assert!(status.finished_at.is_some());

    let results = results_for(&h.store, StrategyKind::CoveredCall).await;
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.symbol, "XYZ");
    assert!(result.is_valid);
    assert_eq!(result.run_id, status.run_id);
    let EligibleTrade::CoveredCall(trade) = &result.trade else {
        panic!("expected covered call");
    };
    assert_eq!(trade.contract_id, "XYZ-10-58");
    assert_eq!(trade.premium, 1.20);
    assert_eq!(trade.dte, 10);
    assert_eq!(trade.stock_price, 55.0);

    assert_eq!(result.breakdown.pillars.len(), 5);
    let pillar_sum: f64 = result
        .breakdown
        .pillars
        .iter()
        .map(|pillar| pillar.achieved_points)
        .sum();
    assert!((pillar_sum - result.base_score).abs() < 0.005);
    assert!(result.base_score > 0.0 && result.base_score <= 100.0);
    assert_eq!(result.bias_weight, 1.0);
    assert_eq!(result.final_score, result.base_score);
    for pillar in &result.breakdown.pillars {
        assert!(!pillar.explanation.is_empty());
        assert!(pillar.achieved_points <= pillar.max_points + 1e-9);
    }

    assert!(results_for(&h.store, StrategyKind::Pmcc).await.is_empty());
}

#[tokio::test]
async fn pmcc_pair_priced_from_leap_ask_and_short_bid() {
    let source = ScriptedSource::default().with("PMC", quote("PMC", 100.0, day()), pmc_chain(24.0));
    let h = harness(source, &["PMC"]);

    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed);
    assert_eq!(status.cc_count, 0);
    assert_eq!(status.pmcc_count, 1);

    let results = results_for(&h.store, StrategyKind::Pmcc).await;
    let EligibleTrade::Pmcc(trade) = &results[0].trade else {
        panic!("expected pmcc");
    };
    assert_eq!(trade.long_cost, 24.0);
    assert_eq!(trade.short_premium, 1.50);
    assert_eq!(trade.net_debit, 22.5);
    assert_eq!(trade.width, 25.0);
    assert_eq!(trade.breakeven, 102.5);
    assert!(!trade.breakeven_warning);
    assert_eq!(trade.short_leg.strike, 105.0);
    assert_eq!(results[0].breakdown.pillars.len(), 5);
}

#[tokio::test]
async fn insolvent_pair_never_becomes_a_result() {
    // Debit 31.00 - 1.50 = 29.50 against a limit of 25 * 1.2 = 30.00 passes;
    // 32.00 - 1.50 = 30.50 does not.
    let passing = ScriptedSource::default().with("PMC", quote("PMC", 100.0, day()), pmc_chain(31.0));
    let h = harness(passing, &["PMC"]);
    h.orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(results_for(&h.store, StrategyKind::Pmcc).await.len(), 1);

    let failing = ScriptedSource::default().with("PMC", quote("PMC", 100.0, day()), pmc_chain(32.0));
    let h = harness(failing, &["PMC"]);
    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed);
    assert_eq!(status.pmcc_count, 0);
    assert!(results_for(&h.store, StrategyKind::Pmcc).await.is_empty());
}

#[tokio::test]
async fn exclusions_are_counted_by_reason() {
    let later = day().succ_opt().unwrap();
    let source = ScriptedSource::default()
        .with("XYZ", quote("XYZ", 55.0, day()), xyz_chain())
        .with("PMC", quote("PMC", 100.0, day()), pmc_chain(24.0))
        .with(
            "LAG",
            quote("LAG", 55.0, day()),
            chain("LAG", later, vec![call("LAG", 58.0, 10, 1.2, 1.3, 0.3, 500.0)]),
        )
        .with(
            "THN",
            quote("THN", 55.0, day()),
            chain(
                "THN",
                day(),
                vec![
                    call("THN", 58.0, 10, 1.2, 1.3, 0.3, 500.0),
                    call("THN", 58.0, 17, 1.6, 1.7, 0.32, 500.0),
                    call("THN", 60.0, 10, 0.8, 0.85, 0.22, 500.0),
                ],
            ),
        );
    let h = harness(source, &["xyz", "PMC", "LAG", "THN", "GONE"]);

    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed);
    assert_eq!(status.symbols_requested, 5);
    assert_eq!(status.symbols_ingested, 4);
    assert_eq!(status.symbols_excluded, 3);
    assert_eq!(status.exclusion_breakdown.get("MISSING_QUOTE"), Some(&1));
    assert_eq!(status.exclusion_breakdown.get("DATE_MISMATCH"), Some(&1));
    assert_eq!(
        status.exclusion_breakdown.get("CHAIN_INSUFFICIENT_STRIKES"),
        Some(&1)
    );

    // The mismatched snapshot is stored for audit but never scanned.
    let lag = h.store.snapshot_revisions("LAG", day());
    assert_eq!(lag.len(), 1);
    assert!(!lag[0].chain.date_validation_passed);
    assert_eq!(lag[0].chain.options_trade_date, later);

    let covered_calls = results_for(&h.store, StrategyKind::CoveredCall).await;
    let symbols: Vec<&str> = covered_calls.iter().map(|r| r.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["XYZ"]);
    assert_eq!(results_for(&h.store, StrategyKind::Pmcc).await.len(), 1);

    let audits = h.store.audit_records();
    assert_eq!(audits.len(), 5);
    assert!(audits
        .iter()
        .all(|audit| audit.run_id.as_deref() == Some(status.run_id.as_str())));
    let gone = audits.iter().find(|audit| audit.symbol == "GONE").unwrap();
    assert_eq!(gone.outcome, AuditOutcome::Excluded);
}

#[tokio::test]
async fn rerun_reuses_final_snapshots_and_reproduces_results() {
    let source = ScriptedSource::default()
        .with("XYZ", quote("XYZ", 55.0, day()), xyz_chain())
        .with("PMC", quote("PMC", 100.0, day()), pmc_chain(24.0));
    let h = harness(source, &["XYZ", "PMC"]);

    let first = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    let first_cc = results_for(&h.store, StrategyKind::CoveredCall).await;
    let first_pmcc = results_for(&h.store, StrategyKind::Pmcc).await;
    let calls_after_first = h.source.quote_calls();
    let hash = h.store.snapshot_revisions("XYZ", day())[0].content_hash.clone();

    h.clock.advance(ChronoDuration::minutes(10));
    let second = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(second.state, RunState::Committed);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(h.source.quote_calls(), calls_after_first);

    let revisions = h.store.snapshot_revisions("XYZ", day());
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].content_hash, hash);

    let second_cc = results_for(&h.store, StrategyKind::CoveredCall).await;
    let second_pmcc = results_for(&h.store, StrategyKind::Pmcc).await;
    assert_eq!(second_cc[0].run_id, second.run_id);
    assert_eq!(stable_view(&first_cc), stable_view(&second_cc));
    assert_eq!(stable_view(&first_pmcc), stable_view(&second_pmcc));

    let reused = h
        .store
        .audit_records()
        .into_iter()
        .filter(|audit| audit.run_id.as_deref() == Some(second.run_id.as_str()))
        .all(|audit| audit.outcome == AuditOutcome::Reused && audit.attempts == 0);
    assert!(reused);
}

#[tokio::test]
async fn evaluation_is_pure_over_stored_snapshots() {
    let source = ScriptedSource::default()
        .with("XYZ", quote("XYZ", 55.0, day()), xyz_chain())
        .with("PMC", quote("PMC", 100.0, day()), pmc_chain(24.0));
    let h = harness(source, &["XYZ", "PMC"]);
    h.orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();

    let mut records = Vec::new();
    for symbol in ["XYZ", "PMC"] {
        records.push(h.store.latest_snapshot(symbol, day()).await.unwrap().unwrap());
    }
    let first = h.orchestrator.evaluate(&records);
    records.reverse();
    let second = h.orchestrator.evaluate(&records);

    assert_eq!(first.candidates.len(), 2);
    let view = |evaluation: &screener::orchestrator::Evaluation| {
        evaluation
            .candidates
            .iter()
            .map(|(kind, candidate)| (*kind, candidate.trade.clone(), candidate.base_score))
            .collect::<Vec<_>>()
    };
    assert_eq!(view(&first), view(&second));
}

#[tokio::test]
async fn admin_override_appends_a_new_revision() {
    let source = ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain());
    let h = harness(source, &["XYZ"]);
    h.orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();

    h.source.quotes.insert("XYZ".to_string(), quote("XYZ", 56.0, day()));
    let status = h
        .orchestrator
        .trigger_run(TriggerRequest {
            admin_override: Some(AdminOverride {
                operator: "ops-oncall".to_string(),
            }),
            ..TriggerRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed);

    let revisions = h.store.snapshot_revisions("XYZ", day());
    assert_eq!(revisions.len(), 2);
    assert_eq!(revisions[0].stock.stock_price, 55.0);
    assert_eq!(revisions[1].revision, 2);
    assert_eq!(revisions[1].stock.stock_price, 56.0);
    assert_eq!(revisions[1].override_operator.as_deref(), Some("ops-oncall"));
    assert_ne!(revisions[0].content_hash, revisions[1].content_hash);

    let latest = h.store.latest_snapshot("XYZ", day()).await.unwrap().unwrap();
    assert_eq!(latest.revision, 2);
    let audit = h
        .store
        .audit_records()
        .into_iter()
        .find(|audit| audit.run_id.as_deref() == Some(status.run_id.as_str()))
        .unwrap();
    assert_eq!(audit.operator.as_deref(), Some("ops-oncall"));
}

#[tokio::test]
async fn transient_failures_back_off_then_succeed() {
    let source = ScriptedSource::default()
        .with("XYZ", quote("XYZ", 55.0, day()), xyz_chain())
        .failing_quote(
            "XYZ",
            vec![
                SourceError::Unavailable("502".to_string()),
                SourceError::Timeout(Duration::from_secs(15)),
            ],
        );
    let h = harness(source, &["XYZ"]);

    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed);
    assert_eq!(status.cc_count, 1);
    assert_eq!(
        h.sleeper.delays(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
    let audit = &h.store.audit_records()[0];
    assert_eq!(audit.outcome, AuditOutcome::Included);
    assert_eq!(audit.attempts, 4);
}

#[tokio::test]
async fn exhausted_retries_exclude_only_that_symbol() {
    let source = ScriptedSource::default()
        .with("XYZ", quote("XYZ", 55.0, day()), xyz_chain())
        .with("PMC", quote("PMC", 100.0, day()), pmc_chain(24.0))
        .failing_quote(
            "XYZ",
            vec![
                SourceError::RateLimited { retry_after: None },
                SourceError::Unavailable("503".to_string()),
                SourceError::Unavailable("503".to_string()),
                SourceError::Unavailable("503".to_string()),
            ],
        );
    let h = harness(source, &["XYZ", "PMC"]);

    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed);
    assert_eq!(status.exclusion_breakdown.get("MISSING_QUOTE"), Some(&1));
    assert_eq!(status.pmcc_count, 1);
    assert_eq!(
        h.sleeper.delays(),
        vec![
            Duration::from_millis(5000),
            Duration::from_millis(2000),
            Duration::from_millis(4000)
        ]
    );
}

#[tokio::test]
async fn failed_commit_keeps_previous_run_current() {
    let source = ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain());
    let h = harness(source, &["XYZ"]);
    let committed = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();

    h.store.set_fail_commits(true);
    h.clock.advance(ChronoDuration::minutes(5));
    let failed = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(failed.state, RunState::Failed);
    assert!(failed.error.as_deref().unwrap().contains("run commit failed"));

    let latest = h.store.latest_committed_run().await.unwrap().unwrap();
    assert_eq!(latest.run_id, committed.run_id);
    assert!(h
        .store
        .load_results(&failed.run_id, StrategyKind::CoveredCall)
        .await
        .unwrap()
        .is_empty());
    let stored = h
        .orchestrator
        .get_run_status(&failed.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, RunState::Failed);

    let page = query_results(&h.store, &ResultQuery::latest(StrategyKind::CoveredCall))
        .await
        .unwrap();
    assert_eq!(page.run_id.as_deref(), Some(committed.run_id.as_str()));
    assert!(query_results(
        &h.store,
        &ResultQuery::for_run(failed.run_id.clone(), StrategyKind::CoveredCall)
    )
    .await
    .is_err());
}

/// Store that records what the live registry reports while a commit is in
/// progress, then delegates to the in-memory store.
struct CommitObservingStore {
    inner: MemorySnapshotStore,
    registry: Arc<OnceLock<RunRegistry>>,
    seen_during_commit: std::sync::Mutex<Vec<RunState>>,
}

#[async_trait]
impl SnapshotStore for CommitObservingStore {
    async fn latest_snapshot(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
    ) -> Result<Option<SnapshotRecord>> {
        self.inner.latest_snapshot(symbol, trading_day).await
    }

    async fn append_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        self.inner.append_snapshot(record).await
    }

    async fn record_ingestion_audit(&self, records: &[IngestionAuditRecord]) -> Result<()> {
        self.inner.record_ingestion_audit(records).await
    }

    async fn save_run_status(&self, status: &RunStatus) -> Result<()> {
        self.inner.save_run_status(status).await
    }

    async fn load_run_status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        self.inner.load_run_status(run_id).await
    }

    async fn commit_run(&self, status: &RunStatus, results: &[ScanResult]) -> Result<()> {
        if let Some(live) = self.registry.get().and_then(|registry| registry.get(&status.run_id)) {
            self.seen_during_commit.lock().unwrap().push(live.state);
        }
        self.inner.commit_run(status, results).await
    }

    async fn latest_committed_run(&self) -> Result<Option<RunStatus>> {
        self.inner.latest_committed_run().await
    }

    async fn load_results(&self, run_id: &str, strategy: StrategyKind) -> Result<Vec<ScanResult>> {
        self.inner.load_results(run_id, strategy).await
    }
}

#[tokio::test]
async fn live_status_shows_committed_only_after_the_commit_lands() {
    init_logging();
    let inner = MemorySnapshotStore::new();
    let registry = Arc::new(OnceLock::new());
    let store = Arc::new(CommitObservingStore {
        inner: inner.clone(),
        registry: registry.clone(),
        seen_during_commit: std::sync::Mutex::new(Vec::new()),
    });
    let source = Arc::new(
        ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain()),
    );
    let orchestrator = ScanOrchestrator::new(
        Arc::new(settings(&["XYZ"], &[])),
        Arc::new(TradingCalendar::bundled_nyse().unwrap()),
        Arc::new(FixedClock::new(after_close())),
        Arc::new(RecordingSleeper::new()),
        source,
        store.clone(),
        None,
    );
    let _ = registry.set(orchestrator.registry().clone());

    let committed = orchestrator.trigger_run(TriggerRequest::default()).await.unwrap();
    assert_eq!(committed.state, RunState::Committed);
    assert_eq!(*store.seen_during_commit.lock().unwrap(), vec![RunState::Scoring]);

    inner.set_fail_commits(true);
    let failed = orchestrator.trigger_run(TriggerRequest::default()).await.unwrap();
    assert_eq!(failed.state, RunState::Failed);
    assert_eq!(
        *store.seen_during_commit.lock().unwrap(),
        vec![RunState::Scoring, RunState::Scoring]
    );
    let stored = inner.load_run_status(&failed.run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);
}

#[tokio::test]
async fn cancelled_run_fails_without_results() {
    let hold = Arc::new(Notify::new());
    let mut source = ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain());
    source.hold = Some(hold.clone());
    let h = harness(source, &["XYZ"]);

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.trigger_run(TriggerRequest::default()).await });

    let mut run_id = None;
    for _ in 0..400 {
        if let Some(status) = h
            .orchestrator
            .registry()
            .in_flight()
            .into_iter()
            .find(|status| status.state == RunState::Ingesting)
        {
            run_id = Some(status.run_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let run_id = run_id.expect("run never reached INGESTING");
    assert!(h.orchestrator.cancel_run(&run_id, "ops").await.unwrap());
    hold.notify_one();

    let status = run.await.unwrap().unwrap();
    assert_eq!(status.run_id, run_id);
    assert_eq!(status.state, RunState::Failed);
    assert!(status.error.as_deref().unwrap().contains("cancelled"));
    assert!(h.store.latest_committed_run().await.unwrap().is_none());
    assert!(!h.orchestrator.cancel_run(&run_id, "ops").await.unwrap());
    assert!(h.orchestrator.cancel_run("no-such-run", "ops").await.is_err());
}

/// Bias source standing in for an operator in another process: while the
/// watched run is scoring, it fails the run through a separate orchestrator
/// that shares only the store.
struct OperatorFailsRunWhileScoring {
    operator: Arc<ScanOrchestrator>,
    watched: Arc<OnceLock<RunRegistry>>,
    failed_run: Arc<OnceLock<String>>,
}

#[async_trait]
impl MarketBiasSource for OperatorFailsRunWhileScoring {
    async fn fetch_bias_weight(&self) -> Result<Option<f64>> {
        let registry = self.watched.get().ok_or_else(|| anyhow!("no watched run"))?;
        let run = registry
            .in_flight()
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no run in flight"))?;
        assert_eq!(run.state, RunState::Scoring);
        assert!(self.operator.cancel_run(&run.run_id, "ops").await?);
        let _ = self.failed_run.set(run.run_id);
        Ok(None)
    }
}

#[tokio::test]
async fn failure_recorded_by_another_process_is_never_committed_over() {
    init_logging();
    let source = Arc::new(
        ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain()),
    );
    let store = MemorySnapshotStore::new();
    let calendar = Arc::new(TradingCalendar::bundled_nyse().unwrap());
    let clock = Arc::new(FixedClock::new(after_close()));
    let settings = Arc::new(settings(&["XYZ"], &[]));

    let operator = Arc::new(ScanOrchestrator::new(
        Arc::clone(&settings),
        Arc::clone(&calendar),
        clock.clone(),
        Arc::new(RecordingSleeper::new()),
        source.clone(),
        Arc::new(store.clone()),
        None,
    ));
    let watched = Arc::new(OnceLock::new());
    let failed_run = Arc::new(OnceLock::new());
    let bias: Arc<dyn MarketBiasSource> = Arc::new(OperatorFailsRunWhileScoring {
        operator,
        watched: watched.clone(),
        failed_run: failed_run.clone(),
    });
    let scanner = ScanOrchestrator::new(
        settings,
        calendar,
        clock.clone(),
        Arc::new(RecordingSleeper::new()),
        source.clone(),
        Arc::new(store.clone()),
        Some(bias),
    );
    let _ = watched.set(scanner.registry().clone());

    let status = scanner.trigger_run(TriggerRequest::default()).await.unwrap();
    assert_eq!(failed_run.get(), Some(&status.run_id));
    assert_eq!(status.state, RunState::Failed);
    assert!(status.error.as_deref().unwrap().contains("cancelled"));

    let stored = store.load_run_status(&status.run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);
    assert!(store.latest_committed_run().await.unwrap().is_none());
    assert!(store
        .load_results(&status.run_id, StrategyKind::CoveredCall)
        .await
        .unwrap()
        .is_empty());
    assert!(scanner.registry().in_flight().is_empty());
}

#[tokio::test]
async fn unplaceable_vendor_timestamp_excludes_only_that_symbol() {
    let epoch = Utc.timestamp_opt(0, 0).unwrap();
    let mut bad_quote = quote("BADQ", 55.0, day());
    bad_quote.previous_close_date = None;
    bad_quote.as_of = Some(epoch);
    let mut bad_chain = chain(
        "BADC",
        day(),
        vec![
            call("BADC", 58.0, 10, 1.20, 1.30, 0.30, 500.0),
            call("BADC", 50.0, 10, 5.20, 5.40, 0.80, 400.0),
            call("BADC", 52.0, 10, 3.50, 3.60, 0.70, 400.0),
        ],
    );
    bad_chain.trade_date = None;
    bad_chain.as_of = Some(epoch);
    let source = ScriptedSource::default()
        .with("XYZ", quote("XYZ", 55.0, day()), xyz_chain())
        .with("BADQ", bad_quote, xyz_chain())
        .with("BADC", quote("BADC", 55.0, day()), bad_chain);
    let h = harness(source, &["XYZ", "BADQ", "BADC"]);

    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Committed, "{:?}", status.error);
    assert_eq!(status.symbols_ingested, 1);
    assert_eq!(status.symbols_excluded, 2);
    assert_eq!(status.exclusion_breakdown.get("MISSING_QUOTE"), Some(&1));
    assert_eq!(status.exclusion_breakdown.get("MISSING_CHAIN"), Some(&1));
    assert_eq!(status.cc_count, 1);

    // A payload the calendar cannot place is permanent: no backoff, no retry.
    assert!(h.sleeper.delays().is_empty());
    assert_eq!(h.source.quote_calls(), 3);
    assert!(h.store.snapshot_revisions("BADQ", day()).is_empty());
    assert!(h.store.snapshot_revisions("BADC", day()).is_empty());

    let covered_calls = results_for(&h.store, StrategyKind::CoveredCall).await;
    let symbols: Vec<&str> = covered_calls.iter().map(|r| r.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["XYZ"]);
}

#[tokio::test]
async fn market_bias_is_clamped_and_capped() {
    let source = ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain());
    let bias: Arc<dyn MarketBiasSource> = Arc::new(StaticBias(3.0));
    let h = harness_with(source, settings(&["XYZ"], &[]), Some(bias));
    h.orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();

    let result = &results_for(&h.store, StrategyKind::CoveredCall).await[0];
    assert_eq!(result.bias_weight, 1.25);
    let expected = ((result.base_score * 1.25) * 100.0).round() / 100.0;
    assert_eq!(result.final_score, expected.min(100.0));
}

#[tokio::test]
async fn non_trading_day_fails_the_run() {
    let h = harness(ScriptedSource::default(), &["XYZ"]);
    let status = h
        .orchestrator
        .trigger_run(TriggerRequest {
            trading_day: NaiveDate::from_ymd_opt(2026, 1, 24),
            ..TriggerRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!(h.source.quote_calls(), 0);
}

#[tokio::test]
async fn calendar_gap_fails_the_run() {
    let h = harness(ScriptedSource::default(), &["XYZ"]);
    h.clock.set(Utc.with_ymd_and_hms(2031, 6, 2, 22, 0, 0).unwrap());
    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();
    assert_eq!(status.state, RunState::Failed);
    assert!(status.trading_day.is_none());
    assert!(status.error.is_some());
}

#[tokio::test]
async fn scheduler_waits_for_each_close() {
    let h = harness(ScriptedSource::default(), &[]);
    h.clock.set(Utc.with_ymd_and_hms(2026, 1, 23, 12, 0, 0).unwrap());

    let runs = h.orchestrator.run_daily(Some(2)).await.unwrap();
    let days: Vec<Option<NaiveDate>> = runs.iter().map(|run| run.trading_day).collect();
    assert_eq!(
        days,
        vec![
            NaiveDate::from_ymd_opt(2026, 1, 23),
            NaiveDate::from_ymd_opt(2026, 1, 26)
        ]
    );
    assert!(runs.iter().all(|run| run.state == RunState::Committed));
    // 12:00Z to 21:30Z, then to the Monday scan.
    assert_eq!(
        h.sleeper.delays(),
        vec![
            Duration::from_secs(9 * 3600 + 1800),
            Duration::from_secs(3 * 86_400 + 9 * 3600 + 1800)
        ]
    );
}

#[tokio::test]
async fn cache_matches_store_queries() {
    let source = ScriptedSource::default()
        .with("XYZ", quote("XYZ", 55.0, day()), xyz_chain())
        .with("ABC", quote("ABC", 55.0, day()), {
            let mut raw = xyz_chain();
            raw.symbol = Some("ABC".to_string());
            raw
        });
    let h = harness(source, &["XYZ", "ABC"]);
    let status = h
        .orchestrator
        .trigger_run(TriggerRequest::default())
        .await
        .unwrap();

    let cache = ScanResultCache::new(Arc::new(h.store.clone()));
    let mut query = ResultQuery::latest(StrategyKind::CoveredCall);
    query.limit = Some(1);
    let cached = cache.query(&query).await.unwrap();
    let direct = query_results(&h.store, &query).await.unwrap();
    assert_eq!(cached.run_id.as_deref(), Some(status.run_id.as_str()));
    assert_eq!(cached.results, direct.results);
    assert_eq!(cached.results.len(), 1);
    // Identical scores tie-break on symbol.
    assert_eq!(cached.results[0].symbol, "ABC");

    query.limit = None;
    query.symbols = Some(vec!["XYZ".to_string()]);
    let filtered = cache.query(&query).await.unwrap();
    assert_eq!(filtered.results.len(), 1);
    assert_eq!(filtered.results[0].symbol, "XYZ");
    assert_eq!(cache.cached_runs(), 1);
}

#[tokio::test]
async fn postgres_store_round_trips_a_run() -> Result<()> {
    init_logging();
    dotenvy::dotenv().ok();
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set; skipping Postgres smoke test");
        return Ok(());
    }
    let root = test_db_root_url()?;
    let admin_url = format!("{}/postgres", root);
    let database_url = format!("{}/{}", root, SMOKE_TEST_DB_NAME);
    let admin = connect(&admin_url).await?;
    drop_database_with_client(&admin, SMOKE_TEST_DB_NAME).await?;
    admin
        .batch_execute(&format!(
            "CREATE DATABASE {} TEMPLATE template0",
            SMOKE_TEST_DB_NAME
        ))
        .await?;

    let outcome = async {
        let db = Arc::new(Database::new(&database_url).await?);
        db.ensure_schema().await?;
        let source = Arc::new(
            ScriptedSource::default().with("XYZ", quote("XYZ", 55.0, day()), xyz_chain()),
        );
        let orchestrator = ScanOrchestrator::new(
            Arc::new(settings(&["XYZ"], &[])),
            Arc::new(TradingCalendar::bundled_nyse()?),
            Arc::new(FixedClock::new(after_close())),
            Arc::new(RecordingSleeper::new()),
            source.clone(),
            db.clone(),
            None,
        );
        let first = orchestrator.trigger_run(TriggerRequest::default()).await?;
        if first.state != RunState::Committed {
            return Err(anyhow!("run ended {:?}", first.error));
        }
        orchestrator.trigger_run(TriggerRequest::default()).await?;
        assert_eq!(source.quote_calls(), 1);

        let query = ResultQuery::for_run(first.run_id.clone(), StrategyKind::CoveredCall);
        let page = query_results(db.as_ref(), &query).await?;
        assert_eq!(page.results.len(), 1);
        let record = db.latest_snapshot("XYZ", day()).await?.expect("snapshot stored");
        assert_eq!(record.revision, 1);
        assert!(db.append_snapshot(&record).await.is_err());
        Ok::<(), anyhow::Error>(())
    }
    .await;

    drop_database_with_client(&admin, SMOKE_TEST_DB_NAME).await?;
    outcome
}

fn test_db_root_url() -> Result<String> {
    let url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL must be set in .env"))?;
    let url = url
        .split('?')
        .next()
        .unwrap_or(url.as_str())
        .trim_end_matches('/');
    let root = url.rsplit_once('/').map(|(root, _)| root).unwrap_or(url);
    Ok(root.to_string())
}

async fn connect(url: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(url, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            eprintln!("postgres error: {}", err);
        }
    });
    Ok(client)
}

async fn drop_database_with_client(client: &Client, db_name: &str) -> Result<()> {
    client
        .execute(
            "SELECT pg_terminate_backend(pid)
             FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
            &[&db_name],
        )
        .await
        .ok();
    client
        .batch_execute(&format!("DROP DATABASE IF EXISTS {}", db_name))
        .await?;
    Ok(())
}
