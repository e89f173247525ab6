use crate::models::{
    IngestionAuditRecord, RunState, RunStatus, ScanResult, SnapshotRecord, StrategyKind,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Persistence for snapshots, audits, run status and committed results.
///
/// Snapshots are append-only per `(symbol, trading_day)`; a record for an
/// existing revision is never replaced. Results are written once per run by
/// `commit_run`, all or nothing.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn latest_snapshot(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
    ) -> Result<Option<SnapshotRecord>>;

    /// Fails if a record with the same revision already exists.
    async fn append_snapshot(&self, record: &SnapshotRecord) -> Result<()>;

    async fn record_ingestion_audit(&self, records: &[IngestionAuditRecord]) -> Result<()>;

    async fn save_run_status(&self, status: &RunStatus) -> Result<()>;

    async fn load_run_status(&self, run_id: &str) -> Result<Option<RunStatus>>;

    async fn commit_run(&self, status: &RunStatus, results: &[ScanResult]) -> Result<()>;

    async fn latest_committed_run(&self) -> Result<Option<RunStatus>>;

    async fn load_results(&self, run_id: &str, strategy: StrategyKind) -> Result<Vec<ScanResult>>;
}

#[derive(Debug, Clone)]
pub struct ResultQuery {
    /// `None` resolves to the latest committed run.
    pub run_id: Option<String>,
    pub strategy: StrategyKind,
    pub min_score: Option<f64>,
    pub symbols: Option<Vec<String>>,
    pub limit: Option<usize>,
}

impl ResultQuery {
    pub fn latest(strategy: StrategyKind) -> Self {
        Self {
            run_id: None,
            strategy,
            min_score: None,
            symbols: None,
            limit: None,
        }
    }

    pub fn for_run<S: Into<String>>(run_id: S, strategy: StrategyKind) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::latest(strategy)
        }
    }
}

/// Results of one committed run. `committed_at` makes staleness visible.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResultPage {
    pub run_id: Option<String>,
    pub strategy: StrategyKind,
    pub trading_day: Option<NaiveDate>,
    pub committed_at: Option<DateTime<Utc>>,
    pub results: Vec<ScanResult>,
}

pub async fn resolve_committed_run(
    store: &dyn SnapshotStore,
    run_id: Option<&str>,
) -> Result<Option<RunStatus>> {
    let status = match run_id {
        Some(run_id) => store
            .load_run_status(run_id)
            .await?
            .ok_or_else(|| anyhow!("Unknown run {}", run_id))?,
        None => match store.latest_committed_run().await? {
            Some(status) => status,
            None => return Ok(None),
        },
    };
    if status.state != RunState::Committed {
        return Err(anyhow!(
            "Run {} is {} and has no readable results",
            status.run_id,
            status.state
        ));
    }
    Ok(Some(status))
}

/// Applies filters and the canonical ordering: final score descending, then symbol.
pub fn filter_and_order(mut results: Vec<ScanResult>, query: &ResultQuery) -> Vec<ScanResult> {
    if let Some(min_score) = query.min_score {
        results.retain(|result| result.final_score >= min_score);
    }
    if let Some(symbols) = query.symbols.as_ref() {
        let wanted: Vec<String> = symbols
            .iter()
            .map(|symbol| symbol.trim().to_ascii_uppercase())
            .collect();
        results.retain(|result| wanted.iter().any(|symbol| symbol == &result.symbol));
    }
    sort_results(&mut results);
    if let Some(limit) = query.limit {
        results.truncate(limit);
    }
    results
}

pub fn sort_results(results: &mut [ScanResult]) {
    results.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}

pub async fn query_results(store: &dyn SnapshotStore, query: &ResultQuery) -> Result<ScanResultPage> {
    let Some(run) = resolve_committed_run(store, query.run_id.as_deref()).await? else {
        return Ok(ScanResultPage {
            run_id: None,
            strategy: query.strategy,
            trading_day: None,
            committed_at: None,
            results: Vec::new(),
        });
    };
    let results = store.load_results(&run.run_id, query.strategy).await?;
    Ok(ScanResultPage {
        run_id: Some(run.run_id.clone()),
        strategy: query.strategy,
        trading_day: run.trading_day,
        committed_at: run.finished_at,
        results: filter_and_order(results, query),
    })
}
