use crate::models::{
    IngestionAuditRecord, RunState, RunStatus, ScanResult, SnapshotRecord, StrategyKind,
};
use crate::snapshot_store::SnapshotStore;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Process-local store for offline replays and tests.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<DashMap<(String, NaiveDate), Vec<SnapshotRecord>>>,
    audits: Arc<Mutex<Vec<IngestionAuditRecord>>>,
    runs: Arc<DashMap<String, RunStatus>>,
    results: Arc<DashMap<(String, StrategyKind), Vec<ScanResult>>>,
    fail_commits: Arc<AtomicBool>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `commit_run` fail, simulating an unavailable store.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot_revisions(&self, symbol: &str, trading_day: NaiveDate) -> Vec<SnapshotRecord> {
        self.snapshots
            .get(&(symbol.to_string(), trading_day))
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn audit_records(&self) -> Vec<IngestionAuditRecord> {
        self.audits
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn latest_snapshot(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
    ) -> Result<Option<SnapshotRecord>> {
        Ok(self
            .snapshots
            .get(&(symbol.to_string(), trading_day))
            .and_then(|entry| entry.iter().max_by_key(|record| record.revision).cloned()))
    }

    async fn append_snapshot(&self, record: &SnapshotRecord) -> Result<()> {
        let key = (record.symbol().to_string(), record.trading_day());
        let mut entry = self.snapshots.entry(key).or_default();
        if entry.iter().any(|existing| existing.revision == record.revision) {
            return Err(anyhow!(
                "Snapshot {} {} revision {} already exists",
                record.symbol(),
                record.trading_day(),
                record.revision
            ));
        }
        entry.push(record.clone());
        Ok(())
    }

    async fn record_ingestion_audit(&self, records: &[IngestionAuditRecord]) -> Result<()> {
        let mut guard = self
            .audits
            .lock()
            .map_err(|_| anyhow!("audit log lock poisoned"))?;
        guard.extend(records.iter().cloned());
        Ok(())
    }

    async fn save_run_status(&self, status: &RunStatus) -> Result<()> {
        if let Some(existing) = self.runs.get(&status.run_id) {
            let overwrites_failure =
                existing.state == RunState::Failed && status.state != RunState::Failed;
            if existing.state == RunState::Committed || overwrites_failure {
                return Err(anyhow!(
                    "Run {} is already terminal; refusing to record {}",
                    status.run_id,
                    status.state
                ));
            }
        }
        self.runs.insert(status.run_id.clone(), status.clone());
        Ok(())
    }

    async fn load_run_status(&self, run_id: &str) -> Result<Option<RunStatus>> {
        Ok(self.runs.get(run_id).map(|entry| entry.clone()))
    }

    async fn commit_run(&self, status: &RunStatus, results: &[ScanResult]) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(anyhow!("snapshot store unavailable"));
        }
        if status.state != RunState::Committed {
            return Err(anyhow!(
                "Run {} must be COMMITTED to commit, found {}",
                status.run_id,
                status.state
            ));
        }
        let stored_state = self.runs.get(&status.run_id).map(|entry| entry.state);
        if stored_state.is_some_and(|state| state.is_terminal()) {
            return Err(anyhow!(
                "Run {} is already COMMITTED or FAILED; nothing committed",
                status.run_id
            ));
        }
        if self
            .results
            .iter()
            .any(|entry| entry.key().0 == status.run_id)
        {
            return Err(anyhow!("Results for run {} already written", status.run_id));
        }

        let mut seen = HashSet::new();
        for result in results {
            if result.run_id != status.run_id {
                return Err(anyhow!(
                    "Result for {} belongs to run {}, not {}",
                    result.symbol,
                    result.run_id,
                    status.run_id
                ));
            }
            if !seen.insert((result.strategy, result.symbol.clone())) {
                return Err(anyhow!(
                    "Duplicate result for ({}, {}, {})",
                    status.run_id,
                    result.strategy,
                    result.symbol
                ));
            }
        }

        // Results land before the status flips so readers never see a partial run.
        for strategy in StrategyKind::ALL {
            let batch: Vec<ScanResult> = results
                .iter()
                .filter(|result| result.strategy == strategy)
                .cloned()
                .collect();
            self.results.insert((status.run_id.clone(), strategy), batch);
        }
        self.runs.insert(status.run_id.clone(), status.clone());
        Ok(())
    }

    async fn latest_committed_run(&self) -> Result<Option<RunStatus>> {
        Ok(self
            .runs
            .iter()
            .filter(|entry| entry.state == RunState::Committed)
            .map(|entry| entry.clone())
            .max_by(|a, b| {
                a.finished_at
                    .cmp(&b.finished_at)
                    .then_with(|| a.run_id.cmp(&b.run_id))
            }))
    }

    async fn load_results(&self, run_id: &str, strategy: StrategyKind) -> Result<Vec<ScanResult>> {
        Ok(self
            .results
            .get(&(run_id.to_string(), strategy))
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }
}
