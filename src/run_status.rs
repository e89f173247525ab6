use crate::models::{RunState, RunStatus};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Live status of one in-flight run, shared between the orchestrator and
/// operator-facing readers.
#[derive(Clone)]
pub struct RunProgress {
    inner: Arc<Mutex<RunProgressData>>,
}

struct RunProgressData {
    status: RunStatus,
    cancelled_by: Option<String>,
}

impl RunProgress {
    pub fn new(status: RunStatus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunProgressData {
                status,
                cancelled_by: None,
            })),
        }
    }

    pub fn set_state(&self, state: RunState) {
        if let Ok(mut data) = self.inner.lock() {
            data.status.state = state;
        }
    }

    pub fn set_ingestion(
        &self,
        symbols_ingested: usize,
        symbols_excluded: usize,
        exclusion_breakdown: BTreeMap<String, usize>,
    ) {
        if let Ok(mut data) = self.inner.lock() {
            data.status.symbols_ingested = symbols_ingested;
            data.status.symbols_excluded = symbols_excluded;
            data.status.exclusion_breakdown = exclusion_breakdown;
        }
    }

    pub fn set_counts(&self, cc_count: usize, pmcc_count: usize) {
        if let Ok(mut data) = self.inner.lock() {
            data.status.cc_count = cc_count;
            data.status.pmcc_count = pmcc_count;
        }
    }

    pub fn update<F: FnOnce(&mut RunStatus)>(&self, apply: F) {
        if let Ok(mut data) = self.inner.lock() {
            apply(&mut data.status);
        }
    }

    pub fn request_cancel<S: Into<String>>(&self, operator: S) {
        if let Ok(mut data) = self.inner.lock() {
            if data.cancelled_by.is_none() {
                data.cancelled_by = Some(operator.into());
            }
        }
    }

    pub fn cancelled_by(&self) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|data| data.cancelled_by.clone())
    }

    pub fn snapshot(&self) -> RunStatus {
        match self.inner.lock() {
            Ok(data) => data.status.clone(),
            Err(poisoned) => poisoned.into_inner().status.clone(),
        }
    }
}

/// In-flight runs by id. Finished runs are dropped; the store holds their
/// final status.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<DashMap<String, RunProgress>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, status: RunStatus) -> RunProgress {
        let progress = RunProgress::new(status);
        self.runs
            .insert(progress.snapshot().run_id, progress.clone());
        progress
    }

    pub fn get(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.get(run_id).map(|entry| entry.snapshot())
    }

    /// Returns false when no run with that id is in flight.
    pub fn request_cancel(&self, run_id: &str, operator: &str) -> bool {
        match self.runs.get(run_id) {
            Some(entry) => {
                entry.request_cancel(operator);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, run_id: &str) {
        self.runs.remove(run_id);
    }

    pub fn in_flight(&self) -> Vec<RunStatus> {
        let mut runs: Vec<RunStatus> = self.runs.iter().map(|entry| entry.snapshot()).collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pending(run_id: &str) -> RunStatus {
        RunStatus {
            run_id: run_id.to_string(),
            state: RunState::Pending,
            trading_day: None,
            started_at: Utc::now(),
            finished_at: None,
            symbols_requested: 3,
            symbols_ingested: 0,
            symbols_excluded: 0,
            exclusion_breakdown: BTreeMap::new(),
            cc_count: 0,
            pmcc_count: 0,
            duration_seconds: 0.0,
            error: None,
        }
    }

    #[test]
    fn registry_exposes_live_progress() {
        let registry = RunRegistry::new();
        let progress = registry.register(pending("run-1"));
        progress.set_state(RunState::Ingesting);
        progress.set_counts(2, 1);
        let status = registry.get("run-1").unwrap();
        assert_eq!(status.state, RunState::Ingesting);
        assert_eq!(status.cc_count, 2);
        registry.finish("run-1");
        assert!(registry.get("run-1").is_none());
    }

    #[test]
    fn first_cancel_request_wins() {
        let registry = RunRegistry::new();
        let progress = registry.register(pending("run-2"));
        assert!(registry.request_cancel("run-2", "alice"));
        assert!(registry.request_cancel("run-2", "bob"));
        assert_eq!(progress.cancelled_by().as_deref(), Some("alice"));
        assert!(!registry.request_cancel("missing", "alice"));
    }
}
