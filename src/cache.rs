use crate::models::{ScanResult, StrategyKind};
use crate::snapshot_store::{
    filter_and_order, resolve_committed_run, ResultQuery, ScanResultPage, SnapshotStore,
};
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// Read-through cache over committed runs.
///
/// Committed result sets never change, so entries never need invalidating.
/// Filtering and ordering are the store query's own, applied to the cached
/// set, so a cached read and a store read always agree.
#[derive(Clone)]
pub struct ScanResultCache {
    store: Arc<dyn SnapshotStore>,
    local_cache: Arc<DashMap<(String, StrategyKind), Arc<Vec<ScanResult>>>>,
}

impl ScanResultCache {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            local_cache: Arc::new(DashMap::new()),
        }
    }

    pub fn get_cache_key(run_id: &str, strategy: StrategyKind) -> (String, StrategyKind) {
        (run_id.to_string(), strategy)
    }

    pub fn cached_runs(&self) -> usize {
        self.local_cache.len()
    }

    pub async fn query(&self, query: &ResultQuery) -> Result<ScanResultPage> {
        let Some(run) = resolve_committed_run(self.store.as_ref(), query.run_id.as_deref()).await?
        else {
            return Ok(ScanResultPage {
                run_id: None,
                strategy: query.strategy,
                trading_day: None,
                committed_at: None,
                results: Vec::new(),
            });
        };

        let cache_key = Self::get_cache_key(&run.run_id, query.strategy);
        let cached = self
            .local_cache
            .get(&cache_key)
            .map(|entry| Arc::clone(entry.value()));
        let results = match cached {
            Some(cached) => cached,
            None => {
                let loaded = Arc::new(self.store.load_results(&run.run_id, query.strategy).await?);
                log::debug!(
                    "Cached {} {} results for run {}",
                    loaded.len(),
                    query.strategy,
                    run.run_id
                );
                self.local_cache.insert(cache_key, Arc::clone(&loaded));
                loaded
            }
        };

        Ok(ScanResultPage {
            run_id: Some(run.run_id.clone()),
            strategy: query.strategy,
            trading_day: run.trading_day,
            committed_at: run.finished_at,
            results: filter_and_order(results.as_ref().clone(), query),
        })
    }
}
