use crate::cache::ScanResultCache;
use crate::calendar::{Clock, SystemClock, TradingCalendar};
use crate::config::ScreenerSettings;
use crate::database::Database;
use crate::http_source::HttpMarketDataSource;
use crate::market_data::{MarketBiasSource, MarketDataSource, StaticBias};
use crate::orchestrator::ScanOrchestrator;
use crate::retry::{Sleeper, TokioSleeper};
use crate::snapshot_store::SnapshotStore;
use anyhow::{anyhow, Context, Result};
use log::info;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed screener commands."
            ));
        };
        Database::new(database_url).await
    }

    /// Connects, applies the schema and wires the full pipeline from the
    /// `settings` table.
    pub async fn scanner(&self) -> Result<ScannerContext> {
        let db = self.database().await?;
        db.ensure_schema().await?;
        let settings = ScreenerSettings::from_settings_map(&db.get_all_settings().await?)?;
        info!(
            "Loaded settings: profile {}, {} symbols in universe",
            settings.profile.label(),
            settings.universe.len()
        );
        let calendar = load_calendar(&settings)?;
        let source = build_market_data_source(&settings)?;
        let bias = settings
            .market_bias_weight
            .map(|weight| Arc::new(StaticBias(weight)) as Arc<dyn MarketBiasSource>);
        Ok(ScannerContext::from_components(
            settings,
            calendar,
            Arc::new(db),
            source,
            Arc::new(SystemClock),
            Arc::new(TokioSleeper),
            bias,
        ))
    }
}

pub fn load_calendar(settings: &ScreenerSettings) -> Result<TradingCalendar> {
    match settings.holiday_calendar_file.as_deref() {
        Some(path) => {
            info!("Using holiday calendar {}", path);
            TradingCalendar::load_from_file(path)
        }
        None => TradingCalendar::bundled_nyse(),
    }
}

pub fn build_market_data_source(settings: &ScreenerSettings) -> Result<Arc<dyn MarketDataSource>> {
    let base_url = settings
        .market_data_base_url
        .as_deref()
        .ok_or_else(|| anyhow!("MARKET_DATA_BASE_URL must be set to ingest market data."))?;
    let source = HttpMarketDataSource::new(
        base_url,
        settings.market_data_api_key.as_deref(),
        settings.ingestion.fetch_timeout,
    )
    .context("failed to build market data client")?;
    Ok(Arc::new(source))
}

/// Everything a command needs, built once per process.
pub struct ScannerContext {
    settings: Arc<ScreenerSettings>,
    store: Arc<dyn SnapshotStore>,
    orchestrator: ScanOrchestrator,
    cache: ScanResultCache,
}

impl ScannerContext {
    pub fn from_components(
        settings: ScreenerSettings,
        calendar: TradingCalendar,
        store: Arc<dyn SnapshotStore>,
        source: Arc<dyn MarketDataSource>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        bias: Option<Arc<dyn MarketBiasSource>>,
    ) -> Self {
        let settings = Arc::new(settings);
        let orchestrator = ScanOrchestrator::new(
            Arc::clone(&settings),
            Arc::new(calendar),
            clock,
            sleeper,
            source,
            Arc::clone(&store),
            bias,
        );
        let cache = ScanResultCache::new(Arc::clone(&store));
        Self {
            settings,
            store,
            orchestrator,
            cache,
        }
    }

    pub fn settings(&self) -> &ScreenerSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn orchestrator(&self) -> &ScanOrchestrator {
        &self.orchestrator
    }

    pub fn cache(&self) -> &ScanResultCache {
        &self.cache
    }
}
