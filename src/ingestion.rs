//! Fetch-and-store of per-symbol snapshot pairs.
//!
//! A snapshot for `(symbol, trading_day)` is final once stored. Re-ingesting
//! the same key is a no-op that returns the stored record, unless an
//! [`AdminOverride`] is supplied, in which case a new revision is appended.

use crate::calendar::{Clock, TradingCalendar};
use crate::config::{IngestionConfig, PricingRules};
use crate::errors::{CalendarError, ParseFailure, PipelineError, SourceError};
use crate::market_data::{MarketDataSource, OptionChainQuote, StockQuote};
use crate::models::{
    AdminOverride, AuditOutcome, ExclusionReason, IngestionAuditRecord, OptionChainSnapshot,
    OptionContract, SnapshotRecord, StockSnapshot,
};
use crate::retry::{retry_async, retry_store, Sleeper};
use crate::snapshot_store::SnapshotStore;
use crate::validation::assess_contract;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const MAX_REJECTION_SAMPLES: usize = 5;

/// Minimum spacing between outbound requests, shared by every worker.
pub struct RequestGate {
    min_gap: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_request: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        if self.min_gap.is_zero() {
            return;
        }
        let mut guard = self.last_request.lock().await;
        if let Some(last) = *guard {
            let elapsed = last.elapsed();
            if elapsed < self.min_gap {
                tokio::time::sleep(self.min_gap - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub enum IngestionOutcome {
    Stored(SnapshotRecord),
    Reused(SnapshotRecord),
    Excluded(ExclusionReason),
}

#[derive(Debug, Clone)]
pub struct SymbolIngestion {
    pub symbol: String,
    pub trading_day: NaiveDate,
    pub outcome: IngestionOutcome,
    /// Total source calls made, retries included. Zero for a reused snapshot.
    pub attempts: u32,
}

impl SymbolIngestion {
    pub fn record(&self) -> Option<&SnapshotRecord> {
        match &self.outcome {
            IngestionOutcome::Stored(record) | IngestionOutcome::Reused(record) => Some(record),
            IngestionOutcome::Excluded(_) => None,
        }
    }

    /// Why this symbol cannot be scanned, if it cannot.
    pub fn exclusion(&self) -> Option<ExclusionReason> {
        match &self.outcome {
            IngestionOutcome::Excluded(reason) => Some(reason.clone()),
            IngestionOutcome::Stored(record) | IngestionOutcome::Reused(record) => {
                unscannable_reason(record)
            }
        }
    }
}

pub fn unscannable_reason(record: &SnapshotRecord) -> Option<ExclusionReason> {
    if !record.chain.date_validation_passed {
        return Some(ExclusionReason::DateMismatch);
    }
    if !record.stock.completeness_flag {
        return Some(ExclusionReason::IncompleteData(
            record
                .stock
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "stock snapshot incomplete".to_string()),
        ));
    }
    if !record.chain.completeness_flag {
        return Some(ExclusionReason::IncompleteData(
            "option chain snapshot incomplete".to_string(),
        ));
    }
    None
}

/// Hex SHA-256 over the canonical JSON of a snapshot pair.
pub fn snapshot_content_hash(stock: &StockSnapshot, chain: &OptionChainSnapshot) -> Result<String> {
    let payload = serde_json::to_vec(&(stock, chain)).context("failed to serialize snapshot pair")?;
    Ok(hex::encode(Sha256::digest(&payload)))
}

pub struct SnapshotIngestionService {
    source: Arc<dyn MarketDataSource>,
    store: Arc<dyn SnapshotStore>,
    calendar: Arc<TradingCalendar>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    pricing: PricingRules,
    config: IngestionConfig,
    gate: RequestGate,
}

impl SnapshotIngestionService {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Arc<dyn SnapshotStore>,
        calendar: Arc<TradingCalendar>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        pricing: PricingRules,
        config: IngestionConfig,
    ) -> Self {
        let gate = RequestGate::new(config.min_request_gap);
        Self {
            source,
            store,
            calendar,
            clock,
            sleeper,
            pricing,
            config,
            gate,
        }
    }

    /// Ingests one symbol outside of any run and records its audit entry.
    pub async fn ingest_symbol(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        admin_override: Option<&AdminOverride>,
    ) -> Result<SymbolIngestion> {
        self.ingest_one(symbol, trading_day, admin_override, None).await
    }

    /// Ingests every symbol with at most `worker_limit` in flight. Returns
    /// once every symbol has been attempted; results are ordered by symbol.
    pub async fn ingest_universe(
        &self,
        symbols: &[String],
        trading_day: NaiveDate,
        admin_override: Option<&AdminOverride>,
        run_id: &str,
    ) -> Result<Vec<SymbolIngestion>> {
        let worker_limit = self.config.worker_limit.max(1).min(symbols.len().max(1));
        info!(
            "Ingesting {} symbols for {} with {} concurrent worker{}",
            symbols.len(),
            trading_day,
            worker_limit,
            if worker_limit == 1 { "" } else { "s" }
        );

        let mut pending = symbols.iter();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..worker_limit {
            if let Some(symbol) = pending.next() {
                in_flight.push(self.ingest_one(symbol, trading_day, admin_override, Some(run_id)));
            }
        }

        let mut results = Vec::with_capacity(symbols.len());
        while let Some(result) = in_flight.next().await {
            results.push(result?);
            if let Some(symbol) = pending.next() {
                in_flight.push(self.ingest_one(symbol, trading_day, admin_override, Some(run_id)));
            }
        }

        results.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(results)
    }

    async fn ingest_one(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        admin_override: Option<&AdminOverride>,
        run_id: Option<&str>,
    ) -> Result<SymbolIngestion> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if !self.calendar.is_trading_day(trading_day)? {
            return Err(PipelineError::Calendar(CalendarError::NotATradingDay(trading_day)).into());
        }

        let ingestion = self
            .fetch_and_store(&symbol, trading_day, admin_override)
            .await?;

        let audit = self.audit_record(&ingestion, admin_override, run_id);
        let audit_context = format!("recording ingestion audit for {}", symbol);
        retry_store(&self.config.retry, self.sleeper.as_ref(), &audit_context, || {
            self.store
                .record_ingestion_audit(std::slice::from_ref(&audit))
        })
        .await?;

        Ok(ingestion)
    }

    async fn fetch_and_store(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        admin_override: Option<&AdminOverride>,
    ) -> Result<SymbolIngestion> {
        let lookup_context = format!("loading snapshot for {} {}", symbol, trading_day);
        let existing = retry_store(&self.config.retry, self.sleeper.as_ref(), &lookup_context, || {
            self.store.latest_snapshot(symbol, trading_day)
        })
        .await?;

        if let Some(record) = existing.as_ref() {
            if admin_override.is_none() {
                debug!(
                    "Snapshot for {} {} already final (revision {}); skipping fetch",
                    symbol, trading_day, record.revision
                );
                return Ok(SymbolIngestion {
                    symbol: symbol.to_string(),
                    trading_day,
                    outcome: IngestionOutcome::Reused(record.clone()),
                    attempts: 0,
                });
            }
        }

        let quote_outcome = retry_async(
            &self.config.retry,
            self.sleeper.as_ref(),
            &format!("stock quote {}", symbol),
            |_| self.fetch_quote(symbol),
        )
        .await;
        let mut attempts = quote_outcome.attempts;
        let (quote, stock_price_trade_date) = match quote_outcome.result {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!("Excluding {}: stock quote unavailable ({})", symbol, err);
                return Ok(SymbolIngestion {
                    symbol: symbol.to_string(),
                    trading_day,
                    outcome: IngestionOutcome::Excluded(ExclusionReason::MissingQuote),
                    attempts,
                });
            }
        };

        let chain_outcome = retry_async(
            &self.config.retry,
            self.sleeper.as_ref(),
            &format!("option chain {}", symbol),
            |_| self.fetch_chain(symbol),
        )
        .await;
        attempts += chain_outcome.attempts;
        let (chain, options_trade_date) = match chain_outcome.result {
            Ok(resolved) => resolved,
            Err(err) => {
                debug!("Excluding {}: option chain unavailable ({})", symbol, err);
                return Ok(SymbolIngestion {
                    symbol: symbol.to_string(),
                    trading_day,
                    outcome: IngestionOutcome::Excluded(ExclusionReason::MissingChain),
                    attempts,
                });
            }
        };

        let captured_at = self.clock.now();
        let (stock, chain) = self.build_snapshots(
            symbol,
            trading_day,
            (quote, stock_price_trade_date),
            (chain, options_trade_date),
            captured_at,
        )?;
        if !chain.date_validation_passed {
            warn!(
                "{}",
                PipelineError::DateMismatch {
                    symbol: symbol.to_string(),
                    stock_date: chain.stock_price_trade_date,
                    options_date: chain.options_trade_date,
                }
            );
        }

        let record = SnapshotRecord {
            revision: existing.as_ref().map(|r| r.revision + 1).unwrap_or(1),
            content_hash: snapshot_content_hash(&stock, &chain)?,
            stock,
            chain,
            override_operator: admin_override.map(|o| o.operator.clone()),
        };
        if let Some(admin) = admin_override {
            info!(
                "Operator {} replaced snapshot {} {} with revision {}",
                admin.operator, symbol, trading_day, record.revision
            );
        }

        let append_context = format!("storing snapshot {} {}", symbol, trading_day);
        retry_store(&self.config.retry, self.sleeper.as_ref(), &append_context, || {
            self.store.append_snapshot(&record)
        })
        .await?;

        Ok(SymbolIngestion {
            symbol: symbol.to_string(),
            trading_day,
            outcome: IngestionOutcome::Stored(record),
            attempts,
        })
    }

    /// The quote with the session its close belongs to.
    async fn fetch_quote(&self, symbol: &str) -> Result<(StockQuote, NaiveDate), SourceError> {
        self.gate.wait().await;
        let raw = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch_stock_quote(symbol))
            .await
            .map_err(|_| SourceError::Timeout(self.config.fetch_timeout))??;
        let quote = raw.parse()?;
        let session = self.session_date(quote.previous_close_date, quote.as_of)?;
        Ok((quote, session))
    }

    async fn fetch_chain(&self, symbol: &str) -> Result<(OptionChainQuote, NaiveDate), SourceError> {
        self.gate.wait().await;
        let raw = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch_option_chain(symbol))
            .await
            .map_err(|_| SourceError::Timeout(self.config.fetch_timeout))??;
        let chain = raw.parse(symbol)?;
        let session = self.session_date(chain.trade_date, chain.as_of)?;
        Ok((chain, session))
    }

    /// A declared trade date wins; otherwise the session closed at `as_of`.
    /// An `as_of` the calendar cannot place is a bad payload for this symbol
    /// only, never a calendar failure of the run.
    fn session_date(
        &self,
        declared: Option<NaiveDate>,
        as_of: DateTime<Utc>,
    ) -> Result<NaiveDate, SourceError> {
        if let Some(date) = declared {
            return Ok(date);
        }
        self.calendar.last_trading_day(as_of).map_err(|err| {
            SourceError::Parse(ParseFailure::InvalidValue {
                field: "asOf",
                value: format!("{} ({})", as_of.to_rfc3339(), err),
            })
        })
    }

    fn build_snapshots(
        &self,
        symbol: &str,
        trading_day: NaiveDate,
        (quote, stock_price_trade_date): (StockQuote, NaiveDate),
        (chain, options_trade_date): (OptionChainQuote, NaiveDate),
        captured_at: DateTime<Utc>,
    ) -> Result<(StockSnapshot, OptionChainSnapshot), CalendarError> {
        let close = self.calendar.market_close_instant(trading_day)?;
        let data_age_hours =
            ((captured_at - close).num_seconds() as f64 / 3600.0 * 100.0).round() / 100.0;

        let stock_date_ok = stock_price_trade_date == trading_day;
        let stock = StockSnapshot {
            symbol: symbol.to_string(),
            trading_day,
            stock_price: quote.previous_close,
            stock_price_trade_date,
            captured_at,
            data_age_hours,
            volume: quote.volume,
            avg_volume: quote.avg_volume,
            market_cap: quote.market_cap,
            next_earnings_date: quote.next_earnings_date,
            analyst_rating: quote.analyst_rating,
            iv_rank: quote.iv_rank,
            fifty_day_average: quote.fifty_day_average,
            two_hundred_day_average: quote.two_hundred_day_average,
            fifty_two_week_high: quote.fifty_two_week_high,
            fifty_two_week_low: quote.fifty_two_week_low,
            completeness_flag: stock_date_ok,
            rejection_reason: if stock_date_ok {
                None
            } else {
                Some(format!(
                    "STOCK_TRADE_DATE_MISMATCH: close dated {} for trading day {}",
                    stock_price_trade_date, trading_day
                ))
            },
            source: self.source.name().to_string(),
        };

        let mut contracts = Vec::with_capacity(chain.contracts.len());
        let mut rejection_samples = Vec::new();
        for parsed in chain.contracts {
            let mut contract = OptionContract {
                contract_id: parsed.contract_id,
                strike: parsed.strike,
                expiry: parsed.expiry,
                dte: (parsed.expiry - trading_day).num_days(),
                option_type: parsed.option_type,
                bid: parsed.bid,
                ask: parsed.ask,
                last_price: parsed.last_price,
                volume: parsed.volume,
                open_interest: parsed.open_interest,
                implied_volatility: parsed.implied_volatility,
                delta: parsed.delta,
                gamma: parsed.gamma,
                theta: parsed.theta,
                vega: parsed.vega,
                // Greeks come straight from the source; nothing is estimated here.
                greeks_estimated: false,
                is_valid: true,
                rejection_reason: None,
            };
            if let Some(rejection) = assess_contract(&contract, &self.pricing) {
                contract.is_valid = false;
                contract.rejection_reason = Some(rejection);
                if rejection_samples.len() < MAX_REJECTION_SAMPLES {
                    rejection_samples.push(format!("{}: {}", contract.contract_id, rejection));
                }
            }
            contracts.push(contract);
        }

        let date_validation_passed = stock_price_trade_date == options_trade_date;
        let valid_contracts = contracts.iter().filter(|c| c.is_valid).count();
        let chain = OptionChainSnapshot {
            symbol: symbol.to_string(),
            trading_day,
            stock_price_reference: stock.stock_price,
            stock_price_trade_date,
            options_trade_date,
            captured_at,
            expiries: chain.expiries,
            total_contracts: contracts.len(),
            valid_contracts,
            contracts,
            rejection_samples,
            completeness_flag: date_validation_passed && options_trade_date == trading_day,
            date_validation_passed,
            source: self.source.name().to_string(),
        };

        Ok((stock, chain))
    }

    fn audit_record(
        &self,
        ingestion: &SymbolIngestion,
        admin_override: Option<&AdminOverride>,
        run_id: Option<&str>,
    ) -> IngestionAuditRecord {
        let reason = ingestion.exclusion();
        let outcome = match (&ingestion.outcome, reason.is_some()) {
            (_, true) => AuditOutcome::Excluded,
            (IngestionOutcome::Reused(_), false) => AuditOutcome::Reused,
            _ => AuditOutcome::Included,
        };
        IngestionAuditRecord {
            run_id: run_id.map(str::to_string),
            symbol: ingestion.symbol.clone(),
            trading_day: ingestion.trading_day,
            outcome,
            reason,
            attempts: ingestion.attempts,
            revision: ingestion.record().map(|record| record.revision),
            operator: match ingestion.outcome {
                IngestionOutcome::Stored(_) => admin_override.map(|o| o.operator.clone()),
                _ => None,
            },
            recorded_at: self.clock.now(),
        }
    }
}
