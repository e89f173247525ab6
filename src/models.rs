use crate::validation::{ChainRejection, ContractRejection};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum OptionType {
    Call,
    Put,
}

/// Which side of the book a leg trades against: sells fill at the bid, buys at the ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegSide {
    Sell,
    Buy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    CoveredCall,
    Pmcc,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 2] = [StrategyKind::CoveredCall, StrategyKind::Pmcc];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::CoveredCall => "covered_call",
            StrategyKind::Pmcc => "pmcc",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cc" | "covered_call" | "covered-call" => Ok(StrategyKind::CoveredCall),
            "pmcc" => Ok(StrategyKind::Pmcc),
            other => Err(anyhow!("Unknown strategy: {}", other)),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionContract {
    pub contract_id: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub dte: i64,
    pub option_type: OptionType,
    pub bid: f64,
    pub ask: f64,
    /// Informational only; never used for valuation.
    pub last_price: Option<f64>,
    pub volume: i64,
    pub open_interest: i64,
    pub implied_volatility: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub greeks_estimated: bool,
    pub is_valid: bool,
    pub rejection_reason: Option<ContractRejection>,
}

impl OptionContract {
    /// `(ask - bid) / ask`, or `None` when the ask is not positive.
    pub fn spread_ratio(&self) -> Option<f64> {
        if self.ask > 0.0 && self.ask.is_finite() && self.bid.is_finite() {
            Some((self.ask - self.bid) / self.ask)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StockSnapshot {
    pub symbol: String,
    pub trading_day: NaiveDate,
    /// Previous official close. Never an intraday or extended-hours quote.
    pub stock_price: f64,
    pub stock_price_trade_date: NaiveDate,
    pub captured_at: DateTime<Utc>,
    pub data_age_hours: f64,
    pub volume: i64,
    pub avg_volume: i64,
    pub market_cap: f64,
    pub next_earnings_date: Option<NaiveDate>,
    pub analyst_rating: Option<String>,
    pub iv_rank: Option<f64>,
    pub fifty_day_average: Option<f64>,
    pub two_hundred_day_average: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub completeness_flag: bool,
    pub rejection_reason: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionChainSnapshot {
    pub symbol: String,
    pub trading_day: NaiveDate,
    pub stock_price_reference: f64,
    pub stock_price_trade_date: NaiveDate,
    pub options_trade_date: NaiveDate,
    pub captured_at: DateTime<Utc>,
    pub expiries: Vec<NaiveDate>,
    pub contracts: Vec<OptionContract>,
    pub total_contracts: usize,
    pub valid_contracts: usize,
    pub rejection_samples: Vec<String>,
    pub completeness_flag: bool,
    pub date_validation_passed: bool,
    pub source: String,
}

impl OptionChainSnapshot {
    pub fn calls(&self) -> impl Iterator<Item = &OptionContract> {
        self.contracts
            .iter()
            .filter(|contract| contract.option_type == OptionType::Call)
    }
}

/// One stored (stock, chain) pair for a symbol and trading day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub revision: u32,
    pub content_hash: String,
    pub stock: StockSnapshot,
    pub chain: OptionChainSnapshot,
    pub override_operator: Option<String>,
}

impl SnapshotRecord {
    pub fn symbol(&self) -> &str {
        &self.stock.symbol
    }

    pub fn trading_day(&self) -> NaiveDate {
        self.stock.trading_day
    }

    pub fn is_scannable(&self) -> bool {
        self.stock.completeness_flag
            && self.chain.completeness_flag
            && self.chain.date_validation_passed
    }
}

/// Caller-supplied authorization to replace a final snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminOverride {
    pub operator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "code", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    MissingQuote,
    MissingChain,
    DateMismatch,
    IncompleteData(String),
    ChainRejected(ChainRejection),
    StoreUnavailable,
}

impl ExclusionReason {
    pub fn code(&self) -> &'static str {
        match self {
            ExclusionReason::MissingQuote => "MISSING_QUOTE",
            ExclusionReason::MissingChain => "MISSING_CHAIN",
            ExclusionReason::DateMismatch => "DATE_MISMATCH",
            ExclusionReason::IncompleteData(_) => "INCOMPLETE_DATA",
            ExclusionReason::ChainRejected(rejection) => rejection.code(),
            ExclusionReason::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::IncompleteData(detail) => write!(f, "{} ({})", self.code(), detail),
            ExclusionReason::ChainRejected(rejection) => write!(f, "{}", rejection),
            _ => f.write_str(self.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Included,
    Reused,
    Excluded,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Included => "included",
            AuditOutcome::Reused => "reused",
            AuditOutcome::Excluded => "excluded",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngestionAuditRecord {
    pub run_id: Option<String>,
    pub symbol: String,
    pub trading_day: NaiveDate,
    pub outcome: AuditOutcome,
    pub reason: Option<ExclusionReason>,
    pub attempts: u32,
    pub revision: Option<u32>,
    pub operator: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoveredCallTrade {
    pub symbol: String,
    pub stock_price: f64,
    pub contract_id: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub dte: i64,
    /// Bid of the short call.
    pub premium: f64,
    pub ask: f64,
    pub delta: f64,
    pub implied_volatility: Option<f64>,
    pub open_interest: i64,
    pub option_volume: i64,
    pub avg_volume: i64,
    pub market_cap: f64,
    pub spread_ratio: f64,
    pub otm_ratio: f64,
    pub premium_yield: f64,
    pub annualized_yield: f64,
    pub days_to_earnings: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PmccLeg {
    pub contract_id: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub dte: i64,
    pub delta: f64,
    pub implied_volatility: Option<f64>,
    pub bid: f64,
    pub ask: f64,
    pub open_interest: i64,
    pub volume: i64,
    pub spread_ratio: f64,
}

impl PmccLeg {
    pub fn from_contract(contract: &OptionContract, delta: f64, spread_ratio: f64) -> Self {
        Self {
            contract_id: contract.contract_id.clone(),
            strike: contract.strike,
            expiry: contract.expiry,
            dte: contract.dte,
            delta,
            implied_volatility: contract.implied_volatility,
            bid: contract.bid,
            ask: contract.ask,
            open_interest: contract.open_interest,
            volume: contract.volume,
            spread_ratio,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PmccTrade {
    pub symbol: String,
    pub stock_price: f64,
    pub long_leg: PmccLeg,
    /// Ask of the LEAP.
    pub long_cost: f64,
    pub short_leg: PmccLeg,
    /// Bid of the short call.
    pub short_premium: f64,
    pub net_debit: f64,
    pub width: f64,
    pub breakeven: f64,
    pub max_profit: f64,
    pub breakeven_warning: bool,
    pub iv_rank: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum EligibleTrade {
    CoveredCall(CoveredCallTrade),
    Pmcc(PmccTrade),
}

impl EligibleTrade {
    pub fn symbol(&self) -> &str {
        match self {
            EligibleTrade::CoveredCall(trade) => &trade.symbol,
            EligibleTrade::Pmcc(trade) => &trade.symbol,
        }
    }

    pub fn strategy(&self) -> StrategyKind {
        match self {
            EligibleTrade::CoveredCall(_) => StrategyKind::CoveredCall,
            EligibleTrade::Pmcc(_) => StrategyKind::Pmcc,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FactorScore {
    pub name: String,
    pub max_points: f64,
    pub achieved_points: f64,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PillarScore {
    pub pillar: String,
    pub weight: f64,
    pub max_points: f64,
    pub achieved_points: f64,
    pub percentage: f64,
    pub explanation: String,
    pub factors: Vec<FactorScore>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub pillars: Vec<PillarScore>,
}

impl ScoreBreakdown {
    pub fn total_points(&self) -> f64 {
        self.pillars.iter().map(|pillar| pillar.achieved_points).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub run_id: String,
    pub computed_at: DateTime<Utc>,
    pub strategy: StrategyKind,
    pub symbol: String,
    pub trading_day: NaiveDate,
    pub trade: EligibleTrade,
    pub base_score: f64,
    pub final_score: f64,
    pub bias_weight: f64,
    pub breakdown: ScoreBreakdown,
    pub warnings: Vec<String>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Ingesting,
    Validating,
    Selecting,
    Scoring,
    Committed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Ingesting => "INGESTING",
            RunState::Validating => "VALIDATING",
            RunState::Selecting => "SELECTING",
            RunState::Scoring => "SCORING",
            RunState::Committed => "COMMITTED",
            RunState::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RunState::Pending),
            "INGESTING" => Ok(RunState::Ingesting),
            "VALIDATING" => Ok(RunState::Validating),
            "SELECTING" => Ok(RunState::Selecting),
            "SCORING" => Ok(RunState::Scoring),
            "COMMITTED" => Ok(RunState::Committed),
            "FAILED" => Ok(RunState::Failed),
            other => Err(anyhow!("Unknown run state: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Committed | RunState::Failed)
    }

    /// Legal forward transitions; `Failed` is reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunState::Failed {
            return true;
        }
        matches!(
            (self, next),
            (RunState::Pending, RunState::Ingesting)
                | (RunState::Ingesting, RunState::Validating)
                | (RunState::Validating, RunState::Selecting)
                | (RunState::Selecting, RunState::Scoring)
                | (RunState::Scoring, RunState::Committed)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: String,
    pub state: RunState,
    pub trading_day: Option<NaiveDate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub symbols_requested: usize,
    pub symbols_ingested: usize,
    pub symbols_excluded: usize,
    pub exclusion_breakdown: BTreeMap<String, usize>,
    pub cc_count: usize,
    pub pmcc_count: usize,
    pub duration_seconds: f64,
    pub error: Option<String>,
}
