use crate::config::ScreenerSettings;
use crate::models::{EligibleTrade, ScoreBreakdown, SnapshotRecord, StrategyKind};
use crate::validation::ContractRejection;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Why a candidate (symbol, contract or contract pair) was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateRejection {
    PriceOutOfBand,
    AvgVolumeTooLow,
    MarketCapTooLow,
    EarningsInWindow,
    DteOutOfWindow,
    StrikeOutOfBand,
    StrikeNotOutOfTheMoney,
    MissingDelta,
    Contract(ContractRejection),
    LeapDteOutOfWindow,
    LeapNotInTheMoney,
    LeapDeltaTooLow,
    LeapOpenInterestTooLow,
    ShortDteOutOfWindow,
    ShortDeltaOutOfBand,
    ShortExpiryNotBeforeLeap,
    ShortStrikeNotAboveLeap,
    SolvencyCheckFailed,
    NoLeapCandidate,
    NoShortCandidate,
}

impl CandidateRejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::PriceOutOfBand => "PRICE_OUT_OF_BAND",
            Self::AvgVolumeTooLow => "AVG_VOLUME_TOO_LOW",
            Self::MarketCapTooLow => "MARKET_CAP_TOO_LOW",
            Self::EarningsInWindow => "EARNINGS_IN_WINDOW",
            Self::DteOutOfWindow => "DTE_OUT_OF_WINDOW",
            Self::StrikeOutOfBand => "STRIKE_OUT_OF_BAND",
            Self::StrikeNotOutOfTheMoney => "STRIKE_NOT_OTM",
            Self::MissingDelta => "MISSING_DELTA",
            Self::Contract(rejection) => rejection.code(),
            Self::LeapDteOutOfWindow => "LEAP_DTE_OUT_OF_WINDOW",
            Self::LeapNotInTheMoney => "LEAP_NOT_ITM",
            Self::LeapDeltaTooLow => "LEAP_DELTA_TOO_LOW",
            Self::LeapOpenInterestTooLow => "LEAP_OPEN_INTEREST_TOO_LOW",
            Self::ShortDteOutOfWindow => "SHORT_DTE_OUT_OF_WINDOW",
            Self::ShortDeltaOutOfBand => "SHORT_DELTA_OUT_OF_BAND",
            Self::ShortExpiryNotBeforeLeap => "SHORT_EXPIRY_NOT_BEFORE_LEAP",
            Self::ShortStrikeNotAboveLeap => "SHORT_STRIKE_NOT_ABOVE_LEAP",
            Self::SolvencyCheckFailed => "SOLVENCY_CHECK_FAILED",
            Self::NoLeapCandidate => "NO_LEAP_CANDIDATE",
            Self::NoShortCandidate => "NO_SHORT_CANDIDATE",
        }
    }
}

impl fmt::Display for CandidateRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl From<ContractRejection> for CandidateRejection {
    fn from(rejection: ContractRejection) -> Self {
        Self::Contract(rejection)
    }
}

/// An eligible trade with its score, before market bias.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub trade: EligibleTrade,
    pub breakdown: ScoreBreakdown,
    pub base_score: f64,
    pub warnings: Vec<String>,
}

/// Outcome of running one strategy over one validated snapshot.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub candidate: Option<ScoredCandidate>,
    pub rejections: BTreeMap<CandidateRejection, usize>,
}

impl Selection {
    pub fn reject(&mut self, rejection: CandidateRejection) {
        *self.rejections.entry(rejection).or_insert(0) += 1;
    }

    pub fn rejected(rejection: CandidateRejection) -> Self {
        let mut selection = Self::default();
        selection.reject(rejection);
        selection
    }

    /// Keeps `candidate` if it beats the current one under `prefer`.
    pub fn offer<F>(&mut self, candidate: ScoredCandidate, prefer: F)
    where
        F: Fn(&ScoredCandidate, &ScoredCandidate) -> Ordering,
    {
        let replace = match self.candidate.as_ref() {
            None => true,
            Some(current) => prefer(&candidate, current) == Ordering::Less,
        };
        if replace {
            self.candidate = Some(candidate);
        }
    }
}

/// Higher score first.
pub fn by_score_desc(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.base_score.total_cmp(&a.base_score)
}

/// Strategy filter over a snapshot whose chain already passed validation.
/// Implementations are pure: same snapshot in, same selection out.
pub trait StrategySelector: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn requires_puts(&self) -> bool {
        false
    }

    fn select(&self, record: &SnapshotRecord) -> Selection;
}

#[path = "strategies/covered_call.rs"]
pub mod covered_call;

pub use covered_call::CoveredCallSelector;

#[path = "strategies/pmcc.rs"]
pub mod pmcc;

pub use pmcc::PmccSelector;

pub fn create_selectors(settings: &ScreenerSettings) -> Vec<Box<dyn StrategySelector>> {
    vec![
        Box::new(CoveredCallSelector::new(
            settings.covered_call.clone(),
            settings.pricing.clone(),
            settings.profile,
        )),
        Box::new(PmccSelector::new(
            settings.pmcc.clone(),
            settings.pricing.clone(),
            settings.profile,
        )),
    ]
}
