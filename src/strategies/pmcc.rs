use crate::config::{PmccConfig, PricingRules, ScanProfile};
use crate::errors::PipelineError;
use crate::models::{
    EligibleTrade, LegSide, OptionContract, PmccLeg, PmccTrade, SnapshotRecord, StrategyKind,
};
use crate::scoring::{base_score, round2, score_pmcc};
use crate::strategy::{
    by_score_desc, CandidateRejection, ScoredCandidate, Selection, StrategySelector,
};
use crate::validation::{validate_contract, ContractRejection};
use log::trace;

const PRICE_EPSILON: f64 = 1e-9;
pub const BREAKEVEN_WARNING: &str = "SHORT_STRIKE_AT_OR_BELOW_BREAKEVEN";

pub struct PmccSelector {
    config: PmccConfig,
    pricing: PricingRules,
    profile: ScanProfile,
}

struct PricedLeg<'a> {
    contract: &'a OptionContract,
    price: f64,
    leg: PmccLeg,
}

impl PmccSelector {
    pub fn new(config: PmccConfig, pricing: PricingRules, profile: ScanProfile) -> Self {
        Self {
            config,
            pricing,
            profile,
        }
    }

    fn screen_leap<'a>(
        &self,
        stock_price: f64,
        contract: &'a OptionContract,
    ) -> Result<PricedLeg<'a>, CandidateRejection> {
        if contract.dte < self.config.leap_dte_min || contract.dte > self.config.leap_dte_max {
            return Err(CandidateRejection::LeapDteOutOfWindow);
        }
        if contract.strike >= stock_price {
            return Err(CandidateRejection::LeapNotInTheMoney);
        }
        let delta = contract.delta.ok_or(CandidateRejection::MissingDelta)?;
        if delta < self.config.leap_delta_floor(self.profile) - PRICE_EPSILON {
            return Err(CandidateRejection::LeapDeltaTooLow);
        }
        if contract.open_interest < self.config.leap_open_interest_floor(self.profile) {
            return Err(CandidateRejection::LeapOpenInterestTooLow);
        }
        // The LEAP cap is never looser than the general spread rule.
        let spread_cap = self
            .config
            .leap_max_spread_ratio
            .min(self.pricing.max_spread_ratio);
        let price = validate_contract(contract, LegSide::Buy, spread_cap)?;
        let spread_ratio = contract.spread_ratio().ok_or(ContractRejection::InvalidAsk)?;
        Ok(PricedLeg {
            contract,
            price,
            leg: PmccLeg::from_contract(contract, delta, spread_ratio),
        })
    }

    fn screen_short<'a>(
        &self,
        contract: &'a OptionContract,
    ) -> Result<PricedLeg<'a>, CandidateRejection> {
        if contract.dte < 1 || contract.dte > self.config.short_max_dte {
            return Err(CandidateRejection::ShortDteOutOfWindow);
        }
        let delta = contract.delta.ok_or(CandidateRejection::MissingDelta)?;
        if delta < self.config.short_delta_min - PRICE_EPSILON
            || delta > self.config.short_delta_max + PRICE_EPSILON
        {
            return Err(CandidateRejection::ShortDeltaOutOfBand);
        }
        let price = validate_contract(contract, LegSide::Sell, self.pricing.max_spread_ratio)?;
        let spread_ratio = contract.spread_ratio().ok_or(ContractRejection::InvalidAsk)?;
        Ok(PricedLeg {
            contract,
            price,
            leg: PmccLeg::from_contract(contract, delta, spread_ratio),
        })
    }

    /// Structural acceptance of a (LEAP, short call) pair.
    pub fn check_pair(
        &self,
        symbol: &str,
        long_ask: f64,
        long_strike: f64,
        short_bid: f64,
        short_strike: f64,
    ) -> Result<PairEconomics, PipelineError> {
        let net_debit = long_ask - short_bid;
        let width = short_strike - long_strike;
        let limit = width * self.config.solvency_multiplier;
        if net_debit > limit + PRICE_EPSILON {
            return Err(PipelineError::SolvencyCheckFailed {
                net_debit,
                width,
                limit,
            });
        }
        let breakeven = long_strike + net_debit;
        trace!(
            "{} pair {:.2}/{:.2}: debit {:.2}, width {:.2}, breakeven {:.2}",
            symbol,
            long_strike,
            short_strike,
            net_debit,
            width,
            breakeven
        );
        Ok(PairEconomics {
            net_debit: round2(net_debit),
            width: round2(width),
            breakeven: round2(breakeven),
            max_profit: round2(width - net_debit),
            breakeven_warning: short_strike <= breakeven + PRICE_EPSILON,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairEconomics {
    pub net_debit: f64,
    pub width: f64,
    pub breakeven: f64,
    pub max_profit: f64,
    pub breakeven_warning: bool,
}

fn prefer(a: &ScoredCandidate, b: &ScoredCandidate) -> std::cmp::Ordering {
    let (EligibleTrade::Pmcc(left), EligibleTrade::Pmcc(right)) = (&a.trade, &b.trade) else {
        return by_score_desc(a, b);
    };
    by_score_desc(a, b)
        .then_with(|| left.short_leg.dte.cmp(&right.short_leg.dte))
        .then_with(|| left.short_leg.strike.total_cmp(&right.short_leg.strike))
        .then_with(|| left.long_leg.strike.total_cmp(&right.long_leg.strike))
        .then_with(|| left.long_leg.contract_id.cmp(&right.long_leg.contract_id))
        .then_with(|| left.short_leg.contract_id.cmp(&right.short_leg.contract_id))
}

impl StrategySelector for PmccSelector {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pmcc
    }

    fn select(&self, record: &SnapshotRecord) -> Selection {
        let stock = &record.stock;
        let mut selection = Selection::default();

        let mut leaps = Vec::new();
        let mut shorts = Vec::new();
        for contract in record.chain.calls() {
            if contract.dte >= self.config.leap_dte_min {
                match self.screen_leap(stock.stock_price, contract) {
                    Ok(leg) => leaps.push(leg),
                    Err(rejection) => selection.reject(rejection),
                }
            } else {
                match self.screen_short(contract) {
                    Ok(leg) => shorts.push(leg),
                    Err(rejection) => selection.reject(rejection),
                }
            }
        }
        if leaps.is_empty() {
            selection.reject(CandidateRejection::NoLeapCandidate);
            return selection;
        }
        if shorts.is_empty() {
            selection.reject(CandidateRejection::NoShortCandidate);
            return selection;
        }

        for long in &leaps {
            for short in &shorts {
                if short.contract.expiry >= long.contract.expiry {
                    selection.reject(CandidateRejection::ShortExpiryNotBeforeLeap);
                    continue;
                }
                if short.contract.strike <= long.contract.strike {
                    selection.reject(CandidateRejection::ShortStrikeNotAboveLeap);
                    continue;
                }
                let economics = match self.check_pair(
                    &stock.symbol,
                    long.price,
                    long.contract.strike,
                    short.price,
                    short.contract.strike,
                ) {
                    Ok(economics) => economics,
                    Err(_) => {
                        selection.reject(CandidateRejection::SolvencyCheckFailed);
                        continue;
                    }
                };

                let mut warnings = Vec::new();
                if economics.breakeven_warning {
                    warnings.push(BREAKEVEN_WARNING.to_string());
                }
                let trade = PmccTrade {
                    symbol: stock.symbol.clone(),
                    stock_price: stock.stock_price,
                    long_leg: long.leg.clone(),
                    long_cost: long.price,
                    short_leg: short.leg.clone(),
                    short_premium: short.price,
                    net_debit: economics.net_debit,
                    width: economics.width,
                    breakeven: economics.breakeven,
                    max_profit: economics.max_profit,
                    breakeven_warning: economics.breakeven_warning,
                    iv_rank: stock.iv_rank,
                };
                let breakdown = score_pmcc(&trade, stock);
                selection.offer(
                    ScoredCandidate {
                        base_score: base_score(&breakdown),
                        trade: EligibleTrade::Pmcc(trade),
                        breakdown,
                        warnings,
                    },
                    prefer,
                );
            }
        }
        selection
    }
}
