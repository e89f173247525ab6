//! Chain and contract validation over stored snapshots.
//!
//! Everything here is pure: no market data access, no store access. Prices
//! come from the bid (sell legs) or the ask (buy legs) and nothing else.

use crate::config::PricingRules;
use crate::models::{LegSide, OptionChainSnapshot, OptionContract, OptionType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

const RATIO_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractRejection {
    InvalidBid,
    InvalidAsk,
    SpreadTooWide,
}

impl ContractRejection {
    pub fn code(&self) -> &'static str {
        match self {
            ContractRejection::InvalidBid => "INVALID_BID",
            ContractRejection::InvalidAsk => "INVALID_ASK",
            ContractRejection::SpreadTooWide => "SPREAD_TOO_WIDE",
        }
    }
}

impl fmt::Display for ContractRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ChainRejection {
    DateValidationFailed,
    NoExpiries,
    NoCalls,
    NoPuts,
    InsufficientStrikes { found: usize, required: usize },
    InsufficientBids { found: usize, required: usize },
}

impl ChainRejection {
    pub fn code(&self) -> &'static str {
        match self {
            ChainRejection::DateValidationFailed => "CHAIN_DATE_VALIDATION_FAILED",
            ChainRejection::NoExpiries => "CHAIN_NO_EXPIRIES",
            ChainRejection::NoCalls => "CHAIN_NO_CALLS",
            ChainRejection::NoPuts => "CHAIN_NO_PUTS",
            ChainRejection::InsufficientStrikes { .. } => "CHAIN_INSUFFICIENT_STRIKES",
            ChainRejection::InsufficientBids { .. } => "CHAIN_INSUFFICIENT_BIDS",
        }
    }
}

impl fmt::Display for ChainRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainRejection::InsufficientStrikes { found, required }
            | ChainRejection::InsufficientBids { found, required } => {
                write!(f, "{} ({} < {})", self.code(), found, required)
            }
            _ => f.write_str(self.code()),
        }
    }
}

pub fn within_strike_band(strike: f64, stock_price: f64, band_ratio: f64) -> bool {
    if stock_price <= 0.0 || !strike.is_finite() {
        return false;
    }
    ((strike - stock_price).abs() / stock_price) <= band_ratio + RATIO_EPSILON
}

/// Chain-level gate. A rejected chain is invisible to every strategy for the run.
pub fn validate_chain(
    chain: &OptionChainSnapshot,
    rules: &PricingRules,
    require_puts: bool,
) -> Result<(), ChainRejection> {
    if !chain.date_validation_passed {
        return Err(ChainRejection::DateValidationFailed);
    }
    if chain.expiries.is_empty() {
        return Err(ChainRejection::NoExpiries);
    }
    if !chain
        .contracts
        .iter()
        .any(|contract| contract.option_type == OptionType::Call)
    {
        return Err(ChainRejection::NoCalls);
    }
    if require_puts
        && !chain
            .contracts
            .iter()
            .any(|contract| contract.option_type == OptionType::Put)
    {
        return Err(ChainRejection::NoPuts);
    }

    let strikes_in_band: BTreeSet<i64> = chain
        .contracts
        .iter()
        .filter(|contract| {
            within_strike_band(
                contract.strike,
                chain.stock_price_reference,
                rules.strike_band_ratio,
            )
        })
        .map(|contract| (contract.strike * 1000.0).round() as i64)
        .collect();
    if strikes_in_band.len() < rules.min_chain_strikes {
        return Err(ChainRejection::InsufficientStrikes {
            found: strikes_in_band.len(),
            required: rules.min_chain_strikes,
        });
    }

    let positive_bids = chain
        .contracts
        .iter()
        .filter(|contract| contract.bid > 0.0 && contract.bid.is_finite())
        .count();
    if positive_bids < rules.min_positive_bid_contracts {
        return Err(ChainRejection::InsufficientBids {
            found: positive_bids,
            required: rules.min_positive_bid_contracts,
        });
    }

    Ok(())
}

/// Price a sell leg receives: the bid, strictly positive.
pub fn sell_price(contract: &OptionContract) -> Result<f64, ContractRejection> {
    if contract.bid > 0.0 && contract.bid.is_finite() {
        Ok(contract.bid)
    } else {
        Err(ContractRejection::InvalidBid)
    }
}

/// Price a buy leg pays: the ask, strictly positive.
pub fn buy_price(contract: &OptionContract) -> Result<f64, ContractRejection> {
    if contract.ask > 0.0 && contract.ask.is_finite() {
        Ok(contract.ask)
    } else {
        Err(ContractRejection::InvalidAsk)
    }
}

pub fn spread_within(contract: &OptionContract, max_spread_ratio: f64) -> Result<f64, ContractRejection> {
    let Some(spread) = contract.spread_ratio() else {
        return Err(ContractRejection::InvalidAsk);
    };
    if spread > max_spread_ratio + RATIO_EPSILON {
        return Err(ContractRejection::SpreadTooWide);
    }
    Ok(spread)
}

/// Contract-level gate for a leg. Returns the leg's execution price.
pub fn validate_contract(
    contract: &OptionContract,
    side: LegSide,
    max_spread_ratio: f64,
) -> Result<f64, ContractRejection> {
    let price = match side {
        LegSide::Sell => sell_price(contract)?,
        LegSide::Buy => buy_price(contract)?,
    };
    spread_within(contract, max_spread_ratio)?;
    Ok(price)
}

/// Side-independent validity stamped on each contract at ingestion.
pub fn assess_contract(contract: &OptionContract, rules: &PricingRules) -> Option<ContractRejection> {
    sell_price(contract)
        .and_then(|_| buy_price(contract))
        .and_then(|_| spread_within(contract, rules.max_spread_ratio))
        .err()
}
