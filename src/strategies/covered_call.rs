use crate::config::{CoveredCallConfig, PricingRules, ScanProfile};
use crate::models::{
    CoveredCallTrade, EligibleTrade, LegSide, OptionContract, SnapshotRecord, StockSnapshot,
    StrategyKind,
};
use crate::scoring::{base_score, score_covered_call};
use crate::strategy::{
    by_score_desc, CandidateRejection, ScoredCandidate, Selection, StrategySelector,
};
use crate::validation::{validate_contract, within_strike_band, ContractRejection};

const RATIO_EPSILON: f64 = 1e-9;

pub struct CoveredCallSelector {
    config: CoveredCallConfig,
    pricing: PricingRules,
    profile: ScanProfile,
}

impl CoveredCallSelector {
    pub fn new(config: CoveredCallConfig, pricing: PricingRules, profile: ScanProfile) -> Self {
        Self {
            config,
            pricing,
            profile,
        }
    }

    fn screen_stock(&self, stock: &StockSnapshot) -> Result<(), CandidateRejection> {
        let (price_min, price_max) = self.config.price_band(self.profile);
        if stock.stock_price < price_min || stock.stock_price > price_max {
            return Err(CandidateRejection::PriceOutOfBand);
        }
        if (stock.avg_volume as f64) < self.config.min_avg_volume {
            return Err(CandidateRejection::AvgVolumeTooLow);
        }
        if stock.market_cap < self.config.min_market_cap {
            return Err(CandidateRejection::MarketCapTooLow);
        }
        Ok(())
    }

    fn evaluate(
        &self,
        stock: &StockSnapshot,
        contract: &OptionContract,
    ) -> Result<CoveredCallTrade, CandidateRejection> {
        let days_to_earnings = stock
            .next_earnings_date
            .map(|earnings| (earnings - contract.expiry).num_days());
        if let Some(days) = days_to_earnings {
            if days.abs() <= self.config.earnings_window_days {
                return Err(CandidateRejection::EarningsInWindow);
            }
        }

        if !self.config.dte_mode.contains(contract.dte) {
            return Err(CandidateRejection::DteOutOfWindow);
        }

        let price = stock.stock_price;
        if !within_strike_band(contract.strike, price, self.pricing.strike_band_ratio) {
            return Err(CandidateRejection::StrikeOutOfBand);
        }
        let otm_ratio = (contract.strike - price) / price;
        if otm_ratio < self.config.otm_min_ratio - RATIO_EPSILON
            || otm_ratio > self.config.otm_max_ratio + RATIO_EPSILON
        {
            return Err(CandidateRejection::StrikeNotOutOfTheMoney);
        }

        let premium = validate_contract(contract, LegSide::Sell, self.pricing.max_spread_ratio)?;
        let delta = contract.delta.ok_or(CandidateRejection::MissingDelta)?;
        let spread_ratio = contract
            .spread_ratio()
            .ok_or(ContractRejection::InvalidAsk)?;

        let premium_yield = premium / price;
        Ok(CoveredCallTrade {
            symbol: stock.symbol.clone(),
            stock_price: price,
            contract_id: contract.contract_id.clone(),
            strike: contract.strike,
            expiry: contract.expiry,
            dte: contract.dte,
            premium,
            ask: contract.ask,
            delta,
            implied_volatility: contract.implied_volatility,
            open_interest: contract.open_interest,
            option_volume: contract.volume,
            avg_volume: stock.avg_volume,
            market_cap: stock.market_cap,
            spread_ratio,
            otm_ratio,
            premium_yield,
            annualized_yield: premium_yield * 365.0 / contract.dte.max(1) as f64,
            days_to_earnings,
        })
    }
}

fn prefer(a: &ScoredCandidate, b: &ScoredCandidate) -> std::cmp::Ordering {
    let (EligibleTrade::CoveredCall(left), EligibleTrade::CoveredCall(right)) = (&a.trade, &b.trade)
    else {
        return by_score_desc(a, b);
    };
    by_score_desc(a, b)
        .then_with(|| left.dte.cmp(&right.dte))
        .then_with(|| left.strike.total_cmp(&right.strike))
        .then_with(|| left.contract_id.cmp(&right.contract_id))
}

impl StrategySelector for CoveredCallSelector {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CoveredCall
    }

    fn select(&self, record: &SnapshotRecord) -> Selection {
        let stock = &record.stock;
        if let Err(rejection) = self.screen_stock(stock) {
            return Selection::rejected(rejection);
        }

        let mut selection = Selection::default();
        for contract in record.chain.calls() {
            match self.evaluate(stock, contract) {
                Ok(trade) => {
                    let breakdown = score_covered_call(&trade, stock);
                    let candidate = ScoredCandidate {
                        base_score: base_score(&breakdown),
                        trade: EligibleTrade::CoveredCall(trade),
                        breakdown,
                        warnings: Vec::new(),
                    };
                    selection.offer(candidate, prefer);
                }
                Err(rejection) => selection.reject(rejection),
            }
        }
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DteMode;
    use crate::models::{OptionChainSnapshot, OptionType};
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 22).unwrap()
    }

    fn call(strike: f64, dte: i64, bid: f64, ask: f64, delta: f64) -> OptionContract {
        OptionContract {
            contract_id: format!("XYZ-{}-{}", dte, strike),
            strike,
            expiry: day() + Duration::days(dte),
            dte,
            option_type: OptionType::Call,
            bid,
            ask,
            last_price: None,
            volume: 100,
            open_interest: 500,
            implied_volatility: Some(0.40),
            delta: Some(delta),
            gamma: None,
            theta: None,
            vega: None,
            greeks_estimated: false,
            is_valid: true,
            rejection_reason: None,
        }
    }

    fn record(price: f64, contracts: Vec<OptionContract>) -> SnapshotRecord {
        let captured_at = Utc.with_ymd_and_hms(2026, 1, 22, 21, 30, 0).unwrap();
        let stock = StockSnapshot {
            symbol: "XYZ".to_string(),
            trading_day: day(),
            stock_price: price,
            stock_price_trade_date: day(),
            captured_at,
            data_age_hours: 0.5,
            volume: 1_000_000,
            avg_volume: 2_000_000,
            market_cap: 1.0e10,
            next_earnings_date: None,
            analyst_rating: None,
            iv_rank: Some(45.0),
            fifty_day_average: None,
            two_hundred_day_average: None,
            fifty_two_week_high: None,
            fifty_two_week_low: None,
            completeness_flag: true,
            rejection_reason: None,
            source: "test".to_string(),
        };
        let chain = OptionChainSnapshot {
            symbol: "XYZ".to_string(),
            trading_day: day(),
            stock_price_reference: price,
            stock_price_trade_date: day(),
            options_trade_date: day(),
            captured_at,
            expiries: contracts.iter().map(|c| c.expiry).collect(),
            total_contracts: contracts.len(),
            valid_contracts: contracts.len(),
            contracts,
            rejection_samples: Vec::new(),
            completeness_flag: true,
            date_validation_passed: true,
            source: "test".to_string(),
        };
        SnapshotRecord {
            revision: 1,
            content_hash: String::new(),
            stock,
            chain,
            override_operator: None,
        }
    }

    fn selector(profile: ScanProfile) -> CoveredCallSelector {
        CoveredCallSelector::new(CoveredCallConfig::default(), PricingRules::default(), profile)
    }

    #[test]
    fn premium_is_the_bid() {
        let selection = selector(ScanProfile::Standard)
            .select(&record(55.0, vec![call(58.0, 10, 1.20, 1.30, 0.30)]));
        let candidate = selection.candidate.unwrap();
        let EligibleTrade::CoveredCall(trade) = candidate.trade else {
            panic!("expected covered call");
        };
        assert_eq!(trade.premium, 1.20);
        assert_eq!(trade.ask, 1.30);
    }

    #[test]
    fn price_band_widens_only_under_relaxed_profile() {
        let snapshot = record(120.0, vec![call(126.0, 10, 2.0, 2.1, 0.3)]);
        let standard = selector(ScanProfile::Standard).select(&snapshot);
        assert!(standard.candidate.is_none());
        assert_eq!(standard.rejections.get(&CandidateRejection::PriceOutOfBand), Some(&1));
        assert!(selector(ScanProfile::Relaxed).select(&snapshot).candidate.is_some());
    }

    #[test]
    fn relaxed_profile_keeps_pricing_rules() {
        let snapshot = record(120.0, vec![call(126.0, 10, 1.0, 1.5, 0.3)]);
        let selection = selector(ScanProfile::Relaxed).select(&snapshot);
        assert!(selection.candidate.is_none());
        assert_eq!(
            selection
                .rejections
                .get(&CandidateRejection::Contract(ContractRejection::SpreadTooWide)),
            Some(&1)
        );
    }

    #[test]
    fn filters_report_distinct_reasons() {
        let mut snapshot = record(
            55.0,
            vec![
                call(58.0, 3, 1.2, 1.3, 0.3),
                call(54.0, 10, 2.2, 2.3, 0.55),
                call(58.0, 10, 0.0, 1.3, 0.3),
            ],
        );
        snapshot.stock.next_earnings_date = None;
        let selection = selector(ScanProfile::Standard).select(&snapshot);
        assert!(selection.candidate.is_none());
        assert_eq!(selection.rejections.get(&CandidateRejection::DteOutOfWindow), Some(&1));
        assert_eq!(
            selection.rejections.get(&CandidateRejection::StrikeNotOutOfTheMoney),
            Some(&1)
        );
        assert_eq!(
            selection
                .rejections
                .get(&CandidateRejection::Contract(ContractRejection::InvalidBid)),
            Some(&1)
        );
    }

    #[test]
    fn earnings_near_expiry_blocks_contract() {
        let mut snapshot = record(55.0, vec![call(58.0, 10, 1.2, 1.3, 0.3)]);
        snapshot.stock.next_earnings_date = Some(day() + Duration::days(14));
        let selection = selector(ScanProfile::Standard).select(&snapshot);
        assert!(selection.candidate.is_none());
        assert_eq!(selection.rejections.get(&CandidateRejection::EarningsInWindow), Some(&1));
    }

    #[test]
    fn identical_candidates_resolve_deterministically() {
        let mut config = CoveredCallConfig::default();
        config.dte_mode = DteMode::Weekly;
        let selector = CoveredCallSelector::new(config, PricingRules::default(), ScanProfile::Standard);
        let first = call(58.0, 10, 1.2, 1.3, 0.3);
        let mut twin = first.clone();
        twin.contract_id = "XYZ-twin".to_string();
        let selection = selector.select(&record(55.0, vec![twin, first.clone()]));
        let EligibleTrade::CoveredCall(trade) = selection.candidate.unwrap().trade else {
            panic!("expected covered call");
        };
        assert_eq!(trade.contract_id, first.contract_id);
    }
}
