//! Pillar-weighted 0-100 quality score for eligible trades.
//!
//! Every pillar is a sum of independently capped factors, so no single input
//! can saturate its pillar. Points are rounded to cents at factor, pillar and
//! total level; the total is the sum of the rounded pillar points. Inputs the
//! snapshot does not carry score a fixed neutral share of their factor.

use crate::models::{
    CoveredCallTrade, FactorScore, PillarScore, PmccTrade, ScoreBreakdown, StockSnapshot,
};

pub const MIN_BIAS_WEIGHT: f64 = 0.75;
pub const MAX_BIAS_WEIGHT: f64 = 1.25;
pub const MAX_SCORE: f64 = 100.0;

const NEUTRAL_SHARE: f64 = 0.5;
const SCORED_SPREAD_CEILING: f64 = 0.10;
const IV_RANK_SWEET_LOW: f64 = 30.0;
const IV_RANK_SWEET_HIGH: f64 = 60.0;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn factor(name: &str, max_points: f64, share: f64, detail: String) -> FactorScore {
    FactorScore {
        name: name.to_string(),
        max_points,
        achieved_points: round2(max_points * clamp_unit(share)),
        detail,
    }
}

fn neutral(name: &str, max_points: f64, missing: &str) -> FactorScore {
    factor(
        name,
        max_points,
        NEUTRAL_SHARE,
        format!("{} unavailable, scored neutral", missing),
    )
}

fn pillar(name: &str, weight: f64, factors: Vec<FactorScore>) -> PillarScore {
    let max_points = round2(weight * MAX_SCORE);
    let achieved_points = round2(
        factors
            .iter()
            .map(|factor| factor.achieved_points)
            .sum::<f64>()
            .min(max_points),
    );
    let percentage = if max_points > 0.0 {
        round2(achieved_points / max_points * 100.0)
    } else {
        0.0
    };
    let explanation = format!(
        "{:.2}/{:.2} pts from {}",
        achieved_points,
        max_points,
        factors
            .iter()
            .map(|factor| format!("{} {:.2}/{:.2}", factor.name, factor.achieved_points, factor.max_points))
            .collect::<Vec<_>>()
            .join(", ")
    );
    PillarScore {
        pillar: name.to_string(),
        weight,
        max_points,
        achieved_points,
        percentage,
        explanation,
        factors,
    }
}

/// Sum of rounded pillar points.
pub fn base_score(breakdown: &ScoreBreakdown) -> f64 {
    round2(breakdown.total_points())
}

/// Clamps the external bias weight and applies it. Returns `(final_score, weight)`.
pub fn apply_market_bias(base: f64, weight: Option<f64>) -> (f64, f64) {
    let weight = match weight {
        Some(value) if value.is_finite() => value.clamp(MIN_BIAS_WEIGHT, MAX_BIAS_WEIGHT),
        _ => 1.0,
    };
    (round2(base * weight).min(MAX_SCORE), weight)
}

fn iv_rank_factor(name: &str, max_points: f64, iv_rank: Option<f64>) -> FactorScore {
    let Some(rank) = iv_rank else {
        return neutral(name, max_points, "IV rank");
    };
    let share = if rank < IV_RANK_SWEET_LOW {
        rank / IV_RANK_SWEET_LOW
    } else if rank <= IV_RANK_SWEET_HIGH {
        1.0
    } else {
        (100.0 - rank) / (100.0 - IV_RANK_SWEET_HIGH)
    };
    factor(
        name,
        max_points,
        share,
        format!(
            "IV rank {:.1} vs {:.0}-{:.0} sweet spot",
            rank, IV_RANK_SWEET_LOW, IV_RANK_SWEET_HIGH
        ),
    )
}

fn trend_factor(max_points: f64, stock: &StockSnapshot) -> FactorScore {
    let price = stock.stock_price;
    match (stock.fifty_day_average, stock.two_hundred_day_average) {
        (Some(fifty), Some(two_hundred)) => {
            let above = [fifty, two_hundred].iter().filter(|avg| price >= **avg).count();
            let share = match above {
                2 => 1.0,
                1 => 0.6,
                _ => 0.2,
            };
            factor(
                "trend",
                max_points,
                share,
                format!(
                    "close {:.2} above {} of 50d {:.2} / 200d {:.2}",
                    price, above, fifty, two_hundred
                ),
            )
        }
        _ => neutral("trend", max_points, "moving averages"),
    }
}

fn range_position_factor(max_points: f64, stock: &StockSnapshot) -> FactorScore {
    match (stock.fifty_two_week_low, stock.fifty_two_week_high) {
        (Some(low), Some(high)) if high > low => {
            let position = (stock.stock_price - low) / (high - low);
            let share = if position < 0.3 {
                position / 0.3
            } else if position <= 0.8 {
                1.0
            } else {
                (1.0 - position) / 0.2 * 0.5 + 0.5
            };
            factor(
                "range_position",
                max_points,
                share,
                format!("{:.0}% of 52-week range", clamp_unit(position) * 100.0),
            )
        }
        _ => neutral("range_position", max_points, "52-week range"),
    }
}

fn spread_share(spread_ratio: f64) -> f64 {
    1.0 - spread_ratio / SCORED_SPREAD_CEILING
}

pub fn score_covered_call(trade: &CoveredCallTrade, stock: &StockSnapshot) -> ScoreBreakdown {
    let volatility = {
        let iv_rank = iv_rank_factor("iv_rank_sweet_spot", 10.0, stock.iv_rank);
        let premium_yield = factor(
            "premium_yield",
            12.0,
            trade.annualized_yield / 0.30,
            format!(
                "{:.2}% yield, {:.1}% annualized (full at 30%)",
                trade.premium_yield * 100.0,
                trade.annualized_yield * 100.0
            ),
        );
        let iv_efficiency = match trade.implied_volatility {
            Some(iv) if iv > 0.0 && trade.dte > 0 => {
                let expected_move = iv * (trade.dte as f64 / 365.0).sqrt();
                let ratio = trade.premium_yield / expected_move;
                factor(
                    "iv_efficiency",
                    8.0,
                    ratio / 0.20,
                    format!(
                        "premium is {:.1}% of the {:.1}% one-sigma move",
                        ratio * 100.0,
                        expected_move * 100.0
                    ),
                )
            }
            _ => neutral("iv_efficiency", 8.0, "implied volatility"),
        };
        pillar(
            "Volatility & Pricing Edge",
            0.30,
            vec![iv_rank, premium_yield, iv_efficiency],
        )
    };

    let greeks = {
        let delta = trade.delta.abs();
        let delta_share = if delta < 0.20 {
            delta / 0.20
        } else if delta <= 0.35 {
            1.0
        } else {
            1.0 - (delta - 0.35) / 0.30
        };
        let delta_target = factor(
            "delta_target",
            12.0,
            delta_share,
            format!("delta {:.2} vs 0.20-0.35 target", delta),
        );
        let otm_share = if trade.otm_ratio < 0.04 {
            trade.otm_ratio / 0.04
        } else if trade.otm_ratio <= 0.07 {
            1.0
        } else {
            1.0 - (trade.otm_ratio - 0.07) / 0.06
        };
        let otm_cushion = factor(
            "otm_cushion",
            8.0,
            otm_share,
            format!("strike {:.1}% above close", trade.otm_ratio * 100.0),
        );
        let theta_share = match trade.dte {
            dte if dte <= 14 => 1.0,
            dte if dte <= 30 => 0.7,
            _ => 0.4,
        };
        let theta_capture = factor(
            "theta_capture",
            5.0,
            theta_share,
            format!("{} DTE", trade.dte),
        );
        pillar(
            "Greeks Efficiency",
            0.25,
            vec![delta_target, otm_cushion, theta_capture],
        )
    };

    let technical = pillar(
        "Technical Stability",
        0.20,
        vec![trend_factor(10.0, stock), range_position_factor(10.0, stock)],
    );

    let fundamental = {
        let cap_share = (trade.market_cap.max(1.0).log10() - 9.0) / (5.0e10_f64.log10() - 9.0);
        let market_cap = factor(
            "market_cap",
            8.0,
            cap_share,
            format!("${:.1}B market cap (full at $50B)", trade.market_cap / 1.0e9),
        );
        let rating = analyst_rating_factor(4.0, stock.analyst_rating.as_deref());
        let earnings = match trade.days_to_earnings {
            Some(days) => factor(
                "earnings_clearance",
                3.0,
                days.abs() as f64 / 30.0,
                format!("earnings {} days from expiry", days),
            ),
            None => neutral("earnings_clearance", 3.0, "earnings date"),
        };
        pillar(
            "Fundamental Safety",
            0.15,
            vec![market_cap, rating, earnings],
        )
    };

    let liquidity = pillar(
        "Liquidity & Execution",
        0.10,
        vec![
            factor(
                "bid_ask_spread",
                4.0,
                spread_share(trade.spread_ratio),
                format!("spread {:.2}% of ask", trade.spread_ratio * 100.0),
            ),
            factor(
                "open_interest",
                3.0,
                trade.open_interest as f64 / 1000.0,
                format!("open interest {} (full at 1000)", trade.open_interest),
            ),
            factor(
                "stock_volume",
                3.0,
                trade.avg_volume as f64 / 5_000_000.0,
                format!("average volume {} (full at 5M)", trade.avg_volume),
            ),
        ],
    );

    ScoreBreakdown {
        pillars: vec![volatility, greeks, technical, fundamental, liquidity],
    }
}

fn analyst_rating_factor(max_points: f64, rating: Option<&str>) -> FactorScore {
    let Some(rating) = rating else {
        return neutral("analyst_rating", max_points, "analyst rating");
    };
    let normalized = rating.trim().to_ascii_lowercase().replace(['_', '-'], " ");
    let share = match normalized.as_str() {
        "strong buy" | "buy" | "outperform" | "overweight" => 1.0,
        "hold" | "neutral" | "market perform" | "equal weight" => 0.5,
        "sell" | "strong sell" | "underperform" | "underweight" => 0.1,
        _ => NEUTRAL_SHARE,
    };
    factor(
        "analyst_rating",
        max_points,
        share,
        format!("consensus {}", rating),
    )
}

pub fn score_pmcc(trade: &PmccTrade, stock: &StockSnapshot) -> ScoreBreakdown {
    let long = &trade.long_leg;
    let short = &trade.short_leg;

    let leap_quality = {
        let delta = factor(
            "leap_delta",
            12.0,
            0.5 + (long.delta - 0.70) / 0.30,
            format!("LEAP delta {:.2} (full at 0.85)", long.delta),
        );
        let intrinsic = (trade.stock_price - long.strike).max(0.0);
        let extrinsic_ratio = if trade.long_cost > 0.0 {
            ((trade.long_cost - intrinsic).max(0.0)) / trade.long_cost
        } else {
            1.0
        };
        let extrinsic = factor(
            "extrinsic_cost",
            10.0,
            1.0 - extrinsic_ratio / 0.30,
            format!("{:.1}% of LEAP cost is time value", extrinsic_ratio * 100.0),
        );
        let time = factor(
            "leap_time",
            8.0,
            0.5 + 0.5 * (long.dte as f64 - 365.0) / 175.0,
            format!("{} DTE on the LEAP", long.dte),
        );
        pillar("LEAP Quality", 0.30, vec![delta, extrinsic, time])
    };

    let income = {
        let income_ratio = if trade.net_debit > 0.0 {
            trade.short_premium / trade.net_debit
        } else {
            0.0
        };
        let income_to_debit = factor(
            "income_to_debit",
            12.0,
            income_ratio / 0.05,
            format!(
                "short premium {:.2} is {:.2}% of net debit",
                trade.short_premium,
                income_ratio * 100.0
            ),
        );
        let delta_target = factor(
            "short_delta_target",
            8.0,
            1.0 - (short.delta - 0.25).abs() / 0.10,
            format!("short delta {:.2} vs 0.25 centre", short.delta),
        );
        let cycle_share = match short.dte {
            21..=45 => 1.0,
            7..=20 => 0.7,
            _ => 0.4,
        };
        let cycle = factor(
            "short_cycle",
            5.0,
            cycle_share,
            format!("{} DTE on the short call", short.dte),
        );
        pillar(
            "Short-Call Income Efficiency",
            0.25,
            vec![income_to_debit, delta_target, cycle],
        )
    };

    let volatility = {
        let iv_rank = iv_rank_factor("iv_rank", 10.0, trade.iv_rank);
        let skew = match (short.implied_volatility, long.implied_volatility) {
            (Some(short_iv), Some(long_iv)) if long_iv > 0.0 => {
                let ratio = short_iv / long_iv;
                factor(
                    "term_structure",
                    10.0,
                    0.2 + (ratio - 0.8) / 0.3 * 0.8,
                    format!(
                        "short IV {:.1}% vs LEAP IV {:.1}%",
                        short_iv * 100.0,
                        long_iv * 100.0
                    ),
                )
            }
            _ => neutral("term_structure", 10.0, "leg implied volatility"),
        };
        pillar("Volatility Structure", 0.20, vec![iv_rank, skew])
    };

    let technical = pillar(
        "Technical Alignment",
        0.15,
        vec![trend_factor(8.0, stock), range_position_factor(7.0, stock)],
    );

    let risk = {
        let average_spread = (long.spread_ratio + short.spread_ratio) / 2.0;
        let spreads = factor(
            "leg_spreads",
            4.0,
            spread_share(average_spread),
            format!("average leg spread {:.2}%", average_spread * 100.0),
        );
        let min_open_interest = long.open_interest.min(short.open_interest);
        let open_interest = factor(
            "open_interest",
            3.0,
            min_open_interest as f64 / 1000.0,
            format!("thinnest leg open interest {}", min_open_interest),
        );
        let breakeven = if trade.breakeven_warning {
            factor(
                "breakeven_safety",
                3.0,
                0.0,
                format!(
                    "short strike {:.2} at or below breakeven {:.2}",
                    short.strike, trade.breakeven
                ),
            )
        } else {
            factor(
                "breakeven_safety",
                3.0,
                1.0,
                format!(
                    "short strike {:.2} above breakeven {:.2}",
                    short.strike, trade.breakeven
                ),
            )
        };
        pillar(
            "Liquidity & Risk Controls",
            0.10,
            vec![spreads, open_interest, breakeven],
        )
    };

    ScoreBreakdown {
        pillars: vec![leap_quality, income, volatility, technical, risk],
    }
}
