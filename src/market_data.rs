//! Market data source interface and the parsing boundary for its payloads.
//!
//! Raw payloads are loosely typed; `parse` turns them into typed quotes or
//! fails. Only `previousClose` is ever read as the stock price: intraday,
//! extended-hours and "current" price fields have no place in these structs.

use crate::errors::{ParseFailure, SourceError};
use crate::models::OptionType;
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_stock_quote(&self, symbol: &str) -> Result<RawStockQuote, SourceError>;
    async fn fetch_option_chain(&self, symbol: &str) -> Result<RawOptionChain, SourceError>;
}

/// External volatility/momentum signal consumed as a score multiplier.
#[async_trait]
pub trait MarketBiasSource: Send + Sync {
    async fn fetch_bias_weight(&self) -> AnyResult<Option<f64>>;
}

/// Fixed bias weight, useful for replays and tests.
pub struct StaticBias(pub f64);

#[async_trait]
impl MarketBiasSource for StaticBias {
    async fn fetch_bias_weight(&self) -> AnyResult<Option<f64>> {
        Ok(Some(self.0))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawStockQuote {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub previous_close: Option<f64>,
    #[serde(default)]
    pub previous_close_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub avg_volume: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub next_earnings_date: Option<NaiveDate>,
    #[serde(default)]
    pub analyst_rating: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub iv_rank: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub fifty_day_average: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub two_hundred_day_average: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub fifty_two_week_high: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub fifty_two_week_low: Option<f64>,
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StockQuote {
    pub previous_close: f64,
    pub previous_close_date: Option<NaiveDate>,
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
    pub as_of: DateTime<Utc>,
}

impl RawStockQuote {
    pub fn parse(self) -> Result<StockQuote, ParseFailure> {
        let previous_close = require_positive(self.previous_close, "previousClose")?;
        let as_of = self.as_of.ok_or(ParseFailure::MissingField { field: "asOf" })?;
        let avg_volume = require_non_negative(self.avg_volume, "avgVolume")?;
        let market_cap = require_non_negative(self.market_cap, "marketCap")?;
        let volume = match self.volume {
            Some(value) => require_non_negative(Some(value), "volume")?,
            None => 0.0,
        };

        Ok(StockQuote {
            previous_close,
            previous_close_date: self.previous_close_date,
            volume: volume.round() as i64,
            avg_volume: avg_volume.round() as i64,
            market_cap,
            next_earnings_date: self.next_earnings_date,
            analyst_rating: self
                .analyst_rating
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            iv_rank: finite(self.iv_rank),
            fifty_day_average: positive(self.fifty_day_average),
            two_hundred_day_average: positive(self.two_hundred_day_average),
            fifty_two_week_high: positive(self.fifty_two_week_high),
            fifty_two_week_low: positive(self.fifty_two_week_low),
            as_of,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOptionChain {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub expiries: Option<Vec<NaiveDate>>,
    #[serde(default)]
    pub contracts: Option<Vec<RawOptionContract>>,
    /// Session the quotes belong to, when the provider states it.
    #[serde(default)]
    pub trade_date: Option<NaiveDate>,
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOptionContract {
    #[serde(default)]
    pub contract_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub strike: Option<f64>,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
    #[serde(rename = "type", default)]
    pub option_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub bid: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub ask: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub last_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub volume: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub open_interest: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub implied_volatility: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub delta: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub gamma: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub theta: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub vega: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedContract {
    pub contract_id: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub option_type: OptionType,
    /// Zero when the source quoted no bid.
    pub bid: f64,
    /// Zero when the source quoted no ask.
    pub ask: f64,
    pub last_price: Option<f64>,
    pub volume: i64,
    pub open_interest: i64,
    pub implied_volatility: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptionChainQuote {
    pub expiries: Vec<NaiveDate>,
    pub contracts: Vec<ParsedContract>,
    pub trade_date: Option<NaiveDate>,
    pub as_of: DateTime<Utc>,
}

impl RawOptionChain {
    pub fn parse(self, symbol: &str) -> Result<OptionChainQuote, ParseFailure> {
        let as_of = self.as_of.ok_or(ParseFailure::MissingField { field: "asOf" })?;
        let raw_contracts = self
            .contracts
            .ok_or(ParseFailure::MissingField { field: "contracts" })?;

        let mut contracts = Vec::with_capacity(raw_contracts.len());
        for raw in raw_contracts {
            contracts.push(raw.parse(symbol)?);
        }
        contracts.sort_by(|a, b| {
            a.expiry
                .cmp(&b.expiry)
                .then(a.option_type.cmp(&b.option_type))
                .then(a.strike.total_cmp(&b.strike))
                .then(a.contract_id.cmp(&b.contract_id))
        });

        let mut expiries = self.expiries.unwrap_or_default();
        expiries.extend(contracts.iter().map(|contract| contract.expiry));
        expiries.sort();
        expiries.dedup();

        Ok(OptionChainQuote {
            expiries,
            contracts,
            trade_date: self.trade_date,
            as_of,
        })
    }
}

impl RawOptionContract {
    fn parse(self, symbol: &str) -> Result<ParsedContract, ParseFailure> {
        let strike = require_positive(self.strike, "contracts[].strike")?;
        let expiry = self
            .expiry
            .ok_or(ParseFailure::MissingField { field: "contracts[].expiry" })?;
        let option_type = match self.option_type.as_deref().map(|raw| raw.trim().to_ascii_lowercase()) {
            Some(raw) if raw == "call" || raw == "c" => OptionType::Call,
            Some(raw) if raw == "put" || raw == "p" => OptionType::Put,
            Some(raw) => {
                return Err(ParseFailure::InvalidValue {
                    field: "contracts[].type",
                    value: raw,
                })
            }
            None => return Err(ParseFailure::MissingField { field: "contracts[].type" }),
        };
        let contract_id = self
            .contract_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| {
                format!(
                    "{}{}{}{:08}",
                    symbol,
                    expiry.format("%y%m%d"),
                    if option_type == OptionType::Call { "C" } else { "P" },
                    (strike * 1000.0).round() as i64
                )
            });

        Ok(ParsedContract {
            contract_id,
            strike,
            expiry,
            option_type,
            bid: non_negative_or_zero(self.bid),
            ask: non_negative_or_zero(self.ask),
            last_price: positive(self.last_price),
            volume: non_negative_or_zero(self.volume).round() as i64,
            open_interest: non_negative_or_zero(self.open_interest).round() as i64,
            implied_volatility: positive(self.implied_volatility),
            delta: finite(self.delta),
            gamma: finite(self.gamma),
            theta: finite(self.theta),
            vega: finite(self.vega),
        })
    }
}

fn require_positive(value: Option<f64>, field: &'static str) -> Result<f64, ParseFailure> {
    match value {
        None => Err(ParseFailure::MissingField { field }),
        Some(v) if v.is_finite() && v > 0.0 => Ok(v),
        Some(v) => Err(ParseFailure::InvalidValue {
            field,
            value: v.to_string(),
        }),
    }
}

fn require_non_negative(value: Option<f64>, field: &'static str) -> Result<f64, ParseFailure> {
    match value {
        None => Err(ParseFailure::MissingField { field }),
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        Some(v) => Err(ParseFailure::InvalidValue {
            field,
            value: v.to_string(),
        }),
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

fn non_negative_or_zero(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(0.0)
}

fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number, a numeric string or null")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<f64>()
                .map(Some)
                .map_err(|_| E::custom(format!("invalid number {:?}", value)))
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}
