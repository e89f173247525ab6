use crate::retry::RetryPolicy;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Profile that loosens or tightens eligibility filters. Pricing and chain
/// rules are identical in every profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanProfile {
    Standard,
    Relaxed,
    Strict,
}

impl ScanProfile {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" | "default" => Ok(Self::Standard),
            "relaxed" | "manual" => Ok(Self::Relaxed),
            "strict" => Ok(Self::Strict),
            other => Err(anyhow!(
                "SCAN_PROFILE must be standard, relaxed or strict (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Relaxed => "relaxed",
            Self::Strict => "strict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DteMode {
    Weekly,
    Monthly,
    All,
}

impl DteMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "all" => Ok(Self::All),
            other => Err(anyhow!(
                "CC_DTE_MODE must be weekly, monthly or all (value: {})",
                other
            )),
        }
    }

    pub fn contains(self, dte: i64) -> bool {
        let weekly = (7..=14).contains(&dte);
        let monthly = (21..=45).contains(&dte);
        match self {
            Self::Weekly => weekly,
            Self::Monthly => monthly,
            Self::All => weekly || monthly,
        }
    }
}

/// Rules shared by chain validation and contract validation.
#[derive(Debug, Clone)]
pub struct PricingRules {
    pub max_spread_ratio: f64,
    pub strike_band_ratio: f64,
    pub min_chain_strikes: usize,
    pub min_positive_bid_contracts: usize,
}

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            max_spread_ratio: 0.10,
            strike_band_ratio: 0.20,
            min_chain_strikes: 3,
            min_positive_bid_contracts: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoveredCallConfig {
    pub price_min: f64,
    pub price_max: f64,
    pub relaxed_price_min: f64,
    pub relaxed_price_max: f64,
    pub min_avg_volume: f64,
    pub min_market_cap: f64,
    pub earnings_window_days: i64,
    pub dte_mode: DteMode,
    pub otm_min_ratio: f64,
    pub otm_max_ratio: f64,
}

impl Default for CoveredCallConfig {
    fn default() -> Self {
        Self {
            price_min: 30.0,
            price_max: 90.0,
            relaxed_price_min: 15.0,
            relaxed_price_max: 500.0,
            min_avg_volume: 1_000_000.0,
            min_market_cap: 5_000_000_000.0,
            earnings_window_days: 7,
            dte_mode: DteMode::All,
            otm_min_ratio: 0.02,
            otm_max_ratio: 0.10,
        }
    }
}

impl CoveredCallConfig {
    pub fn price_band(&self, profile: ScanProfile) -> (f64, f64) {
        match profile {
            ScanProfile::Relaxed => (self.relaxed_price_min, self.relaxed_price_max),
            ScanProfile::Standard | ScanProfile::Strict => (self.price_min, self.price_max),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PmccConfig {
    pub leap_dte_min: i64,
    pub leap_dte_max: i64,
    pub leap_min_delta: f64,
    pub leap_strict_min_delta: f64,
    pub leap_min_open_interest: i64,
    pub leap_relaxed_min_open_interest: i64,
    pub leap_max_spread_ratio: f64,
    pub short_max_dte: i64,
    pub short_delta_min: f64,
    pub short_delta_max: f64,
    pub solvency_multiplier: f64,
}

impl Default for PmccConfig {
    fn default() -> Self {
        Self {
            leap_dte_min: 365,
            leap_dte_max: 730,
            leap_min_delta: 0.70,
            leap_strict_min_delta: 0.80,
            leap_min_open_interest: 500,
            leap_relaxed_min_open_interest: 100,
            leap_max_spread_ratio: 0.05,
            short_max_dte: 45,
            short_delta_min: 0.20,
            short_delta_max: 0.30,
            solvency_multiplier: 1.20,
        }
    }
}

impl PmccConfig {
    pub fn leap_delta_floor(&self, profile: ScanProfile) -> f64 {
        match profile {
            ScanProfile::Strict => self.leap_strict_min_delta,
            ScanProfile::Standard | ScanProfile::Relaxed => self.leap_min_delta,
        }
    }

    pub fn leap_open_interest_floor(&self, profile: ScanProfile) -> i64 {
        match profile {
            ScanProfile::Relaxed => self.leap_relaxed_min_open_interest,
            ScanProfile::Standard | ScanProfile::Strict => self.leap_min_open_interest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub worker_limit: usize,
    pub min_request_gap: Duration,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            worker_limit: 4,
            min_request_gap: Duration::from_millis(250),
            fetch_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything a scan needs, resolved once and threaded through explicitly.
#[derive(Debug, Clone)]
pub struct ScreenerSettings {
    pub profile: ScanProfile,
    pub pricing: PricingRules,
    pub covered_call: CoveredCallConfig,
    pub pmcc: PmccConfig,
    pub ingestion: IngestionConfig,
    pub scan_delay_after_close: chrono::Duration,
    pub holiday_calendar_file: Option<String>,
    pub market_data_base_url: Option<String>,
    pub market_data_api_key: Option<String>,
    /// Fixed market bias weight; unset means neutral.
    pub market_bias_weight: Option<f64>,
    pub universe: Vec<String>,
}

impl Default for ScreenerSettings {
    fn default() -> Self {
        Self {
            profile: ScanProfile::Standard,
            pricing: PricingRules::default(),
            covered_call: CoveredCallConfig::default(),
            pmcc: PmccConfig::default(),
            ingestion: IngestionConfig::default(),
            scan_delay_after_close: chrono::Duration::minutes(30),
            holiday_calendar_file: None,
            market_data_base_url: None,
            market_data_api_key: None,
            market_bias_weight: None,
            universe: Vec::new(),
        }
    }
}

impl ScreenerSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let profile = match optional_setting(settings, "SCAN_PROFILE") {
            Some(raw) => ScanProfile::parse(raw)?,
            None => defaults.profile,
        };

        let pricing = PricingRules {
            max_spread_ratio: setting_f64(
                settings,
                "MAX_SPREAD_RATIO",
                defaults.pricing.max_spread_ratio,
                Some(0.0),
                Some(1.0),
            )?,
            strike_band_ratio: setting_f64(
                settings,
                "STRIKE_BAND_RATIO",
                defaults.pricing.strike_band_ratio,
                Some(0.0),
                Some(1.0),
            )?,
            min_chain_strikes: setting_usize(
                settings,
                "MIN_CHAIN_STRIKES",
                defaults.pricing.min_chain_strikes,
                1,
            )?,
            min_positive_bid_contracts: setting_usize(
                settings,
                "MIN_POSITIVE_BID_CONTRACTS",
                defaults.pricing.min_positive_bid_contracts,
                1,
            )?,
        };

        let cc_defaults = &defaults.covered_call;
        let dte_mode = match optional_setting(settings, "CC_DTE_MODE") {
            Some(raw) => DteMode::parse(raw)?,
            None => cc_defaults.dte_mode,
        };
        let covered_call = CoveredCallConfig {
            price_min: setting_f64(settings, "CC_PRICE_MIN", cc_defaults.price_min, Some(0.0), None)?,
            price_max: setting_f64(settings, "CC_PRICE_MAX", cc_defaults.price_max, Some(0.0), None)?,
            relaxed_price_min: setting_f64(
                settings,
                "CC_RELAXED_PRICE_MIN",
                cc_defaults.relaxed_price_min,
                Some(0.0),
                None,
            )?,
            relaxed_price_max: setting_f64(
                settings,
                "CC_RELAXED_PRICE_MAX",
                cc_defaults.relaxed_price_max,
                Some(0.0),
                None,
            )?,
            min_avg_volume: setting_f64(
                settings,
                "CC_MIN_AVG_VOLUME",
                cc_defaults.min_avg_volume,
                Some(0.0),
                None,
            )?,
            min_market_cap: setting_f64(
                settings,
                "CC_MIN_MARKET_CAP",
                cc_defaults.min_market_cap,
                Some(0.0),
                None,
            )?,
            earnings_window_days: setting_usize(
                settings,
                "EARNINGS_WINDOW_DAYS",
                cc_defaults.earnings_window_days as usize,
                0,
            )? as i64,
            dte_mode,
            otm_min_ratio: setting_f64(settings, "CC_OTM_MIN", cc_defaults.otm_min_ratio, Some(0.0), Some(1.0))?,
            otm_max_ratio: setting_f64(settings, "CC_OTM_MAX", cc_defaults.otm_max_ratio, Some(0.0), Some(1.0))?,
        };
        ensure_ordered("CC_PRICE_MIN", covered_call.price_min, "CC_PRICE_MAX", covered_call.price_max)?;
        ensure_ordered(
            "CC_RELAXED_PRICE_MIN",
            covered_call.relaxed_price_min,
            "CC_RELAXED_PRICE_MAX",
            covered_call.relaxed_price_max,
        )?;
        ensure_ordered("CC_OTM_MIN", covered_call.otm_min_ratio, "CC_OTM_MAX", covered_call.otm_max_ratio)?;

        let pmcc_defaults = &defaults.pmcc;
        let pmcc = PmccConfig {
            leap_dte_min: setting_usize(settings, "PMCC_LEAP_DTE_MIN", pmcc_defaults.leap_dte_min as usize, 1)? as i64,
            leap_dte_max: setting_usize(settings, "PMCC_LEAP_DTE_MAX", pmcc_defaults.leap_dte_max as usize, 1)? as i64,
            leap_min_delta: setting_f64(
                settings,
                "PMCC_LEAP_MIN_DELTA",
                pmcc_defaults.leap_min_delta,
                Some(0.0),
                Some(1.0),
            )?,
            leap_strict_min_delta: setting_f64(
                settings,
                "PMCC_LEAP_STRICT_MIN_DELTA",
                pmcc_defaults.leap_strict_min_delta,
                Some(0.0),
                Some(1.0),
            )?,
            leap_min_open_interest: setting_usize(
                settings,
                "PMCC_LEAP_MIN_OPEN_INTEREST",
                pmcc_defaults.leap_min_open_interest as usize,
                0,
            )? as i64,
            leap_relaxed_min_open_interest: setting_usize(
                settings,
                "PMCC_LEAP_RELAXED_MIN_OPEN_INTEREST",
                pmcc_defaults.leap_relaxed_min_open_interest as usize,
                0,
            )? as i64,
            leap_max_spread_ratio: setting_f64(
                settings,
                "LEAP_MAX_SPREAD_RATIO",
                pmcc_defaults.leap_max_spread_ratio,
                Some(0.0),
                Some(1.0),
            )?,
            short_max_dte: setting_usize(settings, "PMCC_SHORT_MAX_DTE", pmcc_defaults.short_max_dte as usize, 1)? as i64,
            short_delta_min: setting_f64(
                settings,
                "PMCC_SHORT_DELTA_MIN",
                pmcc_defaults.short_delta_min,
                Some(0.0),
                Some(1.0),
            )?,
            short_delta_max: setting_f64(
                settings,
                "PMCC_SHORT_DELTA_MAX",
                pmcc_defaults.short_delta_max,
                Some(0.0),
                Some(1.0),
            )?,
            solvency_multiplier: setting_f64(
                settings,
                "PMCC_SOLVENCY_MULTIPLIER",
                pmcc_defaults.solvency_multiplier,
                Some(0.0),
                None,
            )?,
        };
        ensure_ordered(
            "PMCC_LEAP_DTE_MIN",
            pmcc.leap_dte_min as f64,
            "PMCC_LEAP_DTE_MAX",
            pmcc.leap_dte_max as f64,
        )?;
        ensure_ordered(
            "PMCC_SHORT_DELTA_MIN",
            pmcc.short_delta_min,
            "PMCC_SHORT_DELTA_MAX",
            pmcc.short_delta_max,
        )?;
        // The LEAP spread cap may only tighten the general spread rule.
        if pmcc.leap_max_spread_ratio > pricing.max_spread_ratio {
            return Err(anyhow!(
                "LEAP_MAX_SPREAD_RATIO ({}) must be <= MAX_SPREAD_RATIO ({})",
                pmcc.leap_max_spread_ratio,
                pricing.max_spread_ratio
            ));
        }

        let ingestion_defaults = &defaults.ingestion;
        let retry_defaults = &ingestion_defaults.retry;
        let retry = RetryPolicy {
            max_attempts: setting_usize(settings, "RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts as usize, 1)?
                as u32,
            base_delay: Duration::from_millis(setting_usize(
                settings,
                "RETRY_BASE_DELAY_MS",
                retry_defaults.base_delay.as_millis() as usize,
                0,
            )? as u64),
            max_delay: Duration::from_millis(setting_usize(
                settings,
                "RETRY_MAX_DELAY_MS",
                retry_defaults.max_delay.as_millis() as usize,
                0,
            )? as u64),
            multiplier: retry_defaults.multiplier,
            rate_limited_min_delay: Duration::from_millis(setting_usize(
                settings,
                "RETRY_RATE_LIMITED_MIN_DELAY_MS",
                retry_defaults.rate_limited_min_delay.as_millis() as usize,
                0,
            )? as u64),
            jitter_ratio: setting_f64(
                settings,
                "RETRY_JITTER_RATIO",
                retry_defaults.jitter_ratio,
                Some(0.0),
                Some(1.0),
            )?,
        };
        let ingestion = IngestionConfig {
            worker_limit: setting_usize(settings, "INGEST_WORKERS", ingestion_defaults.worker_limit, 1)?,
            min_request_gap: Duration::from_millis(setting_usize(
                settings,
                "INGEST_MIN_REQUEST_GAP_MS",
                ingestion_defaults.min_request_gap.as_millis() as usize,
                0,
            )? as u64),
            fetch_timeout: Duration::from_secs(setting_usize(
                settings,
                "INGEST_FETCH_TIMEOUT_SECS",
                ingestion_defaults.fetch_timeout.as_secs() as usize,
                1,
            )? as u64),
            retry,
        };

        let scan_delay_after_close = chrono::Duration::minutes(setting_usize(
            settings,
            "SCAN_DELAY_AFTER_CLOSE_MINUTES",
            defaults.scan_delay_after_close.num_minutes() as usize,
            0,
        )? as i64);

        let market_bias_weight = match optional_setting(settings, "MARKET_BIAS_WEIGHT") {
            Some(_) => Some(setting_f64(settings, "MARKET_BIAS_WEIGHT", 1.0, Some(0.0), None)?),
            None => None,
        };

        Ok(Self {
            profile,
            pricing,
            covered_call,
            pmcc,
            ingestion,
            scan_delay_after_close,
            holiday_calendar_file: optional_setting(settings, "HOLIDAY_CALENDAR_FILE").map(str::to_string),
            market_data_base_url: optional_setting(settings, "MARKET_DATA_BASE_URL").map(str::to_string),
            market_data_api_key: optional_setting(settings, "MARKET_DATA_API_KEY").map(str::to_string),
            market_bias_weight,
            universe: optional_setting(settings, "SCAN_UNIVERSE")
                .map(parse_symbol_list)
                .unwrap_or_default(),
        })
    }
}

pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    let mut symbols: Vec<String> = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(|entry| entry.trim().to_ascii_uppercase())
        .filter(|entry| !entry.is_empty())
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn ensure_ordered(min_key: &str, min: f64, max_key: &str, max: f64) -> Result<()> {
    if max < min {
        return Err(anyhow!(
            "{} ({}) must be >= {} ({})",
            max_key,
            max,
            min_key,
            min
        ));
    }
    Ok(())
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}
