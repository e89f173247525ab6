//! Exchange calendar: trading days, market close instants and scan timing.
//!
//! The holiday table is a maintained input. Dates outside its coverage fail
//! with [`CalendarError::OutOfRange`] instead of being treated as weekdays.

use crate::errors::CalendarError;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

const BUNDLED_NYSE_CALENDAR: &str = include_str!("../data/nyse_holidays.json");
const CLOSE_TIME_FORMAT: &str = "%H:%M";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to an instant; tests move it explicitly.
#[derive(Debug)]
pub struct FixedClock {
    instant: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Mutex::new(instant),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut guard) = self.instant.lock() {
            *guard = instant;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.instant.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.instant.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Deserialize)]
struct HolidayCalendarFile {
    exchange: String,
    timezone: String,
    coverage_start: NaiveDate,
    coverage_end: NaiveDate,
    regular_close: String,
    #[serde(default)]
    holidays: Vec<NaiveDate>,
    #[serde(default)]
    early_closes: Vec<EarlyCloseEntry>,
}

#[derive(Deserialize)]
struct EarlyCloseEntry {
    date: NaiveDate,
    close: String,
}

#[derive(Debug, Clone)]
pub struct TradingCalendar {
    exchange: String,
    timezone: Tz,
    coverage_start: NaiveDate,
    coverage_end: NaiveDate,
    regular_close: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
    early_closes: BTreeMap<NaiveDate, NaiveTime>,
}

impl TradingCalendar {
    pub fn bundled_nyse() -> Result<Self> {
        Self::from_json_str(BUNDLED_NYSE_CALENDAR).context("bundled NYSE calendar is invalid")
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read holiday calendar at {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("Invalid holiday calendar at {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: HolidayCalendarFile =
            serde_json::from_str(raw).context("holiday calendar is not valid JSON")?;
        let timezone: Tz = file.timezone.parse().map_err(|_| {
            CalendarError::InvalidCalendar(format!("unknown timezone {}", file.timezone))
        })?;
        if file.coverage_end < file.coverage_start {
            return Err(CalendarError::InvalidCalendar(format!(
                "coverage_end {} precedes coverage_start {}",
                file.coverage_end, file.coverage_start
            ))
            .into());
        }
        let regular_close = parse_close_time(&file.regular_close)?;
        let mut early_closes = BTreeMap::new();
        for entry in file.early_closes {
            early_closes.insert(entry.date, parse_close_time(&entry.close)?);
        }

        Ok(Self {
            exchange: file.exchange,
            timezone,
            coverage_start: file.coverage_start,
            coverage_end: file.coverage_end,
            regular_close,
            holidays: file.holidays.into_iter().collect(),
            early_closes,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn coverage(&self) -> (NaiveDate, NaiveDate) {
        (self.coverage_start, self.coverage_end)
    }

    fn ensure_covered(&self, date: NaiveDate) -> Result<(), CalendarError> {
        if date < self.coverage_start || date > self.coverage_end {
            return Err(CalendarError::OutOfRange {
                date,
                start: self.coverage_start,
                end: self.coverage_end,
            });
        }
        Ok(())
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> Result<bool, CalendarError> {
        self.ensure_covered(date)?;
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return Ok(false);
        }
        Ok(!self.holidays.contains(&date))
    }

    /// Calendar date of `instant` in the exchange's local time.
    pub fn exchange_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone).date_naive()
    }

    pub fn market_close_instant(&self, date: NaiveDate) -> Result<DateTime<Utc>, CalendarError> {
        if !self.is_trading_day(date)? {
            return Err(CalendarError::NotATradingDay(date));
        }
        let close = self
            .early_closes
            .get(&date)
            .copied()
            .unwrap_or(self.regular_close);
        self.timezone
            .from_local_datetime(&date.and_time(close))
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| {
                CalendarError::InvalidCalendar(format!("close time {} does not exist on {}", close, date))
            })
    }

    /// Most recent trading day whose session has closed at `reference`.
    pub fn last_trading_day(&self, reference: DateTime<Utc>) -> Result<NaiveDate, CalendarError> {
        let local_date = self.exchange_date(reference);
        if self.is_trading_day(local_date)? && reference >= self.market_close_instant(local_date)? {
            return Ok(local_date);
        }
        self.previous_trading_day(local_date)
    }

    pub fn previous_trading_day(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        let mut candidate = date;
        loop {
            candidate = candidate.pred_opt().ok_or(CalendarError::OutOfRange {
                date: candidate,
                start: self.coverage_start,
                end: self.coverage_end,
            })?;
            if self.is_trading_day(candidate)? {
                return Ok(candidate);
            }
        }
    }

    pub fn next_trading_day(&self, date: NaiveDate) -> Result<NaiveDate, CalendarError> {
        let mut candidate = date;
        loop {
            candidate = candidate.succ_opt().ok_or(CalendarError::OutOfRange {
                date: candidate,
                start: self.coverage_start,
                end: self.coverage_end,
            })?;
            if self.is_trading_day(candidate)? {
                return Ok(candidate);
            }
        }
    }

    /// First post-close scan instant strictly after `now`.
    pub fn next_scan_instant(
        &self,
        now: DateTime<Utc>,
        delay_after_close: Duration,
    ) -> Result<DateTime<Utc>, CalendarError> {
        let today = self.exchange_date(now);
        if self.is_trading_day(today)? {
            let scan_at = self.market_close_instant(today)? + delay_after_close;
            if scan_at > now {
                return Ok(scan_at);
            }
        }
        let next = self.next_trading_day(today)?;
        Ok(self.market_close_instant(next)? + delay_after_close)
    }
}

fn parse_close_time(raw: &str) -> Result<NaiveTime, CalendarError> {
    NaiveTime::parse_from_str(raw.trim(), CLOSE_TIME_FORMAT)
        .map_err(|_| CalendarError::InvalidCalendar(format!("invalid close time {}", raw)))
}
