use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Failure mapping an upstream payload into a snapshot.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseFailure {
    #[error("missing field {field}")]
    MissingField { field: &'static str },
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Errors raised by a market data source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("market data source unavailable: {0}")]
    Unavailable(String),
    #[error("market data source rate limited the request")]
    RateLimited { retry_after: Option<Duration> },
    #[error("market data request timed out after {0:?}")]
    Timeout(Duration),
    #[error("no market data for {0}")]
    NotFound(String),
    #[error("unparseable market data payload: {0}")]
    Parse(#[from] ParseFailure),
}

impl SourceError {
    pub fn kind(&self) -> SourceErrorKind {
        match self {
            SourceError::Unavailable(_) | SourceError::Timeout(_) => SourceErrorKind::Transient,
            SourceError::RateLimited { .. } => SourceErrorKind::RateLimited,
            SourceError::NotFound(_) | SourceError::Parse(_) => SourceErrorKind::Permanent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Transient,
    RateLimited,
    Permanent,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CalendarError {
    #[error("{date} is outside the holiday calendar coverage ({start} to {end})")]
    OutOfRange {
        date: NaiveDate,
        start: NaiveDate,
        end: NaiveDate,
    },
    #[error("{0} is not a trading day")]
    NotATradingDay(NaiveDate),
    #[error("invalid holiday calendar: {0}")]
    InvalidCalendar(String),
}

/// Pipeline-level failures. Chain and contract rejections are expected and
/// aggregated; only `RunCommitFailed`, `RunCancelled` and `Calendar` end a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stock trade date {stock_date} does not match options trade date {options_date} for {symbol}")]
    DateMismatch {
        symbol: String,
        stock_date: NaiveDate,
        options_date: NaiveDate,
    },
    #[error("option chain rejected: {0}")]
    ChainIncomplete(String),
    #[error("contract rejected: {0}")]
    ContractInvalid(String),
    #[error("net debit {net_debit:.2} exceeds solvency limit {limit:.2} (width {width:.2})")]
    SolvencyCheckFailed {
        net_debit: f64,
        width: f64,
        limit: f64,
    },
    #[error("run commit failed: {0}")]
    RunCommitFailed(String),
    #[error("run {0} was cancelled by an operator")]
    RunCancelled(String),
    #[error(transparent)]
    Calendar(#[from] CalendarError),
}
