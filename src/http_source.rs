use crate::errors::{ParseFailure, SourceError};
use crate::market_data::{MarketDataSource, RawOptionChain, RawStockQuote};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

const SOURCE_NAME: &str = "http-json";

/// JSON REST market data source.
///
/// `GET {base}/quotes/{symbol}` returns a stock quote and
/// `GET {base}/chains/{symbol}` an option chain. Status codes map onto the
/// source error taxonomy so the retry policy can tell transient from permanent.
pub struct HttpMarketDataSource {
    http: Client,
    base_url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpMarketDataSource {
    pub fn new(base_url: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("MARKET_DATA_BASE_URL is empty"));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .context("invalid market data API key")?,
            );
        }

        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build market data HTTP client")?;

        Ok(Self {
            http,
            base_url,
            headers,
            timeout,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, symbol: &str) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self
            .http
            .get(&url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SourceError::Timeout(self.timeout)
                } else {
                    SourceError::Unavailable(format!("GET {} failed: {}", url, err))
                }
            })?;

        let response = check_status(response, symbol)?;
        let body = response
            .text()
            .await
            .map_err(|err| SourceError::Unavailable(format!("reading {} failed: {}", url, err)))?;
        serde_json::from_str::<T>(&body).map_err(|err| {
            SourceError::Parse(ParseFailure::InvalidValue {
                field: "body",
                value: err.to_string(),
            })
        })
    }
}

fn check_status(response: Response, symbol: &str) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SourceError::RateLimited {
            retry_after: parse_retry_after(response.headers().get(RETRY_AFTER)),
        });
    }
    if status == StatusCode::NOT_FOUND {
        return Err(SourceError::NotFound(symbol.to_string()));
    }
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return Err(SourceError::Unavailable(format!(
            "provider returned {} for {}",
            status, symbol
        )));
    }
    Err(SourceError::NotFound(format!(
        "{} (provider returned {})",
        symbol, status
    )))
}

fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    value
        .and_then(|raw| raw.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl MarketDataSource for HttpMarketDataSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_stock_quote(&self, symbol: &str) -> Result<RawStockQuote, SourceError> {
        self.get(&format!("/quotes/{}", symbol), symbol).await
    }

    async fn fetch_option_chain(&self, symbol: &str) -> Result<RawOptionChain, SourceError> {
        self.get(&format!("/chains/{}", symbol), symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_accepts_delta_seconds_only() {
        let value = HeaderValue::from_static("7");
        assert_eq!(parse_retry_after(Some(&value)), Some(Duration::from_secs(7)));
        let date = HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&date)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn base_url_is_required_and_normalized() {
        assert!(HttpMarketDataSource::new("  ", None, Duration::from_secs(5)).is_err());
        let source =
            HttpMarketDataSource::new("https://data.example.com/v1/", Some("k"), Duration::from_secs(5))
                .unwrap();
        assert_eq!(source.base_url, "https://data.example.com/v1");
        assert!(source.headers.contains_key(AUTHORIZATION));
    }
}
