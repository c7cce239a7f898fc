use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Client;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{within_range, PriceLoader};
use crate::config::ProviderSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::types::{RawPriceRow, RawPriceTable};

const DAILY_ADJUSTED_FUNCTION: &str = "TIME_SERIES_DAILY_ADJUSTED";
const SERIES_KEY: &str = "Time Series (Daily)";

/// Alpha Vantage daily adjusted time series client
#[derive(Clone)]
pub struct AlphaVantageClient {
    client: Client,
    api_key: String,
    base_url: String,
    output_size: String,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl AlphaVantageClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        if settings.api_key.is_empty() {
            return Err(anyhow!(
                "Alpha Vantage API key missing; set provider.api_key or {}",
                crate::config::API_KEY_ENV
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        let per_minute = NonZeroU32::new(settings.requests_per_minute).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            output_size: settings.output_size.clone(),
            limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        })
    }

    /// Raw JSON body of the daily adjusted series for `symbol`
    pub async fn daily_adjusted(&self, symbol: &str) -> PipelineResult<Value> {
        self.limiter.until_ready().await;

        let url = format!("{}/query", self.base_url);
        debug!("GET {} ({} {})", url, DAILY_ADJUSTED_FUNCTION, symbol);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("function", DAILY_ADJUSTED_FUNCTION),
                ("symbol", symbol),
                ("outputsize", self.output_size.as_str()),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::DataUnavailable(format!("request for {} failed: {}", symbol, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::DataUnavailable(format!(
                "provider returned HTTP {} for {}",
                status, symbol
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| PipelineError::DataUnavailable(format!("invalid JSON for {}: {}", symbol, e)))
    }
}

#[async_trait]
impl PriceLoader for AlphaVantageClient {
    async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> PipelineResult<RawPriceTable> {
        let body = self.daily_adjusted(symbol).await?;
        let rows = within_range(parse_daily_adjusted(symbol, &body)?, start, end);

        if rows.is_empty() {
            return Err(PipelineError::DataUnavailable(format!(
                "no rows for {} between {} and {}",
                symbol, start, end
            )));
        }

        info!("Fetched {} daily rows for {} ({} to {})", rows.len(), symbol, start, end);
        Ok(RawPriceTable::new(symbol, rows))
    }
}

/// Parse a `TIME_SERIES_DAILY_ADJUSTED` response.
///
/// Provider error payloads become `DataUnavailable`. Numbers that fail to parse
/// are kept as missing values for the cleaner to drop. Rows are unordered.
pub fn parse_daily_adjusted(symbol: &str, body: &Value) -> PipelineResult<Vec<RawPriceRow>> {
    if let Some(message) = body.get("Error Message").and_then(Value::as_str) {
        return Err(PipelineError::DataUnavailable(format!("{}: {}", symbol, message)));
    }
    for notice in ["Note", "Information"] {
        if let Some(message) = body.get(notice).and_then(Value::as_str) {
            return Err(PipelineError::DataUnavailable(format!(
                "provider notice for {}: {}",
                symbol, message
            )));
        }
    }

    let series = body
        .get(SERIES_KEY)
        .and_then(Value::as_object)
        .ok_or_else(|| {
            PipelineError::DataUnavailable(format!("response for {} has no '{}'", symbol, SERIES_KEY))
        })?;

    let mut rows = Vec::with_capacity(series.len());
    for (date, fields) in series {
        let timestamp = match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => {
                warn!("Skipping {} row with unparseable date '{}'", symbol, date);
                continue;
            }
        };

        let field = |key: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| s.trim().parse::<f64>().ok())
        };

        rows.push(RawPriceRow {
            timestamp,
            open: field("1. open"),
            high: field("2. high"),
            low: field("3. low"),
            close: field("4. close"),
            adj_close: field("5. adjusted close"),
            volume: field("6. volume"),
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_body() -> Value {
        json!({
            "Meta Data": { "2. Symbol": "AAPL" },
            "Time Series (Daily)": {
                "2024-01-04": {
                    "1. open": "182.15", "2. high": "183.09", "3. low": "180.88",
                    "4. close": "181.91", "5. adjusted close": "181.05",
                    "6. volume": "71983570", "7. dividend amount": "0.0000"
                },
                "2024-01-02": {
                    "1. open": "187.15", "2. high": "188.44", "3. low": "183.89",
                    "4. close": "185.64", "5. adjusted close": "184.76",
                    "6. volume": "82488674", "7. dividend amount": "0.0000"
                },
                "2024-01-03": {
                    "1. open": "184.22", "2. high": "185.88", "3. low": "183.43",
                    "4. close": "184.25", "5. adjusted close": "n/a",
                    "6. volume": "58414460", "7. dividend amount": "0.0000"
                }
            }
        })
    }

    #[test]
    fn test_parse_daily_adjusted() {
        let rows = parse_daily_adjusted("AAPL", &sample_body()).unwrap();
        let rows = within_range(
            rows,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        );

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].timestamp, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(rows[0].adj_close, Some(184.76));
        assert_eq!(rows[0].volume, Some(82_488_674.0));
        // unparseable value is missing, not zero
        assert_eq!(rows[1].adj_close, None);
        assert_eq!(rows[2].close, Some(181.91));
    }

    #[test]
    fn test_range_filter() {
        let rows = parse_daily_adjusted("AAPL", &sample_body()).unwrap();
        let rows = within_range(
            rows,
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
    }

    #[test]
    fn test_provider_errors() {
        let unknown = json!({ "Error Message": "Invalid API call." });
        assert!(matches!(
            parse_daily_adjusted("NOPE", &unknown),
            Err(PipelineError::DataUnavailable(_))
        ));

        let throttled = json!({ "Note": "Thank you for using Alpha Vantage!" });
        assert!(matches!(
            parse_daily_adjusted("AAPL", &throttled),
            Err(PipelineError::DataUnavailable(_))
        ));

        assert!(matches!(
            parse_daily_adjusted("AAPL", &json!({})),
            Err(PipelineError::DataUnavailable(_))
        ));
    }

    #[test]
    fn test_client_requires_api_key() {
        assert!(AlphaVantageClient::new(&ProviderSettings::default()).is_err());

        let settings = ProviderSettings {
            api_key: "demo".to_string(),
            ..ProviderSettings::default()
        };
        assert!(AlphaVantageClient::new(&settings).is_ok());
    }
}
