//! Yahoo Finance data provider.
//!
//! Fetches daily OHLCV rows from Yahoo's v8 chart API and hands them to the
//! worker as a raw batch. Exchange-listed symbols are addressed with a
//! suffix (`RELIANCE` + `.NS`), configured once per run. Trade-for-trade
//! listings carry a `-BE` marker before the suffix (`RELIANCE-BE.NS`).
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; anything unexpected in the payload surfaces as
//! [`RemoteError::ResponseFormatChanged`].

use super::circuit_breaker::CircuitBreaker;
use super::provider::{DataProvider, FetchRequest, RawBatch, RemoteError, SeriesKind};
use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

/// Client settings.
#[derive(Debug, Clone)]
pub struct YahooOptions {
    pub timeout: Duration,
    /// Extra HTTP attempts inside one fetch call. Unit-level retries happen
    /// on the next run, not here.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Appended to every symbol, e.g. `.NS`.
    pub symbol_suffix: String,
}

impl Default for YahooOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            symbol_suffix: String::new(),
        }
    }
}

impl YahooOptions {
    /// Longest one fetch call can take: every attempt timing out plus the
    /// backoff sleeps between attempts.
    pub fn worst_case_latency(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let backoff_steps = 2u32.saturating_pow(self.max_retries).saturating_sub(1);
        self.timeout
            .saturating_mul(attempts)
            .saturating_add(self.base_delay.saturating_mul(backoff_steps))
    }
}

pub struct YahooProvider {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    options: YahooOptions,
}

impl YahooProvider {
    pub fn new(
        options: YahooOptions,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(options.timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| RemoteError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            options,
        })
    }

    fn chart_url(
        &self,
        symbol: &str,
        series: SeriesKind,
        start: NaiveDate,
        end: NaiveDate,
    ) -> String {
        let start_ts = start.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
        // period2 is exclusive upstream; ask through the end of `end`.
        let end_ts = end.and_time(chrono::NaiveTime::MIN).and_utc().timestamp() + 86_400;
        format!(
            "https://query2.finance.yahoo.com/v8/finance/chart/{symbol}{marker}{suffix}\
             ?period1={start_ts}&period2={end_ts}&interval=1d&events=history",
            marker = match series {
                SeriesKind::Equity => "",
                SeriesKind::TradeForTrade => "-BE",
            },
            suffix = self.options.symbol_suffix
        )
    }

    fn fetch_with_retry(&self, request: &FetchRequest) -> Result<RawBatch, RemoteError> {
        let url = self.chart_url(&request.symbol, request.series, request.start, request.end);
        let mut last_error = None;

        for attempt in 0..=self.options.max_retries {
            if attempt > 0 {
                std::thread::sleep(
                    self.options
                        .base_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1)),
                );
            }
            if !self.circuit_breaker.is_allowed() {
                return Err(RemoteError::CircuitBreakerTripped);
            }

            debug!(symbol = %request.symbol, attempt, "GET chart");
            let resp = match self.client.get(&url).send() {
                Ok(resp) => resp,
                Err(e) => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(if e.is_timeout() {
                        RemoteError::Timeout(e.to_string())
                    } else {
                        RemoteError::NetworkUnreachable(e.to_string())
                    });
                    continue;
                }
            };

            let status = resp.status();
            match status.as_u16() {
                403 => {
                    self.circuit_breaker.trip();
                    return Err(RemoteError::CircuitBreakerTripped);
                }
                401 => {
                    return Err(RemoteError::AuthenticationRequired(
                        "Yahoo Finance requires authentication".into(),
                    ))
                }
                404 => {
                    return Err(RemoteError::SymbolNotFound {
                        symbol: request.symbol.clone(),
                    })
                }
                429 => {
                    self.circuit_breaker.record_failure();
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(60);
                    last_error = Some(RemoteError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                    continue;
                }
                code if status.is_server_error() => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(RemoteError::Server { status: code });
                    continue;
                }
                code if !status.is_success() => {
                    return Err(RemoteError::Other(format!(
                        "HTTP {code} for {}",
                        request.symbol
                    )))
                }
                _ => {}
            }

            let chart: ChartResponse = resp.json().map_err(|e| {
                RemoteError::ResponseFormatChanged(format!(
                    "failed to parse response for {}: {e}",
                    request.symbol
                ))
            })?;
            let batch = parse_chart(&request.symbol, chart)?;
            self.circuit_breaker.record_success();
            return Ok(batch);
        }

        Err(last_error.unwrap_or_else(|| RemoteError::Other("max retries exceeded".into())))
    }
}

/// Turn the chart payload into rows with Yahoo's CSV header names.
fn parse_chart(symbol: &str, resp: ChartResponse) -> Result<RawBatch, RemoteError> {
    let result = match (resp.chart.result, resp.chart.error) {
        (Some(result), _) => result,
        (None, Some(err)) if err.code == "Not Found" => {
            return Err(RemoteError::SymbolNotFound {
                symbol: symbol.to_string(),
            })
        }
        (None, Some(err)) => {
            return Err(RemoteError::ResponseFormatChanged(format!(
                "{}: {}",
                err.code, err.description
            )))
        }
        (None, None) => {
            return Err(RemoteError::ResponseFormatChanged(
                "empty result with no error".into(),
            ))
        }
    };

    let mut batch = RawBatch::new(
        ["Date", "Open", "High", "Low", "Close", "Volume"]
            .map(String::from)
            .to_vec(),
    );

    let Some(data) = result.into_iter().next() else {
        return Ok(batch);
    };
    // No timestamps: nothing traded in the range (e.g. before listing).
    let Some(timestamps) = data.timestamp else {
        return Ok(batch);
    };
    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| RemoteError::ResponseFormatChanged("no quote data".into()))?;
    let offset = data.meta.and_then(|m| m.gmtoffset).unwrap_or(0);

    let cell = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();

    for (i, &ts) in timestamps.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(ts + offset, 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| RemoteError::ResponseFormatChanged(format!("invalid timestamp: {ts}")))?;

        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();

        // Holidays come back as all-null rows.
        if open.is_none() && high.is_none() && low.is_none() && close.is_none() {
            continue;
        }

        batch.push_row(vec![
            date.format("%Y-%m-%d").to_string(),
            cell(open),
            cell(high),
            cell(low),
            cell(close),
            volume.map(|v| v.to_string()).unwrap_or_default(),
        ]);
    }

    Ok(batch)
}

impl DataProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch(&self, request: &FetchRequest) -> Result<RawBatch, RemoteError> {
        self.fetch_with_retry(request)
    }

    fn blocked_for(&self) -> Option<Duration> {
        if self.circuit_breaker.is_allowed() {
            return None;
        }
        self.circuit_breaker.remaining_cooldown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<RawBatch, RemoteError> {
        let resp: ChartResponse = serde_json::from_str(json).unwrap();
        parse_chart("TCS", resp)
    }

    #[test]
    fn parses_rows_and_skips_holidays() {
        let json = r#"{"chart":{"result":[{
            "meta":{"gmtoffset":19800},
            "timestamp":[1577936700,1578023100,1578282300],
            "indicators":{"quote":[{
                "open":[2168.0,null,2200.5],
                "high":[2180.0,null,2210.0],
                "low":[2150.0,null,2190.0],
                "close":[2170.0,null,2205.0],
                "volume":[100,null,300]
            }]}
        }],"error":null}}"#;
        let batch = parse(json).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows[0][0], "2020-01-02");
        assert_eq!(batch.rows[1][4], "2205");
    }

    #[test]
    fn missing_timestamps_is_an_empty_batch() {
        let json = r#"{"chart":{"result":[{"meta":{},"indicators":{"quote":[{}]}}],"error":null}}"#;
        let batch = parse(json).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.headers[0], "Date");
    }

    #[test]
    fn not_found_error_maps_to_symbol_not_found() {
        let json = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found"}}}"#;
        assert!(matches!(parse(json), Err(RemoteError::SymbolNotFound { .. })));
    }

    fn provider(suffix: &str) -> YahooProvider {
        YahooProvider::new(
            YahooOptions {
                symbol_suffix: suffix.into(),
                ..Default::default()
            },
            Arc::new(CircuitBreaker::new(Duration::from_secs(60), 3)),
        )
        .unwrap()
    }

    #[test]
    fn url_carries_suffix_and_inclusive_end() {
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let url = provider(".NS").chart_url("TCS", SeriesKind::Equity, day, day);
        assert!(url.contains("/chart/TCS.NS?"));
        assert!(url.contains("period1=1577836800&period2=1577923200"));
    }

    #[test]
    fn trade_for_trade_series_uses_be_listing() {
        let day = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let url = provider(".NS").chart_url("TCS", SeriesKind::TradeForTrade, day, day);
        assert!(url.contains("/chart/TCS-BE.NS?"));
    }

    #[test]
    fn worst_case_latency_counts_attempts_and_backoff() {
        let options = YahooOptions {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            symbol_suffix: String::new(),
        };
        // 3 x 30s + 0.5s + 1s
        assert_eq!(options.worst_case_latency(), Duration::from_millis(91_500));

        let hostile = YahooOptions {
            timeout: Duration::from_secs(u64::MAX),
            max_retries: u32::MAX,
            ..options
        };
        assert_eq!(hostile.worst_case_latency(), Duration::MAX);
    }

    #[test]
    fn open_breaker_reports_blocked_time() {
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(600), 3));
        let yahoo = YahooProvider::new(YahooOptions::default(), Arc::clone(&breaker)).unwrap();
        assert_eq!(yahoo.blocked_for(), None);

        breaker.trip();
        let blocked = yahoo.blocked_for().unwrap();
        assert!(blocked > Duration::from_secs(590));
    }
}
