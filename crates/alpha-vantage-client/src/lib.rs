//! Alpha Vantage data provider. Serves NSE/BSE tickers (the primary
//! domestic source) and falls back to any global symbol the service
//! knows about.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use valuation_core::{
    Cashflow, DataProvider, NormalizedFundamentals, NormalizedQuote, Ticker, ValuationError,
};

const BASE_URL: &str = "https://www.alphavantage.co/query";

pub const PROVIDER_ID: &str = "alpha_vantage";

/// Sliding-window quota guard. Unlike a sleeping limiter, an exhausted
/// window reports `RateLimited` with a retry-after hint so the resolver
/// can move on to the next provider instead of stalling the chain.
struct QuotaWindow {
    timestamps: Mutex<VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl QuotaWindow {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            max_requests,
            window,
        }
    }

    fn try_acquire(&self) -> Result<(), ValuationError> {
        let mut ts = self.timestamps.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        while let Some(&front) = ts.front() {
            if now.duration_since(front) >= self.window {
                ts.pop_front();
            } else {
                break;
            }
        }

        if ts.len() < self.max_requests {
            ts.push_back(now);
            return Ok(());
        }

        let retry_after = ts
            .front()
            .map(|&front| self.window.saturating_sub(now.duration_since(front)));
        Err(ValuationError::RateLimited { retry_after })
    }
}

pub struct AlphaVantageProvider {
    api_key: String,
    client: Client,
    quota: QuotaWindow,
}

impl AlphaVantageProvider {
    pub fn new(api_key: String) -> Self {
        // Free tier allows 5 requests/minute; override with
        // ALPHA_VANTAGE_RATE_LIMIT for paid plans.
        let rate_limit: usize = std::env::var("ALPHA_VANTAGE_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            client,
            quota: QuotaWindow::new(rate_limit, Duration::from_secs(60)),
        }
    }

    async fn fetch(
        &self,
        function: &str,
        symbol: &str,
    ) -> Result<serde_json::Value, ValuationError> {
        self.quota.try_acquire()?;

        let response = self
            .client
            .get(BASE_URL)
            .query(&[
                ("function", function),
                ("symbol", symbol),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ValuationError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ValuationError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            return Err(ValuationError::ProviderUnavailable(format!(
                "Alpha Vantage HTTP {}",
                status
            )));
        }

        // A body that is not JSON (truncated response, HTML error page)
        // is a provider malfunction, not a verdict on the symbol.
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ValuationError::ProviderUnavailable(e.to_string()))?;
        classify_payload(&body, symbol)?;
        Ok(body)
    }
}

/// Alpha Vantage signals throttling and bad symbols inside a 200 body.
fn classify_payload(body: &serde_json::Value, symbol: &str) -> Result<(), ValuationError> {
    if body.get("Note").is_some() || body.get("Information").is_some() {
        // Standard free-tier throttle message; quota resets each minute.
        tracing::warn!("Alpha Vantage throttled the request for {}", symbol);
        return Err(ValuationError::RateLimited {
            retry_after: Some(Duration::from_secs(60)),
        });
    }
    if body.get("Error Message").is_some() {
        return Err(ValuationError::SymbolNotFound(symbol.to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote")]
    quote: Option<GlobalQuote>,
}

#[derive(Debug, Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol")]
    symbol: String,
    #[serde(rename = "05. price")]
    price: String,
    #[serde(rename = "07. latest trading day")]
    latest_trading_day: String,
}

#[derive(Debug, Deserialize)]
struct Overview {
    #[serde(rename = "Currency")]
    currency: Option<String>,
    #[serde(rename = "SharesOutstanding")]
    shares_outstanding: Option<String>,
    #[serde(rename = "DividendPerShare")]
    dividend_per_share: Option<String>,
    #[serde(rename = "Beta")]
    beta: Option<String>,
    #[serde(rename = "RevenueTTM")]
    revenue_ttm: Option<String>,
    #[serde(rename = "QuarterlyRevenueGrowthYOY")]
    revenue_growth_yoy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CashFlowResponse {
    #[serde(rename = "annualReports", default)]
    annual_reports: Vec<AnnualReport>,
}

#[derive(Debug, Deserialize)]
struct AnnualReport {
    #[serde(rename = "fiscalDateEnding")]
    fiscal_date_ending: String,
    #[serde(rename = "operatingCashflow")]
    operating_cashflow: Option<String>,
    #[serde(rename = "capitalExpenditures")]
    capital_expenditures: Option<String>,
}

/// Alpha Vantage serializes numbers as strings, sometimes with thousands
/// separators, and uses "None"/"-" for missing values.
fn parse_num(raw: &str) -> Option<f64> {
    let cleaned = raw.replace(',', "");
    if cleaned.is_empty() || cleaned == "None" || cleaned == "-" {
        return None;
    }
    cleaned.parse().ok()
}

fn quote_currency(ticker: &Ticker, overview_currency: Option<&str>) -> String {
    if ticker.is_domestic() {
        "INR".to_string()
    } else {
        overview_currency.unwrap_or("USD").to_string()
    }
}

fn normalize_quote(ticker: &Ticker, quote: GlobalQuote) -> Result<NormalizedQuote, ValuationError> {
    let price = parse_num(&quote.price).ok_or_else(|| {
        ValuationError::InvalidData(format!(
            "unparseable price '{}' for {}",
            quote.price, quote.symbol
        ))
    })?;

    let trading_day = NaiveDate::parse_from_str(&quote.latest_trading_day, "%Y-%m-%d")
        .map_err(|e| {
            ValuationError::InvalidData(format!(
                "bad trading day '{}': {}",
                quote.latest_trading_day, e
            ))
        })?;
    let timestamp = Utc.from_utc_datetime(&trading_day.and_time(NaiveTime::MIN));

    let normalized = NormalizedQuote {
        symbol: quote.symbol,
        price,
        currency: quote_currency(ticker, None),
        timestamp,
        source: PROVIDER_ID.to_string(),
    };
    normalized.validate()?;
    Ok(normalized)
}

/// Reports arrive newest first; normalize to oldest first with free cash
/// flow = operating cash flow + capex (capex is reported negative).
fn normalize_cashflows(reports: Vec<AnnualReport>) -> Vec<Cashflow> {
    let mut flows: Vec<Cashflow> = reports
        .into_iter()
        .filter_map(|report| {
            let year: i32 = report.fiscal_date_ending.get(..4)?.parse().ok()?;
            let ocf = report.operating_cashflow.as_deref().and_then(parse_num)?;
            let capex = report
                .capital_expenditures
                .as_deref()
                .and_then(parse_num)
                .unwrap_or(0.0);
            Some(Cashflow {
                fiscal_year: year,
                free_cash_flow: ocf + capex,
            })
        })
        .collect();
    flows.sort_by_key(|c| c.fiscal_year);
    flows
}

#[async_trait]
impl DataProvider for AlphaVantageProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    /// Alpha Vantage covers NSE/BSE listings and global symbols alike;
    /// its position in each chain is decided by resolver configuration.
    fn supports(&self, _ticker: &Ticker) -> bool {
        true
    }

    async fn quote(&self, ticker: &Ticker) -> Result<NormalizedQuote, ValuationError> {
        let body = self.fetch("GLOBAL_QUOTE", ticker.as_str()).await?;
        let parsed: GlobalQuoteResponse = serde_json::from_value(body)
            .map_err(|e| ValuationError::InvalidData(e.to_string()))?;
        let quote = parsed
            .quote
            .ok_or_else(|| ValuationError::SymbolNotFound(ticker.to_string()))?;
        normalize_quote(ticker, quote)
    }

    async fn fundamentals(
        &self,
        ticker: &Ticker,
        lookback_years: usize,
    ) -> Result<NormalizedFundamentals, ValuationError> {
        let overview_body = self.fetch("OVERVIEW", ticker.as_str()).await?;
        let overview: Overview = serde_json::from_value(overview_body)
            .map_err(|e| ValuationError::InvalidData(e.to_string()))?;

        let shares = overview
            .shares_outstanding
            .as_deref()
            .and_then(parse_num)
            .ok_or_else(|| {
                ValuationError::InvalidData(format!("no shares outstanding for {}", ticker))
            })?;

        let mut flows = self.cashflows(ticker).await?;
        if flows.len() > lookback_years {
            flows.drain(..flows.len() - lookback_years);
        }
        if flows.len() < 2 {
            return Err(ValuationError::InsufficientHistory {
                required: 2,
                available: flows.len(),
            });
        }

        // OVERVIEW carries only the latest dividend per share, so the
        // history is at most one point; DDM callers supply growth.
        let dividends: Vec<f64> = overview
            .dividend_per_share
            .as_deref()
            .and_then(parse_num)
            .filter(|d| *d > 0.0)
            .into_iter()
            .collect();

        let fundamentals = NormalizedFundamentals {
            symbol: ticker.to_string(),
            currency: quote_currency(ticker, overview.currency.as_deref()),
            revenue: overview.revenue_ttm.as_deref().and_then(parse_num),
            free_cash_flows: flows,
            shares_outstanding: shares,
            dividends_per_share: dividends,
            growth_estimate: overview.revenue_growth_yoy.as_deref().and_then(parse_num),
            beta: overview.beta.as_deref().and_then(parse_num),
            source: PROVIDER_ID.to_string(),
        };
        fundamentals.validate()?;
        Ok(fundamentals)
    }

    async fn cashflows(&self, ticker: &Ticker) -> Result<Vec<Cashflow>, ValuationError> {
        let body = self.fetch("CASH_FLOW", ticker.as_str()).await?;
        let parsed: CashFlowResponse = serde_json::from_value(body)
            .map_err(|e| ValuationError::InvalidData(e.to_string()))?;
        if parsed.annual_reports.is_empty() {
            return Err(ValuationError::SymbolNotFound(ticker.to_string()));
        }
        Ok(normalize_cashflows(parsed.annual_reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quote_normalization_with_thousand_separators() {
        let ticker = Ticker::parse("INFY.NS").unwrap();
        let quote = GlobalQuote {
            symbol: "INFY.NS".to_string(),
            price: "2,100.50".to_string(),
            latest_trading_day: "2023-06-22".to_string(),
        };

        let normalized = normalize_quote(&ticker, quote).unwrap();
        assert_eq!(normalized.price, 2100.50);
        assert_eq!(normalized.currency, "INR");
        assert_eq!(normalized.source, PROVIDER_ID);
    }

    #[test]
    fn test_global_ticker_defaults_to_usd() {
        let ticker = Ticker::parse("AAPL").unwrap();
        assert_eq!(quote_currency(&ticker, None), "USD");
        assert_eq!(quote_currency(&ticker, Some("EUR")), "EUR");
    }

    #[test]
    fn test_throttle_note_maps_to_rate_limited() {
        let body = json!({
            "Note": "Thank you for using Alpha Vantage! Our standard API rate limit is 5 requests per minute."
        });
        let err = classify_payload(&body, "INFY.NS").unwrap_err();
        assert!(matches!(err, ValuationError::RateLimited { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn test_error_message_maps_to_symbol_not_found() {
        let body = json!({ "Error Message": "Invalid API call." });
        let err = classify_payload(&body, "NOPE").unwrap_err();
        assert!(matches!(err, ValuationError::SymbolNotFound(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_cashflow_normalization_orders_oldest_first() {
        let reports = vec![
            AnnualReport {
                fiscal_date_ending: "2022-12-31".to_string(),
                operating_cashflow: Some("1000000000".to_string()),
                capital_expenditures: Some("-200000000".to_string()),
            },
            AnnualReport {
                fiscal_date_ending: "2021-12-31".to_string(),
                operating_cashflow: Some("900000000".to_string()),
                capital_expenditures: Some("-150000000".to_string()),
            },
        ];

        let flows = normalize_cashflows(reports);
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].fiscal_year, 2021);
        assert_eq!(flows[0].free_cash_flow, 750_000_000.0);
        assert_eq!(flows[1].fiscal_year, 2022);
        assert_eq!(flows[1].free_cash_flow, 800_000_000.0);
    }

    #[test]
    fn test_reports_without_operating_cashflow_are_dropped() {
        let reports = vec![AnnualReport {
            fiscal_date_ending: "2022-12-31".to_string(),
            operating_cashflow: Some("None".to_string()),
            capital_expenditures: None,
        }];
        assert!(normalize_cashflows(reports).is_empty());
    }

    #[test]
    fn test_quota_window_reports_retry_after() {
        let quota = QuotaWindow::new(2, Duration::from_secs(60));
        assert!(quota.try_acquire().is_ok());
        assert!(quota.try_acquire().is_ok());

        match quota.try_acquire() {
            Err(ValuationError::RateLimited { retry_after }) => {
                let hint = retry_after.expect("retry-after hint");
                assert!(hint <= Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_supports_any_symbol() {
        let provider = AlphaVantageProvider::new("demo".to_string());
        assert!(provider.supports(&Ticker::parse("INFY.NS").unwrap()));
        assert!(provider.supports(&Ticker::parse("AAPL").unwrap()));
    }
}
