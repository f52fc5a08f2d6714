//! Yahoo Finance data provider. Unauthenticated and universal coverage,
//! which makes it the last-resort fallback in every chain. No API key
//! means no quota bookkeeping either.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use valuation_core::{
    Cashflow, DataProvider, NormalizedFundamentals, NormalizedQuote, Ticker, ValuationError,
};

const CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const SUMMARY_URL: &str = "https://query1.finance.yahoo.com/v10/finance/quoteSummary";
const USER_AGENT: &str = "Mozilla/5.0 (compatible; intrinsiq/0.1)";

pub const PROVIDER_ID: &str = "yahoo";

pub struct YahooProvider {
    client: Client,
}

impl YahooProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        symbol: &str,
    ) -> Result<T, ValuationError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| ValuationError::ProviderUnavailable(e.to_string()))?;

        match response.status().as_u16() {
            404 => return Err(ValuationError::SymbolNotFound(symbol.to_string())),
            429 => return Err(ValuationError::RateLimited { retry_after: None }),
            s if !(200..300).contains(&s) => {
                return Err(ValuationError::ProviderUnavailable(format!(
                    "Yahoo HTTP {}",
                    s
                )))
            }
            _ => {}
        }

        // Non-JSON bodies (truncated responses, HTML error pages) are a
        // provider malfunction, not a verdict on the symbol.
        response
            .json()
            .await
            .map_err(|e| ValuationError::ProviderUnavailable(e.to_string()))
    }

    async fn chart(&self, ticker: &Ticker, range: &str) -> Result<ChartResult, ValuationError> {
        let url = format!("{}/{}", CHART_URL, ticker.as_str());
        let body: ChartResponse = self
            .get_json(
                &url,
                &[("range", range), ("interval", "1mo"), ("events", "div")],
                ticker.as_str(),
            )
            .await?;
        chart_result(body, ticker.as_str())
    }

    async fn quote_summary(&self, ticker: &Ticker) -> Result<SummaryResult, ValuationError> {
        let url = format!("{}/{}", SUMMARY_URL, ticker.as_str());
        let body: QuoteSummaryResponse = self
            .get_json(
                &url,
                &[(
                    "modules",
                    "cashflowStatementHistory,defaultKeyStatistics,financialData",
                )],
                ticker.as_str(),
            )
            .await?;
        body.quote_summary
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .ok_or_else(|| ValuationError::SymbolNotFound(ticker.to_string()))
    }
}

impl Default for YahooProvider {
    fn default() -> Self {
        Self::new()
    }
}

// ---- v8 chart ----

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartOuter,
}

#[derive(Debug, Deserialize)]
struct ChartOuter {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    events: Option<ChartEvents>,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    symbol: String,
    currency: Option<String>,
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
    #[serde(rename = "regularMarketTime")]
    regular_market_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ChartEvents {
    dividends: Option<HashMap<String, DividendEvent>>,
}

#[derive(Debug, Deserialize)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

fn chart_result(body: ChartResponse, symbol: &str) -> Result<ChartResult, ValuationError> {
    if let Some(err) = body.chart.error {
        tracing::debug!("Yahoo chart error for {}: {} {}", symbol, err.code, err.description);
        return Err(ValuationError::SymbolNotFound(symbol.to_string()));
    }
    body.chart
        .result
        .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
        .ok_or_else(|| ValuationError::SymbolNotFound(symbol.to_string()))
}

/// Sum per-payment dividend events into annual per-share figures, oldest
/// year first. The current (partial) year is dropped so a half-collected
/// year does not read as a dividend cut.
fn annual_dividends(events: &HashMap<String, DividendEvent>, now: DateTime<Utc>) -> Vec<f64> {
    let current_year = now.year();
    let mut by_year: BTreeMap<i32, f64> = BTreeMap::new();
    for event in events.values() {
        if let Some(ts) = Utc.timestamp_opt(event.date, 0).single() {
            if ts.year() < current_year {
                *by_year.entry(ts.year()).or_insert(0.0) += event.amount;
            }
        }
    }
    by_year.into_values().collect()
}

// ---- v10 quoteSummary ----

#[derive(Debug, Deserialize)]
struct QuoteSummaryResponse {
    #[serde(rename = "quoteSummary")]
    quote_summary: QuoteSummaryOuter,
}

#[derive(Debug, Deserialize)]
struct QuoteSummaryOuter {
    result: Option<Vec<SummaryResult>>,
}

#[derive(Debug, Deserialize)]
struct SummaryResult {
    #[serde(rename = "cashflowStatementHistory")]
    cashflow_statement_history: Option<CashflowHistory>,
    #[serde(rename = "defaultKeyStatistics")]
    default_key_statistics: Option<KeyStatistics>,
    #[serde(rename = "financialData")]
    financial_data: Option<FinancialData>,
}

#[derive(Debug, Deserialize)]
struct CashflowHistory {
    #[serde(rename = "cashflowStatements", default)]
    cashflow_statements: Vec<CashflowStatement>,
}

#[derive(Debug, Deserialize)]
struct CashflowStatement {
    #[serde(rename = "endDate")]
    end_date: Option<RawNum>,
    #[serde(rename = "totalCashFromOperatingActivities")]
    operating_cash_flow: Option<RawNum>,
    #[serde(rename = "capitalExpenditures")]
    capital_expenditures: Option<RawNum>,
}

#[derive(Debug, Deserialize)]
struct KeyStatistics {
    #[serde(rename = "sharesOutstanding")]
    shares_outstanding: Option<RawNum>,
    beta: Option<RawNum>,
}

#[derive(Debug, Deserialize)]
struct FinancialData {
    #[serde(rename = "totalRevenue")]
    total_revenue: Option<RawNum>,
}

/// Yahoo wraps every numeric field as `{"raw": ..., "fmt": "..."}`.
#[derive(Debug, Deserialize)]
struct RawNum {
    raw: Option<f64>,
}

fn raw(value: &Option<RawNum>) -> Option<f64> {
    value.as_ref().and_then(|v| v.raw)
}

/// Statements arrive newest first; normalize to oldest first with free
/// cash flow = operating cash flow + capex (capex is reported negative).
fn normalize_cashflows(statements: &[CashflowStatement]) -> Vec<Cashflow> {
    let mut flows: Vec<Cashflow> = statements
        .iter()
        .filter_map(|s| {
            let end = raw(&s.end_date)? as i64;
            let year = Utc.timestamp_opt(end, 0).single()?.year();
            let ocf = raw(&s.operating_cash_flow)?;
            let capex = raw(&s.capital_expenditures).unwrap_or(0.0);
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
impl DataProvider for YahooProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    /// Yahoo resolves any exchange-qualified or bare symbol.
    fn supports(&self, _ticker: &Ticker) -> bool {
        true
    }

    async fn quote(&self, ticker: &Ticker) -> Result<NormalizedQuote, ValuationError> {
        let result = self.chart(ticker, "1d").await?;
        let price = result.meta.regular_market_price.ok_or_else(|| {
            ValuationError::InvalidData(format!("no market price for {}", ticker))
        })?;
        let timestamp = result
            .meta
            .regular_market_time
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);

        let normalized = NormalizedQuote {
            symbol: result.meta.symbol,
            price,
            currency: result.meta.currency.unwrap_or_else(|| "USD".to_string()),
            timestamp,
            source: PROVIDER_ID.to_string(),
        };
        normalized.validate()?;
        Ok(normalized)
    }

    async fn fundamentals(
        &self,
        ticker: &Ticker,
        lookback_years: usize,
    ) -> Result<NormalizedFundamentals, ValuationError> {
        let summary = self.quote_summary(ticker).await?;
        // Ten years of monthly bars brings the dividend event history
        // along with currency in one call.
        let chart = self.chart(ticker, "10y").await?;

        let statements = summary
            .cashflow_statement_history
            .as_ref()
            .map(|h| h.cashflow_statements.as_slice())
            .unwrap_or(&[]);
        let mut flows = normalize_cashflows(statements);
        if flows.len() > lookback_years {
            flows.drain(..flows.len() - lookback_years);
        }
        if flows.len() < 2 {
            return Err(ValuationError::InsufficientHistory {
                required: 2,
                available: flows.len(),
            });
        }

        let stats = summary.default_key_statistics.as_ref();
        let shares = stats
            .and_then(|s| raw(&s.shares_outstanding))
            .ok_or_else(|| {
                ValuationError::InvalidData(format!("no shares outstanding for {}", ticker))
            })?;

        let dividends = chart
            .events
            .as_ref()
            .and_then(|e| e.dividends.as_ref())
            .map(|d| annual_dividends(d, Utc::now()))
            .unwrap_or_default();

        let fundamentals = NormalizedFundamentals {
            symbol: ticker.to_string(),
            currency: chart.meta.currency.unwrap_or_else(|| "USD".to_string()),
            revenue: summary.financial_data.as_ref().and_then(|f| raw(&f.total_revenue)),
            free_cash_flows: flows,
            shares_outstanding: shares,
            dividends_per_share: dividends,
            growth_estimate: None,
            beta: stats.and_then(|s| raw(&s.beta)),
            source: PROVIDER_ID.to_string(),
        };
        fundamentals.validate()?;
        Ok(fundamentals)
    }

    async fn cashflows(&self, ticker: &Ticker) -> Result<Vec<Cashflow>, ValuationError> {
        let summary = self.quote_summary(ticker).await?;
        let statements = summary
            .cashflow_statement_history
            .as_ref()
            .map(|h| h.cashflow_statements.as_slice())
            .unwrap_or(&[]);
        let flows = normalize_cashflows(statements);
        if flows.is_empty() {
            return Err(ValuationError::SymbolNotFound(ticker.to_string()));
        }
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHART_BODY: &str = r#"{
        "chart": {
            "result": [{
                "meta": {
                    "symbol": "AAPL",
                    "currency": "USD",
                    "regularMarketPrice": 190.5,
                    "regularMarketTime": 1719244800
                },
                "events": {
                    "dividends": {
                        "1614350000": {"amount": 0.22, "date": 1614350000},
                        "1645886000": {"amount": 0.23, "date": 1645886000},
                        "1677422000": {"amount": 0.24, "date": 1677422000}
                    }
                }
            }],
            "error": null
        }
    }"#;

    #[test]
    fn test_chart_quote_parsing() {
        let body: ChartResponse = serde_json::from_str(CHART_BODY).unwrap();
        let result = chart_result(body, "AAPL").unwrap();
        assert_eq!(result.meta.symbol, "AAPL");
        assert_eq!(result.meta.regular_market_price, Some(190.5));
        assert_eq!(result.meta.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn test_chart_error_maps_to_symbol_not_found() {
        let raw = r#"{
            "chart": {
                "result": null,
                "error": {"code": "Not Found", "description": "No data found, symbol may be delisted"}
            }
        }"#;
        let body: ChartResponse = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            chart_result(body, "ZZZZ"),
            Err(ValuationError::SymbolNotFound(_))
        ));
    }

    #[test]
    fn test_annual_dividends_grouped_oldest_first() {
        let body: ChartResponse = serde_json::from_str(CHART_BODY).unwrap();
        let result = chart_result(body, "AAPL").unwrap();
        let events = result.events.unwrap().dividends.unwrap();

        // Events fall in 2021, 2022 and 2023; with "now" in 2024 all
        // three are complete years.
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let annual = annual_dividends(&events, now);
        assert_eq!(annual, vec![0.22, 0.23, 0.24]);

        // With "now" inside 2023 the partial year is dropped.
        let mid_2023 = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        let annual = annual_dividends(&events, mid_2023);
        assert_eq!(annual, vec![0.22, 0.23]);
    }

    #[test]
    fn test_cashflow_statement_normalization() {
        let raw_body = r#"{
            "quoteSummary": {
                "result": [{
                    "cashflowStatementHistory": {
                        "cashflowStatements": [
                            {"endDate": {"raw": 1664496000}, "totalCashFromOperatingActivities": {"raw": 1000.0}, "capitalExpenditures": {"raw": -200.0}},
                            {"endDate": {"raw": 1632960000}, "totalCashFromOperatingActivities": {"raw": 900.0}, "capitalExpenditures": {"raw": -150.0}}
                        ]
                    },
                    "defaultKeyStatistics": {"sharesOutstanding": {"raw": 1000000.0}, "beta": {"raw": 1.1}},
                    "financialData": {"totalRevenue": {"raw": 50000.0}}
                }]
            }
        }"#;
        let body: QuoteSummaryResponse = serde_json::from_str(raw_body).unwrap();
        let result = body.quote_summary.result.unwrap().remove(0);
        let flows =
            normalize_cashflows(&result.cashflow_statement_history.unwrap().cashflow_statements);

        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].fiscal_year, 2021);
        assert_eq!(flows[0].free_cash_flow, 750.0);
        assert_eq!(flows[1].fiscal_year, 2022);
        assert_eq!(flows[1].free_cash_flow, 800.0);
    }

    #[test]
    fn test_supports_everything() {
        let provider = YahooProvider::new();
        assert!(provider.supports(&Ticker::parse("INFY.NS").unwrap()));
        assert!(provider.supports(&Ticker::parse("AAPL").unwrap()));
        assert!(provider.supports(&Ticker::parse("BP.L").unwrap()));
    }
}
