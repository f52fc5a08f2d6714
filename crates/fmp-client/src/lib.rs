//! Financial Modeling Prep data provider. The free plan only serves a
//! fixed universe of US/UK/CA large caps, so `supports` is a membership
//! check rather than a suffix rule.

use async_trait::async_trait;
use chrono::{Datelike, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use valuation_core::{
    Cashflow, DataProvider, NormalizedFundamentals, NormalizedQuote, Ticker, ValuationError,
};

const BASE_URL: &str = "https://financialmodelingprep.com/api/v3";

pub const PROVIDER_ID: &str = "fmp";

/// Tickers covered by the FMP free plan (US, UK, CA large caps).
pub const SUPPORTED_TICKERS: &[&str] = &[
    // US large caps
    "AAPL", "MSFT", "GOOGL", "AMZN", "META", "TSLA", "NVDA", "JPM", "V", "JNJ",
    "WMT", "PG", "MA", "UNH", "HD", "DIS", "BAC", "PFE", "KO", "PEP",
    // UK large caps (LSE, .L)
    "HSBA.L", "BP.L", "GSK.L", "RIO.L", "AZN.L", "BATS.L", "DGE.L", "VOD.L", "BARC.L", "ULVR.L",
    // Canada large caps (TSX, .TO)
    "RY.TO", "TD.TO", "BNS.TO", "ENB.TO", "BAM.TO", "BMO.TO", "CM.TO", "TRP.TO", "CNR.TO", "SU.TO",
];

/// Free-plan quota is per calendar day, not per minute; track a daily
/// counter that rolls over at UTC midnight.
struct DailyQuota {
    state: Mutex<(i32, u32)>,
    limit: u32,
}

impl DailyQuota {
    fn new(limit: u32) -> Self {
        Self {
            state: Mutex::new((Utc::now().ordinal() as i32, 0)),
            limit,
        }
    }

    fn try_acquire(&self) -> Result<(), ValuationError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let today = Utc::now().ordinal() as i32;
        if state.0 != today {
            *state = (today, 0);
        }
        if state.1 >= self.limit {
            // Quota resets on a fixed daily window, so no useful
            // retry-after shorter than "tomorrow".
            tracing::warn!("FMP daily quota of {} requests exhausted", self.limit);
            return Err(ValuationError::RateLimited { retry_after: None });
        }
        state.1 += 1;
        Ok(())
    }
}

pub struct FmpProvider {
    api_key: String,
    client: Client,
    quota: DailyQuota,
}

impl FmpProvider {
    pub fn new(api_key: String) -> Self {
        // Free plan allows 250 requests/day; override with FMP_DAILY_LIMIT.
        let daily_limit: u32 = std::env::var("FMP_DAILY_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(250);

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            client,
            quota: DailyQuota::new(daily_limit),
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        extra: &[(&str, &str)],
    ) -> Result<T, ValuationError> {
        self.quota.try_acquire()?;

        let url = format!("{}/{}", BASE_URL, path);
        let mut query: Vec<(&str, &str)> = vec![("apikey", self.api_key.as_str())];
        query.extend_from_slice(extra);

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ValuationError::ProviderUnavailable(e.to_string()))?;

        match response.status().as_u16() {
            429 => return Err(ValuationError::RateLimited { retry_after: None }),
            401 | 403 => {
                return Err(ValuationError::ProviderUnavailable(
                    "FMP rejected the API key".to_string(),
                ))
            }
            s if !(200..300).contains(&s) => {
                return Err(ValuationError::ProviderUnavailable(format!("FMP HTTP {}", s)))
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
}

#[derive(Debug, Deserialize)]
struct FmpQuote {
    symbol: String,
    price: Option<f64>,
    /// Epoch seconds of the quote.
    timestamp: Option<i64>,
    #[serde(rename = "sharesOutstanding")]
    shares_outstanding: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FmpProfile {
    currency: Option<String>,
    beta: Option<f64>,
    #[serde(rename = "lastDiv")]
    last_div: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FmpCashflowStatement {
    #[serde(rename = "calendarYear")]
    calendar_year: Option<String>,
    #[serde(rename = "freeCashFlow")]
    free_cash_flow: Option<f64>,
    #[serde(rename = "operatingCashFlow")]
    operating_cash_flow: Option<f64>,
    #[serde(rename = "capitalExpenditure")]
    capital_expenditure: Option<f64>,
    revenue: Option<f64>,
}

/// Statements arrive newest first. FMP reports free cash flow directly;
/// fall back to operating cash flow + capex when it is absent.
fn normalize_cashflows(statements: Vec<FmpCashflowStatement>) -> Vec<Cashflow> {
    let mut flows: Vec<Cashflow> = statements
        .into_iter()
        .filter_map(|s| {
            let year: i32 = s.calendar_year.as_deref()?.parse().ok()?;
            let fcf = s.free_cash_flow.or_else(|| {
                s.operating_cash_flow
                    .map(|ocf| ocf + s.capital_expenditure.unwrap_or(0.0))
            })?;
            Some(Cashflow {
                fiscal_year: year,
                free_cash_flow: fcf,
            })
        })
        .collect();
    flows.sort_by_key(|c| c.fiscal_year);
    flows
}

#[async_trait]
impl DataProvider for FmpProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn supports(&self, ticker: &Ticker) -> bool {
        SUPPORTED_TICKERS.contains(&ticker.as_str())
    }

    async fn quote(&self, ticker: &Ticker) -> Result<NormalizedQuote, ValuationError> {
        let quotes: Vec<FmpQuote> = self
            .fetch(&format!("quote/{}", ticker.as_str()), &[])
            .await?;
        let quote = quotes
            .into_iter()
            .next()
            .ok_or_else(|| ValuationError::SymbolNotFound(ticker.to_string()))?;

        let price = quote
            .price
            .ok_or_else(|| ValuationError::InvalidData(format!("no price for {}", ticker)))?;
        let timestamp = quote
            .timestamp
            .and_then(|t| Utc.timestamp_opt(t, 0).single())
            .unwrap_or_else(Utc::now);

        let profiles: Vec<FmpProfile> = self
            .fetch(&format!("profile/{}", ticker.as_str()), &[])
            .await?;
        let currency = profiles
            .first()
            .and_then(|p| p.currency.clone())
            .unwrap_or_else(|| "USD".to_string());

        let normalized = NormalizedQuote {
            symbol: quote.symbol,
            price,
            currency,
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
        let limit = lookback_years.max(2).to_string();
        let statements: Vec<FmpCashflowStatement> = self
            .fetch(
                &format!("cash-flow-statement/{}", ticker.as_str()),
                &[("limit", limit.as_str())],
            )
            .await?;
        if statements.is_empty() {
            return Err(ValuationError::SymbolNotFound(ticker.to_string()));
        }
        let revenue = statements.first().and_then(|s| s.revenue);
        let flows = normalize_cashflows(statements);
        if flows.len() < 2 {
            return Err(ValuationError::InsufficientHistory {
                required: 2,
                available: flows.len(),
            });
        }

        let profiles: Vec<FmpProfile> = self
            .fetch(&format!("profile/{}", ticker.as_str()), &[])
            .await?;
        let profile = profiles
            .into_iter()
            .next()
            .ok_or_else(|| ValuationError::SymbolNotFound(ticker.to_string()))?;

        let quotes: Vec<FmpQuote> = self
            .fetch(&format!("quote/{}", ticker.as_str()), &[])
            .await?;
        let shares = quotes
            .first()
            .and_then(|q| q.shares_outstanding)
            .ok_or_else(|| {
                ValuationError::InvalidData(format!("no shares outstanding for {}", ticker))
            })?;

        let dividends: Vec<f64> = profile
            .last_div
            .filter(|d| *d > 0.0)
            .into_iter()
            .collect();

        let fundamentals = NormalizedFundamentals {
            symbol: ticker.to_string(),
            currency: profile.currency.unwrap_or_else(|| "USD".to_string()),
            revenue,
            free_cash_flows: flows,
            shares_outstanding: shares,
            dividends_per_share: dividends,
            growth_estimate: None,
            beta: profile.beta,
            source: PROVIDER_ID.to_string(),
        };
        fundamentals.validate()?;
        Ok(fundamentals)
    }

    async fn cashflows(&self, ticker: &Ticker) -> Result<Vec<Cashflow>, ValuationError> {
        let statements: Vec<FmpCashflowStatement> = self
            .fetch(
                &format!("cash-flow-statement/{}", ticker.as_str()),
                &[("limit", "10")],
            )
            .await?;
        if statements.is_empty() {
            return Err(ValuationError::SymbolNotFound(ticker.to_string()));
        }
        Ok(normalize_cashflows(statements))
    }
}
