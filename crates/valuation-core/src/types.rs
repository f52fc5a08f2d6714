use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValuationError;

/// Exchange suffixes resolved through the domestic provider chain.
pub const DOMESTIC_SUFFIXES: &[&str] = &["NS", "BO"];

/// Exchange-qualified ticker symbol, e.g. `INFY.NS` or `AAPL`.
///
/// The suffix after the last `.` names the exchange and decides which
/// provider chain is eligible; bare symbols use the global chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    pub fn parse(raw: &str) -> Result<Self, ValuationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValuationError::InvalidData(
                "ticker symbol is empty".to_string(),
            ));
        }
        if trimmed.starts_with('.') || trimmed.ends_with('.') {
            return Err(ValuationError::InvalidData(format!(
                "malformed ticker symbol: {}",
                raw
            )));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Symbol without the exchange suffix (`INFY.NS` -> `INFY`).
    pub fn base_symbol(&self) -> &str {
        match self.0.rsplit_once('.') {
            Some((base, _)) => base,
            None => &self.0,
        }
    }

    pub fn exchange_suffix(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(_, suffix)| suffix)
    }

    /// True for tickers on a recognized domestic exchange (`.NS`, `.BO`).
    pub fn is_domestic(&self) -> bool {
        self.exchange_suffix()
            .map(|s| DOMESTIC_SUFFIXES.contains(&s))
            .unwrap_or(false)
    }
}

impl std::fmt::Display for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest quote, normalized across providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedQuote {
    pub symbol: String,
    pub price: f64,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    /// Provider id that supplied this quote.
    pub source: String,
}

impl NormalizedQuote {
    pub fn validate(&self) -> Result<(), ValuationError> {
        if !(self.price > 0.0) {
            return Err(ValuationError::InvalidData(format!(
                "non-positive price {} for {}",
                self.price, self.symbol
            )));
        }
        if self.timestamp > Utc::now() {
            return Err(ValuationError::InvalidData(format!(
                "quote timestamp {} for {} is in the future",
                self.timestamp, self.symbol
            )));
        }
        Ok(())
    }
}

/// One fiscal period of free cash flow.
///
/// Free cash flow is operating cash flow plus capital expenditure (capex
/// is reported negative), the "owner earnings" a DCF discounts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cashflow {
    pub fiscal_year: i32,
    pub free_cash_flow: f64,
}

/// Fundamental data normalized across providers.
///
/// Series are ordered oldest to newest. All monetary figures share one
/// currency; cross-currency fundamentals are rejected at normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedFundamentals {
    pub symbol: String,
    pub currency: String,
    pub revenue: Option<f64>,
    /// Annual free-cash-flow series, oldest first.
    pub free_cash_flows: Vec<Cashflow>,
    pub shares_outstanding: f64,
    /// Dividend per share by year, oldest first. Empty for non-payers.
    pub dividends_per_share: Vec<f64>,
    /// Provider-supplied growth estimate, if any.
    pub growth_estimate: Option<f64>,
    pub beta: Option<f64>,
    /// Provider id that supplied this record.
    pub source: String,
}

impl NormalizedFundamentals {
    /// Check the invariants consumers rely on: positive share count and a
    /// gap-free, oldest-first cash-flow series.
    pub fn validate(&self) -> Result<(), ValuationError> {
        if !(self.shares_outstanding > 0.0) {
            return Err(ValuationError::InvalidData(format!(
                "non-positive shares outstanding for {}",
                self.symbol
            )));
        }
        for pair in self.free_cash_flows.windows(2) {
            if pair[1].fiscal_year != pair[0].fiscal_year + 1 {
                return Err(ValuationError::InvalidData(format!(
                    "cash-flow series for {} has a gap between {} and {}",
                    self.symbol, pair[0].fiscal_year, pair[1].fiscal_year
                )));
            }
        }
        Ok(())
    }

    pub fn latest_free_cash_flow(&self) -> Option<f64> {
        self.free_cash_flows.last().map(|c| c.free_cash_flow)
    }

    pub fn latest_dividend(&self) -> Option<f64> {
        self.dividends_per_share.last().copied()
    }
}

/// Valuation model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Dcf,
    Ddm,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Dcf => f.write_str("DCF"),
            ModelKind::Ddm => f.write_str("DDM"),
        }
    }
}

/// Which provider supplied each input to a computed result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    pub quote: Option<String>,
    pub fundamentals: Option<String>,
    pub cashflows: Option<String>,
}

/// Result of a single valuation request. Immutable, created per request,
/// never cached (parameters vary per call).
#[derive(Debug, Clone, Serialize)]
pub struct ValuationResult {
    pub symbol: String,
    pub model: ModelKind,
    /// Intrinsic value per share.
    pub intrinsic_value: f64,
    pub currency: String,
    /// The assumption values actually used, for auditability.
    pub assumptions: serde_json::Value,
    pub provenance: Provenance,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ticker_suffix_parsing() {
        let t = Ticker::parse("infy.ns").unwrap();
        assert_eq!(t.as_str(), "INFY.NS");
        assert_eq!(t.base_symbol(), "INFY");
        assert_eq!(t.exchange_suffix(), Some("NS"));
        assert!(t.is_domestic());

        let bse = Ticker::parse("RELIANCE.BO").unwrap();
        assert!(bse.is_domestic());

        let global = Ticker::parse("AAPL").unwrap();
        assert_eq!(global.exchange_suffix(), None);
        assert!(!global.is_domestic());

        // Other exchange suffixes are not domestic
        let lse = Ticker::parse("BP.L").unwrap();
        assert_eq!(lse.exchange_suffix(), Some("L"));
        assert!(!lse.is_domestic());
    }

    #[test]
    fn test_ticker_rejects_malformed_symbols() {
        assert!(Ticker::parse("").is_err());
        assert!(Ticker::parse("   ").is_err());
        assert!(Ticker::parse(".NS").is_err());
        assert!(Ticker::parse("INFY.").is_err());
    }

    #[test]
    fn test_quote_validation() {
        let mut quote = NormalizedQuote {
            symbol: "AAPL".to_string(),
            price: 190.5,
            currency: "USD".to_string(),
            timestamp: Utc::now() - Duration::minutes(5),
            source: "yahoo".to_string(),
        };
        assert!(quote.validate().is_ok());

        quote.price = 0.0;
        assert!(quote.validate().is_err());

        quote.price = 190.5;
        quote.timestamp = Utc::now() + Duration::hours(1);
        assert!(quote.validate().is_err());
    }

    #[test]
    fn test_fundamentals_gap_detection() {
        let mut f = NormalizedFundamentals {
            symbol: "INFY.NS".to_string(),
            currency: "INR".to_string(),
            revenue: Some(1_000_000.0),
            free_cash_flows: vec![
                Cashflow { fiscal_year: 2021, free_cash_flow: 100.0 },
                Cashflow { fiscal_year: 2022, free_cash_flow: 110.0 },
                Cashflow { fiscal_year: 2023, free_cash_flow: 121.0 },
            ],
            shares_outstanding: 100.0,
            dividends_per_share: vec![],
            growth_estimate: None,
            beta: None,
            source: "alpha_vantage".to_string(),
        };
        assert!(f.validate().is_ok());
        assert_eq!(f.latest_free_cash_flow(), Some(121.0));

        // 2022 missing
        f.free_cash_flows.remove(1);
        assert!(f.validate().is_err());
    }
}
