use async_trait::async_trait;

use crate::{Cashflow, NormalizedFundamentals, NormalizedQuote, Ticker, ValuationError};

/// Capability contract every concrete data provider implements.
///
/// Providers are stateless apart from internal rate-limit bookkeeping.
/// Transient failures (`RateLimited`, `ProviderUnavailable`) are expected
/// and handled by the resolver's fallback chain.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Stable provider id, used for cache keys and provenance.
    fn id(&self) -> &'static str;

    /// Pure predicate on the symbol/exchange suffix. Must not perform I/O.
    fn supports(&self, ticker: &Ticker) -> bool;

    async fn quote(&self, ticker: &Ticker) -> Result<NormalizedQuote, ValuationError>;

    /// Fails with `InsufficientHistory` when fewer than 2 cash-flow
    /// periods exist within the lookback window.
    async fn fundamentals(
        &self,
        ticker: &Ticker,
        lookback_years: usize,
    ) -> Result<NormalizedFundamentals, ValuationError>;

    /// Full annual free-cash-flow series, ordered oldest to newest.
    async fn cashflows(&self, ticker: &Ticker) -> Result<Vec<Cashflow>, ValuationError>;
}
