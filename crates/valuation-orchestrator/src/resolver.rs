//! Ordered provider fallback: the core resolution algorithm.
//!
//! A single deterministic pass through the chain for the ticker class;
//! transient failures move on to the next provider, and the caller above
//! this layer owns any re-attempt scheduling (provider quotas reset on
//! fixed windows, not backoff timers).

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use valuation_core::{
    AttemptOutcome, Cashflow, DataProvider, NormalizedFundamentals, NormalizedQuote,
    ProviderAttempt, Ticker, ValuationError,
};

use crate::cache::{params_hash, CacheKey, Method, Payload, ResponseCache};

/// Explicit, injected chain configuration: ordered provider ids per
/// ticker class, so tests can substitute synthetic chains.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Chain for tickers with a domestic exchange suffix (.NS/.BO).
    pub domestic_chain: Vec<String>,
    /// Chain for everything else, including bare symbols.
    pub global_chain: Vec<String>,
    /// Timeout for a single provider live call.
    pub request_timeout: Duration,
    pub quote_ttl: Duration,
    pub fundamentals_ttl: Duration,
    /// Years of cash-flow history requested from providers.
    pub lookback_years: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            domestic_chain: vec![
                alpha_vantage_client::PROVIDER_ID.to_string(),
                yahoo_client::PROVIDER_ID.to_string(),
            ],
            global_chain: vec![
                fmp_client::PROVIDER_ID.to_string(),
                alpha_vantage_client::PROVIDER_ID.to_string(),
                yahoo_client::PROVIDER_ID.to_string(),
            ],
            request_timeout: Duration::from_secs(30),
            quote_ttl: Duration::from_secs(15 * 60),
            fundamentals_ttl: Duration::from_secs(24 * 60 * 60),
            lookback_years: 10,
        }
    }
}

impl ResolverConfig {
    /// Default chains with timeout/TTL overrides from the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env_secs("VALUATION_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = secs;
        }
        if let Some(secs) = env_secs("VALUATION_QUOTE_TTL_SECS") {
            config.quote_ttl = secs;
        }
        if let Some(secs) = env_secs("VALUATION_FUNDAMENTALS_TTL_SECS") {
            config.fundamentals_ttl = secs;
        }
        config
    }
}

fn env_secs(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

pub struct ProviderResolver {
    providers: Vec<Arc<dyn DataProvider>>,
    config: ResolverConfig,
    cache: ResponseCache,
    /// Last fallback trace per ticker, for the diagnostics surface.
    traces: DashMap<String, Vec<ProviderAttempt>>,
}

impl ProviderResolver {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>, config: ResolverConfig) -> Self {
        let cache = ResponseCache::new(config.quote_ttl, config.fundamentals_ttl);
        Self {
            providers,
            config,
            cache,
            traces: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Providers in chain order for this ticker class. Ids without a
    /// registered provider are ignored.
    fn chain_for(&self, ticker: &Ticker) -> Vec<Arc<dyn DataProvider>> {
        let ids = if ticker.is_domestic() {
            &self.config.domestic_chain
        } else {
            &self.config.global_chain
        };
        ids.iter()
            .filter_map(|id| {
                self.providers
                    .iter()
                    .find(|p| p.id() == id.as_str())
                    .cloned()
            })
            .collect()
    }

    pub async fn quote(
        &self,
        ticker: &Ticker,
        deadline: Option<Instant>,
    ) -> Result<NormalizedQuote, ValuationError> {
        match self.resolve(ticker, Method::Quote, deadline).await? {
            Payload::Quote(quote) => Ok(quote),
            _ => Err(ValuationError::InvalidData(
                "cache payload type mismatch for quote".to_string(),
            )),
        }
    }

    pub async fn fundamentals(
        &self,
        ticker: &Ticker,
        deadline: Option<Instant>,
    ) -> Result<NormalizedFundamentals, ValuationError> {
        match self.resolve(ticker, Method::Fundamentals, deadline).await? {
            Payload::Fundamentals(fundamentals) => Ok(fundamentals),
            _ => Err(ValuationError::InvalidData(
                "cache payload type mismatch for fundamentals".to_string(),
            )),
        }
    }

    pub async fn cashflows(
        &self,
        ticker: &Ticker,
        deadline: Option<Instant>,
    ) -> Result<Vec<Cashflow>, ValuationError> {
        match self.resolve(ticker, Method::Cashflows, deadline).await? {
            Payload::Cashflows(flows) => Ok(flows),
            _ => Err(ValuationError::InvalidData(
                "cache payload type mismatch for cashflows".to_string(),
            )),
        }
    }

    /// Most recent fallback trace for a ticker (provider attempted →
    /// outcome), for troubleshooting degraded coverage.
    pub fn last_trace(&self, ticker: &Ticker) -> Option<Vec<ProviderAttempt>> {
        self.traces.get(ticker.as_str()).map(|t| t.clone())
    }

    async fn call(
        &self,
        provider: &Arc<dyn DataProvider>,
        ticker: &Ticker,
        method: Method,
    ) -> Result<Payload, ValuationError> {
        match method {
            Method::Quote => provider.quote(ticker).await.map(Payload::Quote),
            Method::Fundamentals => provider
                .fundamentals(ticker, self.config.lookback_years)
                .await
                .map(Payload::Fundamentals),
            Method::Cashflows => provider.cashflows(ticker).await.map(Payload::Cashflows),
        }
    }

    fn cache_key(&self, provider_id: &str, ticker: &Ticker, method: Method) -> CacheKey {
        let hash = match method {
            Method::Fundamentals => params_hash(self.config.lookback_years),
            _ => 0,
        };
        CacheKey::new(provider_id, ticker.as_str(), method, hash)
    }

    fn finish_trace(&self, ticker: &Ticker, attempts: Vec<ProviderAttempt>) {
        self.traces.insert(ticker.as_str().to_string(), attempts);
    }

    /// Walk the chain once, in order. Cache first, then a live call
    /// under a bounded timeout; soft failures continue, the rest surface.
    async fn resolve(
        &self,
        ticker: &Ticker,
        method: Method,
        deadline: Option<Instant>,
    ) -> Result<Payload, ValuationError> {
        let chain = self.chain_for(ticker);
        let mut attempts: Vec<ProviderAttempt> = Vec::new();

        for provider in &chain {
            if deadline_passed(deadline) {
                tracing::warn!(
                    "Deadline exceeded resolving {} for {}, abandoning remaining providers",
                    method.name(),
                    ticker
                );
                self.finish_trace(ticker, attempts);
                return Err(ValuationError::DeadlineExceeded);
            }

            if !provider.supports(ticker) {
                attempts.push(ProviderAttempt::new(provider.id(), AttemptOutcome::Skipped));
                continue;
            }

            let key = self.cache_key(provider.id(), ticker, method);
            if let Some(hit) = self.cache.get(&key) {
                attempts.push(
                    ProviderAttempt::new(provider.id(), AttemptOutcome::Success)
                        .with_detail("cache hit"),
                );
                self.finish_trace(ticker, attempts);
                return Ok(hit);
            }

            // Single-flight: hold the per-key lock across the fetch so
            // concurrent misses await this call instead of duplicating it.
            // The lock scope is the block; the flight entry is pruned
            // once the last holder lets go.
            let lock = self.cache.flight_lock(&key);
            let outcome = {
                let _guard = lock.lock().await;
                if let Some(hit) = self.cache.get(&key) {
                    FetchOutcome::Coalesced(hit)
                } else {
                    match remaining_budget(self.config.request_timeout, deadline) {
                        None => FetchOutcome::DeadlineExceeded,
                        Some(budget) => {
                            let call = self.call(provider, ticker, method);
                            match tokio::time::timeout(budget, call).await {
                                Err(_) => FetchOutcome::TimedOut(budget),
                                Ok(result) => {
                                    if let Ok(payload) = &result {
                                        self.cache.insert(key.clone(), payload.clone());
                                    }
                                    FetchOutcome::Fetched(result)
                                }
                            }
                        }
                    }
                }
            };
            drop(lock);
            self.cache.finish_flight(&key);

            match outcome {
                FetchOutcome::Coalesced(hit) => {
                    attempts.push(
                        ProviderAttempt::new(provider.id(), AttemptOutcome::Success)
                            .with_detail("coalesced"),
                    );
                    self.finish_trace(ticker, attempts);
                    return Ok(hit);
                }
                FetchOutcome::DeadlineExceeded => {
                    self.finish_trace(ticker, attempts);
                    return Err(ValuationError::DeadlineExceeded);
                }
                FetchOutcome::TimedOut(budget) => {
                    if deadline_passed(deadline) {
                        self.finish_trace(ticker, attempts);
                        return Err(ValuationError::DeadlineExceeded);
                    }
                    tracing::warn!(
                        "Provider '{}' timed out on {} for {} after {:?}. Trying next.",
                        provider.id(),
                        method.name(),
                        ticker,
                        budget
                    );
                    attempts.push(ProviderAttempt::new(provider.id(), AttemptOutcome::TimedOut));
                }
                FetchOutcome::Fetched(Ok(payload)) => {
                    attempts.push(ProviderAttempt::new(provider.id(), AttemptOutcome::Success));
                    self.finish_trace(ticker, attempts);
                    return Ok(payload);
                }
                FetchOutcome::Fetched(Err(e)) if is_soft_failure(&e) => {
                    tracing::warn!(
                        "Provider '{}' failed {} for {}: {}. Trying next.",
                        provider.id(),
                        method.name(),
                        ticker,
                        e
                    );
                    attempts.push(
                        ProviderAttempt::new(provider.id(), e.attempt_outcome())
                            .with_detail(e.to_string()),
                    );
                }
                FetchOutcome::Fetched(Err(ValuationError::SymbolNotFound(_))) => {
                    // Hard failure for this provider, but coverage
                    // differs; the rest of the chain may know it.
                    attempts.push(ProviderAttempt::new(provider.id(), AttemptOutcome::NotFound));
                }
                FetchOutcome::Fetched(Err(e)) => {
                    // Data-quality errors mean the request itself cannot
                    // be satisfied; surface them unambiguously.
                    attempts.push(
                        ProviderAttempt::new(provider.id(), AttemptOutcome::Unavailable)
                            .with_detail(e.to_string()),
                    );
                    self.finish_trace(ticker, attempts);
                    return Err(e);
                }
            }
        }

        let attempted: Vec<ProviderAttempt> = attempts
            .iter()
            .filter(|a| a.outcome != AttemptOutcome::Skipped)
            .cloned()
            .collect();
        self.finish_trace(ticker, attempts);

        // Every provider that recognized the symbol format said "no such
        // symbol": that is a terminal not-found, not an outage.
        if !attempted.is_empty()
            && attempted.iter().all(|a| a.outcome == AttemptOutcome::NotFound)
        {
            return Err(ValuationError::SymbolNotFound(ticker.to_string()));
        }

        Err(ValuationError::AllProvidersExhausted {
            symbol: ticker.to_string(),
            attempts: attempted,
        })
    }
}

/// What came out of one provider attempt while the flight lock was held.
enum FetchOutcome {
    /// Another task fetched this key while we waited on the lock.
    Coalesced(Payload),
    DeadlineExceeded,
    TimedOut(Duration),
    Fetched(Result<Payload, ValuationError>),
}

/// Failures the chain recovers from by moving to the next provider.
/// A payload that cannot be parsed or normalized (`InvalidData` from a
/// live call) counts as a provider malfunction, not a verdict on the
/// request; `InsufficientHistory` and friends are verdicts and surface.
fn is_soft_failure(e: &ValuationError) -> bool {
    e.is_transient() || matches!(e, ValuationError::InvalidData(_))
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

/// Per-call timeout, capped to whatever remains of the caller's budget.
fn remaining_budget(request_timeout: Duration, deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(request_timeout),
        Some(d) => {
            let remaining = d.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                None
            } else {
                Some(request_timeout.min(remaining))
            }
        }
    }
}
