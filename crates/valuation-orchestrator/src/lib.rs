//! Request orchestration: wires the provider chain, the response cache
//! and the valuation models into one entry point.

pub mod cache;
pub mod resolver;

pub use cache::ResponseCache;
pub use resolver::{ProviderResolver, ResolverConfig};

use std::sync::Arc;
use std::time::Instant;

use valuation_core::{
    DataProvider, ModelKind, NormalizedFundamentals, NormalizedQuote, ProviderAttempt, Ticker,
    ValuationError, ValuationResult,
};
use valuation_engine::{
    blend_fair_value, compute_dcf, compute_ddm, DcfConfig, DdmConfig, FairValueSummary,
};

/// Parameters for one valuation request. Results are computed fresh per
/// request; only raw provider responses are cached.
#[derive(Debug, Clone)]
pub struct ValuationRequest {
    pub dcf: DcfConfig,
    pub ddm: DdmConfig,
    /// Fraction in `[0, 1)` shaved off fair value for the target price.
    pub margin_of_safety: f64,
    /// Overall wall-clock budget for the request, spanning every
    /// provider attempt it triggers.
    pub deadline: Option<Instant>,
}

impl Default for ValuationRequest {
    fn default() -> Self {
        Self {
            dcf: DcfConfig::default(),
            ddm: DdmConfig::default(),
            margin_of_safety: 0.25,
            deadline: None,
        }
    }
}

pub struct ValuationService {
    resolver: ProviderResolver,
}

impl ValuationService {
    pub fn new(providers: Vec<Arc<dyn DataProvider>>, config: ResolverConfig) -> Self {
        Self {
            resolver: ProviderResolver::new(providers, config),
        }
    }

    /// Build the service from environment configuration. Providers whose
    /// API key is absent are left out of the registry; the chains simply
    /// never reach them.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let mut providers: Vec<Arc<dyn DataProvider>> = Vec::new();

        match std::env::var("FMP_API_KEY") {
            Ok(key) if !key.is_empty() => {
                providers.push(Arc::new(fmp_client::FmpProvider::new(key)));
            }
            _ => tracing::warn!("FMP_API_KEY not set, FMP provider disabled"),
        }
        match std::env::var("ALPHA_VANTAGE_API_KEY") {
            Ok(key) if !key.is_empty() => {
                providers.push(Arc::new(alpha_vantage_client::AlphaVantageProvider::new(
                    key,
                )));
            }
            _ => tracing::warn!("ALPHA_VANTAGE_API_KEY not set, Alpha Vantage provider disabled"),
        }
        // Yahoo needs no key and backstops every chain.
        providers.push(Arc::new(yahoo_client::YahooProvider::new()));

        Self::new(providers, ResolverConfig::from_env())
    }

    pub async fn quote(
        &self,
        ticker: &Ticker,
        deadline: Option<Instant>,
    ) -> Result<NormalizedQuote, ValuationError> {
        self.resolver.quote(ticker, deadline).await
    }

    pub async fn fundamentals(
        &self,
        ticker: &Ticker,
        deadline: Option<Instant>,
    ) -> Result<NormalizedFundamentals, ValuationError> {
        self.resolver.fundamentals(ticker, deadline).await
    }

    /// Run one model against freshly resolved data.
    pub async fn valuate(
        &self,
        ticker: &Ticker,
        model: ModelKind,
        request: &ValuationRequest,
    ) -> Result<ValuationResult, ValuationError> {
        let quote = self.resolver.quote(ticker, request.deadline).await?;
        let fundamentals = self.resolver.fundamentals(ticker, request.deadline).await?;

        // All figures feeding one valuation must share a currency; this
        // engine deliberately does not convert.
        if quote.currency != fundamentals.currency {
            return Err(ValuationError::CurrencyMismatch {
                expected: fundamentals.currency,
                found: quote.currency,
            });
        }

        let mut result = match model {
            ModelKind::Dcf => compute_dcf(&fundamentals, &request.dcf)?,
            ModelKind::Ddm => compute_ddm(&fundamentals, &request.ddm)?,
        };
        result.provenance.quote = Some(quote.source);
        tracing::info!(
            "{} valuation for {}: {:.2} {}",
            model,
            ticker,
            result.intrinsic_value,
            result.currency
        );
        Ok(result)
    }

    /// Run both models and blend them into one fair value. A model that
    /// is inapplicable (say, no dividends for DDM) is dropped from the
    /// blend; if neither applies the first failure surfaces.
    pub async fn fair_value(
        &self,
        ticker: &Ticker,
        request: &ValuationRequest,
    ) -> Result<FairValueSummary, ValuationError> {
        let quote = self.resolver.quote(ticker, request.deadline).await?;
        let fundamentals = self.resolver.fundamentals(ticker, request.deadline).await?;

        if quote.currency != fundamentals.currency {
            return Err(ValuationError::CurrencyMismatch {
                expected: fundamentals.currency,
                found: quote.currency,
            });
        }

        let dcf = compute_dcf(&fundamentals, &request.dcf);
        let ddm = compute_ddm(&fundamentals, &request.ddm);
        let (dcf, ddm) = match (dcf, ddm) {
            (Err(dcf_err), Err(ddm_err)) => {
                tracing::warn!(
                    "No model applicable for {}: DCF failed ({}), DDM failed ({})",
                    ticker,
                    dcf_err,
                    ddm_err
                );
                return Err(dcf_err);
            }
            (dcf, ddm) => (dcf.ok(), ddm.ok()),
        };

        let mut summary = blend_fair_value(
            dcf.as_ref(),
            ddm.as_ref(),
            Some(quote.price),
            request.margin_of_safety,
        )?;
        summary.provenance.quote = Some(quote.source);
        Ok(summary)
    }

    /// Fallback trace from the most recent resolution for this ticker.
    pub fn last_trace(&self, ticker: &Ticker) -> Option<Vec<ProviderAttempt>> {
        self.resolver.last_trace(ticker)
    }
}
