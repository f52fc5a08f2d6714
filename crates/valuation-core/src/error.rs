use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Outcome of a single provider attempt during fallback resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    Success,
    /// `supports()` returned false; not counted as a failure.
    Skipped,
    RateLimited,
    Unavailable,
    NotFound,
    TimedOut,
}

/// One entry in a fallback trace: which provider was tried and how it went.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAttempt {
    pub provider_id: String,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
}

impl ProviderAttempt {
    pub fn new(provider_id: impl Into<String>, outcome: AttemptOutcome) -> Self {
        Self {
            provider_id: provider_id.into(),
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum ValuationError {
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Insufficient history: need {required} periods, have {available}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("No dividend history for {0}")]
    NoDividendHistory(String),

    #[error("Invalid assumptions: {0}")]
    InvalidAssumptions(String),

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("All providers exhausted for {symbol} ({} attempted)", .attempts.len())]
    AllProvidersExhausted {
        symbol: String,
        attempts: Vec<ProviderAttempt>,
    },

    #[error("Caller deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl ValuationError {
    /// Transient failures are handled by the resolver (fall back to the
    /// next provider); everything else surfaces to the caller as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ValuationError::RateLimited { .. }
                | ValuationError::ProviderUnavailable(_)
                | ValuationError::Timeout(_)
        )
    }

    pub fn attempt_outcome(&self) -> AttemptOutcome {
        match self {
            ValuationError::RateLimited { .. } => AttemptOutcome::RateLimited,
            ValuationError::Timeout(_) => AttemptOutcome::TimedOut,
            ValuationError::SymbolNotFound(_) => AttemptOutcome::NotFound,
            _ => AttemptOutcome::Unavailable,
        }
    }
}
