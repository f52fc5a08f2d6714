//! Short-TTL response memoization with single-flight coalescing.
//!
//! The cache is advisory: a stale entry is never served, and a failed
//! live call behind a miss does not fall back to whatever expired data
//! is still sitting in the map.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use valuation_core::{Cashflow, NormalizedFundamentals, NormalizedQuote};

/// Provider capability being resolved; part of the cache key so a quote
/// never shadows a fundamentals payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Quote,
    Fundamentals,
    Cashflows,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Quote => "quote",
            Method::Fundamentals => "fundamentals",
            Method::Cashflows => "cashflows",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub provider_id: String,
    pub ticker: String,
    pub method: Method,
    pub params_hash: u64,
}

impl CacheKey {
    pub fn new(provider_id: &str, ticker: &str, method: Method, params_hash: u64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            ticker: ticker.to_string(),
            method,
            params_hash,
        }
    }
}

/// Hash of the method parameters that vary per call (lookback window).
pub fn params_hash(lookback_years: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    lookback_years.hash(&mut hasher);
    hasher.finish()
}

/// Normalized payload stored per (provider, ticker, method) key.
#[derive(Debug, Clone)]
pub enum Payload {
    Quote(NormalizedQuote),
    Fundamentals(NormalizedFundamentals),
    Cashflows(Vec<Cashflow>),
}

struct CacheEntry {
    data: Payload,
    fetched_at: DateTime<Utc>,
}

pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    /// Per-key fetch locks; concurrent misses for one key coalesce into
    /// a single upstream call while unrelated keys proceed in parallel.
    /// Entries are pruned via `finish_flight` once no task holds them;
    /// `entries` itself grows with the ticker universe, which is bounded
    /// by the provider plans this serves.
    flights: DashMap<CacheKey, Arc<Mutex<()>>>,
    quote_ttl: ChronoDuration,
    fundamentals_ttl: ChronoDuration,
}

impl ResponseCache {
    pub fn new(quote_ttl: Duration, fundamentals_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            flights: DashMap::new(),
            quote_ttl: ChronoDuration::from_std(quote_ttl)
                .unwrap_or_else(|_| ChronoDuration::minutes(15)),
            fundamentals_ttl: ChronoDuration::from_std(fundamentals_ttl)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        }
    }

    /// Quotes go stale in minutes; fundamentals change at most daily.
    fn ttl(&self, method: Method) -> ChronoDuration {
        match method {
            Method::Quote => self.quote_ttl,
            Method::Fundamentals | Method::Cashflows => self.fundamentals_ttl,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Payload> {
        let entry = self.entries.get(key)?;
        if Utc::now() - entry.fetched_at < self.ttl(key.method) {
            Some(entry.data.clone())
        } else {
            // Expired entries stay in place until the next successful
            // fetch overwrites them.
            None
        }
    }

    pub fn insert(&self, key: CacheKey, data: Payload) {
        self.entries.insert(
            key,
            CacheEntry {
                data,
                fetched_at: Utc::now(),
            },
        );
    }

    /// Lock guarding the upstream fetch for one key.
    pub fn flight_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the flight entry for a key once no fetch or waiter still
    /// holds its lock. The map itself keeps one reference, so a strong
    /// count of 1 means the flight is over.
    pub fn finish_flight(&self, key: &CacheKey) {
        self.flights
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn flights_len(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote_payload(price: f64) -> Payload {
        Payload::Quote(NormalizedQuote {
            symbol: "AAPL".to_string(),
            price,
            currency: "USD".to_string(),
            timestamp: Utc::now(),
            source: "yahoo".to_string(),
        })
    }

    #[test]
    fn test_hit_within_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(900), Duration::from_secs(86400));
        let key = CacheKey::new("yahoo", "AAPL", Method::Quote, 0);

        assert!(cache.get(&key).is_none());
        cache.insert(key.clone(), quote_payload(190.5));

        match cache.get(&key) {
            Some(Payload::Quote(q)) => assert_eq!(q.price, 190.5),
            other => panic!("expected quote hit, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn test_zero_ttl_is_always_a_miss() {
        let cache = ResponseCache::new(Duration::ZERO, Duration::ZERO);
        let key = CacheKey::new("yahoo", "AAPL", Method::Quote, 0);
        cache.insert(key.clone(), quote_payload(190.5));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_method_and_params_are_part_of_the_key() {
        let cache = ResponseCache::new(Duration::from_secs(900), Duration::from_secs(86400));
        let quote_key = CacheKey::new("yahoo", "AAPL", Method::Quote, 0);
        let fund_key = CacheKey::new("yahoo", "AAPL", Method::Fundamentals, params_hash(10));
        let fund_key_other = CacheKey::new("yahoo", "AAPL", Method::Fundamentals, params_hash(5));

        cache.insert(quote_key.clone(), quote_payload(190.5));
        assert!(cache.get(&fund_key).is_none());
        assert!(cache.get(&fund_key_other).is_none());
        assert_ne!(params_hash(10), params_hash(5));
    }

    #[test]
    fn test_flight_entries_pruned_when_released() {
        let cache = ResponseCache::new(Duration::from_secs(900), Duration::from_secs(86400));
        let key = CacheKey::new("yahoo", "AAPL", Method::Quote, 0);

        let lock = cache.flight_lock(&key);
        let waiter = cache.flight_lock(&key);
        assert_eq!(cache.flights_len(), 1);

        // A waiter still holds the lock, so the entry stays.
        drop(lock);
        cache.finish_flight(&key);
        assert_eq!(cache.flights_len(), 1);

        drop(waiter);
        cache.finish_flight(&key);
        assert_eq!(cache.flights_len(), 0);
    }
}
