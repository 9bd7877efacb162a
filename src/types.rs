//! Core data model for the triangular arbitrage engine.

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// An on-chain token: identity, symbol, and decimal precision.
///
/// Equality is by `address` alone — two `Asset` values with the same
/// address but stale `symbol`/`decimals` are still the same asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
}

impl PartialEq for Asset {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}
impl Eq for Asset {}

impl Asset {
    pub fn new(address: impl Into<String>, symbol: impl Into<String>, decimals: u8) -> Self {
        Self {
            address: address.into(),
            symbol: symbol.into(),
            decimals,
        }
    }

    /// Converts a decimal amount (e.g. `0.05` SOL) to its raw integer
    /// representation (`* 10^decimals`), truncating any sub-unit remainder.
    pub fn to_raw(&self, native: f64) -> BigUint {
        let scaled = native * 10f64.powi(self.decimals as i32);
        BigUint::from(scaled.max(0.0).round() as u128)
    }

    /// Converts a raw integer amount back to a lossy decimal, for
    /// logging and USD computations only — never for further integer math.
    pub fn to_native(&self, raw: &BigUint) -> f64 {
        raw_to_f64(raw) / 10f64.powi(self.decimals as i32)
    }
}

/// Converts a `BigUint` to `f64` for display purposes. Precision loss
/// beyond ~2^53 is acceptable here; this is never used for amount math.
pub fn raw_to_f64(raw: &BigUint) -> f64 {
    raw.to_string().parse::<f64>().unwrap_or(0.0)
}

/// The result of asking the aggregator for a single-leg swap `in -> out`.
#[derive(Debug, Clone)]
pub struct Quote {
    pub in_amount: BigUint,
    pub out_amount: BigUint,
    pub price_impact_fraction: f64,
    /// Opaque bytes sufficient to construct the subsequent exchange call.
    pub route_descriptor: Vec<u8>,
}

impl Quote {
    pub fn is_valid(&self) -> bool {
        self.out_amount > BigUint::from(0u32)
    }
}

/// Probe-size generation strategy for the dynamic sizer (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeStrategy {
    Stepped,
    Optimal,
}

/// The outcome of probing a single candidate size over the round-trip `A -> B -> A`.
#[derive(Debug, Clone)]
pub struct SizeProbeResult {
    pub size_raw: BigUint,
    pub size_native: f64,
    pub leg1: Option<Quote>,
    pub leg2: Option<Quote>,
    pub profit_raw: i128,
    pub profit_pct: f64,
    pub profit_usd: f64,
    pub total_value_usd: f64,
    pub total_impact: f64,
    pub meets_pct: bool,
    pub meets_usd: bool,
    pub meets_impact: bool,
    pub success: bool,
    /// Failure reason when a leg quote failed outright.
    pub reason: Option<String>,
    /// True when this sample came from a real execution rather than a probe.
    pub actual: bool,
    pub recorded_at: DateTime<Utc>,
}

impl SizeProbeResult {
    pub fn failed(size_raw: BigUint, size_native: f64, reason: impl Into<String>) -> Self {
        Self {
            size_raw,
            size_native,
            leg1: None,
            leg2: None,
            profit_raw: 0,
            profit_pct: 0.0,
            profit_usd: 0.0,
            total_value_usd: 0.0,
            total_impact: 0.0,
            meets_pct: false,
            meets_usd: false,
            meets_impact: false,
            success: false,
            reason: Some(reason.into()),
            actual: false,
            recorded_at: Utc::now(),
        }
    }
}

/// A selected, scored probe — the candidate the search loop may execute.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub probe: SizeProbeResult,
    pub score: f64,
}

/// Outcome of one search-loop iteration.
#[derive(Debug, Clone)]
pub enum IterationOutcome {
    NoProfitable,
    Executed {
        profit_pct: f64,
        profit_usd: f64,
        txid: String,
        legs: Vec<String>,
    },
    Failed {
        kind: ArbError,
        message: String,
    },
    Skipped {
        reason: SkipReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BusyExecuting,
    BelowUsdFloor,
    CircuitOpen,
}

/// A single iteration of the search loop, recorded for bookkeeping.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub index: u64,
    pub started_at: DateTime<Utc>,
    pub route: (String, String, String),
    pub picked_size: Option<f64>,
    pub outcome: IterationOutcome,
}

/// Historical performance for a single `(A, B)` pair, used by the sizer
/// to hint future sizing decisions.
#[derive(Debug, Clone, Default)]
pub struct PerformanceEntry {
    pub best_size: Option<f64>,
    pub best_profit_pct: Option<f64>,
    pub recent_samples: VecDeque<SizeProbeResult>,
    pub total_trades: u64,
    pub successful_trades: u64,
}

pub const MAX_RECENT_SAMPLES: usize = 100;

impl PerformanceEntry {
    /// Appends a sample, evicting the oldest once the cap is exceeded,
    /// and updates `best_size`/`best_profit_pct` if strictly improved.
    pub fn record_sample(&mut self, sample: SizeProbeResult) {
        if sample.success && sample.profit_pct > self.best_profit_pct.unwrap_or(f64::MIN) {
            self.best_size = Some(sample.size_native);
            self.best_profit_pct = Some(sample.profit_pct);
        }
        self.recent_samples.push_back(sample);
        while self.recent_samples.len() > MAX_RECENT_SAMPLES {
            self.recent_samples.pop_front();
        }
    }

    /// True once every sample is older than `max_age`, signaling the
    /// entry is eligible for cleanup.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        self.recent_samples
            .iter()
            .all(|s| now - s.recorded_at > max_age)
    }
}

/// A single anchor-price observation from the price oracle.
#[derive(Debug, Clone)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price_usd: f64,
    pub contributing_sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

/// Transport submission method actually used for an execution leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMethod {
    Bundle,
    PrivatePool,
    StandardRpc,
}

/// Result of a single leg's execution via the MEV transport.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub txid: Option<String>,
    pub error_kind: Option<ArbError>,
    pub method: SubmissionMethod,
    pub realized_out_amount: Option<BigUint>,
}

/// The error taxonomy named in the error-handling design (§7).
#[derive(Debug, Clone, Error)]
pub enum ArbError {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("rate limited")]
    RateLimited,
    #[error("circuit open")]
    CircuitOpen,
    #[error("invalid quote: {0}")]
    QuoteInvalid(String),
    #[error("client error: {0}")]
    ClientError(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_equality_ignores_symbol() {
        let a = Asset::new("mint1", "SOL", 9);
        let b = Asset::new("mint1", "wSOL", 9);
        assert_eq!(a, b);
    }

    #[test]
    fn to_raw_and_back_roundtrip_is_lossy_but_close() {
        let sol = Asset::new("mint1", "SOL", 9);
        let raw = sol.to_raw(1.5);
        assert_eq!(raw, BigUint::from(1_500_000_000u64));
        let native = sol.to_native(&raw);
        assert!((native - 1.5).abs() < 1e-9);
    }

    #[test]
    fn quote_validity_requires_positive_out_amount() {
        let q = Quote {
            in_amount: BigUint::from(100u32),
            out_amount: BigUint::from(0u32),
            price_impact_fraction: 0.0,
            route_descriptor: vec![],
        };
        assert!(!q.is_valid());
    }

    #[test]
    fn performance_entry_caps_recent_samples_fifo() {
        let mut entry = PerformanceEntry::default();
        for i in 0..(MAX_RECENT_SAMPLES + 10) {
            let mut sample =
                SizeProbeResult::failed(BigUint::from(i as u64), i as f64, "probe");
            sample.success = true;
            sample.profit_pct = 0.1;
            entry.record_sample(sample);
        }
        assert_eq!(entry.recent_samples.len(), MAX_RECENT_SAMPLES);
        assert_eq!(entry.recent_samples.front().unwrap().size_native, 10.0);
    }

    #[test]
    fn performance_entry_updates_best_on_strict_improvement() {
        let mut entry = PerformanceEntry::default();
        let mut a = SizeProbeResult::failed(BigUint::from(1u32), 0.01, "p");
        a.success = true;
        a.profit_pct = 0.5;
        entry.record_sample(a);
        assert_eq!(entry.best_profit_pct, Some(0.5));

        let mut b = SizeProbeResult::failed(BigUint::from(2u32), 0.02, "p");
        b.success = true;
        b.profit_pct = 0.3;
        entry.record_sample(b);
        assert_eq!(entry.best_profit_pct, Some(0.5));
    }
}
