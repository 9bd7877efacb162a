//! Anchor-asset USD price oracle — polls N >= 2 redundant external
//! sources in parallel, accepts the arithmetic mean of the successes
//! within a plausibility band, and serves cached reads between refreshes.
//!
//! Grounded in the corpus's price-fetching fan-out: parallel per-source
//! calls via `futures::future::join_all`, each source failing gracefully
//! (`Ok(None)`) rather than propagating an error.

use crate::clock::Clock;
use crate::logger::{Category as LogCategory, Level, Logger};
use crate::types::{PriceSample, Trend};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The accepted band for the anchor's USD price — an anchor-specific
/// heuristic (a USD-stablecoin band), named so a future anchor swap is
/// a one-line change rather than a rederivation.
pub const ANCHOR_PRICE_BAND: (f64, f64) = (1.0, 10_000.0);

const MAX_SAMPLES: usize = 100;
const VOLATILITY_WINDOW: usize = 10;
const TREND_THRESHOLD_PCT: f64 = 2.0;

#[async_trait]
pub trait PriceSource: Send + Sync {
    fn name(&self) -> &str;
    /// Returns `Ok(None)` on any failure — network, parse, or
    /// missing-credential — never propagates an error for a single source.
    async fn fetch_price(&self) -> Option<f64>;
}

struct State {
    current_price: Option<f64>,
    samples: std::collections::VecDeque<PriceSample>,
    last_update: Option<chrono::DateTime<Utc>>,
}

pub struct PriceOracle {
    sources: Vec<Arc<dyn PriceSource>>,
    refresh_interval_ms: u64,
    state: RwLock<State>,
    logger: Logger,
}

impl PriceOracle {
    pub fn new(sources: Vec<Arc<dyn PriceSource>>, refresh_interval_ms: u64, logger: Logger) -> Self {
        assert!(sources.len() >= 2, "price oracle requires at least two sources");
        Self {
            sources,
            refresh_interval_ms,
            state: RwLock::new(State {
                current_price: None,
                samples: std::collections::VecDeque::new(),
                last_update: None,
            }),
            logger,
        }
    }

    /// The currently cached price, if any update has ever succeeded.
    pub async fn current(&self) -> Option<f64> {
        self.state.read().await.current_price
    }

    /// `now - last_update < 2 * refresh_interval`.
    pub async fn is_fresh(&self, clock: &dyn Clock) -> bool {
        let state = self.state.read().await;
        match state.last_update {
            Some(last) => {
                let age = clock.now_wall() - last;
                age < chrono::Duration::milliseconds(2 * self.refresh_interval_ms as i64)
            }
            None => false,
        }
    }

    /// Polls every source in parallel and updates the cached price if
    /// at least one source responded and the mean is within the
    /// plausibility band. Otherwise the previous price is retained.
    pub async fn force_refresh(&self) -> Option<f64> {
        let fetches = self.sources.iter().map(|s| {
            let source = Arc::clone(s);
            async move {
                let price = source.fetch_price().await;
                (source.name().to_string(), price)
            }
        });
        let results = futures::future::join_all(fetches).await;

        let successes: Vec<(String, f64)> = results
            .into_iter()
            .filter_map(|(name, price)| price.map(|p| (name, p)))
            .collect();

        if successes.is_empty() {
            self.logger
                .rpc(Level::Warn, "price oracle: all sources failed this refresh");
            return self.current().await;
        }

        let mean = successes.iter().map(|(_, p)| p).sum::<f64>() / successes.len() as f64;
        let rounded = (mean * 100.0).round() / 100.0;

        if rounded < ANCHOR_PRICE_BAND.0 || rounded > ANCHOR_PRICE_BAND.1 {
            self.logger.categorized_warn(
                LogCategory::Rpc,
                &format!("price oracle: mean {rounded} outside plausibility band, retaining previous price"),
            );
            return self.current().await;
        }

        let mut state = self.state.write().await;
        state.current_price = Some(rounded);
        state.last_update = Some(Utc::now());
        state.samples.push_back(PriceSample {
            timestamp: Utc::now(),
            price_usd: rounded,
            contributing_sources: successes.into_iter().map(|(n, _)| n).collect(),
        });
        while state.samples.len() > MAX_SAMPLES {
            state.samples.pop_front();
        }
        Some(rounded)
    }

    /// Coefficient of variation over the last `VOLATILITY_WINDOW` samples.
    pub async fn volatility(&self) -> Option<f64> {
        let state = self.state.read().await;
        let recent: Vec<f64> = state
            .samples
            .iter()
            .rev()
            .take(VOLATILITY_WINDOW)
            .map(|s| s.price_usd)
            .collect();
        if recent.len() < 2 {
            return None;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        if mean == 0.0 {
            return None;
        }
        let variance =
            recent.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / recent.len() as f64;
        Some(variance.sqrt() / mean)
    }

    /// Trend over the last `VOLATILITY_WINDOW` samples: the relation
    /// between the first and last value in that window, gated by
    /// `TREND_THRESHOLD_PCT`.
    pub async fn trend(&self) -> Trend {
        let state = self.state.read().await;
        let recent: Vec<f64> = state
            .samples
            .iter()
            .rev()
            .take(VOLATILITY_WINDOW)
            .map(|s| s.price_usd)
            .collect();
        if recent.len() < 2 {
            return Trend::Stable;
        }
        let last = recent[0];
        let first = recent[recent.len() - 1];
        if first == 0.0 {
            return Trend::Stable;
        }
        let change_pct = (last - first) / first * 100.0;
        if change_pct >= TREND_THRESHOLD_PCT {
            Trend::Rising
        } else if change_pct <= -TREND_THRESHOLD_PCT {
            Trend::Falling
        } else {
            Trend::Stable
        }
    }
}

impl Logger {
    /// Small convenience used only by the price oracle's warn path above.
    fn categorized_warn(&self, category: LogCategory, message: &str) {
        match category {
            LogCategory::Rpc => self.rpc(Level::Warn, message),
            LogCategory::Trade => self.trade(Level::Warn, message),
            LogCategory::Performance => self.performance(Level::Warn, message),
            LogCategory::Balance => self.balance(Level::Warn, message),
            LogCategory::Rotation => self.rotation(Level::Warn, message),
            LogCategory::Arbitrage => self.arbitrage(Level::Warn, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        name: &'static str,
        price: Option<f64>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PriceSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }
        async fn fetch_price(&self) -> Option<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.price
        }
    }

    #[tokio::test]
    async fn mean_of_successes_is_accepted() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![
            Arc::new(FixedSource { name: "a", price: Some(100.0), calls: AtomicUsize::new(0) }),
            Arc::new(FixedSource { name: "b", price: Some(102.0), calls: AtomicUsize::new(0) }),
        ];
        let oracle = PriceOracle::new(sources, 1000, Logger::new());
        let price = oracle.force_refresh().await.unwrap();
        assert!((price - 101.0).abs() < 1e-9);
    }

    struct FlippingSource {
        name: &'static str,
        flipped: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl PriceSource for FlippingSource {
        fn name(&self) -> &str {
            self.name
        }
        async fn fetch_price(&self) -> Option<f64> {
            if self.flipped.load(Ordering::SeqCst) {
                Some(50_000.0)
            } else {
                Some(100.0)
            }
        }
    }

    #[tokio::test]
    async fn out_of_band_mean_retains_previous_price() {
        let flag_a = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag_b = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let sources: Vec<Arc<dyn PriceSource>> = vec![
            Arc::new(FlippingSource { name: "a", flipped: Arc::clone(&flag_a) }),
            Arc::new(FlippingSource { name: "b", flipped: Arc::clone(&flag_b) }),
        ];
        let oracle = PriceOracle::new(sources, 1000, Logger::new());
        let first = oracle.force_refresh().await.unwrap();
        assert!((first - 100.0).abs() < 1e-9);

        flag_a.store(true, Ordering::SeqCst);
        flag_b.store(true, Ordering::SeqCst);
        let second = oracle.force_refresh().await.unwrap();
        assert!((second - 100.0).abs() < 1e-9, "out-of-band mean must not replace cached price");
    }

    #[tokio::test]
    async fn all_sources_failing_retains_previous_price() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![
            Arc::new(FixedSource { name: "a", price: None, calls: AtomicUsize::new(0) }),
            Arc::new(FixedSource { name: "b", price: None, calls: AtomicUsize::new(0) }),
        ];
        let oracle = PriceOracle::new(sources, 1000, Logger::new());
        assert_eq!(oracle.force_refresh().await, None);
        assert_eq!(oracle.current().await, None);
    }

    #[tokio::test]
    async fn volatility_and_trend_need_at_least_two_samples() {
        let sources: Vec<Arc<dyn PriceSource>> = vec![
            Arc::new(FixedSource { name: "a", price: Some(100.0), calls: AtomicUsize::new(0) }),
            Arc::new(FixedSource { name: "b", price: Some(100.0), calls: AtomicUsize::new(0) }),
        ];
        let oracle = PriceOracle::new(sources, 1000, Logger::new());
        assert_eq!(oracle.volatility().await, None);
        assert_eq!(oracle.trend().await, Trend::Stable);
    }
}
