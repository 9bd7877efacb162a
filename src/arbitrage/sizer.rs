//! Dynamic trade sizer (spec §4.6): probe-size generation, per-probe
//! quoting, scoring, and the historical performance store that learns
//! across iterations.
//!
//! The bounded, time-pruned per-pair store is grounded in `cooldown.rs`'s
//! keyed-state pattern and in `paper_trading/metrics.rs`'s
//! `MAX_RECENT_TRADES` FIFO eviction.

use crate::arbitrage::quote_client::QuoteClient;
use crate::types::{Asset, Candidate, PerformanceEntry, SizeProbeResult, SizeStrategy};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

pub struct SizerConfig {
    pub min_trade_size: f64,
    pub max_trade_size: f64,
    pub size_strategy: SizeStrategy,
    pub size_tests: usize,
    pub preferred_percentages: Vec<u32>,
    pub min_profit_pct: f64,
    pub min_profit_usd: f64,
    pub max_price_impact_pct: f64,
    pub max_slippage_bps: u32,
    pub probe_delay_ms: u64,
}

type PairKey = (String, String);

pub struct DynamicSizer {
    quote_client: Arc<QuoteClient>,
    cfg: SizerConfig,
    store: Mutex<HashMap<PairKey, PerformanceEntry>>,
}

impl DynamicSizer {
    pub fn new(quote_client: Arc<QuoteClient>, cfg: SizerConfig) -> Self {
        Self {
            quote_client,
            cfg,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Generates candidate sizes per §4.6, rounded to 4 decimals,
    /// deduplicated, sorted ascending, truncated to `size_tests`.
    pub fn generate_probe_sizes(&self) -> Vec<f64> {
        let min = self.cfg.min_trade_size;
        let max = self.cfg.max_trade_size;
        let n = self.cfg.size_tests;

        let mut sizes: Vec<f64> = match self.cfg.size_strategy {
            SizeStrategy::Stepped => {
                if n <= 1 {
                    vec![min]
                } else {
                    (0..n)
                        .map(|i| min + (max - min) * i as f64 / (n - 1) as f64)
                        .collect()
                }
            }
            SizeStrategy::Optimal => {
                let mut sizes = vec![min];
                let take = n.saturating_sub(2);
                for p in self.cfg.preferred_percentages.iter().take(take) {
                    sizes.push(min + (max - min) * (*p as f64) / 100.0);
                }
                sizes.push(max);
                sizes
            }
        };

        sizes = sizes.into_iter().map(|s| (s * 10_000.0).round() / 10_000.0).collect();
        sizes.sort_by(|a, b| a.partial_cmp(b).unwrap());
        sizes.dedup();
        sizes.truncate(n);
        sizes
    }

    /// Runs the per-probe procedure (§4.6 steps 1-5) over every
    /// generated size and returns the scored winner, if any.
    pub async fn find_optimal(&self, anchor: &Asset, intermediate: &Asset, anchor_usd: f64) -> Option<Candidate> {
        let sizes = self.generate_probe_sizes();
        let mut probes = Vec::with_capacity(sizes.len());

        for (i, size) in sizes.iter().enumerate() {
            let probe = self.probe_size(anchor, intermediate, *size, anchor_usd).await;
            probes.push(probe);

            if i + 1 < sizes.len() {
                sleep(Duration::from_millis(self.cfg.probe_delay_ms)).await;
            }
        }

        let winner = probes
            .iter()
            .filter(|p| p.success)
            .max_by(|a, b| score(self, a).partial_cmp(&score(self, b)).unwrap()
                .then(a.profit_usd.partial_cmp(&b.profit_usd).unwrap())
                .then(a.size_native.partial_cmp(&b.size_native).unwrap()))
            .cloned();

        let key = (anchor.address.clone(), intermediate.address.clone());
        let mut store = self.store.lock().await;
        let entry = store.entry(key).or_default();
        for probe in probes {
            entry.record_sample(probe);
        }

        winner.map(|probe| {
            let s = score(self, &probe);
            Candidate { probe, score: s }
        })
    }

    async fn probe_size(&self, anchor: &Asset, intermediate: &Asset, size: f64, anchor_usd: f64) -> SizeProbeResult {
        let size_raw = anchor.to_raw(size);

        let leg1 = match self
            .quote_client
            .quote(anchor, intermediate, &size_raw, self.cfg.max_slippage_bps)
            .await
        {
            Ok(q) => q,
            Err(e) => return SizeProbeResult::failed(size_raw, size, e.to_string()),
        };

        sleep(Duration::from_millis(200)).await;

        let leg2 = match self
            .quote_client
            .quote(intermediate, anchor, &leg1.out_amount, self.cfg.max_slippage_bps)
            .await
        {
            Ok(q) => q,
            Err(e) => return SizeProbeResult::failed(size_raw, size, e.to_string()),
        };

        let out_native = anchor.to_native(&leg2.out_amount);
        let profit_native = out_native - size;
        let profit_pct = if size > 0.0 { profit_native / size * 100.0 } else { 0.0 };
        let profit_usd = profit_native * anchor_usd;
        let total_value_usd = size * anchor_usd;
        let total_impact =
            (leg1.price_impact_fraction + leg2.price_impact_fraction) * 100.0;

        let meets_pct = profit_pct >= self.cfg.min_profit_pct;
        let meets_usd = profit_usd >= self.cfg.min_profit_usd;
        let meets_impact = total_impact <= self.cfg.max_price_impact_pct;

        SizeProbeResult {
            size_raw,
            size_native: size,
            leg1: Some(leg1),
            leg2: Some(leg2),
            profit_raw: (profit_native * 10f64.powi(anchor.decimals as i32)) as i128,
            profit_pct,
            profit_usd,
            total_value_usd,
            total_impact,
            meets_pct,
            meets_usd,
            meets_impact,
            success: meets_pct && meets_usd && meets_impact,
            reason: None,
            actual: false,
            recorded_at: Utc::now(),
        }
    }

    /// Invoked by the search loop after execution: feeds the learning
    /// store without replacing `best_size` directly.
    pub async fn update_actual(&self, anchor: &Asset, intermediate: &Asset, size: f64, realized_profit_pct: f64, success: bool) {
        let key = (anchor.address.clone(), intermediate.address.clone());
        let mut store = self.store.lock().await;
        let entry = store.entry(key).or_default();
        entry.total_trades += 1;
        if success {
            entry.successful_trades += 1;
        }
        let mut sample = SizeProbeResult::failed(anchor.to_raw(size), size, "actual execution");
        sample.actual = true;
        sample.success = success;
        sample.profit_pct = realized_profit_pct;
        entry.recent_samples.push_back(sample);
        while entry.recent_samples.len() > crate::types::MAX_RECENT_SAMPLES {
            entry.recent_samples.pop_front();
        }
    }

    /// Prunes entries whose entire sample window is older than 24h.
    pub async fn cleanup_old(&self) {
        let now = Utc::now();
        let max_age = chrono::Duration::hours(24);
        let mut store = self.store.lock().await;
        store.retain(|_, entry| !entry.is_stale(now, max_age));
    }
}

fn score(sizer: &DynamicSizer, probe: &SizeProbeResult) -> f64 {
    let cfg = &sizer.cfg;
    let anchor_usd = if probe.size_native > 0.0 {
        probe.total_value_usd / probe.size_native
    } else {
        0.0
    };

    let usd_term = 0.4 * (probe.profit_usd / cfg.min_profit_usd);
    let pct_term = 0.3 * (probe.profit_pct / cfg.min_profit_pct);
    let value_term = if anchor_usd > 0.0 {
        0.2 * (probe.total_value_usd / (cfg.max_trade_size * anchor_usd))
    } else {
        0.0
    };
    let impact_term = 0.1 * (1.0 - probe.total_impact / cfg.max_price_impact_pct).max(0.0);

    usd_term + pct_term + value_term + impact_term
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cfg() -> SizerConfig {
        SizerConfig {
            min_trade_size: 0.005,
            max_trade_size: 0.1,
            size_strategy: SizeStrategy::Optimal,
            size_tests: 5,
            preferred_percentages: vec![10, 25, 50, 75, 90],
            min_profit_pct: 0.3,
            min_profit_usd: 0.50,
            max_price_impact_pct: 2.0,
            max_slippage_bps: 100,
            probe_delay_ms: 0,
        }
    }

    fn dummy_sizer(cfg: SizerConfig) -> DynamicSizer {
        let transport = crate::arbitrage::quote_client::ReqwestTransport::new("http://localhost");
        let client = Arc::new(QuoteClient::new(Box::new(transport), 0, 1000, 5, 60_000));
        DynamicSizer::new(client, cfg)
    }

    #[test]
    fn optimal_strategy_generates_min_max_and_percentages() {
        let sizer = dummy_sizer(base_cfg());
        let sizes = sizer.generate_probe_sizes();
        assert_eq!(sizes.len(), 5);
        assert_eq!(*sizes.first().unwrap(), 0.005);
        assert_eq!(*sizes.last().unwrap(), 0.1);
        for s in &sizes {
            assert!(*s >= 0.005 && *s <= 0.1);
        }
    }

    #[test]
    fn stepped_strategy_generates_evenly_spaced_sizes() {
        let mut cfg = base_cfg();
        cfg.size_strategy = SizeStrategy::Stepped;
        let sizer = dummy_sizer(cfg);
        let sizes = sizer.generate_probe_sizes();
        assert_eq!(sizes.len(), 5);
        assert_eq!(*sizes.first().unwrap(), 0.005);
        assert_eq!(*sizes.last().unwrap(), 0.1);
    }

    #[test]
    fn probe_sizes_are_sorted_ascending_and_distinct() {
        let sizer = dummy_sizer(base_cfg());
        let sizes = sizer.generate_probe_sizes();
        for pair in sizes.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
