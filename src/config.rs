//! Engine configuration — the finite set of recognized options (spec §4.1).
//!
//! Loaded once at startup from an optional TOML file plus environment
//! overrides (via `clap`'s `env` attribute) and never mutated afterward;
//! a config change requires a restart.

use crate::types::SizeStrategy;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::Path;

#[derive(Parser, Debug)]
#[command(name = "triarb-core", about = "Triangular arbitrage engine")]
pub struct Cli {
    /// Path to a TOML config file. Missing fields fall back to defaults.
    #[arg(long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trading_enabled: bool,
    #[serde(default = "default_max_trade_size")]
    pub max_trade_size: f64,
    #[serde(default = "default_min_trade_size")]
    pub min_trade_size: f64,
    #[serde(default = "default_size_strategy")]
    pub size_strategy: SizeStrategy,
    #[serde(default = "default_size_tests")]
    pub size_tests: usize,
    #[serde(default = "default_preferred_percentages")]
    pub preferred_percentages: Vec<u32>,
    #[serde(default = "default_min_profit_pct")]
    pub min_profit_pct: f64,
    #[serde(default = "default_min_profit_usd")]
    pub min_profit_usd: f64,
    #[serde(default = "default_max_price_impact_pct")]
    pub max_price_impact_pct: f64,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
    #[serde(default = "default_probe_delay_ms")]
    pub probe_delay_ms: u64,
    #[serde(default = "default_iteration_interval_ms")]
    pub iteration_interval_ms: u64,
    #[serde(default = "default_rotation_interval_ms")]
    pub rotation_interval_ms: u64,
    #[serde(default)]
    pub mev: MevConfig,
    #[serde(default)]
    pub quote: QuoteConfig,
    #[serde(default)]
    pub price: PriceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MevConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub use_bundles: bool,
    #[serde(default)]
    pub randomize_gas: bool,
    #[serde(default = "default_max_submit_jitter_ms")]
    pub max_submit_jitter_ms: u64,
    #[serde(default = "default_bundle_timeout_ms")]
    pub bundle_timeout_ms: u64,
}

impl Default for MevConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            use_bundles: false,
            randomize_gas: false,
            max_submit_jitter_ms: default_max_submit_jitter_ms(),
            bundle_timeout_ms: default_bundle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteConfig {
    #[serde(default = "default_quote_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_quote_max_per_minute")]
    pub max_per_minute: u32,
    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,
    #[serde(default = "default_circuit_timeout_ms")]
    pub circuit_timeout_ms: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_quote_min_interval_ms(),
            max_per_minute: default_quote_max_per_minute(),
            circuit_threshold: default_circuit_threshold(),
            circuit_timeout_ms: default_circuit_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceConfig {
    #[serde(default = "default_price_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_price_refresh_interval_ms(),
        }
    }
}

fn default_max_trade_size() -> f64 {
    0.1
}
fn default_min_trade_size() -> f64 {
    0.005
}
fn default_size_strategy() -> SizeStrategy {
    SizeStrategy::Optimal
}
fn default_size_tests() -> usize {
    5
}
fn default_preferred_percentages() -> Vec<u32> {
    vec![10, 25, 50, 75, 90]
}
fn default_min_profit_pct() -> f64 {
    0.3
}
fn default_min_profit_usd() -> f64 {
    0.50
}
fn default_max_price_impact_pct() -> f64 {
    2.0
}
fn default_max_slippage_bps() -> u32 {
    100
}
fn default_probe_delay_ms() -> u64 {
    500
}
fn default_iteration_interval_ms() -> u64 {
    8000
}
fn default_rotation_interval_ms() -> u64 {
    120_000
}
fn default_max_submit_jitter_ms() -> u64 {
    2000
}
fn default_bundle_timeout_ms() -> u64 {
    30_000
}
fn default_quote_min_interval_ms() -> u64 {
    2000
}
fn default_quote_max_per_minute() -> u32 {
    30
}
fn default_circuit_threshold() -> u32 {
    5
}
fn default_circuit_timeout_ms() -> u64 {
    60_000
}
fn default_price_refresh_interval_ms() -> u64 {
    30_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trading_enabled: false,
            max_trade_size: default_max_trade_size(),
            min_trade_size: default_min_trade_size(),
            size_strategy: default_size_strategy(),
            size_tests: default_size_tests(),
            preferred_percentages: default_preferred_percentages(),
            min_profit_pct: default_min_profit_pct(),
            min_profit_usd: default_min_profit_usd(),
            max_price_impact_pct: default_max_price_impact_pct(),
            max_slippage_bps: default_max_slippage_bps(),
            probe_delay_ms: default_probe_delay_ms(),
            iteration_interval_ms: default_iteration_interval_ms(),
            rotation_interval_ms: default_rotation_interval_ms(),
            mev: MevConfig::default(),
            quote: QuoteConfig::default(),
            price: PriceConfig::default(),
        }
    }
}

impl Config {
    /// Loads from a TOML file if present, else falls back to defaults.
    /// Every field can still be overridden by an environment variable
    /// named after it (e.g. `MIN_PROFIT_USD`), matching the teacher's
    /// env-first instinct while keeping the richer TOML shape.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = if path.as_ref().exists() {
            let content = std::fs::read_to_string(path.as_ref())
                .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
            toml::from_str(&content).with_context(|| "failed to parse TOML configuration")?
        } else {
            Config::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("TRADING_ENABLED") {
            self.trading_enabled = v.parse().context("TRADING_ENABLED must be a bool")?;
        }
        if let Ok(v) = std::env::var("MAX_TRADE_SIZE") {
            self.max_trade_size = v.parse().context("MAX_TRADE_SIZE must be a number")?;
        }
        if let Ok(v) = std::env::var("MIN_TRADE_SIZE") {
            self.min_trade_size = v.parse().context("MIN_TRADE_SIZE must be a number")?;
        }
        if let Ok(v) = std::env::var("MIN_PROFIT_USD") {
            self.min_profit_usd = v.parse().context("MIN_PROFIT_USD must be a number")?;
        }
        if let Ok(v) = std::env::var("MIN_PROFIT_PCT") {
            self.min_profit_pct = v.parse().context("MIN_PROFIT_PCT must be a number")?;
        }
        if let Ok(v) = std::env::var("MEV_ENABLED") {
            self.mev.enabled = v.parse().context("MEV_ENABLED must be a bool")?;
        }
        Ok(())
    }

    /// Startup clamp per spec §6/§8: forces `trading_enabled` off when
    /// the anchor balance is zero, and clamps `max_trade_size` downward
    /// when it exceeds 90% of the available anchor balance.
    pub fn clamp_to_balance(&mut self, anchor_balance_native: f64) {
        if anchor_balance_native <= 0.0 {
            self.trading_enabled = false;
            return;
        }
        let ceiling = (0.9 * anchor_balance_native * 10_000.0).floor() / 10_000.0;
        if self.max_trade_size > ceiling {
            self.max_trade_size = ceiling;
        }
    }
}
