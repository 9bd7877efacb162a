//! Process entry point: wires the core's components together, installs
//! a `Ctrl+C` handler, and runs the search loop until shutdown.
//!
//! Everything here is ambient-process plumbing — config path resolution,
//! signer loading from the environment, signal handling — the core
//! library itself consumes only the `Signer`/`Config`/`Logger`/`Clock`/
//! `TokenDirectory` interfaces.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use triarb_core::arbitrage::mev_transport::{
    HttpBundleEndpoint, MevTransport, MevTransportConfig, UnimplementedPrivatePool,
};
use triarb_core::arbitrage::quote_client::{QuoteClient, ReqwestTransport};
use triarb_core::arbitrage::search_loop::{JupiterExchange, SearchLoop, SearchLoopConfig};
use triarb_core::arbitrage::sizer::{DynamicSizer, SizerConfig};
use triarb_core::config::Cli;
use triarb_core::logger::Logger;
use triarb_core::price_oracle::PriceSource;
use triarb_core::{Config, KeypairSigner, NoopPreflightGate, PreflightGate, PriceOracle, Signer};
use triarb_core::token_directory::{parse_owner, ConfigTokenDirectory, TokenDirectory};
use triarb_core::types::Asset;

/// A single HTTP JSON price source, configured by env var, matching
/// the anchor-price-source interface (§4.3): a URL plus the JSON
/// pointer to the numeric field.
struct JsonFieldPriceSource {
    name: String,
    client: reqwest::Client,
    url: String,
    json_pointer: String,
}

#[async_trait::async_trait]
impl PriceSource for JsonFieldPriceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_price(&self) -> Option<f64> {
        let resp = self.client.get(&self.url).send().await.ok()?;
        let body: serde_json::Value = resp.json().await.ok()?;
        body.pointer(&self.json_pointer)?.as_f64().filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    Logger::install_global_subscriber();
    let logger = Logger::new();

    NoopPreflightGate.check().context("pre-flight check failed")?;

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config).context("failed to load configuration")?;

    let signer_key = std::env::var("SIGNER_PRIVATE_KEY")
        .context("SIGNER_PRIVATE_KEY must be set (base58-encoded keypair)")?;
    let signer: Arc<dyn Signer> =
        Arc::new(KeypairSigner::from_base58(&signer_key).context("invalid signer key")?);

    let rpc_url = std::env::var("SOLANA_RPC_URL").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".into());
    let aggregator_url =
        std::env::var("AGGREGATOR_BASE_URL").unwrap_or_else(|_| "https://quote-api.jup.ag/v6".into());

    let anchor = Asset::new("native", "SOL", 9);
    let intermediates_raw = std::env::var("INTERMEDIATE_MINTS")
        .context("INTERMEDIATE_MINTS must be a comma-separated list of mint:symbol:decimals")?;
    let intermediates: Vec<Asset> = intermediates_raw
        .split(',')
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let address = parts.next().unwrap_or_default().to_string();
            let symbol = parts.next().unwrap_or("UNKNOWN").to_string();
            let decimals: u8 = parts.next().and_then(|d| d.parse().ok()).unwrap_or(6);
            Asset::new(address, symbol, decimals)
        })
        .collect();

    let owner = parse_owner(&bs58::encode(signer.public_key()).into_string())
        .context("signer public key is not a valid owner address")?;
    let token_directory: Arc<dyn TokenDirectory> =
        Arc::new(ConfigTokenDirectory::new(anchor.clone(), intermediates.clone(), rpc_url.clone(), owner)?);

    let anchor_balance = token_directory
        .balance(&anchor)
        .await
        .context("failed to read anchor balance at startup")?;
    config.clamp_to_balance(anchor_balance);
    logger.balance(
        triarb_core::logger::Level::Info,
        &format!("anchor balance at startup: {anchor_balance}, trading_enabled={}", config.trading_enabled),
    );

    let quote_transport = ReqwestTransport::new(aggregator_url.clone());
    let quote_client = Arc::new(QuoteClient::new(
        Box::new(quote_transport),
        config.quote.min_interval_ms,
        config.quote.max_per_minute,
        config.quote.circuit_threshold,
        config.quote.circuit_timeout_ms,
    ));

    let sizer_cfg = SizerConfig {
        min_trade_size: config.min_trade_size,
        max_trade_size: config.max_trade_size,
        size_strategy: config.size_strategy,
        size_tests: config.size_tests,
        preferred_percentages: config.preferred_percentages.clone(),
        min_profit_pct: config.min_profit_pct,
        min_profit_usd: config.min_profit_usd,
        max_price_impact_pct: config.max_price_impact_pct,
        max_slippage_bps: config.max_slippage_bps,
        probe_delay_ms: config.probe_delay_ms,
    };
    let sizer = Arc::new(DynamicSizer::new(Arc::clone(&quote_client), sizer_cfg));

    let price_sources: Vec<Arc<dyn PriceSource>> = std::env::var("PRICE_SOURCE_URLS")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, url)| {
            Arc::new(JsonFieldPriceSource {
                name: format!("source-{i}"),
                client: reqwest::Client::new(),
                url: url.to_string(),
                json_pointer: "/price".to_string(),
            }) as Arc<dyn PriceSource>
        })
        .collect();
    let price_sources = if price_sources.len() >= 2 {
        price_sources
    } else {
        anyhow::bail!("PRICE_SOURCE_URLS must list at least two sources");
    };
    let price_oracle = Arc::new(PriceOracle::new(price_sources, config.price.refresh_interval_ms, logger.clone()));
    price_oracle.force_refresh().await;

    let bundle_endpoints: Vec<Arc<dyn triarb_core::arbitrage::mev_transport::BundleEndpoint>> =
        std::env::var("BUNDLE_ENDPOINT_URLS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|url| Arc::new(HttpBundleEndpoint::new(url.to_string())) as Arc<_>)
            .collect();

    let mev_cfg = MevTransportConfig {
        randomize_gas: config.mev.randomize_gas,
        use_bundles: config.mev.use_bundles && !bundle_endpoints.is_empty(),
        max_submit_jitter_ms: config.mev.max_submit_jitter_ms,
        bundle_timeout_ms: config.mev.bundle_timeout_ms,
        base_priority: 1000,
        priority_floor: 100,
    };
    let standard_rpc = Arc::new(triarb_core::arbitrage::mev_transport::SolanaStandardRpc::new(rpc_url.clone()));
    let transport = Arc::new(MevTransport::new(
        Arc::clone(&signer),
        bundle_endpoints,
        Arc::new(UnimplementedPrivatePool),
        standard_rpc,
        MevTransportConfig {
            randomize_gas: mev_cfg.randomize_gas,
            use_bundles: mev_cfg.use_bundles,
            max_submit_jitter_ms: mev_cfg.max_submit_jitter_ms,
            bundle_timeout_ms: mev_cfg.bundle_timeout_ms,
            base_priority: mev_cfg.base_priority,
            priority_floor: mev_cfg.priority_floor,
        },
    ));

    let exchange = Arc::new(JupiterExchange::new(
        aggregator_url,
        bs58::encode(signer.public_key()).into_string(),
    ));

    let loop_cfg = SearchLoopConfig {
        trading_enabled: config.trading_enabled,
        min_profit_usd: config.min_profit_usd,
        iteration_interval_ms: config.iteration_interval_ms,
        rotation_interval_ms: config.rotation_interval_ms,
        price_refresh_interval_ms: config.price.refresh_interval_ms,
        max_trade_size: config.max_trade_size,
        settle_pause_ms: 3000,
        shutdown_grace_ms: 15_000,
    };

    let search_loop = Arc::new(SearchLoop::new(
        anchor,
        intermediates,
        price_oracle,
        sizer,
        transport,
        exchange,
        mev_cfg,
        config.mev.enabled,
        loop_cfg,
        logger.clone(),
    ));

    let run_handle = {
        let search_loop = Arc::clone(&search_loop);
        tokio::spawn(async move { search_loop.run().await })
    };

    tokio::signal::ctrl_c().await.context("failed to install ctrl_c handler")?;
    logger.event(triarb_core::logger::Level::Info, "shutdown signal received, stopping search loop");
    search_loop.cancel();
    let _ = run_handle.await;

    Ok(())
}
