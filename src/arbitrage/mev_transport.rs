//! MEV-aware execution transport (spec §4.5): randomized priority,
//! jittered submission, bundle-first with private-pool and standard-RPC
//! fallback, and best-effort post-execution monitoring.
//!
//! Grounded in `executor.rs`'s dry-run/live split and in the
//! protection-level-scoring shape used by the pack's Solana MEV files
//! (`advanced_mev_engine.rs`, `mev_arbitrage.rs`), including their use
//! of `rand::thread_rng()` for gas/priority jitter.

use crate::signer::Signer;
use crate::types::{ArbError, ExecutionResult, SubmissionMethod};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtectionLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy)]
pub struct ProtectionParams {
    pub priority: u64,
    pub send_delay_ms: u64,
    pub bundle_tip_usd: f64,
    pub protection_level: ProtectionLevel,
}

pub struct MevTransportConfig {
    pub randomize_gas: bool,
    pub use_bundles: bool,
    pub max_submit_jitter_ms: u64,
    pub bundle_timeout_ms: u64,
    pub base_priority: u64,
    pub priority_floor: u64,
}

/// Derives execution-time protection parameters from `(size, expected
/// profit_pct)` as specified in §4.5 — pure function, testable without I/O.
pub fn derive_protection_params(
    cfg: &MevTransportConfig,
    size: f64,
    max_size: f64,
    expected_profit_pct: f64,
    expected_profit_usd: f64,
) -> ProtectionParams {
    let mut rng = rand::thread_rng();

    let priority = if cfg.randomize_gas {
        let factor: f64 = rng.gen_range(0.8..=1.2);
        ((cfg.base_priority as f64 * factor).round() as u64).max(cfg.priority_floor)
    } else {
        cfg.base_priority
    };

    let send_delay_ms = if cfg.max_submit_jitter_ms == 0 {
        0
    } else {
        rng.gen_range(0..=cfg.max_submit_jitter_ms)
    };

    let bundle_tip_usd = if cfg.use_bundles {
        (expected_profit_usd * 0.1).clamp(0.001, 0.01)
    } else {
        0.0
    };

    let size_term = 0.6 * (size / max_size).min(1.0);
    let profit_term = 0.4 * (expected_profit_pct / 5.0).min(1.0);
    let score = size_term + profit_term;
    let protection_level = if score >= 0.8 {
        ProtectionLevel::High
    } else if score >= 0.5 {
        ProtectionLevel::Medium
    } else {
        ProtectionLevel::Low
    };

    ProtectionParams {
        priority,
        send_delay_ms,
        bundle_tip_usd,
        protection_level,
    }
}

/// Outbound submission boundaries, abstracted for testability.
#[async_trait]
pub trait BundleEndpoint: Send + Sync {
    async fn submit_bundle(&self, serialized_tx: &[u8], tip_usd: f64) -> Result<String, ArbError>;
}

#[async_trait]
pub trait StandardRpc: Send + Sync {
    async fn send_raw_transaction(&self, serialized_tx: &[u8]) -> Result<String, ArbError>;
}

#[async_trait]
pub trait PrivatePool: Send + Sync {
    async fn submit(&self, serialized_tx: &[u8]) -> Result<String, ArbError>;
}

/// Always unimplemented — the private-mempool path is declared but never
/// implemented in the source this was distilled from; §9 allows stubbing
/// it so the submission order always falls through to standard RPC.
pub struct UnimplementedPrivatePool;

#[async_trait]
impl PrivatePool for UnimplementedPrivatePool {
    async fn submit(&self, _serialized_tx: &[u8]) -> Result<String, ArbError> {
        Err(ArbError::Transient("private pool not implemented".into()))
    }
}

/// Submits a single-tx bundle to `POST {base_url}/api/v1/bundles` using
/// the JSON-RPC envelope named in the bundle-submission interface.
pub struct HttpBundleEndpoint {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBundleEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl BundleEndpoint for HttpBundleEndpoint {
    async fn submit_bundle(&self, serialized_tx: &[u8], _tip_usd: f64) -> Result<String, ArbError> {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, serialized_tx);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendBundle",
            "params": [[encoded]],
        });

        let resp = self
            .client
            .post(format!("{}/api/v1/bundles", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ArbError::Transient(e.to_string()))?;

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ArbError::Transient(e.to_string()))?;

        parsed
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ArbError::Transient("bundle response missing result".into()))
    }
}

/// Submits a raw transaction directly over the configured RPC endpoint's
/// JSON-RPC `sendTransaction` method (the serialized tx base64-encoded,
/// per Solana's standard wire submission format).
pub struct SolanaStandardRpc {
    client: reqwest::Client,
    rpc_url: String,
}

impl SolanaStandardRpc {
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            rpc_url: rpc_url.into(),
        }
    }
}

#[async_trait]
impl StandardRpc for SolanaStandardRpc {
    async fn send_raw_transaction(&self, serialized_tx: &[u8]) -> Result<String, ArbError> {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, serialized_tx);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTransaction",
            "params": [encoded, {"encoding": "base64"}],
        });

        let resp = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ArbError::Transient(e.to_string()))?;

        let parsed: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ArbError::Transient(e.to_string()))?;

        if let Some(err) = parsed.get("error") {
            return Err(ArbError::ExecutionFailed(err.to_string()));
        }

        parsed
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ArbError::ExecutionFailed("rpc response missing result".into()))
    }
}

#[derive(Debug, Clone)]
pub struct MevObservation {
    pub txid: String,
    pub expected_profit_usd: f64,
    pub size: f64,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

pub struct MevTransport {
    signer: Arc<dyn Signer>,
    bundle_endpoints: Vec<Arc<dyn BundleEndpoint>>,
    private_pool: Arc<dyn PrivatePool>,
    standard_rpc: Arc<dyn StandardRpc>,
    cfg: MevTransportConfig,
    round_robin: std::sync::atomic::AtomicUsize,
    observations: Arc<tokio::sync::Mutex<Vec<MevObservation>>>,
}

impl MevTransport {
    pub fn new(
        signer: Arc<dyn Signer>,
        bundle_endpoints: Vec<Arc<dyn BundleEndpoint>>,
        private_pool: Arc<dyn PrivatePool>,
        standard_rpc: Arc<dyn StandardRpc>,
        cfg: MevTransportConfig,
    ) -> Self {
        Self {
            signer,
            bundle_endpoints,
            private_pool,
            standard_rpc,
            cfg,
            round_robin: std::sync::atomic::AtomicUsize::new(0),
            observations: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    /// Executes one signed leg: sleeps `send_delay`, then tries bundle
    /// submission (if enabled), falls to the private pool stub when
    /// protection is HIGH, then falls to standard RPC. Never throws
    /// across its boundary — always returns a result (§4.5).
    pub async fn execute(
        &self,
        raw_tx: &[u8],
        params: ProtectionParams,
        expected_profit_usd: f64,
        size: f64,
    ) -> ExecutionResult {
        let signed = match self.signer.sign(raw_tx) {
            Ok(s) => s,
            Err(e) => {
                return ExecutionResult {
                    success: false,
                    txid: None,
                    error_kind: Some(ArbError::ExecutionFailed(e.to_string())),
                    method: SubmissionMethod::StandardRpc,
                    realized_out_amount: None,
                }
            }
        };

        tokio::time::sleep(Duration::from_millis(params.send_delay_ms)).await;

        if self.cfg.use_bundles && !self.bundle_endpoints.is_empty() {
            let idx = self.round_robin.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                % self.bundle_endpoints.len();
            let endpoint = &self.bundle_endpoints[idx];
            let attempt = tokio::time::timeout(
                Duration::from_millis(self.cfg.bundle_timeout_ms),
                endpoint.submit_bundle(&signed, params.bundle_tip_usd),
            )
            .await;

            if let Ok(Ok(txid)) = attempt {
                self.spawn_monitor(txid.clone(), expected_profit_usd, size);
                return ExecutionResult {
                    success: true,
                    txid: Some(txid),
                    error_kind: None,
                    method: SubmissionMethod::Bundle,
                    realized_out_amount: None,
                };
            }

            if params.protection_level == ProtectionLevel::High {
                if let Ok(txid) = self.private_pool.submit(&signed).await {
                    self.spawn_monitor(txid.clone(), expected_profit_usd, size);
                    return ExecutionResult {
                        success: true,
                        txid: Some(txid),
                        error_kind: None,
                        method: SubmissionMethod::PrivatePool,
                        realized_out_amount: None,
                    };
                }
            }
        }

        self.send_via_standard_rpc(&signed, expected_profit_usd, size).await
    }

    async fn send_via_standard_rpc(
        &self,
        signed: &[u8],
        expected_profit_usd: f64,
        size: f64,
    ) -> ExecutionResult {
        const MAX_RETRIES: usize = 3;
        let mut last_error = None;
        for _ in 0..MAX_RETRIES {
            match self.standard_rpc.send_raw_transaction(signed).await {
                Ok(txid) => {
                    self.spawn_monitor(txid.clone(), expected_profit_usd, size);
                    return ExecutionResult {
                        success: true,
                        txid: Some(txid),
                        error_kind: None,
                        method: SubmissionMethod::StandardRpc,
                        realized_out_amount: None,
                    };
                }
                Err(e) => last_error = Some(e),
            }
        }
        ExecutionResult {
            success: false,
            txid: None,
            error_kind: last_error,
            method: SubmissionMethod::StandardRpc,
            realized_out_amount: None,
        }
    }

    /// Fire-and-forget diagnostic: after a fixed settle delay, records a
    /// `MEVObservation`. Purely diagnostic — never influences control flow.
    fn spawn_monitor(&self, txid: String, expected_profit_usd: f64, size: f64) {
        let observations = Arc::clone(&self.observations);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let mut guard = observations.lock().await;
            guard.push(MevObservation {
                txid,
                expected_profit_usd,
                size,
                recorded_at: chrono::Utc::now(),
            });
        });
    }

    pub async fn recent_observations(&self) -> Vec<MevObservation> {
        self.observations.lock().await.clone()
    }

    /// Prunes observations older than 24h, mirroring the sizer's
    /// performance-entry staleness window.
    pub async fn cleanup_old(&self) {
        let now = chrono::Utc::now();
        let max_age = chrono::Duration::hours(24);
        let mut guard = self.observations.lock().await;
        guard.retain(|obs| now - obs.recorded_at <= max_age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(randomize: bool, bundles: bool) -> MevTransportConfig {
        MevTransportConfig {
            randomize_gas: randomize,
            use_bundles: bundles,
            max_submit_jitter_ms: 100,
            bundle_timeout_ms: 1000,
            base_priority: 1000,
            priority_floor: 100,
        }
    }

    #[test]
    fn protection_level_thresholds_match_spec() {
        let c = cfg(false, false);
        let p = derive_protection_params(&c, 0.1, 0.1, 5.0, 1.0);
        assert_eq!(p.protection_level, ProtectionLevel::High);

        let p = derive_protection_params(&c, 0.05, 0.1, 2.0, 1.0);
        assert_eq!(p.protection_level, ProtectionLevel::Medium);

        let p = derive_protection_params(&c, 0.01, 0.1, 0.1, 1.0);
        assert_eq!(p.protection_level, ProtectionLevel::Low);
    }

    #[test]
    fn bundle_tip_is_clamped() {
        let c = cfg(false, true);
        let p = derive_protection_params(&c, 0.05, 0.1, 1.0, 1000.0);
        assert_eq!(p.bundle_tip_usd, 0.01);

        let p = derive_protection_params(&c, 0.05, 0.1, 1.0, 0.001);
        assert_eq!(p.bundle_tip_usd, 0.001);
    }

    #[test]
    fn priority_without_randomization_is_base() {
        let c = cfg(false, false);
        let p = derive_protection_params(&c, 0.05, 0.1, 1.0, 1.0);
        assert_eq!(p.priority, 1000);
    }

    #[tokio::test]
    async fn cleanup_old_prunes_stale_observations_only() {
        let observations = Arc::new(tokio::sync::Mutex::new(vec![
            MevObservation {
                txid: "stale".into(),
                expected_profit_usd: 1.0,
                size: 0.1,
                recorded_at: chrono::Utc::now() - chrono::Duration::hours(25),
            },
            MevObservation {
                txid: "fresh".into(),
                expected_profit_usd: 1.0,
                size: 0.1,
                recorded_at: chrono::Utc::now(),
            },
        ]));

        let transport = MevTransport {
            signer: Arc::new(crate::signer::KeypairSigner::from_base58(
                &bs58::encode(solana_sdk::signature::Keypair::new().to_bytes()).into_string(),
            )
            .unwrap()),
            bundle_endpoints: vec![],
            private_pool: Arc::new(UnimplementedPrivatePool),
            standard_rpc: Arc::new(DummyRpc),
            cfg: cfg(false, false),
            round_robin: std::sync::atomic::AtomicUsize::new(0),
            observations,
        };

        transport.cleanup_old().await;
        let remaining = transport.recent_observations().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].txid, "fresh");
    }

    struct DummyRpc;
    #[async_trait]
    impl StandardRpc for DummyRpc {
        async fn send_raw_transaction(&self, _serialized_tx: &[u8]) -> Result<String, ArbError> {
            Err(ArbError::ExecutionFailed("unused in this test".into()))
        }
    }

    #[test]
    fn priority_with_randomization_stays_in_bounds() {
        let c = cfg(true, false);
        for _ in 0..50 {
            let p = derive_protection_params(&c, 0.05, 0.1, 1.0, 1.0);
            assert!(p.priority >= c.priority_floor);
            assert!(p.priority <= (c.base_priority as f64 * 1.2).round() as u64);
        }
    }
}
