//! Startup pre-flight gate — an external collaborator of uncertain
//! semantics in the source this was distilled from (spec §9), modeled
//! here as a trait the core consults once before entering its loop.

use anyhow::Result;

pub trait PreflightGate: Send + Sync {
    /// Returns `Err` to abort startup; `Ok(())` to proceed.
    fn check(&self) -> Result<()>;
}

/// Default: always ready. Swap in a real gate (balance checks, RPC
/// health, allow-list membership) without touching the search loop.
pub struct NoopPreflightGate;

impl PreflightGate for NoopPreflightGate {
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_gate_always_passes() {
        assert!(NoopPreflightGate.check().is_ok());
    }
}
