//! Token directory — supplies the anchor asset and the intermediate
//! ring (spec §6). Token-list fetching itself is out of scope; this is
//! a minimal, config-driven implementation so the core is runnable.

use crate::types::Asset;
use anyhow::{Context, Result};
use async_trait::async_trait;
use solana_client::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

/// The SPL Token program's well-known address.
const SPL_TOKEN_PROGRAM_ID: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
/// The SPL Associated Token Account program's well-known address.
const ASSOCIATED_TOKEN_PROGRAM_ID: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

/// Derives the associated token account address for `(owner, mint)`,
/// matching the `spl-associated-token-account` crate's own derivation
/// (`[owner, token_program, mint]` seeds under the ATA program) without
/// pulling in that crate for a single PDA computation.
fn derive_associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Result<Pubkey> {
    let token_program =
        Pubkey::from_str(SPL_TOKEN_PROGRAM_ID).context("invalid SPL token program id")?;
    let ata_program =
        Pubkey::from_str(ASSOCIATED_TOKEN_PROGRAM_ID).context("invalid ATA program id")?;
    let seeds = &[owner.as_ref(), token_program.as_ref(), mint.as_ref()];
    Ok(Pubkey::find_program_address(seeds, &ata_program).0)
}

#[async_trait]
pub trait TokenDirectory: Send + Sync {
    fn anchor(&self) -> Asset;
    /// Non-empty ordered ring of intermediate assets.
    fn intermediates(&self) -> Vec<Asset>;
    /// Raw on-chain balance of `asset`, consulted once at startup.
    async fn balance(&self, asset: &Asset) -> Result<f64>;
}

pub struct ConfigTokenDirectory {
    anchor: Asset,
    intermediates: Vec<Asset>,
    rpc_url: String,
    owner: Pubkey,
}

impl ConfigTokenDirectory {
    pub fn new(anchor: Asset, intermediates: Vec<Asset>, rpc_url: String, owner: Pubkey) -> Result<Self> {
        if intermediates.is_empty() {
            anyhow::bail!("intermediate ring must be non-empty");
        }
        Ok(Self {
            anchor,
            intermediates,
            rpc_url,
            owner,
        })
    }
}

#[async_trait]
impl TokenDirectory for ConfigTokenDirectory {
    fn anchor(&self) -> Asset {
        self.anchor.clone()
    }

    fn intermediates(&self) -> Vec<Asset> {
        self.intermediates.clone()
    }

    async fn balance(&self, asset: &Asset) -> Result<f64> {
        let rpc_url = self.rpc_url.clone();
        let owner = self.owner;
        let is_native = asset.address == "native";
        let decimals = asset.decimals;
        let mint_address = asset.address.clone();

        tokio::task::spawn_blocking(move || -> Result<f64> {
            let client = RpcClient::new(rpc_url);
            if is_native {
                let lamports = client
                    .get_balance(&owner)
                    .context("failed to fetch native SOL balance")?;
                return Ok(lamports as f64 / 10f64.powi(decimals as i32));
            }

            let mint = Pubkey::from_str(&mint_address).context("asset address is not a valid mint pubkey")?;
            let ata = derive_associated_token_address(&owner, &mint)?;
            match client.get_token_account_balance(&ata) {
                Ok(amount) => Ok(amount.ui_amount.unwrap_or(0.0)),
                // No associated token account yet means the owner holds none of this mint.
                Err(_) => Ok(0.0),
            }
        })
        .await
        .context("balance query task panicked")?
    }
}

/// Helper used at startup: `addr` must be a valid base58 pubkey unless
/// it is the sentinel `"native"` for SOL itself.
pub fn parse_owner(addr: &str) -> Result<Pubkey> {
    Pubkey::from_str(addr).context("owner address is not a valid pubkey")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_associated_token_address_is_deterministic() {
        let owner = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let a = derive_associated_token_address(&owner, &mint).unwrap();
        let b = derive_associated_token_address(&owner, &mint).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, owner);
        assert_ne!(a, mint);
    }

    #[test]
    fn rejects_empty_intermediate_ring() {
        let anchor = Asset::new("native", "SOL", 9);
        let owner = Pubkey::new_unique();
        let result = ConfigTokenDirectory::new(anchor, vec![], "http://localhost:8899".into(), owner);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_non_empty_ring() {
        let anchor = Asset::new("native", "SOL", 9);
        let intermediate = Asset::new("mint2", "USDC", 6);
        let owner = Pubkey::new_unique();
        let dir =
            ConfigTokenDirectory::new(anchor, vec![intermediate], "http://localhost:8899".into(), owner)
                .unwrap();
        assert_eq!(dir.intermediates().len(), 1);
    }
}
