//! Signing boundary — the core never persists private key material
//! itself; it consumes a `Signer` the way `executor.rs` consumes a
//! `LocalWallet` behind `ethers::Middleware`.

use anyhow::{Context, Result};
use solana_sdk::signature::{Keypair, Signature, Signer as SolanaSigner};

/// `raw_tx` is a serialized, unsigned transaction *message* (no
/// signature slots); `sign` returns the fully wire-encoded single-signer
/// transaction ready for submission — signature count, signature, message.
pub trait Signer: Send + Sync {
    fn public_key(&self) -> Vec<u8>;
    fn sign(&self, raw_tx: &[u8]) -> Result<Vec<u8>>;
}

/// Encodes `len` using Solana's compact-u16 ("short vec" length) scheme:
/// 7 bits per byte, high bit set while more bytes follow.
pub(crate) fn encode_compact_u16(mut len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(2);
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
            out.push(byte);
        } else {
            out.push(byte);
            break;
        }
    }
    out
}

/// Decodes a compact-u16 length prefix, returning `(value, bytes_consumed)`.
pub(crate) fn decode_compact_u16(data: &[u8]) -> Option<(usize, usize)> {
    let mut value = 0usize;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate().take(3) {
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Adapts a Solana `Keypair` to the core's `Signer` interface. Key
/// loading itself (from file, env, or a hardware wallet) is an
/// external concern — only the adapter lives here.
pub struct KeypairSigner {
    keypair: Keypair,
}

impl KeypairSigner {
    pub fn from_base58(encoded: &str) -> Result<Self> {
        let bytes = bs58::decode(encoded)
            .into_vec()
            .context("signer key is not valid base58")?;
        let keypair = Keypair::from_bytes(&bytes).context("signer key is not a valid keypair")?;
        Ok(Self { keypair })
    }
}

impl Signer for KeypairSigner {
    fn public_key(&self) -> Vec<u8> {
        self.keypair.pubkey().to_bytes().to_vec()
    }

    fn sign(&self, raw_tx: &[u8]) -> Result<Vec<u8>> {
        let sig: Signature = self.keypair.sign_message(raw_tx);
        let mut signed = encode_compact_u16(1);
        signed.extend_from_slice(sig.as_ref());
        signed.extend_from_slice(raw_tx);
        Ok(signed)
    }
}
