//! Triangular arbitrage core: an aggregator-driven `A -> B -> A` search
//! loop with dynamic sizing and MEV-aware execution.

pub mod arbitrage;
pub mod clock;
pub mod config;
pub mod logger;
pub mod preflight;
pub mod price_oracle;
pub mod signer;
pub mod token_directory;
pub mod types;

pub use arbitrage::{DynamicSizer, MevTransport, QuoteClient, SearchLoop};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use logger::Logger;
pub use preflight::{NoopPreflightGate, PreflightGate};
pub use price_oracle::PriceOracle;
pub use signer::{KeypairSigner, Signer};
pub use token_directory::{ConfigTokenDirectory, TokenDirectory};
pub use types::{ArbError, Asset};
