//! Arbitrage engine — quote transport, MEV-aware execution, dynamic
//! sizing, and the search loop that drives them.

pub mod mev_transport;
pub mod quote_client;
pub mod search_loop;
pub mod sizer;

pub use mev_transport::MevTransport;
pub use quote_client::QuoteClient;
pub use search_loop::SearchLoop;
pub use sizer::DynamicSizer;
