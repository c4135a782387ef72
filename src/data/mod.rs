//! Data Module
//!
//! Durable state and market data.
//! - SQLite store for patterns, agents, knowledge and their audit trail
//! - Price sources (synthetic random walk, CSV history)

pub mod records;
pub mod source;
pub mod store;

pub use records::Records;
pub use source::{random_start, CsvSource, PriceSource, SyntheticSource};
pub use store::{EvolutionStore, RetryPolicy};
