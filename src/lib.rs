//! Mispricing detection and arbitrage engine for an automated trading desk
//!
//! Detectors turn immutable market snapshots into `MispricingOpportunity`
//! records, engines convert those into risk-gated multi-leg structures, and
//! the coordinator assembles a non-conflicting portfolio across engine
//! families. Pricing models and position sizers plug in through traits.

pub mod config;
pub mod types;
pub mod errors;
pub mod detectors;
pub mod engines;
pub mod pricing;
pub mod sizing;
pub mod utils;

// Re-export commonly used items
pub use config::{Config, CONFIG};
pub use errors::{EngineError, EngineResult};
pub use types::*;
