//! Core data types and structures

pub mod arbitrage;
pub mod market;
pub mod mispricing;
pub mod portfolio;
pub mod signals;

pub use arbitrage::*;
pub use market::*;
pub use mispricing::*;
pub use portfolio::*;
pub use signals::*;
