//! Custom error types for the desk engine

use crate::types::{ArbitrageStatus, InstrumentId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid parameter {name}: {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("Pricing model failed for {instrument}: {source}")]
    Pricing {
        instrument: InstrumentId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Position sizer failed for opportunity {opportunity_id}: {source}")]
    Sizing {
        opportunity_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("No quote available for {instrument}")]
    MissingQuote { instrument: InstrumentId },

    #[error("Illegal status transition {from:?} -> {to:?} for opportunity {opportunity_id}")]
    InvalidTransition {
        opportunity_id: String,
        from: ArbitrageStatus,
        to: ArbitrageStatus,
    },

    #[error("Mismatched components: {components} instruments vs {weights} weights")]
    MismatchedComponents { components: usize, weights: usize },
}

pub type EngineResult<T> = Result<T, EngineError>;
