//! Detected price dislocations

use super::market::InstrumentId;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MispricingType {
    Statistical,
    Triangular,
    MeanReversion,
    Volatility,
    SpreadAnomaly,
    SpotVsSynthetic,
    CrossExchange,
    RealTimeDiscrepancy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MispricingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl MispricingSeverity {
    /// Severity is monotonic in absolute deviation magnitude.
    pub fn from_deviation(deviation_percentage: f64) -> Self {
        let d = deviation_percentage.abs();
        if d > 0.05 {
            MispricingSeverity::Critical
        } else if d > 0.02 {
            MispricingSeverity::High
        } else if d > 0.01 {
            MispricingSeverity::Medium
        } else {
            MispricingSeverity::Low
        }
    }
}

/// A detected dislocation between market and theoretical price. Immutable
/// once emitted by a detector; consumed by engines and the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MispricingOpportunity {
    pub target_instrument: InstrumentId,
    pub component_instruments: Vec<InstrumentId>,
    /// Index-aligned with `component_instruments`; sums to a hedge ratio.
    pub weights: Vec<f64>,
    pub mispricing_type: MispricingType,
    pub severity: MispricingSeverity,

    pub market_price: Decimal,
    pub theoretical_price: Decimal,
    /// (market - theoretical) / theoretical
    pub deviation_percentage: f64,
    pub z_score: f64,
    pub confidence_level: f64,
    pub expected_profit: Decimal,
    pub max_loss: Decimal,

    pub detection_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
}

impl MispricingOpportunity {
    /// `ttl` must be positive so `expiry_time > detection_time` holds.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_instrument: impl Into<InstrumentId>,
        mispricing_type: MispricingType,
        market_price: Decimal,
        theoretical_price: Decimal,
        deviation_percentage: f64,
        z_score: f64,
        confidence_level: f64,
        ttl: Duration,
    ) -> Self {
        let detection_time = Utc::now();
        let ttl = if ttl > Duration::zero() {
            ttl
        } else {
            Duration::seconds(1)
        };
        MispricingOpportunity {
            target_instrument: target_instrument.into(),
            component_instruments: Vec::new(),
            weights: Vec::new(),
            mispricing_type,
            severity: MispricingSeverity::from_deviation(deviation_percentage),
            market_price,
            theoretical_price,
            deviation_percentage,
            z_score,
            confidence_level,
            expected_profit: Decimal::ZERO,
            max_loss: Decimal::ZERO,
            detection_time,
            expiry_time: detection_time + ttl,
        }
    }

    pub fn with_components(mut self, instruments: Vec<InstrumentId>, weights: Vec<f64>) -> Self {
        debug_assert_eq!(instruments.len(), weights.len());
        let n = instruments.len().min(weights.len());
        self.component_instruments = instruments.into_iter().take(n).collect();
        self.weights = weights.into_iter().take(n).collect();
        self
    }

    pub fn with_profit(mut self, expected_profit: Decimal, max_loss: Decimal) -> Self {
        self.expected_profit = expected_profit;
        self.max_loss = max_loss;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }
}
