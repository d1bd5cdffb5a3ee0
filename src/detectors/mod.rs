//! Mispricing detector family
//!
//! Every detector consumes immutable market snapshots and produces
//! `MispricingOpportunity` records once its rolling history is deep enough
//! and the significance predicate holds. State is guarded by one mutex per
//! detector; accessors copy out, and callbacks fire after the lock drops.

pub mod basis;
pub mod composite;
pub mod cross_exchange;
pub mod discrepancy;
pub mod stat_arb;
pub mod statistical;
pub mod synthetic_comparator;
pub mod triangular;
pub mod volatility;

pub use basis::BasisCalculator;
pub use composite::{CompositeDetector, EnhancedCompositeDetector};
pub use cross_exchange::CrossExchangeDetector;
pub use discrepancy::RealTimeDiscrepancyDetector;
pub use stat_arb::StatArbSignalGenerator;
pub use statistical::StatisticalDetector;
pub use synthetic_comparator::SyntheticPriceComparator;
pub use triangular::TriangularDetector;
pub use volatility::VolatilityDetector;

use crate::errors::{EngineError, EngineResult};
use crate::types::{MarketSnapshot, MispricingOpportunity};
use chrono::Duration;
use std::sync::{Arc, Mutex};

pub type DetectionCallback = Arc<dyn Fn(&MispricingOpportunity) + Send + Sync>;
pub type ExpiryCallback = Arc<dyn Fn(&MispricingOpportunity) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DetectionParameters {
    pub min_deviation_threshold: f64,
    pub min_z_score: f64,
    pub min_confidence_level: f64,
    pub max_spread_ratio: f64,
    pub min_observation_window: usize,
    pub volatility_threshold: f64,
    pub liquidity_threshold: f64,
    pub max_opportunity_duration: Duration,
}

impl Default for DetectionParameters {
    fn default() -> Self {
        DetectionParameters {
            min_deviation_threshold: 0.005,
            min_z_score: 2.0,
            min_confidence_level: 0.8,
            max_spread_ratio: 0.02,
            min_observation_window: 50,
            volatility_threshold: 0.15,
            liquidity_threshold: 1000.0,
            max_opportunity_duration: Duration::minutes(30),
        }
    }
}

impl DetectionParameters {
    /// Malformed parameters are rejected here, never downstream.
    pub fn validate(&self) -> EngineResult<()> {
        let checks = [
            ("min_deviation_threshold", self.min_deviation_threshold),
            ("min_z_score", self.min_z_score),
            ("min_confidence_level", self.min_confidence_level),
            ("max_spread_ratio", self.max_spread_ratio),
            ("volatility_threshold", self.volatility_threshold),
            ("liquidity_threshold", self.liquidity_threshold),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::InvalidParameter {
                    name,
                    value,
                    reason: "must be finite and non-negative",
                });
            }
        }
        if self.min_confidence_level > 1.0 {
            return Err(EngineError::InvalidParameter {
                name: "min_confidence_level",
                value: self.min_confidence_level,
                reason: "must not exceed 1.0",
            });
        }
        if self.min_observation_window == 0 {
            return Err(EngineError::InvalidParameter {
                name: "min_observation_window",
                value: 0.0,
                reason: "must be positive",
            });
        }
        if self.max_opportunity_duration <= Duration::zero() {
            return Err(EngineError::InvalidParameter {
                name: "max_opportunity_duration",
                value: self.max_opportunity_duration.num_seconds() as f64,
                reason: "must be positive",
            });
        }
        Ok(())
    }

    /// Rolling histories are capped at twice the observation window.
    pub fn history_capacity(&self) -> usize {
        self.min_observation_window * 2
    }

    pub fn is_significant_deviation(&self, deviation: f64, z_score: f64, confidence: f64) -> bool {
        deviation.abs() > self.min_deviation_threshold
            && z_score.abs() > self.min_z_score
            && confidence > self.min_confidence_level
    }
}

/// At-most-one registered callback per slot; re-registration replaces.
#[derive(Default)]
pub struct CallbackSlots {
    detection: Mutex<Option<DetectionCallback>>,
    expiry: Mutex<Option<ExpiryCallback>>,
}

impl CallbackSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_detection(&self, callback: DetectionCallback) {
        *self.detection.lock().unwrap() = Some(callback);
    }

    pub fn set_expiry(&self, callback: ExpiryCallback) {
        *self.expiry.lock().unwrap() = Some(callback);
    }

    /// Clones the callback out of the slot so invocation happens unlocked.
    pub fn fire_detection(&self, opportunities: &[MispricingOpportunity]) {
        let callback = self.detection.lock().unwrap().clone();
        if let Some(callback) = callback {
            for opp in opportunities {
                callback(opp);
            }
        }
    }

    pub fn fire_expiry(&self, opportunities: &[MispricingOpportunity]) {
        let callback = self.expiry.lock().unwrap().clone();
        if let Some(callback) = callback {
            for opp in opportunities {
                callback(opp);
            }
        }
    }
}

pub trait MispricingDetector: Send + Sync {
    /// Absorb a snapshot: amortized O(instruments) rolling-history update
    /// plus removal of expired internal entries.
    fn update_market_data(&self, snapshot: &MarketSnapshot);

    /// Pure function of current internal state; only significant
    /// deviations are emitted. Short history yields an empty vector.
    fn detect_opportunities(&self) -> Vec<MispricingOpportunity>;

    fn set_detection_callback(&self, callback: DetectionCallback);
    fn set_expiry_callback(&self, callback: ExpiryCallback);

    /// Atomic wholesale replacement; invalid parameters leave the previous
    /// set in place.
    fn update_parameters(&self, params: DetectionParameters) -> EngineResult<()>;
}

/// Shared consolidation: rank by expected profit and keep the best entry
/// per `(target_instrument, type)` pair. Stable sort preserves child
/// insertion order as the tie-break.
pub fn consolidate_opportunities(
    mut opportunities: Vec<MispricingOpportunity>,
) -> Vec<MispricingOpportunity> {
    opportunities.sort_by(|a, b| {
        b.expected_profit
            .cmp(&a.expected_profit)
    });
    let mut seen = std::collections::HashSet::new();
    opportunities.retain(|opp| seen.insert((opp.target_instrument.clone(), opp.mispricing_type)));
    opportunities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MispricingType;
    use rust_decimal::Decimal;

    fn opp(target: &str, mtype: MispricingType, profit: i64) -> MispricingOpportunity {
        MispricingOpportunity::new(
            target,
            mtype,
            Decimal::from(100),
            Decimal::from(102),
            -0.02,
            2.5,
            0.9,
            Duration::minutes(30),
        )
        .with_profit(Decimal::from(profit), Decimal::from(profit / 2))
    }

    #[test]
    fn consolidation_keeps_highest_profit_duplicate() {
        let merged = consolidate_opportunities(vec![
            opp("BTC-USD", MispricingType::Statistical, 50),
            opp("BTC-USD", MispricingType::Statistical, 120),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].expected_profit, Decimal::from(120));
    }

    #[test]
    fn different_types_are_not_duplicates() {
        let merged = consolidate_opportunities(vec![
            opp("BTC-USD", MispricingType::Statistical, 50),
            opp("BTC-USD", MispricingType::Volatility, 40),
        ]);
        assert_eq!(merged.len(), 2);
        // Descending by profit
        assert!(merged[0].expected_profit >= merged[1].expected_profit);
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let params = DetectionParameters {
            min_deviation_threshold: -0.01,
            ..DetectionParameters::default()
        };
        assert!(matches!(
            params.validate(),
            Err(EngineError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn callback_registration_replaces_the_previous_one() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let slots = CallbackSlots::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        slots.set_detection(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = second.clone();
        slots.set_detection(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        slots.fire_detection(&[opp("BTC-USD", MispricingType::Statistical, 50)]);
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn significance_requires_all_three_gates() {
        let params = DetectionParameters::default();
        assert!(params.is_significant_deviation(0.01, 2.5, 0.9));
        assert!(!params.is_significant_deviation(0.001, 2.5, 0.9));
        assert!(!params.is_significant_deviation(0.01, 1.0, 0.9));
        assert!(!params.is_significant_deviation(0.01, 2.5, 0.5));
    }
}
