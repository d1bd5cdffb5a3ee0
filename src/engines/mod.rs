//! Arbitrage engine family
//!
//! Engines turn mispricings into leg-level trade structures, run them
//! through the shared risk gate, and keep a copy-out active set. Every
//! engine is `&self` with one internal mutex; callbacks fire after the
//! lock drops, and expired opportunities are swept on each update.

pub mod basket;
pub mod coordinator;
pub mod cross_exchange;
pub mod general;
pub mod risk_gate;
pub mod spot_funding;
pub mod statistical;
pub mod triangular;

pub use basket::MultiInstrumentBasketEngine;
pub use coordinator::{
    ComprehensiveCoordinator, CoordinatorLimits, CoordinatorReport, EngineKind,
};
pub use cross_exchange::CrossExchangeReplicationEngine;
pub use general::GeneralArbitrageEngine;
pub use risk_gate::RiskGate;
pub use spot_funding::SpotFundingPerpetualEngine;
pub use statistical::StatisticalArbitrageEngine;
pub use triangular::TriangularArbitrageEngine;

use crate::errors::{EngineError, EngineResult};
use crate::types::{ArbitrageOpportunity, ArbitrageStatus, MarketSnapshot, MispricingOpportunity};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};

pub type OpportunityCallback = Arc<dyn Fn(&ArbitrageOpportunity) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ArbitrageParameters {
    /// Minimum profit as a fraction of total cost.
    pub min_profit_threshold: f64,
    /// VaR ceiling as a fraction of total cost.
    pub max_risk_per_trade: f64,
    pub max_correlation_risk: f64,
    pub max_market_impact: f64,
    pub max_slippage: f64,
    /// Notional ceiling per opportunity.
    pub max_position_size: Decimal,
    pub max_holding_period: Duration,
    /// Floor on displayed two-sided book notional for the primary leg.
    pub min_liquidity_requirement: Decimal,
    pub min_confidence_level: f64,
    /// Remaining lifetime an opportunity must keep to be worth validating.
    pub execution_buffer: Duration,
    pub base_order_size: Decimal,
}

impl Default for ArbitrageParameters {
    fn default() -> Self {
        ArbitrageParameters {
            min_profit_threshold: 0.001,
            max_risk_per_trade: 0.02,
            max_correlation_risk: 0.3,
            max_market_impact: 0.005,
            max_slippage: 0.001,
            max_position_size: dec!(1000000),
            max_holding_period: Duration::minutes(60),
            min_liquidity_requirement: dec!(100000),
            min_confidence_level: 0.8,
            execution_buffer: Duration::minutes(5),
            base_order_size: dec!(100),
        }
    }
}

impl ArbitrageParameters {
    pub fn validate(&self) -> EngineResult<()> {
        let checks = [
            ("min_profit_threshold", self.min_profit_threshold),
            ("max_risk_per_trade", self.max_risk_per_trade),
            ("max_correlation_risk", self.max_correlation_risk),
            ("max_market_impact", self.max_market_impact),
            ("max_slippage", self.max_slippage),
            ("min_confidence_level", self.min_confidence_level),
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
        if self.max_position_size <= Decimal::ZERO {
            return Err(EngineError::InvalidParameter {
                name: "max_position_size",
                value: 0.0,
                reason: "must be positive",
            });
        }
        if self.base_order_size <= Decimal::ZERO {
            return Err(EngineError::InvalidParameter {
                name: "base_order_size",
                value: 0.0,
                reason: "must be positive",
            });
        }
        if self.max_holding_period <= Duration::zero()
            || self.execution_buffer <= Duration::zero()
        {
            return Err(EngineError::InvalidParameter {
                name: "holding_period",
                value: self.max_holding_period.num_seconds() as f64,
                reason: "durations must be positive",
            });
        }
        Ok(())
    }
}

pub trait ArbitrageEngine: Send + Sync {
    fn engine_name(&self) -> &'static str;

    /// Absorbs a snapshot; expired active opportunities are swept here
    /// (cleanup-on-touch, no background timer).
    fn update_market_data(&self, snapshot: &MarketSnapshot);

    /// Converts one mispricing into a leg structure and runs it through
    /// the risk gate. Mispricings outside the engine's domain are ignored;
    /// collaborator failures propagate.
    fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()>;

    /// Engine-driven identification from the latest snapshot, independent
    /// of external mispricing input.
    fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity>;

    /// The risk gate. `true` mutates status to Validated; `false` leaves
    /// the opportunity untouched.
    fn validate_opportunity(&self, opportunity: &mut ArbitrageOpportunity) -> bool;

    fn get_active_opportunities(&self) -> Vec<ArbitrageOpportunity>;
    fn get_opportunity(&self, opportunity_id: &str) -> Option<ArbitrageOpportunity>;
    fn clear_opportunities(&self);

    fn set_opportunity_callback(&self, callback: OpportunityCallback);
    fn set_expiry_callback(&self, callback: OpportunityCallback);
    fn set_error_callback(&self, callback: ErrorCallback);

    fn update_parameters(&self, params: ArbitrageParameters) -> EngineResult<()>;
}

/// At-most-one registered callback per slot; re-registration replaces.
#[derive(Default)]
pub struct EngineCallbacks {
    opportunity: Mutex<Option<OpportunityCallback>>,
    expiry: Mutex<Option<OpportunityCallback>>,
    error: Mutex<Option<ErrorCallback>>,
}

impl EngineCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_opportunity(&self, callback: OpportunityCallback) {
        *self.opportunity.lock().unwrap() = Some(callback);
    }

    pub fn set_expiry(&self, callback: OpportunityCallback) {
        *self.expiry.lock().unwrap() = Some(callback);
    }

    pub fn set_error(&self, callback: ErrorCallback) {
        *self.error.lock().unwrap() = Some(callback);
    }

    pub fn fire_opportunity(&self, opportunity: &ArbitrageOpportunity) {
        let callback = self.opportunity.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(opportunity);
        }
    }

    pub fn fire_expiry(&self, opportunities: &[ArbitrageOpportunity]) {
        let callback = self.expiry.lock().unwrap().clone();
        if let Some(callback) = callback {
            for opp in opportunities {
                callback(opp);
            }
        }
    }

    pub fn fire_error(&self, message: &str) {
        let callback = self.error.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }
}

struct CoreState {
    params: ArbitrageParameters,
    snapshot: Option<MarketSnapshot>,
    active: Vec<ArbitrageOpportunity>,
}

/// Shared engine plumbing: parameter storage, latest-snapshot cache,
/// active set with expiry sweeping, and gate admission.
pub(crate) struct EngineCore {
    state: Mutex<CoreState>,
    pub(crate) callbacks: EngineCallbacks,
}

impl EngineCore {
    pub(crate) fn new(params: ArbitrageParameters) -> Self {
        EngineCore {
            state: Mutex::new(CoreState {
                params,
                snapshot: None,
                active: Vec::new(),
            }),
            callbacks: EngineCallbacks::new(),
        }
    }

    pub(crate) fn absorb_snapshot(&self, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            state.snapshot = Some(snapshot.clone());
            let now = Utc::now();
            let (mut expired, live): (Vec<_>, Vec<_>) =
                state.active.drain(..).partition(|opp| opp.is_expired(now));
            state.active = live;
            for opp in &mut expired {
                // Terminal entries stay as they are.
                let _ = opp.transition(ArbitrageStatus::Expired);
            }
            expired
        };
        self.callbacks.fire_expiry(&expired);
    }

    pub(crate) fn params(&self) -> ArbitrageParameters {
        self.state.lock().unwrap().params.clone()
    }

    pub(crate) fn set_params(&self, params: ArbitrageParameters) {
        self.state.lock().unwrap().params = params;
    }

    pub(crate) fn snapshot(&self) -> Option<MarketSnapshot> {
        self.state.lock().unwrap().snapshot.clone()
    }

    /// Runs the gate against the cached snapshot; validated opportunities
    /// join the active set and fire the opportunity callback.
    pub(crate) fn admit(&self, mut opportunity: ArbitrageOpportunity) -> bool {
        let admitted = {
            let mut state = self.state.lock().unwrap();
            let snapshot = state.snapshot.clone();
            if RiskGate::validate(&mut opportunity, snapshot.as_ref(), &state.params) {
                state.active.push(opportunity.clone());
                true
            } else {
                false
            }
        };
        if admitted {
            self.callbacks.fire_opportunity(&opportunity);
        }
        admitted
    }

    pub(crate) fn validate_against_cache(&self, opportunity: &mut ArbitrageOpportunity) -> bool {
        let state = self.state.lock().unwrap();
        RiskGate::validate(opportunity, state.snapshot.as_ref(), &state.params)
    }

    pub(crate) fn active(&self) -> Vec<ArbitrageOpportunity> {
        self.state.lock().unwrap().active.clone()
    }

    pub(crate) fn find(&self, opportunity_id: &str) -> Option<ArbitrageOpportunity> {
        self.state
            .lock()
            .unwrap()
            .active
            .iter()
            .find(|o| o.opportunity_id == opportunity_id)
            .cloned()
    }

    pub(crate) fn clear(&self) {
        self.state.lock().unwrap().active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_threshold_is_rejected() {
        let params = ArbitrageParameters {
            min_profit_threshold: -1.0,
            ..ArbitrageParameters::default()
        };
        assert!(matches!(
            params.validate(),
            Err(EngineError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn zero_position_ceiling_is_rejected() {
        let params = ArbitrageParameters {
            max_position_size: Decimal::ZERO,
            ..ArbitrageParameters::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn default_parameters_are_valid() {
        assert!(ArbitrageParameters::default().validate().is_ok());
    }
}
