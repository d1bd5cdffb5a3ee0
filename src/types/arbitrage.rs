//! Arbitrage opportunity structures and lifecycle state machine

use super::market::{InstrumentId, Side};
use super::mispricing::MispricingOpportunity;
use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArbitrageType {
    Pure,
    Statistical,
    Triangular,
    CalendarSpread,
    InterMarketSpread,
    SpotFundingPerpetual,
    CrossExchangeReplication,
    MultiInstrumentBasket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbitrageStatus {
    Identified,
    Validated,
    Executing,
    Completed,
    Failed,
    Expired,
}

impl ArbitrageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ArbitrageStatus::Completed | ArbitrageStatus::Failed | ArbitrageStatus::Expired
        )
    }

    /// Forward-only lifecycle; terminal states are absorbing.
    pub fn can_transition_to(self, next: ArbitrageStatus) -> bool {
        use ArbitrageStatus::*;
        match (self, next) {
            (Identified, Validated) => true,
            (Validated, Executing) => true,
            (Executing, Completed) | (Executing, Failed) => true,
            (Identified, Expired) | (Validated, Expired) | (Executing, Expired) => true,
            _ => false,
        }
    }
}

/// One tradable side of a multi-leg structure. Owned exclusively by its
/// parent opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageLeg {
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    /// Signed hedge-ratio contribution.
    pub weight: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
}

impl ArbitrageLeg {
    pub fn new(
        instrument_id: impl Into<InstrumentId>,
        side: Side,
        size: Decimal,
        entry_price: Decimal,
        weight: f64,
    ) -> Self {
        ArbitrageLeg {
            instrument_id: instrument_id.into(),
            side,
            size: size.abs(),
            entry_price,
            exit_price: None,
            weight,
            entry_time: Utc::now(),
            exit_time: None,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.entry_price
    }
}

/// A constructed, evaluable multi-leg trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageOpportunity {
    pub opportunity_id: String,
    pub arbitrage_type: ArbitrageType,
    pub status: ArbitrageStatus,

    pub legs: Vec<ArbitrageLeg>,
    /// Informational back-reference, stored by value; never used for
    /// mutation propagation.
    pub mispricing_source: Option<MispricingOpportunity>,

    // Financial metrics
    pub expected_profit: Decimal,
    pub max_loss: Decimal,
    pub profit_probability: f64,
    pub break_even_price: Decimal,
    pub total_cost: Decimal,
    pub net_exposure: Decimal,

    // Risk metrics
    pub value_at_risk: Decimal,
    pub expected_shortfall: Decimal,
    pub sharpe_ratio: f64,
    pub max_drawdown: Decimal,
    pub correlation_risk: f64,

    // Timing
    pub identification_time: DateTime<Utc>,
    pub validation_time: Option<DateTime<Utc>>,
    pub expiry_time: DateTime<Utc>,
    pub estimated_duration_ms: i64,

    // Execution estimates
    pub slippage_estimate: f64,
    pub transaction_costs: Decimal,
    pub total_volume: Decimal,
    pub market_impact: f64,
}

impl ArbitrageOpportunity {
    pub fn new(arbitrage_type: ArbitrageType, ttl: Duration) -> Self {
        let identification_time = Utc::now();
        ArbitrageOpportunity {
            opportunity_id: format!("ARB-{}", uuid::Uuid::new_v4().simple()),
            arbitrage_type,
            status: ArbitrageStatus::Identified,
            legs: Vec::new(),
            mispricing_source: None,
            expected_profit: Decimal::ZERO,
            max_loss: Decimal::ZERO,
            profit_probability: 0.0,
            break_even_price: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            net_exposure: Decimal::ZERO,
            value_at_risk: Decimal::ZERO,
            expected_shortfall: Decimal::ZERO,
            sharpe_ratio: 0.0,
            max_drawdown: Decimal::ZERO,
            correlation_risk: 0.0,
            identification_time,
            validation_time: None,
            expiry_time: identification_time + ttl,
            estimated_duration_ms: 0,
            slippage_estimate: 0.0,
            transaction_costs: Decimal::ZERO,
            total_volume: Decimal::ZERO,
            market_impact: 0.0,
        }
    }

    /// Advance the lifecycle; backward and out-of-terminal transitions are
    /// rejected. Stamps `validation_time` on entry into `Validated`.
    pub fn transition(&mut self, next: ArbitrageStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                opportunity_id: self.opportunity_id.clone(),
                from: self.status,
                to: next,
            });
        }
        if next == ArbitrageStatus::Validated {
            self.validation_time = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_time
    }

    /// Gross notional across all legs.
    pub fn gross_notional(&self) -> Decimal {
        self.legs.iter().map(|l| l.notional().abs()).sum()
    }

    /// Net signed weight per instrument, aggregated across legs.
    pub fn net_weights(&self) -> HashMap<InstrumentId, f64> {
        let mut net: HashMap<InstrumentId, f64> = HashMap::new();
        for leg in &self.legs {
            *net.entry(leg.instrument_id.clone()).or_insert(0.0) += leg.weight;
        }
        net
    }

    /// Two opportunities conflict iff they hold opposing net directional
    /// weight on a shared instrument.
    pub fn conflicts_with(&self, other: &ArbitrageOpportunity) -> bool {
        let mine = self.net_weights();
        let theirs = other.net_weights();
        mine.iter().any(|(instrument, w)| {
            theirs
                .get(instrument)
                .is_some_and(|v| w * v < 0.0 && w.abs() > f64::EPSILON && v.abs() > f64::EPSILON)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn opp_with_leg(weight: f64) -> ArbitrageOpportunity {
        let mut opp = ArbitrageOpportunity::new(ArbitrageType::Pure, Duration::minutes(30));
        let side = if weight >= 0.0 { Side::Ask } else { Side::Bid };
        opp.legs
            .push(ArbitrageLeg::new("BTC-USD", side, dec!(1), dec!(100), weight));
        opp
    }

    #[test]
    fn lifecycle_never_moves_backward() {
        let mut opp = opp_with_leg(1.0);
        opp.transition(ArbitrageStatus::Validated).unwrap();
        let err = opp.transition(ArbitrageStatus::Identified).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(opp.status, ArbitrageStatus::Validated);
        assert!(opp.validation_time.is_some());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut opp = opp_with_leg(1.0);
        opp.transition(ArbitrageStatus::Expired).unwrap();
        assert!(opp.transition(ArbitrageStatus::Validated).is_err());
        assert!(opp.transition(ArbitrageStatus::Executing).is_err());
        assert_eq!(opp.status, ArbitrageStatus::Expired);
    }

    #[test]
    fn opposing_net_weight_on_shared_instrument_conflicts() {
        let long = opp_with_leg(1.0);
        let short = opp_with_leg(-1.0);
        let also_long = opp_with_leg(0.5);
        assert!(long.conflicts_with(&short));
        assert!(!long.conflicts_with(&also_long));
    }
}
