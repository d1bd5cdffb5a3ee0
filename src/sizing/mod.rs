//! Exposure / sizing collaborator boundary
//!
//! Position sizing formulas (full Kelly, Monte Carlo VaR) live outside this
//! crate; engines consume them through `PositionSizer`. `KellySizer` is a
//! fractional-Kelly reference implementation.

use crate::errors::{EngineError, EngineResult};
use crate::types::{ArbitrageOpportunity, Portfolio};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Cap on a single opportunity as a fraction of portfolio value.
    pub max_position_size_percentage: f64,
    pub max_portfolio_var: f64,
    pub max_individual_var: f64,
    pub max_correlation_risk: f64,
    pub max_leverage: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        RiskParameters {
            max_position_size_percentage: 0.05,
            max_portfolio_var: 0.02,
            max_individual_var: 0.01,
            max_correlation_risk: 0.3,
            max_leverage: 3.0,
        }
    }
}

impl RiskParameters {
    pub fn validate(&self) -> EngineResult<()> {
        let checks = [
            ("max_position_size_percentage", self.max_position_size_percentage),
            ("max_portfolio_var", self.max_portfolio_var),
            ("max_individual_var", self.max_individual_var),
            ("max_correlation_risk", self.max_correlation_risk),
            ("max_leverage", self.max_leverage),
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
        Ok(())
    }
}

pub trait PositionSizer: Send + Sync {
    /// Returns a notional size, non-negative and bounded by
    /// `max_position_size_percentage * portfolio_value`.
    fn calculate_optimal_position_size(
        &self,
        opportunity: &ArbitrageOpportunity,
        portfolio: &Portfolio,
        risk_params: &RiskParameters,
    ) -> EngineResult<Decimal>;
}

/// Half-Kelly sizing on the opportunity's win probability and payoff ratio.
pub struct KellySizer {
    kelly_fraction: f64,
}

impl KellySizer {
    pub fn new() -> Self {
        KellySizer { kelly_fraction: 0.5 }
    }
}

impl Default for KellySizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionSizer for KellySizer {
    fn calculate_optimal_position_size(
        &self,
        opportunity: &ArbitrageOpportunity,
        portfolio: &Portfolio,
        risk_params: &RiskParameters,
    ) -> EngineResult<Decimal> {
        risk_params.validate()?;

        let p = opportunity.profit_probability.clamp(0.0, 1.0);
        let win = opportunity.expected_profit.to_f64().unwrap_or(0.0);
        let loss = opportunity.max_loss.to_f64().unwrap_or(0.0).abs();

        let kelly = if win <= 0.0 {
            0.0
        } else if loss <= f64::EPSILON {
            // No modeled downside; fall back to the hard cap.
            risk_params.max_position_size_percentage
        } else {
            let b = win / loss;
            (p - (1.0 - p) / b) * self.kelly_fraction
        };

        let fraction = kelly.clamp(0.0, risk_params.max_position_size_percentage);
        let notional = portfolio.portfolio_value
            * Decimal::from_f64(fraction).ok_or(EngineError::InvalidParameter {
                name: "kelly_fraction",
                value: fraction,
                reason: "not representable",
            })?;
        Ok(notional.max(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArbitrageType;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn opportunity(profit: Decimal, loss: Decimal, p: f64) -> ArbitrageOpportunity {
        let mut opp = ArbitrageOpportunity::new(ArbitrageType::Pure, Duration::minutes(30));
        opp.expected_profit = profit;
        opp.max_loss = loss;
        opp.profit_probability = p;
        opp
    }

    #[test]
    fn size_is_bounded_by_portfolio_cap() {
        let sizer = KellySizer::new();
        let portfolio = Portfolio::new(dec!(1000000));
        let params = RiskParameters::default();
        let size = sizer
            .calculate_optimal_position_size(&opportunity(dec!(500), dec!(10), 0.99), &portfolio, &params)
            .unwrap();
        assert!(size >= Decimal::ZERO);
        assert!(size <= dec!(50000)); // 5% of 1M
    }

    #[test]
    fn losing_proposition_sizes_to_zero() {
        let sizer = KellySizer::new();
        let portfolio = Portfolio::new(dec!(1000000));
        let size = sizer
            .calculate_optimal_position_size(
                &opportunity(dec!(10), dec!(100), 0.1),
                &portfolio,
                &RiskParameters::default(),
            )
            .unwrap();
        assert_eq!(size, Decimal::ZERO);
    }

    #[test]
    fn malformed_risk_parameters_are_rejected() {
        let sizer = KellySizer::new();
        let portfolio = Portfolio::new(dec!(1000000));
        let params = RiskParameters {
            max_position_size_percentage: -0.1,
            ..RiskParameters::default()
        };
        let err = sizer
            .calculate_optimal_position_size(&opportunity(dec!(10), dec!(5), 0.7), &portfolio, &params)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter { .. }));
    }
}
