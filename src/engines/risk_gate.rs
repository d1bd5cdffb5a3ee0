//! Shared validation pipeline
//!
//! Four ordered predicates gate every opportunity before it may leave the
//! Identified state: liquidity, risk limits, timing, and execution
//! feasibility. All four are independent; the gate short-circuits on the
//! first failure and logs which check tripped.

use super::ArbitrageParameters;
use crate::types::{ArbitrageOpportunity, ArbitrageStatus, MarketSnapshot, Side};
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use tracing::debug;

const TRANSACTION_COST_RATE: Decimal = dec!(0.001);
const VAR_FRACTION: Decimal = dec!(0.01);
const EXPECTED_SHORTFALL_MULTIPLIER: Decimal = dec!(1.3);
const IMPACT_VOLUME_UNIT: f64 = 1000.0;
const IMPACT_RATE: f64 = 0.001;
/// Assumed residual correlation exposure for multi-instrument structures
/// whose engine did not supply a better estimate.
const DEFAULT_MULTI_LEG_CORRELATION_RISK: f64 = 0.2;

/// Fills cost/volume/slippage/impact fields from the leg structure and the
/// snapshot the legs were priced against.
pub fn apply_execution_estimates(
    opportunity: &mut ArbitrageOpportunity,
    snapshot: &MarketSnapshot,
) {
    opportunity.total_volume = opportunity.legs.iter().map(|l| l.size).sum();
    opportunity.total_cost = opportunity.gross_notional();
    opportunity.transaction_costs = opportunity.total_cost * TRANSACTION_COST_RATE;
    opportunity.net_exposure = opportunity
        .legs
        .iter()
        .map(|l| {
            if l.weight < 0.0 {
                -l.notional()
            } else {
                l.notional()
            }
        })
        .sum();

    // Crossing half the spread on the worst leg bounds the slippage.
    opportunity.slippage_estimate = opportunity
        .legs
        .iter()
        .filter_map(|l| snapshot.quote(&l.instrument_id))
        .map(|q| q.relative_spread() / 2.0)
        .fold(0.0, f64::max);

    let volume = opportunity.total_volume.to_f64().unwrap_or(0.0);
    opportunity.market_impact = (volume / IMPACT_VOLUME_UNIT) * IMPACT_RATE;
}

/// Fills VaR, expected shortfall, Sharpe, and a correlation-risk fallback.
pub fn apply_risk_metrics(opportunity: &mut ArbitrageOpportunity) {
    opportunity.value_at_risk = opportunity.total_cost * VAR_FRACTION;
    opportunity.expected_shortfall = opportunity.value_at_risk * EXPECTED_SHORTFALL_MULTIPLIER;
    opportunity.max_drawdown = opportunity.max_loss;
    opportunity.sharpe_ratio = if opportunity.value_at_risk > Decimal::ZERO {
        (opportunity.expected_profit / opportunity.value_at_risk)
            .to_f64()
            .unwrap_or(0.0)
    } else {
        0.0
    };
    if opportunity.correlation_risk == 0.0 && opportunity.net_weights().len() > 1 {
        opportunity.correlation_risk = DEFAULT_MULTI_LEG_CORRELATION_RISK;
    }
}

pub struct RiskGate;

impl RiskGate {
    /// On pass: status becomes Validated and `validation_time` is stamped.
    /// On any failure the opportunity is left untouched.
    pub fn validate(
        opportunity: &mut ArbitrageOpportunity,
        snapshot: Option<&MarketSnapshot>,
        params: &ArbitrageParameters,
    ) -> bool {
        if opportunity.legs.is_empty() {
            debug!(id = %opportunity.opportunity_id, "rejected: no legs");
            return false;
        }
        if !Self::check_liquidity(opportunity, snapshot) {
            debug!(id = %opportunity.opportunity_id, check = "liquidity", "risk gate rejected");
            return false;
        }
        if !Self::check_risk_limits(opportunity, params) {
            debug!(id = %opportunity.opportunity_id, check = "risk_limits", "risk gate rejected");
            return false;
        }
        if !Self::check_timing(opportunity, params) {
            debug!(id = %opportunity.opportunity_id, check = "timing", "risk gate rejected");
            return false;
        }
        if !Self::check_feasibility(opportunity, params) {
            debug!(id = %opportunity.opportunity_id, check = "feasibility", "risk gate rejected");
            return false;
        }
        opportunity.transition(ArbitrageStatus::Validated).is_ok()
    }

    /// Counter-side displayed size must cover each leg.
    fn check_liquidity(
        opportunity: &ArbitrageOpportunity,
        snapshot: Option<&MarketSnapshot>,
    ) -> bool {
        let Some(snapshot) = snapshot else {
            return false;
        };
        opportunity.legs.iter().all(|leg| {
            snapshot.quote(&leg.instrument_id).is_some_and(|quote| {
                let available = match leg.side {
                    Side::Ask => quote.ask_size,
                    Side::Bid => quote.bid_size,
                };
                available >= leg.size
            })
        })
    }

    fn check_risk_limits(opportunity: &ArbitrageOpportunity, params: &ArbitrageParameters) -> bool {
        let min_profit = opportunity.total_cost
            * Decimal::from_f64(params.min_profit_threshold).unwrap_or(Decimal::ZERO);
        let max_var = opportunity.total_cost
            * Decimal::from_f64(params.max_risk_per_trade).unwrap_or(Decimal::ZERO);
        opportunity.expected_profit >= min_profit
            && opportunity.value_at_risk <= max_var
            && opportunity.correlation_risk <= params.max_correlation_risk
            && opportunity.market_impact <= params.max_market_impact
    }

    fn check_timing(opportunity: &ArbitrageOpportunity, params: &ArbitrageParameters) -> bool {
        let now = Utc::now();
        now < opportunity.expiry_time
            && opportunity.expiry_time - now >= params.execution_buffer
    }

    fn check_feasibility(opportunity: &ArbitrageOpportunity, params: &ArbitrageParameters) -> bool {
        opportunity.total_cost <= params.max_position_size
            && opportunity.slippage_estimate <= params.max_slippage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArbitrageLeg, ArbitrageType, Quote};
    use chrono::Duration;

    fn liquid_snapshot() -> MarketSnapshot {
        MarketSnapshot::new().with_quote(Quote::new(
            "BTC-USD",
            dec!(99.95),
            dec!(100.05),
            dec!(10000),
            dec!(10000),
        ))
    }

    fn candidate() -> ArbitrageOpportunity {
        let mut opp = ArbitrageOpportunity::new(ArbitrageType::Pure, Duration::minutes(30));
        opp.legs.push(ArbitrageLeg::new(
            "BTC-USD",
            Side::Ask,
            dec!(100),
            dec!(100.05),
            1.0,
        ));
        apply_execution_estimates(&mut opp, &liquid_snapshot());
        opp.expected_profit = dec!(300);
        opp.max_loss = dec!(150);
        apply_risk_metrics(&mut opp);
        opp
    }

    #[test]
    fn clean_opportunity_passes_all_four_checks() {
        let mut opp = candidate();
        assert!(RiskGate::validate(
            &mut opp,
            Some(&liquid_snapshot()),
            &ArbitrageParameters::default()
        ));
        assert_eq!(opp.status, ArbitrageStatus::Validated);
        assert!(opp.validation_time.is_some());
    }

    #[test]
    fn thin_book_fails_liquidity() {
        let mut opp = candidate();
        let thin = MarketSnapshot::new().with_quote(Quote::new(
            "BTC-USD",
            dec!(99.95),
            dec!(100.05),
            dec!(10),
            dec!(10),
        ));
        assert!(!RiskGate::validate(
            &mut opp,
            Some(&thin),
            &ArbitrageParameters::default()
        ));
        assert_eq!(opp.status, ArbitrageStatus::Identified);
    }

    #[test]
    fn excessive_var_fails_risk_limits() {
        let mut opp = candidate();
        opp.value_at_risk = opp.total_cost; // far beyond 2% of cost
        assert!(!RiskGate::validate(
            &mut opp,
            Some(&liquid_snapshot()),
            &ArbitrageParameters::default()
        ));
        assert_eq!(opp.status, ArbitrageStatus::Identified);
    }

    #[test]
    fn nearly_expired_opportunity_fails_timing() {
        let mut opp = candidate();
        opp.expiry_time = Utc::now() + Duration::seconds(30); // under the buffer
        assert!(!RiskGate::validate(
            &mut opp,
            Some(&liquid_snapshot()),
            &ArbitrageParameters::default()
        ));
    }

    #[test]
    fn oversized_notional_fails_feasibility() {
        let mut opp = candidate();
        let params = ArbitrageParameters {
            max_position_size: dec!(100),
            ..ArbitrageParameters::default()
        };
        assert!(!RiskGate::validate(&mut opp, Some(&liquid_snapshot()), &params));
    }

    #[test]
    fn missing_snapshot_rejects_everything() {
        let mut opp = candidate();
        assert!(!RiskGate::validate(
            &mut opp,
            None,
            &ArbitrageParameters::default()
        ));
    }
}
