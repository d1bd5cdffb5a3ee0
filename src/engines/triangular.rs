//! Three-leg cycle execution structures
//!
//! Holds its own triangle registry and can identify cycles straight from
//! the cached snapshot, independent of detector input. A positive residual
//! routes base notional as buy-base, sell-cross, sell-quote; a negative
//! residual runs the cycle in reverse. Leg sizes follow the routed
//! quantity, so the quote leg's size is the cross proceeds.

use super::risk_gate::{apply_execution_estimates, apply_risk_metrics};
use super::{ArbitrageEngine, ArbitrageParameters, EngineCore, ErrorCallback, OpportunityCallback};
use crate::errors::{EngineError, EngineResult};
use crate::types::{
    ArbitrageLeg, ArbitrageOpportunity, ArbitrageType, InstrumentId, MarketSnapshot,
    MispricingOpportunity, MispricingType, Quote, Side,
};
use rust_decimal::prelude::*;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct EngineTriangle {
    name: String,
    legs: [InstrumentId; 3],
}

pub struct TriangularArbitrageEngine {
    core: EngineCore,
    triangles: Mutex<Vec<EngineTriangle>>,
}

fn cycle_residual(first: &Quote, second: &Quote, cross: &Quote) -> Option<f64> {
    let ask1 = first.ask_price.to_f64()?;
    let bid2 = second.bid_price.to_f64()?;
    let bid3 = cross.bid_price.to_f64()?;
    if ask1 <= 0.0 {
        return None;
    }
    Some(bid3 * bid2 / ask1 - 1.0)
}

impl TriangularArbitrageEngine {
    pub fn new(params: ArbitrageParameters) -> Self {
        TriangularArbitrageEngine {
            core: EngineCore::new(params),
            triangles: Mutex::new(Vec::new()),
        }
    }

    pub fn add_triangle(&self, name: impl Into<String>, legs: [InstrumentId; 3]) {
        let name = name.into();
        let mut triangles = self.triangles.lock().unwrap();
        triangles.retain(|t| t.name != name);
        triangles.push(EngineTriangle { name, legs });
    }

    pub fn remove_triangle(&self, name: &str) {
        self.triangles.lock().unwrap().retain(|t| t.name != name);
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.lock().unwrap().len()
    }

    /// Builds the three-leg structure for one cycle. `residual` decides the
    /// routing direction; sizes carry the routed quantity through the legs.
    fn build_cycle(
        &self,
        legs: &[InstrumentId; 3],
        residual: f64,
        snapshot: &MarketSnapshot,
        params: &ArbitrageParameters,
        source: Option<&MispricingOpportunity>,
    ) -> EngineResult<ArbitrageOpportunity> {
        let [base, quote_leg, cross] = legs;
        let q_base = snapshot.quote(base).ok_or_else(|| EngineError::MissingQuote {
            instrument: base.clone(),
        })?;
        let q_quote = snapshot
            .quote(quote_leg)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: quote_leg.clone(),
            })?;
        let q_cross = snapshot
            .quote(cross)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: cross.clone(),
            })?;

        let forward = residual >= 0.0;
        let (base_side, base_price) = if forward {
            (Side::Ask, q_base.ask_price)
        } else {
            (Side::Bid, q_base.bid_price)
        };
        let (cross_side, cross_price) = if forward {
            (Side::Bid, q_cross.bid_price)
        } else {
            (Side::Ask, q_cross.ask_price)
        };
        let (quote_side, quote_price) = if forward {
            (Side::Bid, q_quote.bid_price)
        } else {
            (Side::Ask, q_quote.ask_price)
        };

        if base_price <= Decimal::ZERO {
            return Err(EngineError::MissingQuote {
                instrument: base.clone(),
            });
        }
        // base_order_size is the routed notional, not a unit count.
        let base_qty = params.base_order_size / base_price;
        let quote_qty = base_qty * cross_price;
        let sign = if forward { 1.0 } else { -1.0 };

        let mut opportunity =
            ArbitrageOpportunity::new(ArbitrageType::Triangular, params.max_holding_period);
        opportunity
            .legs
            .push(ArbitrageLeg::new(base.clone(), base_side, base_qty, base_price, sign));
        opportunity.legs.push(ArbitrageLeg::new(
            cross.clone(),
            cross_side,
            base_qty,
            cross_price,
            -sign,
        ));
        opportunity.legs.push(ArbitrageLeg::new(
            quote_leg.clone(),
            quote_side,
            quote_qty,
            quote_price,
            -sign,
        ));

        opportunity.expected_profit = params.base_order_size
            * Decimal::from_f64(residual.abs()).unwrap_or(Decimal::ZERO);
        opportunity.max_loss = opportunity.expected_profit / Decimal::TWO;
        opportunity.break_even_price = q_base.mid();
        opportunity.profit_probability = source.map_or(0.9, |m| m.confidence_level);
        opportunity.estimated_duration_ms = params.max_holding_period.num_milliseconds();
        opportunity.mispricing_source = source.cloned();

        apply_execution_estimates(&mut opportunity, snapshot);
        apply_risk_metrics(&mut opportunity);
        Ok(opportunity)
    }

    fn has_active_cycle(&self, legs: &[InstrumentId; 3]) -> bool {
        self.core.active().iter().any(|opp| {
            opp.legs.len() == 3 && legs.iter().all(|l| {
                opp.legs.iter().any(|leg| &leg.instrument_id == l)
            })
        })
    }
}

impl ArbitrageEngine for TriangularArbitrageEngine {
    fn engine_name(&self) -> &'static str {
        "triangular"
    }

    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.core.absorb_snapshot(snapshot);
    }

    fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()> {
        if mispricing.mispricing_type != MispricingType::Triangular {
            return Ok(());
        }
        if mispricing.component_instruments.len() != 3 {
            debug!(
                instrument = %mispricing.target_instrument,
                "triangular mispricing without a full leg triple"
            );
            return Ok(());
        }
        let params = self.core.params();
        if mispricing.confidence_level < params.min_confidence_level {
            return Ok(());
        }
        let Some(snapshot) = self.core.snapshot() else {
            return Ok(());
        };
        let legs: [InstrumentId; 3] = [
            mispricing.component_instruments[0].clone(),
            mispricing.component_instruments[1].clone(),
            mispricing.component_instruments[2].clone(),
        ];
        let opportunity = self.build_cycle(
            &legs,
            mispricing.deviation_percentage,
            &snapshot,
            &params,
            Some(mispricing),
        )?;
        self.core.admit(opportunity);
        Ok(())
    }

    /// Scans every registered triangle against the cached snapshot; cycles
    /// whose residual clears the profit threshold are gated and admitted.
    fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        let Some(snapshot) = self.core.snapshot() else {
            return Vec::new();
        };
        let params = self.core.params();
        let triangles = self.triangles.lock().unwrap().clone();
        let mut admitted = Vec::new();

        for triangle in &triangles {
            let [base, quote_leg, cross] = &triangle.legs;
            let (Some(q_base), Some(q_quote), Some(q_cross)) = (
                snapshot.quote(base),
                snapshot.quote(quote_leg),
                snapshot.quote(cross),
            ) else {
                continue;
            };
            let Some(residual) = cycle_residual(q_base, q_quote, q_cross) else {
                continue;
            };
            if residual.abs() < params.min_profit_threshold {
                continue;
            }
            if self.has_active_cycle(&triangle.legs) {
                continue;
            }
            match self.build_cycle(&triangle.legs, residual, &snapshot, &params, None) {
                Ok(opportunity) => {
                    debug!(
                        triangle = %triangle.name,
                        residual = residual,
                        "cycle residual above threshold"
                    );
                    let id = opportunity.opportunity_id.clone();
                    if self.core.admit(opportunity) {
                        if let Some(opp) = self.core.find(&id) {
                            admitted.push(opp);
                        }
                    }
                }
                Err(error) => {
                    self.core.callbacks.fire_error(&error.to_string());
                }
            }
        }
        admitted
    }

    fn validate_opportunity(&self, opportunity: &mut ArbitrageOpportunity) -> bool {
        self.core.validate_against_cache(opportunity)
    }

    fn get_active_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        self.core.active()
    }

    fn get_opportunity(&self, opportunity_id: &str) -> Option<ArbitrageOpportunity> {
        self.core.find(opportunity_id)
    }

    fn clear_opportunities(&self) {
        self.core.clear();
    }

    fn set_opportunity_callback(&self, callback: OpportunityCallback) {
        self.core.callbacks.set_opportunity(callback);
    }

    fn set_expiry_callback(&self, callback: OpportunityCallback) {
        self.core.callbacks.set_expiry(callback);
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.core.callbacks.set_error(callback);
    }

    fn update_parameters(&self, params: ArbitrageParameters) -> EngineResult<()> {
        params.validate()?;
        self.core.set_params(params);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArbitrageStatus;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn engine() -> TriangularArbitrageEngine {
        let eng = TriangularArbitrageEngine::new(ArbitrageParameters::default());
        eng.add_triangle(
            "btc-eth-usd",
            ["BTC-USD".into(), "ETH-USD".into(), "BTC-ETH".into()],
        );
        eng
    }

    fn snapshot(cross_bid: Decimal) -> MarketSnapshot {
        MarketSnapshot::new()
            .with_quote(Quote::new("BTC-USD", dec!(49995), dec!(50005), dec!(10), dec!(10)))
            .with_quote(Quote::new("ETH-USD", dec!(1999.8), dec!(2000.2), dec!(100), dec!(100)))
            .with_quote(Quote::new(
                "BTC-ETH",
                cross_bid,
                cross_bid + dec!(0.002),
                dec!(10),
                dec!(10),
            ))
    }

    #[test]
    fn balanced_cycle_identifies_nothing() {
        let eng = engine();
        eng.update_market_data(&snapshot(dec!(25)));
        assert!(eng.identify_opportunities().is_empty());
    }

    #[test]
    fn dislocated_cross_becomes_a_three_leg_structure() {
        let eng = engine();
        // 25.5 * 2000 / 50005 - 1, roughly a 2% residual
        eng.update_market_data(&snapshot(dec!(25.5)));
        let admitted = eng.identify_opportunities();
        assert_eq!(admitted.len(), 1);
        let opp = &admitted[0];
        assert_eq!(opp.status, ArbitrageStatus::Validated);
        assert_eq!(opp.arbitrage_type, ArbitrageType::Triangular);
        assert_eq!(opp.legs.len(), 3);
        assert_eq!(opp.legs[0].side, Side::Ask);
        assert_eq!(opp.legs[1].side, Side::Bid);
        assert_eq!(opp.legs[2].side, Side::Bid);
        // Quote-leg size carries the cross proceeds
        assert!(opp.legs[2].size > opp.legs[0].size);
    }

    #[test]
    fn live_cycle_is_not_duplicated() {
        let eng = engine();
        eng.update_market_data(&snapshot(dec!(25.5)));
        assert_eq!(eng.identify_opportunities().len(), 1);
        assert!(eng.identify_opportunities().is_empty());
        assert_eq!(eng.get_active_opportunities().len(), 1);
    }

    #[test]
    fn detector_mispricing_is_converted() {
        let eng = engine();
        eng.update_market_data(&snapshot(dec!(25.5)));
        let mispricing = MispricingOpportunity::new(
            "BTC-USD",
            MispricingType::Triangular,
            dec!(51000),
            dec!(50000),
            0.0196,
            3.5,
            0.93,
            Duration::minutes(30),
        )
        .with_components(
            vec!["BTC-USD".into(), "ETH-USD".into(), "BTC-ETH".into()],
            vec![1.0, 1.0, 1.0],
        );
        eng.process_mispricing(&mispricing).unwrap();
        assert_eq!(eng.get_active_opportunities().len(), 1);
    }

    #[test]
    fn incomplete_leg_triples_are_ignored() {
        let eng = engine();
        eng.update_market_data(&snapshot(dec!(25.5)));
        let mispricing = MispricingOpportunity::new(
            "BTC-USD",
            MispricingType::Triangular,
            dec!(51000),
            dec!(50000),
            0.0196,
            3.5,
            0.93,
            Duration::minutes(30),
        )
        .with_components(vec!["BTC-USD".into()], vec![1.0]);
        eng.process_mispricing(&mispricing).unwrap();
        assert!(eng.get_active_opportunities().is_empty());
    }
}
