//! Venue-spread capture with replication hedging
//!
//! Converts cross-venue mispricings into buy-cheap / sell-rich structures.
//! Venue economics come from an explicit registry of per-exchange taker
//! costs and round-trip latencies; without venue attribution on the
//! mispricing itself, the most expensive registered route is assumed, so
//! the haircut is conservative. When the mispricing carries replication
//! components the rich side is hedged with that basket instead of an
//! outright opposite leg.

use super::risk_gate::{apply_execution_estimates, apply_risk_metrics};
use super::{ArbitrageEngine, ArbitrageParameters, EngineCore, ErrorCallback, OpportunityCallback};
use crate::errors::{EngineError, EngineResult};
use crate::types::{
    ArbitrageLeg, ArbitrageOpportunity, ArbitrageType, MarketSnapshot, MispricingOpportunity,
    MispricingType, Side,
};
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Edge lost per millisecond of route latency.
const LATENCY_PENALTY_PER_MS: f64 = 1e-6;
/// Both legs reference the same underlying across venues.
const VENUE_CORRELATION_RISK: f64 = 0.05;
const DEFAULT_VENUE_COST: f64 = 0.001;

#[derive(Debug, Clone)]
struct VenueProfile {
    taker_cost: f64,
    latency_ms: u64,
}

pub struct CrossExchangeReplicationEngine {
    core: EngineCore,
    venues: Mutex<HashMap<String, VenueProfile>>,
}

impl CrossExchangeReplicationEngine {
    pub fn new(params: ArbitrageParameters) -> Self {
        CrossExchangeReplicationEngine {
            core: EngineCore::new(params),
            venues: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_exchange(&self, exchange: impl Into<String>, taker_cost: f64, latency_ms: u64) {
        self.venues.lock().unwrap().insert(
            exchange.into(),
            VenueProfile {
                taker_cost,
                latency_ms,
            },
        );
    }

    pub fn exchange_count(&self) -> usize {
        self.venues.lock().unwrap().len()
    }

    /// Cost plus latency penalty for the worst two-venue route. With fewer
    /// than two registered venues the default taker cost fills the gap.
    fn route_haircut(&self) -> f64 {
        let venues = self.venues.lock().unwrap();
        let mut costs: Vec<f64> = venues.values().map(|v| v.taker_cost).collect();
        costs.sort_by(|a, b| b.total_cmp(a));
        let cost = match costs.as_slice() {
            [] => 2.0 * DEFAULT_VENUE_COST,
            [only] => only + DEFAULT_VENUE_COST,
            [first, second, ..] => first + second,
        };
        let latency: u64 = {
            let mut latencies: Vec<u64> = venues.values().map(|v| v.latency_ms).collect();
            latencies.sort_unstable_by(|a, b| b.cmp(a));
            latencies.iter().take(2).sum()
        };
        cost + latency as f64 * LATENCY_PENALTY_PER_MS
    }

    fn build_replication(
        &self,
        mispricing: &MispricingOpportunity,
        net_edge: f64,
        snapshot: &MarketSnapshot,
        params: &ArbitrageParameters,
    ) -> EngineResult<ArbitrageOpportunity> {
        if snapshot.quote(&mispricing.target_instrument).is_none() {
            return Err(EngineError::MissingQuote {
                instrument: mispricing.target_instrument.clone(),
            });
        }

        let base = params.base_order_size;
        let mut opportunity = ArbitrageOpportunity::new(
            ArbitrageType::CrossExchangeReplication,
            params.max_holding_period,
        );

        // Cheap side: market_price is the best available ask.
        opportunity.legs.push(ArbitrageLeg::new(
            mispricing.target_instrument.clone(),
            Side::Ask,
            base,
            mispricing.market_price,
            1.0,
        ));

        if mispricing.component_instruments.is_empty() {
            // Rich side is the same instrument sold on the other venue.
            opportunity.legs.push(ArbitrageLeg::new(
                mispricing.target_instrument.clone(),
                Side::Bid,
                base,
                mispricing.theoretical_price,
                -1.0,
            ));
        } else {
            for (component, weight) in mispricing
                .component_instruments
                .iter()
                .zip(&mispricing.weights)
            {
                let hedge_weight = -weight;
                let hedge_quote =
                    snapshot
                        .quote(component)
                        .ok_or_else(|| EngineError::MissingQuote {
                            instrument: component.clone(),
                        })?;
                let (side, price) = if hedge_weight >= 0.0 {
                    (Side::Ask, hedge_quote.ask_price)
                } else {
                    (Side::Bid, hedge_quote.bid_price)
                };
                opportunity.legs.push(ArbitrageLeg::new(
                    component.clone(),
                    side,
                    base * Decimal::from_f64(weight.abs()).unwrap_or(Decimal::ZERO),
                    price,
                    hedge_weight,
                ));
            }
        }

        opportunity.expected_profit = base
            * mispricing.market_price
            * Decimal::from_f64(net_edge).unwrap_or(Decimal::ZERO);
        opportunity.max_loss = opportunity.expected_profit / Decimal::TWO;
        opportunity.break_even_price = mispricing.theoretical_price;
        opportunity.profit_probability = mispricing.confidence_level;
        opportunity.estimated_duration_ms = params.max_holding_period.num_milliseconds();
        opportunity.mispricing_source = Some(mispricing.clone());
        opportunity.correlation_risk = VENUE_CORRELATION_RISK;

        apply_execution_estimates(&mut opportunity, snapshot);
        apply_risk_metrics(&mut opportunity);
        Ok(opportunity)
    }
}

impl ArbitrageEngine for CrossExchangeReplicationEngine {
    fn engine_name(&self) -> &'static str {
        "cross_exchange"
    }

    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.core.absorb_snapshot(snapshot);
    }

    fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()> {
        if mispricing.mispricing_type != MispricingType::CrossExchange {
            return Ok(());
        }
        let params = self.core.params();
        if mispricing.confidence_level < params.min_confidence_level {
            return Ok(());
        }
        let Some(snapshot) = self.core.snapshot() else {
            return Ok(());
        };
        let (Some(ask), Some(bid)) = (
            mispricing.market_price.to_f64(),
            mispricing.theoretical_price.to_f64(),
        ) else {
            return Ok(());
        };
        if ask <= 0.0 {
            return Ok(());
        }
        let gross = (bid - ask) / ask;
        let net_edge = gross - self.route_haircut();
        if net_edge < params.min_profit_threshold {
            debug!(
                instrument = %mispricing.target_instrument,
                gross = gross,
                net = net_edge,
                "venue costs absorb the spread"
            );
            return Ok(());
        }
        let opportunity = self.build_replication(mispricing, net_edge, &snapshot, &params)?;
        self.core.admit(opportunity);
        Ok(())
    }

    fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        // Venue books live upstream in the detector; nothing to self-scan.
        self.core.active()
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
    use crate::types::{ArbitrageStatus, Quote};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot::new()
            .with_quote(Quote::new(
                "BTC-USD",
                dec!(99.95),
                dec!(100.05),
                dec!(10000),
                dec!(10000),
            ))
            .with_quote(Quote::new(
                "ETH-USD",
                dec!(49.98),
                dec!(50.02),
                dec!(20000),
                dec!(20000),
            ))
    }

    fn venue_spread() -> MispricingOpportunity {
        // Best ask 100 on one venue, best bid 101 on another
        MispricingOpportunity::new(
            "BTC-USD",
            MispricingType::CrossExchange,
            dec!(100),
            dec!(101),
            -0.01,
            3.0,
            0.9,
            Duration::minutes(30),
        )
    }

    fn engine() -> CrossExchangeReplicationEngine {
        let eng = CrossExchangeReplicationEngine::new(ArbitrageParameters::default());
        eng.register_exchange("alpha", 0.0005, 50);
        eng.register_exchange("beta", 0.001, 100);
        eng
    }

    #[test]
    fn venue_spread_becomes_buy_and_sell_legs() {
        let eng = engine();
        eng.update_market_data(&snapshot());
        eng.process_mispricing(&venue_spread()).unwrap();

        let active = eng.get_active_opportunities();
        assert_eq!(active.len(), 1);
        let opp = &active[0];
        assert_eq!(opp.status, ArbitrageStatus::Validated);
        assert_eq!(opp.arbitrage_type, ArbitrageType::CrossExchangeReplication);
        assert_eq!(opp.legs.len(), 2);
        assert_eq!(opp.legs[0].side, Side::Ask);
        assert_eq!(opp.legs[0].entry_price, dec!(100));
        assert_eq!(opp.legs[1].side, Side::Bid);
        assert_eq!(opp.legs[1].entry_price, dec!(101));
        // Haircut leaves less than the 1% gross spread
        assert!(opp.expected_profit < dec!(100) * dec!(100) * dec!(0.01));
    }

    #[test]
    fn expensive_route_absorbs_the_spread() {
        let eng = CrossExchangeReplicationEngine::new(ArbitrageParameters::default());
        eng.register_exchange("alpha", 0.006, 50);
        eng.register_exchange("beta", 0.006, 100);
        eng.update_market_data(&snapshot());
        eng.process_mispricing(&venue_spread()).unwrap();
        assert!(eng.get_active_opportunities().is_empty());
    }

    #[test]
    fn replication_components_hedge_the_rich_side() {
        let eng = engine();
        eng.update_market_data(&snapshot());
        let mispricing = venue_spread().with_components(vec!["ETH-USD".into()], vec![2.0]);
        eng.process_mispricing(&mispricing).unwrap();

        let active = eng.get_active_opportunities();
        assert_eq!(active.len(), 1);
        let legs = &active[0].legs;
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[1].instrument_id, "ETH-USD");
        assert_eq!(legs[1].side, Side::Bid);
        assert_eq!(legs[1].size, dec!(200));
    }

    #[test]
    fn foreign_mispricing_types_are_ignored() {
        let eng = engine();
        eng.update_market_data(&snapshot());
        let mut other = venue_spread();
        other.mispricing_type = MispricingType::Statistical;
        eng.process_mispricing(&other).unwrap();
        assert!(eng.get_active_opportunities().is_empty());
    }

    #[test]
    fn unregistered_venues_fall_back_to_default_costs() {
        let eng = CrossExchangeReplicationEngine::new(ArbitrageParameters::default());
        eng.update_market_data(&snapshot());
        // 1% gross against the 0.2% default route still clears
        eng.process_mispricing(&venue_spread()).unwrap();
        assert_eq!(eng.get_active_opportunities().len(), 1);
    }
}
