//! General mispricing-to-arbitrage conversion
//!
//! The workhorse engine: takes any sufficiently confident mispricing and
//! builds a convergence trade. The primary leg trades the mispriced
//! instrument toward its theoretical price; one hedge leg per component
//! offsets the exposure. When a sizing collaborator is attached the whole
//! structure is rescaled to its notional.

use super::risk_gate::{apply_execution_estimates, apply_risk_metrics};
use super::{ArbitrageEngine, ArbitrageParameters, EngineCore, ErrorCallback, OpportunityCallback};
use crate::errors::{EngineError, EngineResult};
use crate::sizing::{PositionSizer, RiskParameters};
use crate::types::{
    ArbitrageLeg, ArbitrageOpportunity, ArbitrageType, MarketSnapshot, MispricingOpportunity,
    Portfolio, Side,
};
use chrono::Utc;
use rust_decimal::prelude::*;
use std::sync::{Arc, Mutex};
use tracing::debug;

struct SizingContext {
    sizer: Arc<dyn PositionSizer>,
    portfolio: Portfolio,
    risk_params: RiskParameters,
}

pub struct GeneralArbitrageEngine {
    core: EngineCore,
    sizing: Mutex<Option<SizingContext>>,
}

impl GeneralArbitrageEngine {
    pub fn new(params: ArbitrageParameters) -> Self {
        GeneralArbitrageEngine {
            core: EngineCore::new(params),
            sizing: Mutex::new(None),
        }
    }

    /// Attach a sizing collaborator; subsequent structures are rescaled to
    /// its notional. Sizer failures propagate out of `process_mispricing`.
    pub fn attach_sizer(
        &self,
        sizer: Arc<dyn PositionSizer>,
        portfolio: Portfolio,
        risk_params: RiskParameters,
    ) {
        *self.sizing.lock().unwrap() = Some(SizingContext {
            sizer,
            portfolio,
            risk_params,
        });
    }

    fn build_opportunity(
        &self,
        mispricing: &MispricingOpportunity,
        snapshot: &MarketSnapshot,
        params: &ArbitrageParameters,
    ) -> EngineResult<Option<ArbitrageOpportunity>> {
        let quote = snapshot
            .quote(&mispricing.target_instrument)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: mispricing.target_instrument.clone(),
            })?;

        // Thin primary books are not worth structuring against.
        let displayed = (quote.bid_size + quote.ask_size) * quote.mid();
        if displayed < params.min_liquidity_requirement {
            debug!(
                instrument = %mispricing.target_instrument,
                "book below liquidity floor, skipping"
            );
            return Ok(None);
        }

        let now = Utc::now();
        let ttl = (mispricing.expiry_time - now).min(params.max_holding_period);
        let mut opportunity = ArbitrageOpportunity::new(ArbitrageType::Pure, ttl);

        // Trade toward theoretical value: buy when the market is cheap.
        let direction = if mispricing.market_price < mispricing.theoretical_price {
            1.0
        } else {
            -1.0
        };
        let (side, entry_price) = if direction > 0.0 {
            (Side::Ask, quote.ask_price)
        } else {
            (Side::Bid, quote.bid_price)
        };
        let base = params.base_order_size;
        opportunity.legs.push(ArbitrageLeg::new(
            mispricing.target_instrument.clone(),
            side,
            base,
            entry_price,
            direction,
        ));

        for (component, weight) in mispricing
            .component_instruments
            .iter()
            .zip(&mispricing.weights)
        {
            let hedge_weight = -direction * weight;
            let hedge_quote =
                snapshot
                    .quote(component)
                    .ok_or_else(|| EngineError::MissingQuote {
                        instrument: component.clone(),
                    })?;
            let (hedge_side, hedge_price) = if hedge_weight >= 0.0 {
                (Side::Ask, hedge_quote.ask_price)
            } else {
                (Side::Bid, hedge_quote.bid_price)
            };
            let hedge_size =
                base * Decimal::from_f64(weight.abs()).unwrap_or(Decimal::ZERO);
            opportunity.legs.push(ArbitrageLeg::new(
                component.clone(),
                hedge_side,
                hedge_size,
                hedge_price,
                hedge_weight,
            ));
        }

        let edge = (mispricing.market_price - mispricing.theoretical_price).abs();
        opportunity.expected_profit = edge * base;
        opportunity.max_loss = opportunity.expected_profit / Decimal::TWO;
        opportunity.break_even_price = mispricing.theoretical_price;
        opportunity.profit_probability = mispricing.confidence_level;
        opportunity.estimated_duration_ms = ttl.num_milliseconds();
        opportunity.mispricing_source = Some(mispricing.clone());

        if let Some(context) = self.sizing.lock().unwrap().as_ref() {
            let target_notional = context.sizer.calculate_optimal_position_size(
                &opportunity,
                &context.portfolio,
                &context.risk_params,
            )?;
            let primary_notional = opportunity.legs[0].notional();
            if target_notional > Decimal::ZERO && primary_notional > Decimal::ZERO {
                let scale = target_notional / primary_notional;
                for leg in &mut opportunity.legs {
                    leg.size *= scale;
                }
                opportunity.expected_profit *= scale;
                opportunity.max_loss *= scale;
            }
        }

        apply_execution_estimates(&mut opportunity, snapshot);
        apply_risk_metrics(&mut opportunity);
        Ok(Some(opportunity))
    }
}

impl ArbitrageEngine for GeneralArbitrageEngine {
    fn engine_name(&self) -> &'static str {
        "general"
    }

    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.core.absorb_snapshot(snapshot);
    }

    fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()> {
        let params = self.core.params();
        if mispricing.confidence_level < params.min_confidence_level {
            return Ok(());
        }
        let Some(snapshot) = self.core.snapshot() else {
            return Ok(());
        };
        if let Some(opportunity) = self.build_opportunity(mispricing, &snapshot, &params)? {
            self.core.admit(opportunity);
        }
        Ok(())
    }

    fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        // Nothing to scan without external mispricing input.
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
    use crate::sizing::KellySizer;
    use crate::types::{ArbitrageStatus, MispricingType, Quote};
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

    fn cheap_mispricing() -> MispricingOpportunity {
        MispricingOpportunity::new(
            "BTC-USD",
            MispricingType::Statistical,
            dec!(100),
            dec!(103),
            -0.029,
            3.1,
            0.92,
            Duration::minutes(30),
        )
    }

    #[test]
    fn mispricing_becomes_a_validated_buy() {
        let engine = GeneralArbitrageEngine::new(ArbitrageParameters::default());
        engine.update_market_data(&snapshot());
        engine.process_mispricing(&cheap_mispricing()).unwrap();

        let active = engine.get_active_opportunities();
        assert_eq!(active.len(), 1);
        let opp = &active[0];
        assert_eq!(opp.status, ArbitrageStatus::Validated);
        assert_eq!(opp.legs.len(), 1);
        assert_eq!(opp.legs[0].side, Side::Ask);
        assert_eq!(opp.legs[0].weight, 1.0);
        assert!(opp.expected_profit > Decimal::ZERO);
    }

    #[test]
    fn components_produce_opposing_hedge_legs() {
        let engine = GeneralArbitrageEngine::new(ArbitrageParameters::default());
        engine.update_market_data(&snapshot());
        let mispricing = cheap_mispricing()
            .with_components(vec!["ETH-USD".into()], vec![2.0]);
        engine.process_mispricing(&mispricing).unwrap();

        let active = engine.get_active_opportunities();
        assert_eq!(active.len(), 1);
        let legs = &active[0].legs;
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[1].instrument_id, "ETH-USD");
        assert_eq!(legs[1].weight, -2.0);
        assert_eq!(legs[1].side, Side::Bid);
        assert_eq!(legs[1].size, dec!(200));
    }

    #[test]
    fn low_confidence_mispricings_are_ignored() {
        let engine = GeneralArbitrageEngine::new(ArbitrageParameters::default());
        engine.update_market_data(&snapshot());
        let mut weak = cheap_mispricing();
        weak.confidence_level = 0.4;
        engine.process_mispricing(&weak).unwrap();
        assert!(engine.get_active_opportunities().is_empty());
    }

    #[test]
    fn missing_hedge_quote_propagates() {
        let engine = GeneralArbitrageEngine::new(ArbitrageParameters::default());
        engine.update_market_data(&snapshot());
        let mispricing = cheap_mispricing()
            .with_components(vec!["SOL-USD".into()], vec![1.0]);
        let err = engine.process_mispricing(&mispricing).unwrap_err();
        assert!(matches!(err, EngineError::MissingQuote { .. }));
    }

    #[test]
    fn attached_sizer_rescales_the_structure() {
        let engine = GeneralArbitrageEngine::new(ArbitrageParameters::default());
        engine.attach_sizer(
            Arc::new(KellySizer::new()),
            Portfolio::new(dec!(1000000)),
            RiskParameters::default(),
        );
        engine.update_market_data(&snapshot());
        engine.process_mispricing(&cheap_mispricing()).unwrap();

        let active = engine.get_active_opportunities();
        assert_eq!(active.len(), 1);
        // Kelly on a strong edge caps at 5% of the portfolio
        let notional = active[0].legs[0].notional();
        assert!(notional > dec!(49999));
        assert!(notional < dec!(50001));
    }

    #[test]
    fn expired_entries_are_swept_on_update() {
        let engine = GeneralArbitrageEngine::new(ArbitrageParameters::default());
        engine.update_market_data(&snapshot());
        engine.process_mispricing(&cheap_mispricing()).unwrap();
        assert_eq!(engine.get_active_opportunities().len(), 1);

        {
            // Force the active entry past its expiry
            let mut state = engine.core.state.lock().unwrap();
            state.active[0].expiry_time = Utc::now() - Duration::seconds(1);
        }
        engine.update_market_data(&snapshot());
        assert!(engine.get_active_opportunities().is_empty());
    }
}
