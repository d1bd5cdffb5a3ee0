//! Listed basket versus component replication
//!
//! Each defined basket is repriced from its components through the injected
//! `PricingModel`. When the listed product drifts from its replication the
//! engine builds an N+1 leg structure: the listed product traded toward
//! fair value, with every component hedged at the model's weights. Baskets
//! whose synthetic carries weak confidence are skipped, and pricing
//! failures are routed to the error callback rather than aborting the scan.

use super::risk_gate::{apply_execution_estimates, apply_risk_metrics};
use super::{ArbitrageEngine, ArbitrageParameters, EngineCore, ErrorCallback, OpportunityCallback};
use crate::errors::{EngineError, EngineResult};
use crate::pricing::PricingModel;
use crate::types::{
    ArbitrageLeg, ArbitrageOpportunity, ArbitrageType, InstrumentId, MarketSnapshot,
    MispricingOpportunity, MispricingType, Side,
};
use chrono::Utc;
use rust_decimal::prelude::*;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone)]
struct BasketDefinition {
    name: String,
    target: InstrumentId,
    components: Vec<InstrumentId>,
}

pub struct MultiInstrumentBasketEngine {
    core: EngineCore,
    model: Arc<dyn PricingModel>,
    baskets: Mutex<Vec<BasketDefinition>>,
}

impl MultiInstrumentBasketEngine {
    pub fn new(params: ArbitrageParameters, model: Arc<dyn PricingModel>) -> Self {
        MultiInstrumentBasketEngine {
            core: EngineCore::new(params),
            model,
            baskets: Mutex::new(Vec::new()),
        }
    }

    pub fn define_basket(
        &self,
        name: impl Into<String>,
        target: impl Into<InstrumentId>,
        components: Vec<InstrumentId>,
    ) {
        let name = name.into();
        let mut baskets = self.baskets.lock().unwrap();
        baskets.retain(|b| b.name != name);
        baskets.push(BasketDefinition {
            name,
            target: target.into(),
            components,
        });
    }

    pub fn basket_count(&self) -> usize {
        self.baskets.lock().unwrap().len()
    }

    fn build_structure(
        &self,
        target: &InstrumentId,
        components: &[InstrumentId],
        weights: &[f64],
        market_price: Decimal,
        theoretical_price: Decimal,
        confidence: f64,
        snapshot: &MarketSnapshot,
        params: &ArbitrageParameters,
        source: Option<&MispricingOpportunity>,
    ) -> EngineResult<ArbitrageOpportunity> {
        let quote = snapshot
            .quote(target)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: target.clone(),
            })?;

        let direction = if market_price < theoretical_price {
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

        let ttl = source.map_or(params.max_holding_period, |m| {
            (m.expiry_time - Utc::now()).min(params.max_holding_period)
        });
        let mut opportunity = ArbitrageOpportunity::new(ArbitrageType::MultiInstrumentBasket, ttl);
        opportunity
            .legs
            .push(ArbitrageLeg::new(target.clone(), side, base, entry_price, direction));

        for (component, weight) in components.iter().zip(weights) {
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
            opportunity.legs.push(ArbitrageLeg::new(
                component.clone(),
                hedge_side,
                base * Decimal::from_f64(weight.abs()).unwrap_or(Decimal::ZERO),
                hedge_price,
                hedge_weight,
            ));
        }

        opportunity.expected_profit = (market_price - theoretical_price).abs() * base;
        opportunity.max_loss = opportunity.expected_profit / Decimal::TWO;
        opportunity.break_even_price = theoretical_price;
        opportunity.profit_probability = confidence;
        opportunity.estimated_duration_ms = ttl.num_milliseconds();
        opportunity.mispricing_source = source.cloned();

        apply_execution_estimates(&mut opportunity, snapshot);
        apply_risk_metrics(&mut opportunity);
        Ok(opportunity)
    }

    fn has_active_target(&self, target: &InstrumentId) -> bool {
        self.core
            .active()
            .iter()
            .any(|opp| opp.legs.first().is_some_and(|l| &l.instrument_id == target))
    }
}

impl ArbitrageEngine for MultiInstrumentBasketEngine {
    fn engine_name(&self) -> &'static str {
        "basket"
    }

    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.core.absorb_snapshot(snapshot);
    }

    fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()> {
        if mispricing.mispricing_type != MispricingType::SpotVsSynthetic {
            return Ok(());
        }
        if mispricing.component_instruments.is_empty() {
            return Ok(());
        }
        let params = self.core.params();
        if mispricing.confidence_level < params.min_confidence_level {
            return Ok(());
        }
        let Some(snapshot) = self.core.snapshot() else {
            return Ok(());
        };
        let opportunity = self.build_structure(
            &mispricing.target_instrument,
            &mispricing.component_instruments,
            &mispricing.weights,
            mispricing.market_price,
            mispricing.theoretical_price,
            mispricing.confidence_level,
            &snapshot,
            &params,
            Some(mispricing),
        )?;
        self.core.admit(opportunity);
        Ok(())
    }

    /// Reprices every defined basket from the cached snapshot and admits
    /// the ones whose tracking deviation clears the profit threshold.
    fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        let Some(snapshot) = self.core.snapshot() else {
            return Vec::new();
        };
        let params = self.core.params();
        let baskets = self.baskets.lock().unwrap().clone();
        let mut admitted = Vec::new();

        for basket in &baskets {
            let Some(quote) = snapshot.quote(&basket.target) else {
                continue;
            };
            let synthetic = match self.model.calculate_synthetic_price(
                &basket.target,
                &basket.components,
                &snapshot,
            ) {
                Ok(synthetic) => synthetic,
                Err(error) => {
                    self.core.callbacks.fire_error(&error.to_string());
                    continue;
                }
            };
            if synthetic.confidence_score < params.min_confidence_level {
                debug!(
                    basket = %basket.name,
                    confidence = synthetic.confidence_score,
                    "replication confidence too weak"
                );
                continue;
            }
            let (Some(market), Some(theoretical)) = (
                quote.mid().to_f64(),
                synthetic.theoretical_price.to_f64(),
            ) else {
                continue;
            };
            if theoretical <= 0.0 {
                continue;
            }
            let deviation = (market - theoretical) / theoretical;
            if deviation.abs() < params.min_profit_threshold {
                continue;
            }
            if self.has_active_target(&basket.target) {
                continue;
            }
            match self.build_structure(
                &basket.target,
                &synthetic.component_instruments,
                &synthetic.weights,
                quote.mid(),
                synthetic.theoretical_price,
                synthetic.confidence_score,
                &snapshot,
                &params,
                None,
            ) {
                Ok(opportunity) => {
                    debug!(
                        basket = %basket.name,
                        deviation = deviation,
                        "basket drifted from its replication"
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
    use crate::pricing::BasketPricingModel;
    use crate::types::{ArbitrageStatus, Quote};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params() -> ArbitrageParameters {
        ArbitrageParameters {
            base_order_size: dec!(10),
            ..ArbitrageParameters::default()
        }
    }

    fn engine() -> MultiInstrumentBasketEngine {
        let eng = MultiInstrumentBasketEngine::new(params(), Arc::new(BasketPricingModel::new()));
        eng.define_basket(
            "majors",
            "MAJORS-IDX",
            vec!["ETH-USD".into(), "BTC-USD".into()],
        );
        eng
    }

    fn snapshot(index_mid: Decimal) -> MarketSnapshot {
        MarketSnapshot::new()
            .with_quote(Quote::new(
                "MAJORS-IDX",
                index_mid - dec!(10),
                index_mid + dec!(10),
                dec!(100),
                dec!(100),
            ))
            .with_quote(Quote::new("ETH-USD", dec!(1999), dec!(2001), dec!(100), dec!(100)))
            .with_quote(Quote::new("BTC-USD", dec!(49990), dec!(50010), dec!(100), dec!(100)))
    }

    // Liquidity-scored weights put ~0.286 on ETH and ~0.714 on BTC, so the
    // replication prices the index near 36286.
    #[test]
    fn tracking_basket_identifies_nothing() {
        let eng = engine();
        eng.update_market_data(&snapshot(dec!(36286)));
        assert!(eng.identify_opportunities().is_empty());
    }

    #[test]
    fn drifted_basket_builds_an_n_plus_one_structure() {
        let eng = engine();
        eng.update_market_data(&snapshot(dec!(37000)));
        let admitted = eng.identify_opportunities();
        assert_eq!(admitted.len(), 1);
        let opp = &admitted[0];
        assert_eq!(opp.status, ArbitrageStatus::Validated);
        assert_eq!(opp.arbitrage_type, ArbitrageType::MultiInstrumentBasket);
        assert_eq!(opp.legs.len(), 3);
        // Rich index is sold and both components are bought
        assert_eq!(opp.legs[0].side, Side::Bid);
        assert!(opp.legs[1].weight > 0.0);
        assert!(opp.legs[2].weight > 0.0);
        assert!((opp.legs[1].weight + opp.legs[2].weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn weak_replication_confidence_is_skipped() {
        let eng = engine();
        // 2% spread on BTC zeroes out the model's confidence
        let wide = MarketSnapshot::new()
            .with_quote(Quote::new(
                "MAJORS-IDX",
                dec!(36990),
                dec!(37010),
                dec!(100),
                dec!(100),
            ))
            .with_quote(Quote::new("ETH-USD", dec!(1999), dec!(2001), dec!(100), dec!(100)))
            .with_quote(Quote::new("BTC-USD", dec!(49500), dec!(50500), dec!(100), dec!(100)));
        eng.update_market_data(&wide);
        assert!(eng.identify_opportunities().is_empty());
    }

    #[test]
    fn pricing_failures_reach_the_error_callback() {
        let eng = engine();
        // Component quotes are missing from the snapshot entirely
        let bare = MarketSnapshot::new().with_quote(Quote::new(
            "MAJORS-IDX",
            dec!(36990),
            dec!(37010),
            dec!(100),
            dec!(100),
        ));
        eng.update_market_data(&bare);
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        eng.set_error_callback(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(eng.identify_opportunities().is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn synthetic_mispricing_is_converted() {
        let eng = engine();
        eng.update_market_data(&snapshot(dec!(37000)));
        let mispricing = MispricingOpportunity::new(
            "MAJORS-IDX",
            MispricingType::SpotVsSynthetic,
            dec!(37000),
            dec!(36286),
            0.0197,
            3.2,
            0.9,
            chrono::Duration::minutes(30),
        )
        .with_components(
            vec!["ETH-USD".into(), "BTC-USD".into()],
            vec![0.286, 0.714],
        );
        eng.process_mispricing(&mispricing).unwrap();
        assert_eq!(eng.get_active_opportunities().len(), 1);
    }
}
