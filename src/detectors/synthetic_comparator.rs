//! Listed price versus model-built synthetic replication
//!
//! Each registered target is repriced from its component basket through the
//! injected `PricingModel` on every venue feed, and the listed quote is
//! compared against that synthetic. Venues whose synthetic carries a weak
//! confidence score are skipped rather than traded on. Alongside each
//! mispricing a `DerivativePricingDiscrepancy` record captures the margin
//! economics for reporting.

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::pricing::PricingModel;
use crate::types::{
    DerivativePricingDiscrepancy, InstrumentId, MarketSnapshot, MispricingOpportunity,
    MispricingType,
};
use crate::utils::math::RollingWindow;
use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const MARGIN_FRACTION: Decimal = dec!(0.1);

struct ComparatorState {
    params: DetectionParameters,
    targets: HashMap<InstrumentId, Vec<InstrumentId>>,
    snapshots: HashMap<String, MarketSnapshot>,
    deviation_history: HashMap<(String, InstrumentId), RollingWindow>,
    active: Vec<MispricingOpportunity>,
    active_discrepancies: Vec<DerivativePricingDiscrepancy>,
}

pub struct SyntheticPriceComparator {
    state: Mutex<ComparatorState>,
    model: Arc<dyn PricingModel>,
    callbacks: CallbackSlots,
}

impl SyntheticPriceComparator {
    pub fn new(params: DetectionParameters, model: Arc<dyn PricingModel>) -> Self {
        SyntheticPriceComparator {
            state: Mutex::new(ComparatorState {
                params,
                targets: HashMap::new(),
                snapshots: HashMap::new(),
                deviation_history: HashMap::new(),
                active: Vec::new(),
                active_discrepancies: Vec::new(),
            }),
            model,
            callbacks: CallbackSlots::new(),
        }
    }

    pub fn add_synthetic_target(
        &self,
        target: impl Into<InstrumentId>,
        components: Vec<InstrumentId>,
    ) {
        self.state
            .lock()
            .unwrap()
            .targets
            .insert(target.into(), components);
    }

    pub fn update_exchange_snapshot(&self, exchange: impl Into<String>, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            let exchange = exchange.into();
            state.snapshots.insert(exchange.clone(), snapshot.clone());

            let capacity = state.params.history_capacity();
            for (target, components) in state.targets.clone() {
                let Some(quote) = snapshot.quote(&target) else {
                    continue;
                };
                let synthetic =
                    match self
                        .model
                        .calculate_synthetic_price(&target, &components, snapshot)
                    {
                        Ok(synthetic) => synthetic,
                        Err(_) => continue,
                    };
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
                state
                    .deviation_history
                    .entry((exchange.clone(), target.clone()))
                    .or_insert_with(|| RollingWindow::new(capacity))
                    .push(deviation);
            }

            let now = Utc::now();
            let (expired, live): (Vec<_>, Vec<_>) =
                state.active.drain(..).partition(|opp| opp.is_expired(now));
            state.active = live;
            let max_age = state.params.max_opportunity_duration;
            state
                .active_discrepancies
                .retain(|d| now - d.detection_time < max_age);
            expired
        };
        self.callbacks.fire_expiry(&expired);
    }

    pub fn get_active_opportunities(&self) -> Vec<MispricingOpportunity> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn get_active_derivative_discrepancies(&self) -> Vec<DerivativePricingDiscrepancy> {
        self.state.lock().unwrap().active_discrepancies.clone()
    }
}

impl MispricingDetector for SyntheticPriceComparator {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.update_exchange_snapshot("primary", snapshot);
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let params = state.params.clone();
            let mut emitted = Vec::new();
            let mut discrepancies = Vec::new();

            for (exchange, snapshot) in state.snapshots.clone() {
                for (target, components) in state.targets.clone() {
                    let Some(quote) = snapshot.quote(&target) else {
                        continue;
                    };
                    let Some(history) = state
                        .deviation_history
                        .get(&(exchange.clone(), target.clone()))
                    else {
                        continue;
                    };
                    if history.len() < params.min_observation_window {
                        continue;
                    }
                    let synthetic = match self.model.calculate_synthetic_price(
                        &target,
                        &components,
                        &snapshot,
                    ) {
                        Ok(synthetic) => synthetic,
                        Err(error) => {
                            warn!(target = %target, exchange = %exchange, %error,
                                  "synthetic repricing failed");
                            continue;
                        }
                    };
                    if synthetic.confidence_score < params.min_confidence_level {
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
                    let z_score = history.z_score(deviation);
                    let confidence = (synthetic.confidence_score
                        * (1.0 - quote.relative_spread() / params.max_spread_ratio))
                        .clamp(0.0, 1.0);
                    if !params.is_significant_deviation(deviation, z_score, confidence) {
                        continue;
                    }

                    let size = quote.bid_size.min(quote.ask_size);
                    let expected = (quote.mid() - synthetic.theoretical_price).abs() * size;
                    let required_margin = quote.mid() * size * MARGIN_FRACTION;

                    discrepancies.push(DerivativePricingDiscrepancy {
                        spot_instrument: components.first().cloned().unwrap_or_default(),
                        derivative_instrument: target.clone(),
                        spot_price: synthetic.theoretical_price,
                        derivative_market_price: quote.mid(),
                        derivative_theoretical_price: synthetic.theoretical_price,
                        fair_value_deviation: deviation,
                        implied_volatility: quote.relative_spread() * 252f64.sqrt(),
                        expected_profit: expected,
                        required_margin,
                        profit_to_margin_ratio: if required_margin > Decimal::ZERO {
                            (expected / required_margin).to_f64().unwrap_or(0.0)
                        } else {
                            0.0
                        },
                        detection_time: Utc::now(),
                    });

                    let opp = MispricingOpportunity::new(
                        target.clone(),
                        MispricingType::SpotVsSynthetic,
                        quote.mid(),
                        synthetic.theoretical_price,
                        deviation,
                        z_score,
                        confidence,
                        params.max_opportunity_duration,
                    )
                    .with_components(
                        synthetic.component_instruments.clone(),
                        synthetic.weights.clone(),
                    )
                    .with_profit(expected, expected / Decimal::TWO);

                    debug!(
                        target = %target,
                        exchange = %exchange,
                        deviation = deviation,
                        "listed price diverged from synthetic replication"
                    );
                    emitted.push(opp);
                }
            }

            state.active.extend(emitted.iter().cloned());
            state.active_discrepancies.extend(discrepancies);
            emitted
        };
        self.callbacks.fire_detection(&emitted);
        emitted
    }

    fn set_detection_callback(&self, callback: DetectionCallback) {
        self.callbacks.set_detection(callback);
    }

    fn set_expiry_callback(&self, callback: ExpiryCallback) {
        self.callbacks.set_expiry(callback);
    }

    fn update_parameters(&self, params: DetectionParameters) -> EngineResult<()> {
        params.validate()?;
        self.state.lock().unwrap().params = params;
        Ok(())
    }
}
