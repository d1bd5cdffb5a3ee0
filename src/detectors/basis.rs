//! Spot/derivative basis tracking
//!
//! Tracks the percentage basis of registered (spot, derivative) pairs and
//! flags anomalies against the pair's own rolling basis history.

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::types::{
    BasisCalculation, InstrumentId, MarketSnapshot, MispricingOpportunity, MispricingType, Quote,
};
use crate::utils::math::RollingWindow;
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

type PairKey = (InstrumentId, InstrumentId);

struct BasisState {
    params: DetectionParameters,
    pairs: Vec<PairKey>,
    basis_history: HashMap<PairKey, RollingWindow>,
    latest_quotes: HashMap<InstrumentId, Quote>,
    active: Vec<MispricingOpportunity>,
    active_calculations: Vec<BasisCalculation>,
}

pub struct BasisCalculator {
    state: Mutex<BasisState>,
    callbacks: CallbackSlots,
}

fn basis_percentage(spot: &Quote, derivative: &Quote) -> Option<f64> {
    let spot_mid = spot.mid().to_f64()?;
    let deriv_mid = derivative.mid().to_f64()?;
    if spot_mid <= 0.0 {
        return None;
    }
    Some((deriv_mid - spot_mid) / spot_mid)
}

impl BasisCalculator {
    pub fn new(params: DetectionParameters) -> Self {
        BasisCalculator {
            state: Mutex::new(BasisState {
                params,
                pairs: Vec::new(),
                basis_history: HashMap::new(),
                latest_quotes: HashMap::new(),
                active: Vec::new(),
                active_calculations: Vec::new(),
            }),
            callbacks: CallbackSlots::new(),
        }
    }

    pub fn add_instrument_pair(
        &self,
        spot: impl Into<InstrumentId>,
        derivative: impl Into<InstrumentId>,
    ) {
        let mut state = self.state.lock().unwrap();
        let capacity = state.params.history_capacity();
        let key = (spot.into(), derivative.into());
        state
            .basis_history
            .entry(key.clone())
            .or_insert_with(|| RollingWindow::new(capacity));
        if !state.pairs.contains(&key) {
            state.pairs.push(key);
        }
    }

    /// Latest percentage basis for a registered pair, if both legs quote.
    pub fn get_current_basis(&self, spot: &str, derivative: &str) -> Option<f64> {
        let state = self.state.lock().unwrap();
        let spot_quote = state.latest_quotes.get(spot)?;
        let deriv_quote = state.latest_quotes.get(derivative)?;
        basis_percentage(spot_quote, deriv_quote)
    }

    pub fn get_basis_history(&self, spot: &str, derivative: &str) -> Vec<f64> {
        let state = self.state.lock().unwrap();
        state
            .basis_history
            .get(&(spot.to_string(), derivative.to_string()))
            .map(|h| h.values())
            .unwrap_or_default()
    }

    pub fn get_active_calculations(&self) -> Vec<BasisCalculation> {
        self.state.lock().unwrap().active_calculations.clone()
    }
}

impl MispricingDetector for BasisCalculator {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            for (instrument, quote) in &snapshot.quotes {
                state
                    .latest_quotes
                    .insert(instrument.clone(), quote.clone());
            }

            for key in state.pairs.clone() {
                let (Some(spot), Some(deriv)) = (
                    state.latest_quotes.get(&key.0).cloned(),
                    state.latest_quotes.get(&key.1).cloned(),
                ) else {
                    continue;
                };
                if let Some(pct) = basis_percentage(&spot, &deriv) {
                    if let Some(history) = state.basis_history.get_mut(&key) {
                        history.push(pct);
                    }
                }
            }

            let now = Utc::now();
            let (expired, live): (Vec<_>, Vec<_>) =
                state.active.drain(..).partition(|opp| opp.is_expired(now));
            state.active = live;
            let max_age = state.params.max_opportunity_duration;
            state
                .active_calculations
                .retain(|c| now - c.calculation_time < max_age);
            expired
        };
        self.callbacks.fire_expiry(&expired);
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let params = state.params.clone();
            let mut emitted = Vec::new();
            let mut calculations = Vec::new();

            for key in state.pairs.clone() {
                let (Some(spot), Some(deriv)) = (
                    state.latest_quotes.get(&key.0).cloned(),
                    state.latest_quotes.get(&key.1).cloned(),
                ) else {
                    continue;
                };
                let Some(history) = state.basis_history.get(&key) else {
                    continue;
                };
                if history.len() < params.min_observation_window {
                    continue;
                }
                let Some(pct) = basis_percentage(&spot, &deriv) else {
                    continue;
                };
                // The anomaly is the departure from the pair's own typical
                // carry, not the raw basis.
                let theoretical_basis = history.mean().unwrap_or(0.0);
                let deviation = pct - theoretical_basis;
                let z_score = history.z_score(pct);
                let worst_spread = spot.relative_spread().max(deriv.relative_spread());
                let confidence = (1.0 - worst_spread / params.max_spread_ratio).clamp(0.0, 1.0);

                if !params.is_significant_deviation(deviation, z_score, confidence) {
                    continue;
                }

                let market = deriv.mid();
                let theoretical = spot.mid()
                    * Decimal::from_f64(1.0 + theoretical_basis).unwrap_or(Decimal::ONE);
                let size = spot
                    .bid_size
                    .min(spot.ask_size)
                    .min(deriv.bid_size)
                    .min(deriv.ask_size);
                let expected = (market - theoretical).abs() * size;

                calculations.push(BasisCalculation {
                    spot_instrument: key.0.clone(),
                    derivative_instrument: key.1.clone(),
                    spot_price: spot.mid(),
                    derivative_price: market,
                    basis_value: market - spot.mid(),
                    basis_percentage: pct,
                    theoretical_basis,
                    basis_deviation: deviation,
                    z_score,
                    calculation_time: Utc::now(),
                });

                let opp = MispricingOpportunity::new(
                    key.1.clone(),
                    MispricingType::SpreadAnomaly,
                    market,
                    theoretical,
                    deviation,
                    z_score,
                    confidence,
                    params.max_opportunity_duration,
                )
                .with_components(vec![key.0.clone()], vec![1.0])
                .with_profit(expected, expected / Decimal::TWO);

                debug!(
                    spot = %key.0,
                    derivative = %key.1,
                    basis = pct,
                    deviation = deviation,
                    "basis anomaly detected"
                );
                emitted.push(opp);
            }

            state.active.extend(emitted.iter().cloned());
            state.active_calculations.extend(calculations);
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
