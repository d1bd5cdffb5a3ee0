//! Realized-vs-implied volatility mismatch detector
//!
//! The implied side is proxied from the quoted spread: the relative spread
//! is treated as a one-period volatility estimate and annualized on the
//! same square-root-of-252 convention as the realized leg. The mismatch
//! between the two, z-scored against its own history, is the signal.

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::types::{InstrumentId, MarketSnapshot, MispricingOpportunity, MispricingType, Quote};
use crate::utils::math::{realized_volatility, RollingWindow};
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const TRADING_PERIODS: f64 = 252.0;

struct VolatilityState {
    params: DetectionParameters,
    price_history: HashMap<InstrumentId, RollingWindow>,
    mismatch_history: HashMap<InstrumentId, RollingWindow>,
    latest_quotes: HashMap<InstrumentId, Quote>,
    active: Vec<MispricingOpportunity>,
}

pub struct VolatilityDetector {
    state: Mutex<VolatilityState>,
    callbacks: CallbackSlots,
}

fn implied_proxy(quote: &Quote) -> f64 {
    quote.relative_spread() * TRADING_PERIODS.sqrt()
}

impl VolatilityDetector {
    pub fn new(params: DetectionParameters) -> Self {
        VolatilityDetector {
            state: Mutex::new(VolatilityState {
                params,
                price_history: HashMap::new(),
                mismatch_history: HashMap::new(),
                latest_quotes: HashMap::new(),
                active: Vec::new(),
            }),
            callbacks: CallbackSlots::new(),
        }
    }

    /// Annualized realized volatility for one instrument, if enough
    /// observations have accumulated.
    pub fn realized_volatility_for(&self, instrument: &str) -> Option<f64> {
        let state = self.state.lock().unwrap();
        let history = state.price_history.get(instrument)?;
        if history.len() < state.params.min_observation_window {
            return None;
        }
        realized_volatility(&history.values())
    }

    pub fn get_active_opportunities(&self) -> Vec<MispricingOpportunity> {
        self.state.lock().unwrap().active.clone()
    }
}

impl MispricingDetector for VolatilityDetector {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            let capacity = state.params.history_capacity();
            let window = state.params.min_observation_window;

            for (instrument, quote) in &snapshot.quotes {
                let mid = quote.mid().to_f64().unwrap_or(0.0);
                if mid <= 0.0 {
                    continue;
                }
                let history = state
                    .price_history
                    .entry(instrument.clone())
                    .or_insert_with(|| RollingWindow::new(capacity));
                history.push(mid);

                if history.len() >= window {
                    let realized = realized_volatility(&history.values()).unwrap_or(0.0);
                    let implied = implied_proxy(quote);
                    if implied > f64::EPSILON {
                        let mismatch = (realized - implied) / implied;
                        state
                            .mismatch_history
                            .entry(instrument.clone())
                            .or_insert_with(|| RollingWindow::new(capacity))
                            .push(mismatch);
                    }
                }
                state
                    .latest_quotes
                    .insert(instrument.clone(), quote.clone());
            }

            let now = Utc::now();
            let (expired, live): (Vec<_>, Vec<_>) =
                state.active.drain(..).partition(|opp| opp.is_expired(now));
            state.active = live;
            expired
        };
        self.callbacks.fire_expiry(&expired);
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let params = state.params.clone();
            let mut emitted = Vec::new();

            for (instrument, history) in &state.price_history {
                if history.len() < params.min_observation_window {
                    continue;
                }
                let Some(quote) = state.latest_quotes.get(instrument) else {
                    continue;
                };
                let Some(realized) = realized_volatility(&history.values()) else {
                    continue;
                };
                // The vol regime itself must be elevated before a mismatch
                // is worth trading.
                if realized < params.volatility_threshold {
                    continue;
                }
                let implied = implied_proxy(quote);
                if implied <= f64::EPSILON {
                    continue;
                }
                let mismatch = (realized - implied) / implied;
                let z_score = state
                    .mismatch_history
                    .get(instrument)
                    .map(|h| h.z_score(mismatch))
                    .unwrap_or(0.0);
                let confidence =
                    (1.0 - quote.relative_spread() / params.max_spread_ratio).clamp(0.0, 1.0);

                if !params.is_significant_deviation(mismatch, z_score, confidence) {
                    continue;
                }

                let mid = quote.mid();
                let notional = mid * quote.bid_size.min(quote.ask_size);
                let expected = notional
                    * Decimal::from_f64(mismatch.abs().min(1.0) * 0.01)
                        .unwrap_or(Decimal::ZERO);

                let opp = MispricingOpportunity::new(
                    instrument.clone(),
                    MispricingType::Volatility,
                    mid,
                    mid,
                    mismatch,
                    z_score,
                    confidence,
                    params.max_opportunity_duration,
                )
                .with_profit(expected, expected / Decimal::TWO);

                debug!(
                    instrument = %instrument,
                    realized = realized,
                    implied = implied,
                    mismatch = mismatch,
                    "volatility mismatch detected"
                );
                emitted.push(opp);
            }

            state.active.extend(emitted.iter().cloned());
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

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn detector() -> VolatilityDetector {
        VolatilityDetector::new(DetectionParameters {
            min_observation_window: 20,
            ..DetectionParameters::default()
        })
    }

    fn feed(det: &VolatilityDetector, price: Decimal) {
        let snapshot = MarketSnapshot::new().with_quote(Quote::new(
            "ETH-USD",
            price - dec!(0.5),
            price + dec!(0.5),
            dec!(100),
            dec!(100),
        ));
        det.update_market_data(&snapshot);
    }

    #[test]
    fn calm_market_reports_low_realized_vol() {
        let det = detector();
        for i in 0..30 {
            let price = if i % 2 == 0 { dec!(1999.9) } else { dec!(2000.1) };
            feed(&det, price);
        }
        let vol = det.realized_volatility_for("ETH-USD").unwrap();
        assert!(vol < 0.01);
        assert!(det.detect_opportunities().is_empty());
    }

    #[test]
    fn realized_spike_over_stable_regime_is_detected() {
        let det = detector();
        // Moderate alternating moves establish a baseline mismatch history
        for i in 0..40 {
            let price = if i % 2 == 0 { dec!(1990) } else { dec!(2010) };
            feed(&det, price);
        }
        // Then the swings widen sharply
        for i in 0..6 {
            let price = if i % 2 == 0 { dec!(1900) } else { dec!(2100) };
            feed(&det, price);
        }
        let opps = det.detect_opportunities();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].mispricing_type, MispricingType::Volatility);
        assert!(opps[0].deviation_percentage > 0.0);
    }

    #[test]
    fn short_history_yields_no_volatility_estimate() {
        let det = detector();
        for _ in 0..5 {
            feed(&det, dec!(2000));
        }
        assert!(det.realized_volatility_for("ETH-USD").is_none());
        assert!(det.detect_opportunities().is_empty());
    }
}
