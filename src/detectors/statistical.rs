//! Statistical mean-deviation detector

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::types::{InstrumentId, MarketSnapshot, MispricingOpportunity, MispricingType};
use crate::utils::math::RollingWindow;
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

struct StatisticalState {
    params: DetectionParameters,
    price_history: HashMap<InstrumentId, RollingWindow>,
    deviation_history: HashMap<InstrumentId, RollingWindow>,
    latest_spread: HashMap<InstrumentId, f64>,
    active: Vec<MispricingOpportunity>,
}

/// Z-scores the current deviation from a rolling-mean theoretical price
/// against the instrument's own deviation history.
pub struct StatisticalDetector {
    state: Mutex<StatisticalState>,
    callbacks: CallbackSlots,
}

impl StatisticalDetector {
    pub fn new(params: DetectionParameters) -> Self {
        StatisticalDetector {
            state: Mutex::new(StatisticalState {
                params,
                price_history: HashMap::new(),
                deviation_history: HashMap::new(),
                latest_spread: HashMap::new(),
                active: Vec::new(),
            }),
            callbacks: CallbackSlots::new(),
        }
    }

    pub fn get_active_opportunities(&self) -> Vec<MispricingOpportunity> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn clear_opportunities(&self) {
        self.state.lock().unwrap().active.clear();
    }
}

impl MispricingDetector for StatisticalDetector {
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
                    let theoretical = history.mean().unwrap_or(mid);
                    if theoretical > 0.0 {
                        let deviation = (mid - theoretical) / theoretical;
                        state
                            .deviation_history
                            .entry(instrument.clone())
                            .or_insert_with(|| RollingWindow::new(capacity))
                            .push(deviation);
                    }
                }
                state
                    .latest_spread
                    .insert(instrument.clone(), quote.relative_spread());
            }

            let now = Utc::now();
            let (expired, live): (Vec<_>, Vec<_>) = state
                .active
                .drain(..)
                .partition(|opp| opp.is_expired(now));
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
                let (Some(market), Some(theoretical)) = (history.last(), history.mean()) else {
                    continue;
                };
                if theoretical <= 0.0 {
                    continue;
                }
                let deviation = (market - theoretical) / theoretical;
                let z_score = state
                    .deviation_history
                    .get(instrument)
                    .map(|h| h.z_score(deviation))
                    .unwrap_or(0.0);

                let spread = state.latest_spread.get(instrument).copied().unwrap_or(0.0);
                let fill = (history.len() as f64 / params.min_observation_window as f64).min(1.0);
                let confidence = (fill * (1.0 - spread / params.max_spread_ratio)).clamp(0.0, 1.0);

                if !params.is_significant_deviation(deviation, z_score, confidence) {
                    continue;
                }

                let market_price = Decimal::from_f64(market).unwrap_or(Decimal::ZERO);
                let theoretical_price = Decimal::from_f64(theoretical).unwrap_or(Decimal::ZERO);
                let edge = (market_price - theoretical_price).abs();
                let base_size = Decimal::from_f64(params.liquidity_threshold.sqrt())
                    .unwrap_or(Decimal::ONE);

                let opp = MispricingOpportunity::new(
                    instrument.clone(),
                    MispricingType::Statistical,
                    market_price,
                    theoretical_price,
                    deviation,
                    z_score,
                    confidence,
                    params.max_opportunity_duration,
                )
                .with_profit(edge * base_size, edge * base_size / Decimal::TWO);

                debug!(
                    instrument = %instrument,
                    deviation = deviation,
                    z_score = z_score,
                    "statistical mispricing detected"
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
    use crate::types::Quote;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn detector() -> StatisticalDetector {
        StatisticalDetector::new(DetectionParameters {
            min_observation_window: 20,
            ..DetectionParameters::default()
        })
    }

    fn feed(detector: &StatisticalDetector, price: Decimal) {
        let snapshot = MarketSnapshot::new().with_quote(Quote::new(
            "BTC-USD",
            price - dec!(0.05),
            price + dec!(0.05),
            dec!(10000),
            dec!(10000),
        ));
        detector.update_market_data(&snapshot);
    }

    #[test]
    fn no_emission_below_observation_window() {
        let det = detector();
        for _ in 0..10 {
            feed(&det, dec!(100));
        }
        assert!(det.detect_opportunities().is_empty());
    }

    #[test]
    fn flat_market_emits_nothing() {
        let det = detector();
        for _ in 0..40 {
            feed(&det, dec!(100));
        }
        assert!(det.detect_opportunities().is_empty());
    }

    #[test]
    fn outlier_after_stable_history_is_detected() {
        let det = detector();
        for i in 0..40 {
            // Small alternating jitter so the deviation history has variance
            let price = if i % 2 == 0 { dec!(99.9) } else { dec!(100.1) };
            feed(&det, price);
        }
        feed(&det, dec!(103));
        let opps = det.detect_opportunities();
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.target_instrument, "BTC-USD");
        assert!(opp.deviation_percentage > 0.02);
        assert!(opp.z_score.abs() > 2.0);
        assert!(opp.confidence_level > 0.8);
    }

    #[test]
    fn detection_callback_fires_once_per_opportunity() {
        let det = detector();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        det.set_detection_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        for i in 0..40 {
            let price = if i % 2 == 0 { dec!(99.9) } else { dec!(100.1) };
            feed(&det, price);
        }
        feed(&det, dec!(103));
        let n = det.detect_opportunities().len();
        assert_eq!(hits.load(Ordering::SeqCst), n);
    }
}
