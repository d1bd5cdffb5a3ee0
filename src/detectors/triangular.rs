//! Three-leg cycle detector
//!
//! A triangle is a registered triple `[base, quote_leg, cross]` where a
//! round trip base -> cross -> quote_leg -> base leaves a residual. The
//! residual profit fraction is pushed into a rolling history so the z-score
//! reflects how unusual the current cycle is, not just its raw size.

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::types::{InstrumentId, MarketSnapshot, MispricingOpportunity, MispricingType, Quote};
use crate::utils::math::RollingWindow;
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Triangle {
    pub name: String,
    pub legs: [InstrumentId; 3],
}

struct TriangularState {
    params: DetectionParameters,
    triangles: Vec<Triangle>,
    profit_history: HashMap<String, RollingWindow>,
    latest_quotes: HashMap<InstrumentId, Quote>,
    active: Vec<MispricingOpportunity>,
}

pub struct TriangularDetector {
    state: Mutex<TriangularState>,
    callbacks: CallbackSlots,
}

/// Residual of one full cycle as a fraction of the starting notional.
/// Legs are crossed at the touch: buy the first leg at its ask, sell the
/// cross and the second leg at their bids.
fn cycle_profit(first: &Quote, second: &Quote, cross: &Quote) -> Option<f64> {
    let ask1 = first.ask_price.to_f64()?;
    let bid2 = second.bid_price.to_f64()?;
    let bid3 = cross.bid_price.to_f64()?;
    if ask1 <= 0.0 {
        return None;
    }
    Some(bid3 * bid2 / ask1 - 1.0)
}

impl TriangularDetector {
    pub fn new(params: DetectionParameters) -> Self {
        TriangularDetector {
            state: Mutex::new(TriangularState {
                params,
                triangles: Vec::new(),
                profit_history: HashMap::new(),
                latest_quotes: HashMap::new(),
                active: Vec::new(),
            }),
            callbacks: CallbackSlots::new(),
        }
    }

    pub fn add_triangle(&self, name: impl Into<String>, legs: [InstrumentId; 3]) {
        let mut state = self.state.lock().unwrap();
        let capacity = state.params.history_capacity();
        let name = name.into();
        state
            .profit_history
            .entry(name.clone())
            .or_insert_with(|| RollingWindow::new(capacity));
        state.triangles.retain(|t| t.name != name);
        state.triangles.push(Triangle { name, legs });
    }

    pub fn remove_triangle(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.triangles.retain(|t| t.name != name);
        state.profit_history.remove(name);
    }

    pub fn triangle_count(&self) -> usize {
        self.state.lock().unwrap().triangles.len()
    }

    pub fn get_active_opportunities(&self) -> Vec<MispricingOpportunity> {
        self.state.lock().unwrap().active.clone()
    }
}

impl MispricingDetector for TriangularDetector {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            for (instrument, quote) in &snapshot.quotes {
                state
                    .latest_quotes
                    .insert(instrument.clone(), quote.clone());
            }

            let triangles = state.triangles.clone();
            for triangle in &triangles {
                let [a, b, c] = &triangle.legs;
                let (Some(qa), Some(qb), Some(qc)) = (
                    state.latest_quotes.get(a).cloned(),
                    state.latest_quotes.get(b).cloned(),
                    state.latest_quotes.get(c).cloned(),
                ) else {
                    continue;
                };
                if let Some(profit) = cycle_profit(&qa, &qb, &qc) {
                    if let Some(history) = state.profit_history.get_mut(&triangle.name) {
                        history.push(profit);
                    }
                }
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

            for triangle in state.triangles.clone() {
                let [a, b, c] = &triangle.legs;
                let (Some(qa), Some(qb), Some(qc)) = (
                    state.latest_quotes.get(a).cloned(),
                    state.latest_quotes.get(b).cloned(),
                    state.latest_quotes.get(c).cloned(),
                ) else {
                    continue;
                };
                let Some(history) = state.profit_history.get(&triangle.name) else {
                    continue;
                };
                if history.len() < params.min_observation_window {
                    continue;
                }
                let Some(profit) = cycle_profit(&qa, &qb, &qc) else {
                    continue;
                };
                let z_score = history.z_score(profit);

                let worst_spread = qa
                    .relative_spread()
                    .max(qb.relative_spread())
                    .max(qc.relative_spread());
                let confidence = (1.0 - worst_spread / params.max_spread_ratio).clamp(0.0, 1.0);

                if !params.is_significant_deviation(profit, z_score, confidence) {
                    continue;
                }

                let theoretical = qa.mid();
                let market = theoretical
                    * Decimal::from_f64(1.0 + profit).unwrap_or(Decimal::ONE);
                let notional = qa.mid()
                    * qa.bid_size
                        .min(qb.bid_size)
                        .min(qc.bid_size)
                        .max(Decimal::ZERO);
                let expected = notional * Decimal::from_f64(profit.abs()).unwrap_or(Decimal::ZERO);

                let opp = MispricingOpportunity::new(
                    a.clone(),
                    MispricingType::Triangular,
                    market,
                    theoretical,
                    profit,
                    z_score,
                    confidence,
                    params.max_opportunity_duration,
                )
                .with_components(triangle.legs.to_vec(), vec![1.0, 1.0, 1.0])
                .with_profit(expected, expected / Decimal::TWO);

                debug!(
                    triangle = %triangle.name,
                    residual = profit,
                    z_score = z_score,
                    "triangular cycle residual detected"
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

    fn detector() -> TriangularDetector {
        let det = TriangularDetector::new(DetectionParameters {
            min_observation_window: 20,
            ..DetectionParameters::default()
        });
        det.add_triangle(
            "btc-eth-usd",
            ["BTC-USD".into(), "ETH-USD".into(), "BTC-ETH".into()],
        );
        det
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

    // 25 * 2000 = 50000, so the cycle nets out near zero; the jitter keeps
    // the residual history from degenerating to a single value.
    fn feed_balanced(det: &TriangularDetector, rounds: usize) {
        for i in 0..rounds {
            let cross = if i % 2 == 0 { dec!(24.995) } else { dec!(25.005) };
            det.update_market_data(&snapshot(cross));
        }
    }

    #[test]
    fn balanced_triangle_is_quiet() {
        let det = detector();
        feed_balanced(&det, 40);
        assert!(det.detect_opportunities().is_empty());
    }

    #[test]
    fn dislocated_cross_rate_is_detected() {
        let det = detector();
        feed_balanced(&det, 40);
        // Cross rate jumps ~2%: the round trip now nets a residual
        det.update_market_data(&snapshot(dec!(25.5)));
        let opps = det.detect_opportunities();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].mispricing_type, MispricingType::Triangular);
        assert_eq!(opps[0].component_instruments.len(), 3);
        assert!(opps[0].z_score.abs() > 2.0);
    }

    #[test]
    fn removing_a_triangle_stops_detection() {
        let det = detector();
        feed_balanced(&det, 40);
        det.remove_triangle("btc-eth-usd");
        det.update_market_data(&snapshot(dec!(25.5)));
        assert!(det.detect_opportunities().is_empty());
        assert_eq!(det.triangle_count(), 0);
    }
}
