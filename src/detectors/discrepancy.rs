//! Real-time per-venue deviation from a consensus reference price
//!
//! The reference is the equally weighted mean of all venue mids. Any venue
//! trading away from it by more than the deviation threshold, after its own
//! transaction cost, produces a `PriceDiscrepancy` record.

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::types::{
    InstrumentId, MarketSnapshot, MispricingOpportunity, MispricingType, PriceDiscrepancy,
};
use crate::utils::math::RollingWindow;
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const DEFAULT_TRANSACTION_COST: f64 = 0.001;

struct DiscrepancyState {
    params: DetectionParameters,
    feeds: HashMap<String, MarketSnapshot>,
    deviation_history: HashMap<InstrumentId, RollingWindow>,
    transaction_costs: HashMap<String, f64>,
    active: Vec<MispricingOpportunity>,
    active_discrepancies: Vec<PriceDiscrepancy>,
}

pub struct RealTimeDiscrepancyDetector {
    state: Mutex<DiscrepancyState>,
    callbacks: CallbackSlots,
}

impl RealTimeDiscrepancyDetector {
    pub fn new(params: DetectionParameters) -> Self {
        RealTimeDiscrepancyDetector {
            state: Mutex::new(DiscrepancyState {
                params,
                feeds: HashMap::new(),
                deviation_history: HashMap::new(),
                transaction_costs: HashMap::new(),
                active: Vec::new(),
                active_discrepancies: Vec::new(),
            }),
            callbacks: CallbackSlots::new(),
        }
    }

    pub fn add_exchange_feed(&self, exchange: impl Into<String>, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            state.feeds.insert(exchange.into(), snapshot.clone());
            state.refresh_histories();
            state.drop_expired()
        };
        self.callbacks.fire_expiry(&expired);
    }

    pub fn set_exchange_transaction_cost(&self, exchange: impl Into<String>, cost: f64) {
        self.state
            .lock()
            .unwrap()
            .transaction_costs
            .insert(exchange.into(), cost.max(0.0));
    }

    pub fn get_active_discrepancies(&self) -> Vec<PriceDiscrepancy> {
        self.state.lock().unwrap().active_discrepancies.clone()
    }

    pub fn clear_discrepancies(&self) {
        let mut state = self.state.lock().unwrap();
        state.active.clear();
        state.active_discrepancies.clear();
    }
}

impl DiscrepancyState {
    fn cost_for(&self, exchange: &str) -> f64 {
        self.transaction_costs
            .get(exchange)
            .copied()
            .unwrap_or(DEFAULT_TRANSACTION_COST)
    }

    /// Consensus mid per instrument across every venue quoting it.
    fn reference_prices(&self) -> HashMap<InstrumentId, (Decimal, usize)> {
        let mut sums: HashMap<InstrumentId, (Decimal, usize)> = HashMap::new();
        for snapshot in self.feeds.values() {
            for (instrument, quote) in &snapshot.quotes {
                let entry = sums.entry(instrument.clone()).or_insert((Decimal::ZERO, 0));
                entry.0 += quote.mid();
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(id, (sum, n))| (id, (sum / Decimal::from(n), n)))
            .collect()
    }

    fn refresh_histories(&mut self) {
        let references = self.reference_prices();
        let capacity = self.params.history_capacity();
        for snapshot in self.feeds.values() {
            for (instrument, quote) in &snapshot.quotes {
                let Some((reference, venues)) = references.get(instrument) else {
                    continue;
                };
                if *venues < 2 || *reference <= Decimal::ZERO {
                    continue;
                }
                let deviation = ((quote.mid() - reference) / reference)
                    .to_f64()
                    .unwrap_or(0.0);
                self.deviation_history
                    .entry(instrument.clone())
                    .or_insert_with(|| RollingWindow::new(capacity))
                    .push(deviation);
            }
        }
    }

    fn drop_expired(&mut self) -> Vec<MispricingOpportunity> {
        let now = Utc::now();
        let (expired, live): (Vec<_>, Vec<_>) =
            self.active.drain(..).partition(|opp| opp.is_expired(now));
        self.active = live;
        let max_age = self.params.max_opportunity_duration;
        self.active_discrepancies
            .retain(|d| now - d.detection_time < max_age);
        expired
    }
}

impl MispricingDetector for RealTimeDiscrepancyDetector {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.add_exchange_feed("primary", snapshot);
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let params = state.params.clone();
            let references = state.reference_prices();
            let mut emitted = Vec::new();
            let mut discrepancies = Vec::new();

            for (exchange, snapshot) in state.feeds.clone() {
                for (instrument, quote) in &snapshot.quotes {
                    let Some((reference, venues)) = references.get(instrument) else {
                        continue;
                    };
                    if *venues < 2 || *reference <= Decimal::ZERO {
                        continue;
                    }
                    let Some(history) = state.deviation_history.get(instrument) else {
                        continue;
                    };
                    if history.len() < params.min_observation_window {
                        continue;
                    }
                    let spot = quote.mid();
                    let deviation = ((spot - reference) / reference).to_f64().unwrap_or(0.0);
                    let cost = state.cost_for(&exchange);
                    let net_pct = deviation.abs() - cost;
                    if net_pct <= 0.0 {
                        continue;
                    }
                    let z_score = history.z_score(deviation);
                    let confidence =
                        (1.0 - quote.relative_spread() / params.max_spread_ratio).clamp(0.0, 1.0);
                    if !params.is_significant_deviation(deviation, z_score, confidence) {
                        continue;
                    }

                    let size = quote.bid_size.min(quote.ask_size);
                    let required_capital = spot * size;
                    let estimated_cost =
                        required_capital * Decimal::from_f64(cost).unwrap_or(Decimal::ZERO);
                    let net_profit = required_capital
                        * Decimal::from_f64(net_pct).unwrap_or(Decimal::ZERO);

                    discrepancies.push(PriceDiscrepancy {
                        instrument_id: instrument.clone(),
                        exchange_id: exchange.clone(),
                        spot_price: spot,
                        reference_price: *reference,
                        price_difference: spot - reference,
                        percentage_discrepancy: deviation,
                        expected_profit_percentage: net_pct,
                        required_capital,
                        estimated_transaction_cost: estimated_cost,
                        net_profit_after_costs: net_profit,
                        detection_time: Utc::now(),
                    });

                    let opp = MispricingOpportunity::new(
                        instrument.clone(),
                        MispricingType::RealTimeDiscrepancy,
                        spot,
                        *reference,
                        deviation,
                        z_score,
                        confidence,
                        params.max_opportunity_duration,
                    )
                    .with_profit(net_profit, net_profit / Decimal::TWO);

                    debug!(
                        instrument = %instrument,
                        exchange = %exchange,
                        deviation = deviation,
                        "real-time price discrepancy detected"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Quote;
    use rust_decimal_macros::dec;

    fn detector() -> RealTimeDiscrepancyDetector {
        RealTimeDiscrepancyDetector::new(DetectionParameters {
            min_observation_window: 20,
            ..DetectionParameters::default()
        })
    }

    fn venue_snapshot(mid: Decimal) -> MarketSnapshot {
        MarketSnapshot::new().with_quote(Quote::new(
            "SOL-USD",
            mid - dec!(0.01),
            mid + dec!(0.01),
            dec!(500),
            dec!(500),
        ))
    }

    fn feed_consensus(det: &RealTimeDiscrepancyDetector, rounds: usize) {
        for i in 0..rounds {
            let jitter = Decimal::new(i as i64 % 2, 2); // 0.00 / 0.01
            det.add_exchange_feed("alpha", &venue_snapshot(dec!(150) + jitter));
            det.add_exchange_feed("beta", &venue_snapshot(dec!(150) - jitter));
        }
    }

    #[test]
    fn consensus_prices_emit_nothing() {
        let det = detector();
        feed_consensus(&det, 25);
        assert!(det.detect_opportunities().is_empty());
    }

    #[test]
    fn venue_trading_away_from_consensus_is_flagged() {
        let det = detector();
        feed_consensus(&det, 25);
        // Beta dislocates ~2% above the consensus
        det.add_exchange_feed("beta", &venue_snapshot(dec!(153)));
        let opps = det.detect_opportunities();
        // Both venues now deviate from the moved reference; beta carries
        // the dominant deviation.
        assert!(!opps.is_empty());
        let discrepancies = det.get_active_discrepancies();
        let beta = discrepancies
            .iter()
            .find(|d| d.exchange_id == "beta")
            .expect("beta discrepancy");
        assert!(beta.percentage_discrepancy > 0.005);
        assert!(beta.net_profit_after_costs > Decimal::ZERO);
    }

    #[test]
    fn transaction_costs_gate_marginal_discrepancies() {
        let det = detector();
        feed_consensus(&det, 25);
        det.set_exchange_transaction_cost("alpha", 0.05);
        det.set_exchange_transaction_cost("beta", 0.05);
        det.add_exchange_feed("beta", &venue_snapshot(dec!(153)));
        assert!(det.detect_opportunities().is_empty());
    }

    #[test]
    fn clear_discrepancies_resets_state() {
        let det = detector();
        feed_consensus(&det, 25);
        det.add_exchange_feed("beta", &venue_snapshot(dec!(153)));
        det.detect_opportunities();
        det.clear_discrepancies();
        assert!(det.get_active_discrepancies().is_empty());
    }
}
