//! Cross-venue price dislocation detector
//!
//! Each venue feeds its own snapshot stream. When the best bid on one venue
//! crosses the best ask on another for the same instrument by more than the
//! round-trip transaction cost, a `CrossExchangeOpportunity` side-channel
//! record is produced alongside the mispricing itself.

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::types::{
    CrossExchangeOpportunity, InstrumentId, MarketSnapshot, MispricingOpportunity, MispricingType,
};
use crate::utils::math::RollingWindow;
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Venue id used when data arrives through the plain detector interface.
pub const PRIMARY_EXCHANGE: &str = "primary";

const DEFAULT_TRANSACTION_COST: f64 = 0.001;

struct CrossExchangeState {
    params: DetectionParameters,
    snapshots: HashMap<String, MarketSnapshot>,
    spread_history: HashMap<InstrumentId, RollingWindow>,
    transaction_costs: HashMap<String, f64>,
    active: Vec<MispricingOpportunity>,
    active_cross: Vec<CrossExchangeOpportunity>,
}

pub struct CrossExchangeDetector {
    state: Mutex<CrossExchangeState>,
    callbacks: CallbackSlots,
}

impl CrossExchangeDetector {
    pub fn new(params: DetectionParameters) -> Self {
        CrossExchangeDetector {
            state: Mutex::new(CrossExchangeState {
                params,
                snapshots: HashMap::new(),
                spread_history: HashMap::new(),
                transaction_costs: HashMap::new(),
                active: Vec::new(),
                active_cross: Vec::new(),
            }),
            callbacks: CallbackSlots::new(),
        }
    }

    /// Per-venue round-trip cost as a fraction of notional.
    pub fn set_exchange_transaction_cost(&self, exchange: impl Into<String>, cost: f64) {
        self.state
            .lock()
            .unwrap()
            .transaction_costs
            .insert(exchange.into(), cost.max(0.0));
    }

    pub fn update_exchange_data(&self, exchange: impl Into<String>, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            state
                .snapshots
                .insert(exchange.into(), snapshot.clone());
            state.refresh_spread_histories();
            state.drop_expired()
        };
        self.callbacks.fire_expiry(&expired);
    }

    pub fn get_active_cross_exchange_opportunities(&self) -> Vec<CrossExchangeOpportunity> {
        self.state.lock().unwrap().active_cross.clone()
    }

    pub fn get_active_opportunities(&self) -> Vec<MispricingOpportunity> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn clear_opportunities(&self) {
        let mut state = self.state.lock().unwrap();
        state.active.clear();
        state.active_cross.clear();
    }
}

impl CrossExchangeState {
    fn cost_for(&self, exchange: &str) -> f64 {
        self.transaction_costs
            .get(exchange)
            .copied()
            .unwrap_or(DEFAULT_TRANSACTION_COST)
    }

    /// Best bid and best ask across venues for each instrument.
    fn best_books(&self) -> HashMap<InstrumentId, BestBook> {
        let mut books: HashMap<InstrumentId, BestBook> = HashMap::new();
        for (exchange, snapshot) in &self.snapshots {
            for (instrument, quote) in &snapshot.quotes {
                let book = books.entry(instrument.clone()).or_default();
                book.venues += 1;
                if book.bid_exchange.is_empty() || quote.bid_price > book.bid {
                    book.bid = quote.bid_price;
                    book.bid_size = quote.bid_size;
                    book.bid_exchange = exchange.clone();
                    book.bid_spread = quote.relative_spread();
                }
                if book.ask_exchange.is_empty() || quote.ask_price < book.ask {
                    book.ask = quote.ask_price;
                    book.ask_size = quote.ask_size;
                    book.ask_exchange = exchange.clone();
                    book.ask_spread = quote.relative_spread();
                }
            }
        }
        books
    }

    /// Push the current cross-venue spread for every multi-venue instrument,
    /// negative spreads included, so the z-score has a baseline.
    fn refresh_spread_histories(&mut self) {
        let books = self.best_books();
        let capacity = self.params.history_capacity();
        for (instrument, book) in books {
            if book.venues < 2 || book.bid_exchange == book.ask_exchange {
                continue;
            }
            if let Some(spread) = book.gross_spread() {
                self.spread_history
                    .entry(instrument)
                    .or_insert_with(|| RollingWindow::new(capacity))
                    .push(spread);
            }
        }
    }

    fn drop_expired(&mut self) -> Vec<MispricingOpportunity> {
        let now = Utc::now();
        let (expired, live): (Vec<_>, Vec<_>) =
            self.active.drain(..).partition(|opp| opp.is_expired(now));
        self.active = live;
        let max_age = self.params.max_opportunity_duration;
        self.active_cross
            .retain(|opp| now - opp.detection_time < max_age);
        expired
    }
}

#[derive(Default, Clone)]
struct BestBook {
    venues: usize,
    bid: Decimal,
    bid_size: Decimal,
    bid_exchange: String,
    bid_spread: f64,
    ask: Decimal,
    ask_size: Decimal,
    ask_exchange: String,
    ask_spread: f64,
}

impl BestBook {
    /// (best bid - best ask) / best ask; positive when the books cross.
    fn gross_spread(&self) -> Option<f64> {
        let bid = self.bid.to_f64()?;
        let ask = self.ask.to_f64()?;
        if ask <= 0.0 {
            return None;
        }
        Some((bid - ask) / ask)
    }
}

impl MispricingDetector for CrossExchangeDetector {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.update_exchange_data(PRIMARY_EXCHANGE, snapshot);
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let params = state.params.clone();
            let books = state.best_books();
            let mut emitted = Vec::new();
            let mut cross_records = Vec::new();

            for (instrument, book) in books {
                if book.venues < 2 || book.bid_exchange == book.ask_exchange {
                    continue;
                }
                let Some(history) = state.spread_history.get(&instrument) else {
                    continue;
                };
                if history.len() < params.min_observation_window {
                    continue;
                }
                let Some(gross) = book.gross_spread() else {
                    continue;
                };
                let costs = state.cost_for(&book.bid_exchange) + state.cost_for(&book.ask_exchange);
                let net = gross - costs;
                if net <= 0.0 {
                    continue;
                }
                let z_score = history.z_score(gross);
                let worst_spread = book.bid_spread.max(book.ask_spread);
                let confidence = (1.0 - worst_spread / params.max_spread_ratio).clamp(0.0, 1.0);
                if !params.is_significant_deviation(net, z_score, confidence) {
                    continue;
                }

                let size = book.bid_size.min(book.ask_size);
                let required_capital = book.ask * size;
                let expected = required_capital
                    * Decimal::from_f64(net).unwrap_or(Decimal::ZERO);
                let volume = size.to_f64().unwrap_or(0.0) * book.ask.to_f64().unwrap_or(0.0);
                let execution_probability =
                    (volume / params.liquidity_threshold).min(1.0) * confidence;

                let opp = MispricingOpportunity::new(
                    instrument.clone(),
                    MispricingType::CrossExchange,
                    book.ask,
                    book.bid,
                    -net,
                    z_score,
                    confidence,
                    params.max_opportunity_duration,
                )
                .with_profit(expected, expected / Decimal::TWO);

                cross_records.push(CrossExchangeOpportunity {
                    instrument_id: instrument.clone(),
                    buy_exchange: book.ask_exchange.clone(),
                    sell_exchange: book.bid_exchange.clone(),
                    buy_price: book.ask,
                    sell_price: book.bid,
                    price_spread: book.bid - book.ask,
                    percentage_spread: gross,
                    expected_profit: expected,
                    required_capital,
                    capital_efficiency_ratio: if required_capital > Decimal::ZERO {
                        (expected / required_capital).to_f64().unwrap_or(0.0)
                    } else {
                        0.0
                    },
                    available_volume: size,
                    execution_probability,
                    detection_time: opp.detection_time,
                });

                debug!(
                    instrument = %instrument,
                    buy = %book.ask_exchange,
                    sell = %book.bid_exchange,
                    net_spread = net,
                    "cross-exchange dislocation detected"
                );
                emitted.push(opp);
            }

            state.active.extend(emitted.iter().cloned());
            state.active_cross.extend(cross_records);
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

    fn detector() -> CrossExchangeDetector {
        CrossExchangeDetector::new(DetectionParameters {
            min_observation_window: 20,
            ..DetectionParameters::default()
        })
    }

    fn venue_snapshot(bid: Decimal, ask: Decimal) -> MarketSnapshot {
        MarketSnapshot::new().with_quote(Quote::new("BTC-USD", bid, ask, dec!(5), dec!(5)))
    }

    fn feed_aligned(det: &CrossExchangeDetector, rounds: usize) {
        for i in 0..rounds {
            let jitter = Decimal::from(i as i64 % 2);
            det.update_exchange_data(
                "alpha",
                &venue_snapshot(dec!(49995) + jitter, dec!(50005) + jitter),
            );
            det.update_exchange_data(
                "beta",
                &venue_snapshot(dec!(49994) - jitter, dec!(50004) - jitter),
            );
        }
    }

    #[test]
    fn aligned_venues_emit_nothing() {
        let det = detector();
        feed_aligned(&det, 25);
        assert!(det.detect_opportunities().is_empty());
        assert!(det.get_active_cross_exchange_opportunities().is_empty());
    }

    #[test]
    fn crossed_books_emit_a_routed_opportunity() {
        let det = detector();
        feed_aligned(&det, 25);
        // Beta's bid jumps through alpha's ask by ~1%
        det.update_exchange_data("beta", &venue_snapshot(dec!(50500), dec!(50510)));
        let opps = det.detect_opportunities();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].mispricing_type, MispricingType::CrossExchange);

        let cross = det.get_active_cross_exchange_opportunities();
        assert_eq!(cross.len(), 1);
        assert_eq!(cross[0].buy_exchange, "alpha");
        assert_eq!(cross[0].sell_exchange, "beta");
        assert!(cross[0].expected_profit > Decimal::ZERO);
        assert!(cross[0].capital_efficiency_ratio > 0.0);
    }

    #[test]
    fn costs_above_the_spread_suppress_emission() {
        let det = detector();
        feed_aligned(&det, 25);
        det.set_exchange_transaction_cost("alpha", 0.02);
        det.set_exchange_transaction_cost("beta", 0.02);
        det.update_exchange_data("beta", &venue_snapshot(dec!(50500), dec!(50510)));
        assert!(det.detect_opportunities().is_empty());
    }

    #[test]
    fn single_venue_never_crosses_itself() {
        let det = detector();
        for _ in 0..30 {
            det.update_market_data(&venue_snapshot(dec!(49995), dec!(50005)));
        }
        assert!(det.detect_opportunities().is_empty());
    }
}
