//! Pairs-trading signal generation
//!
//! Registered pairs are tracked through their price ratio. A signal goes
//! long or short the spread when the ratio's z-score clears the entry
//! threshold and the legs are actually correlated. An AR(1) half-life of
//! the ratio is reported alongside each signal.

use super::{
    CallbackSlots, DetectionCallback, DetectionParameters, ExpiryCallback, MispricingDetector,
};
use crate::errors::EngineResult;
use crate::types::{
    InstrumentId, MarketSnapshot, MispricingOpportunity, MispricingType, Quote, SignalType,
    StatArbitrageSignal,
};
use crate::utils::math::{ar1_half_life, pearson_correlation, RollingWindow};
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const DEFAULT_ENTRY_THRESHOLD: f64 = 2.0;
const DEFAULT_EXIT_THRESHOLD: f64 = 0.5;
const MIN_PAIR_CORRELATION: f64 = 0.5;

type PairKey = (InstrumentId, InstrumentId);

struct StatArbState {
    params: DetectionParameters,
    entry_threshold: f64,
    exit_threshold: f64,
    pairs: Vec<PairKey>,
    ratio_history: HashMap<PairKey, RollingWindow>,
    mid_history: HashMap<InstrumentId, RollingWindow>,
    latest_quotes: HashMap<InstrumentId, Quote>,
    active: Vec<MispricingOpportunity>,
    active_signals: Vec<StatArbitrageSignal>,
}

pub struct StatArbSignalGenerator {
    state: Mutex<StatArbState>,
    callbacks: CallbackSlots,
}

impl StatArbSignalGenerator {
    pub fn new(params: DetectionParameters) -> Self {
        StatArbSignalGenerator {
            state: Mutex::new(StatArbState {
                params,
                entry_threshold: DEFAULT_ENTRY_THRESHOLD,
                exit_threshold: DEFAULT_EXIT_THRESHOLD,
                pairs: Vec::new(),
                ratio_history: HashMap::new(),
                mid_history: HashMap::new(),
                latest_quotes: HashMap::new(),
                active: Vec::new(),
                active_signals: Vec::new(),
            }),
            callbacks: CallbackSlots::new(),
        }
    }

    pub fn add_pair(&self, first: impl Into<InstrumentId>, second: impl Into<InstrumentId>) {
        let mut state = self.state.lock().unwrap();
        let capacity = state.params.history_capacity();
        let key = (first.into(), second.into());
        state
            .ratio_history
            .entry(key.clone())
            .or_insert_with(|| RollingWindow::new(capacity));
        if !state.pairs.contains(&key) {
            state.pairs.push(key);
        }
    }

    pub fn set_signal_thresholds(&self, entry: f64, exit: f64) -> EngineResult<()> {
        if !entry.is_finite() || entry <= 0.0 || !exit.is_finite() || exit < 0.0 || exit >= entry {
            return Err(crate::errors::EngineError::InvalidParameter {
                name: "signal_thresholds",
                value: entry,
                reason: "entry must be positive and exceed exit",
            });
        }
        let mut state = self.state.lock().unwrap();
        state.entry_threshold = entry;
        state.exit_threshold = exit;
        Ok(())
    }

    pub fn get_active_signals(&self) -> Vec<StatArbitrageSignal> {
        self.state.lock().unwrap().active_signals.clone()
    }

    /// Summary statistics for one registered pair.
    pub fn get_pair_statistics(&self, first: &str, second: &str) -> HashMap<String, f64> {
        let state = self.state.lock().unwrap();
        let mut stats = HashMap::new();
        let key = (first.to_string(), second.to_string());
        if let Some(history) = state.ratio_history.get(&key) {
            stats.insert("observations".to_string(), history.len() as f64);
            if let Some(mean) = history.mean() {
                stats.insert("mean_ratio".to_string(), mean);
            }
            if let Some(std) = history.std_dev() {
                stats.insert("ratio_std_dev".to_string(), std);
            }
            if let Some(half_life) = ar1_half_life(&history.values()) {
                stats.insert("half_life".to_string(), half_life);
            }
        }
        if let (Some(a), Some(b)) = (state.mid_history.get(first), state.mid_history.get(second)) {
            if let Some(corr) = pearson_correlation(&a.values(), &b.values()) {
                stats.insert("correlation".to_string(), corr);
            }
        }
        stats
    }
}

impl MispricingDetector for StatArbSignalGenerator {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        let expired = {
            let mut state = self.state.lock().unwrap();
            let capacity = state.params.history_capacity();

            for (instrument, quote) in &snapshot.quotes {
                let mid = quote.mid().to_f64().unwrap_or(0.0);
                if mid <= 0.0 {
                    continue;
                }
                state
                    .mid_history
                    .entry(instrument.clone())
                    .or_insert_with(|| RollingWindow::new(capacity))
                    .push(mid);
                state
                    .latest_quotes
                    .insert(instrument.clone(), quote.clone());
            }

            for key in state.pairs.clone() {
                let (Some(a), Some(b)) = (
                    state.mid_history.get(&key.0).and_then(|h| h.last()),
                    state.mid_history.get(&key.1).and_then(|h| h.last()),
                ) else {
                    continue;
                };
                if b <= 0.0 {
                    continue;
                }
                if let Some(history) = state.ratio_history.get_mut(&key) {
                    history.push(a / b);
                }
            }

            let now = Utc::now();
            let (expired, live): (Vec<_>, Vec<_>) =
                state.active.drain(..).partition(|opp| opp.is_expired(now));
            state.active = live;
            let max_age = state.params.max_opportunity_duration;
            state
                .active_signals
                .retain(|s| now - s.signal_time < max_age);
            expired
        };
        self.callbacks.fire_expiry(&expired);
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        let emitted = {
            let mut state = self.state.lock().unwrap();
            let params = state.params.clone();
            let entry = state.entry_threshold;
            let exit = state.exit_threshold;
            let mut emitted = Vec::new();
            let mut signals = Vec::new();

            for key in state.pairs.clone() {
                let Some(history) = state.ratio_history.get(&key) else {
                    continue;
                };
                if history.len() < params.min_observation_window {
                    continue;
                }
                let (Some(ratio), Some(mean_ratio), Some(ratio_std)) =
                    (history.last(), history.mean(), history.std_dev())
                else {
                    continue;
                };
                let z_score = history.z_score(ratio);

                let correlation = match (
                    state.mid_history.get(&key.0),
                    state.mid_history.get(&key.1),
                ) {
                    (Some(a), Some(b)) => {
                        pearson_correlation(&a.values(), &b.values()).unwrap_or(0.0)
                    }
                    _ => 0.0,
                };
                if correlation.abs() < MIN_PAIR_CORRELATION {
                    continue;
                }
                // When the AR(1) fit fails the window length stands in.
                let half_life = ar1_half_life(&history.values())
                    .unwrap_or(params.min_observation_window as f64);

                let signal_type = if z_score > entry {
                    SignalType::ShortSpread
                } else if z_score < -entry {
                    SignalType::LongSpread
                } else {
                    SignalType::Neutral
                };
                if signal_type == SignalType::Neutral {
                    continue;
                }

                let (Some(qa), Some(qb)) = (
                    state.latest_quotes.get(&key.0).cloned(),
                    state.latest_quotes.get(&key.1).cloned(),
                ) else {
                    continue;
                };
                let worst_spread = qa.relative_spread().max(qb.relative_spread());
                let confidence = (correlation.abs()
                    * (1.0 - worst_spread / params.max_spread_ratio))
                    .clamp(0.0, 1.0);
                let deviation = if mean_ratio.abs() > f64::EPSILON {
                    (ratio - mean_ratio) / mean_ratio
                } else {
                    0.0
                };
                if !params.is_significant_deviation(deviation, z_score, confidence) {
                    continue;
                }

                signals.push(StatArbitrageSignal {
                    instrument_1: key.0.clone(),
                    instrument_2: key.1.clone(),
                    price_ratio: ratio,
                    mean_ratio,
                    ratio_std_dev: ratio_std,
                    z_score,
                    correlation,
                    half_life,
                    signal_strength: z_score.abs() * correlation.abs(),
                    signal_type,
                    entry_threshold: entry,
                    exit_threshold: exit,
                    confidence_level: confidence,
                    signal_time: Utc::now(),
                });

                let market = qa.mid();
                let hedge_ratio = mean_ratio;
                let theoretical = qb.mid()
                    * Decimal::from_f64(hedge_ratio).unwrap_or(Decimal::ONE);
                let size = qa.bid_size.min(qa.ask_size);
                let expected = (market - theoretical).abs() * size;

                let opp = MispricingOpportunity::new(
                    key.0.clone(),
                    MispricingType::MeanReversion,
                    market,
                    theoretical,
                    deviation,
                    z_score,
                    confidence,
                    params.max_opportunity_duration,
                )
                .with_components(vec![key.1.clone()], vec![hedge_ratio])
                .with_profit(expected, expected / Decimal::TWO);

                debug!(
                    first = %key.0,
                    second = %key.1,
                    z_score = z_score,
                    half_life = half_life,
                    "pairs divergence signal"
                );
                emitted.push(opp);
            }

            state.active.extend(emitted.iter().cloned());
            state.active_signals.extend(signals);
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

    fn generator() -> StatArbSignalGenerator {
        let gen = StatArbSignalGenerator::new(DetectionParameters {
            min_observation_window: 20,
            ..DetectionParameters::default()
        });
        gen.add_pair("ETH-USD", "BTC-USD");
        gen
    }

    fn snapshot(eth: f64, btc: f64) -> MarketSnapshot {
        let eth = Decimal::from_f64(eth).unwrap();
        let btc = Decimal::from_f64(btc).unwrap();
        MarketSnapshot::new()
            .with_quote(Quote::new("ETH-USD", eth - dec!(0.1), eth + dec!(0.1), dec!(50), dec!(50)))
            .with_quote(Quote::new("BTC-USD", btc - dec!(1), btc + dec!(1), dec!(5), dec!(5)))
    }

    // Tightly co-moving legs: the common wave cancels in the ratio, leaving
    // only a tiny residual wiggle on the ETH side.
    fn feed_cointegrated(gen: &StatArbSignalGenerator, rounds: usize) {
        for i in 0..rounds {
            let wave = (i as f64 * 0.7).sin();
            let eth = 2000.0 + 20.0 * wave + 0.2 * (i as f64 * 2.5).sin();
            let btc = 50000.0 + 500.0 * wave;
            gen.update_market_data(&snapshot(eth, btc));
        }
    }

    #[test]
    fn converged_ratio_yields_no_signal() {
        let gen = generator();
        feed_cointegrated(&gen, 40);
        assert!(gen.detect_opportunities().is_empty());
        assert!(gen.get_active_signals().is_empty());
    }

    #[test]
    fn ratio_divergence_emits_short_spread_signal() {
        let gen = generator();
        feed_cointegrated(&gen, 40);
        // ETH runs 2% while BTC stays put: the ratio blows out high
        gen.update_market_data(&snapshot(2040.0, 50000.0));
        let opps = gen.detect_opportunities();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].mispricing_type, MispricingType::MeanReversion);
        assert_eq!(opps[0].component_instruments, vec!["BTC-USD".to_string()]);

        let signals = gen.get_active_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].signal_type, SignalType::ShortSpread);
        assert!(signals[0].z_score > 2.0);
        assert!(signals[0].correlation > 0.5);
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let gen = generator();
        assert!(gen.set_signal_thresholds(0.5, 2.0).is_err());
        assert!(gen.set_signal_thresholds(-1.0, 0.1).is_err());
        assert!(gen.set_signal_thresholds(2.0, 0.5).is_ok());
    }

    #[test]
    fn pair_statistics_expose_the_rolling_state() {
        let gen = generator();
        feed_cointegrated(&gen, 40);
        let stats = gen.get_pair_statistics("ETH-USD", "BTC-USD");
        assert!(stats.contains_key("mean_ratio"));
        assert!(stats.contains_key("correlation"));
        assert!(stats["observations"] >= 20.0);
    }
}
