//! Pricing collaborator boundary
//!
//! The numeric internals of fair-value models live outside this crate;
//! detectors and engines consume them through the `PricingModel` trait.
//! `BasketPricingModel` is the reference implementation used by the demo
//! binary and the test suite.

use crate::errors::{EngineError, EngineResult};
use crate::types::{InstrumentId, MarketSnapshot, Quote};
use crate::utils::math::{pearson_correlation, RollingWindow};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// A theoretical price constructed from a weighted basket of components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticPrice {
    pub theoretical_price: Decimal,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub confidence_score: f64,
    pub component_instruments: Vec<InstrumentId>,
    pub weights: Vec<f64>,
    pub calculation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceDeviation {
    pub instrument_id: InstrumentId,
    pub market_price: Decimal,
    pub theoretical_price: Decimal,
    pub deviation_percentage: f64,
    pub z_score: f64,
    pub confidence_level: f64,
    pub timestamp: DateTime<Utc>,
}

pub trait PricingModel: Send + Sync {
    fn calculate_synthetic_price(
        &self,
        target_instrument: &str,
        component_instruments: &[InstrumentId],
        snapshot: &MarketSnapshot,
    ) -> EngineResult<SyntheticPrice>;

    fn calculate_weights(
        &self,
        instruments: &[InstrumentId],
        snapshot: &MarketSnapshot,
    ) -> EngineResult<Vec<f64>>;

    /// Pearson correlation in [-1, 1]; zero when history is too short.
    fn calculate_correlation(&self, a: &[Quote], b: &[Quote]) -> f64;
}

/// Weighted mid-price basket. Weights favor the more liquid (tighter
/// spread) components; confidence degrades with the widest spread seen.
pub struct BasketPricingModel;

impl BasketPricingModel {
    pub fn new() -> Self {
        BasketPricingModel
    }
}

impl Default for BasketPricingModel {
    fn default() -> Self {
        Self::new()
    }
}

impl PricingModel for BasketPricingModel {
    fn calculate_synthetic_price(
        &self,
        target_instrument: &str,
        component_instruments: &[InstrumentId],
        snapshot: &MarketSnapshot,
    ) -> EngineResult<SyntheticPrice> {
        if component_instruments.is_empty() {
            return Err(EngineError::Pricing {
                instrument: target_instrument.to_string(),
                source: anyhow::anyhow!("empty component basket"),
            });
        }

        let weights = self.calculate_weights(component_instruments, snapshot)?;
        let mut theoretical = Decimal::ZERO;
        let mut bid = Decimal::ZERO;
        let mut ask = Decimal::ZERO;
        let mut worst_spread: f64 = 0.0;

        for (instrument, weight) in component_instruments.iter().zip(&weights) {
            let quote = snapshot
                .quote(instrument)
                .ok_or_else(|| EngineError::MissingQuote {
                    instrument: instrument.clone(),
                })?;
            let w = Decimal::from_f64(*weight).unwrap_or(Decimal::ZERO);
            theoretical += quote.mid() * w;
            bid += quote.bid_price * w;
            ask += quote.ask_price * w;
            worst_spread = worst_spread.max(quote.relative_spread());
        }

        // A 2% relative spread on any component zeroes out confidence.
        let confidence = (1.0 - worst_spread / 0.02).clamp(0.0, 1.0);

        Ok(SyntheticPrice {
            theoretical_price: theoretical,
            bid_price: bid,
            ask_price: ask,
            confidence_score: confidence,
            component_instruments: component_instruments.to_vec(),
            weights,
            calculation_time: Utc::now(),
        })
    }

    fn calculate_weights(
        &self,
        instruments: &[InstrumentId],
        snapshot: &MarketSnapshot,
    ) -> EngineResult<Vec<f64>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }
        let mut raw = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            let quote = snapshot
                .quote(instrument)
                .ok_or_else(|| EngineError::MissingQuote {
                    instrument: instrument.clone(),
                })?;
            // Inverse relative spread as a liquidity score.
            let spread = quote.relative_spread().max(1e-6);
            raw.push(1.0 / spread);
        }
        let total: f64 = raw.iter().sum();
        Ok(raw.into_iter().map(|w| w / total).collect())
    }

    fn calculate_correlation(&self, a: &[Quote], b: &[Quote]) -> f64 {
        let mids_a: Vec<f64> = a.iter().filter_map(|q| q.mid().to_f64()).collect();
        let mids_b: Vec<f64> = b.iter().filter_map(|q| q.mid().to_f64()).collect();
        pearson_correlation(&mids_a, &mids_b).unwrap_or(0.0)
    }
}

/// Prices the target at its own rolling mean mid. Confidence grows with
/// history depth and shrinks with the current spread; components only
/// matter as equal-weight hedge candidates.
pub struct MeanReversionPricingModel {
    histories: Mutex<HashMap<InstrumentId, RollingWindow>>,
    window: usize,
}

impl MeanReversionPricingModel {
    pub fn new(window: usize) -> Self {
        MeanReversionPricingModel {
            histories: Mutex::new(HashMap::new()),
            window: window.max(2),
        }
    }
}

impl PricingModel for MeanReversionPricingModel {
    fn calculate_synthetic_price(
        &self,
        target_instrument: &str,
        component_instruments: &[InstrumentId],
        snapshot: &MarketSnapshot,
    ) -> EngineResult<SyntheticPrice> {
        let quote = snapshot
            .quote(target_instrument)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: target_instrument.to_string(),
            })?;
        let mid = quote.mid().to_f64().ok_or_else(|| EngineError::Pricing {
            instrument: target_instrument.to_string(),
            source: anyhow::anyhow!("mid price not representable"),
        })?;

        let (theoretical, depth) = {
            let mut histories = self.histories.lock().unwrap();
            let history = histories
                .entry(target_instrument.to_string())
                .or_insert_with(|| RollingWindow::new(self.window));
            history.push(mid);
            (history.mean().unwrap_or(mid), history.len())
        };

        let theoretical = Decimal::from_f64(theoretical).ok_or_else(|| EngineError::Pricing {
            instrument: target_instrument.to_string(),
            source: anyhow::anyhow!("rolling mean not representable"),
        })?;
        let half_spread = quote.spread() / dec!(2);
        let depth_score = depth as f64 / self.window as f64;
        let spread_score = (1.0 - quote.relative_spread() / 0.02).clamp(0.0, 1.0);
        let confidence = (depth_score.min(1.0) * spread_score).clamp(0.0, 1.0);

        let weights = if component_instruments.is_empty() {
            Vec::new()
        } else {
            vec![1.0 / component_instruments.len() as f64; component_instruments.len()]
        };

        Ok(SyntheticPrice {
            theoretical_price: theoretical,
            bid_price: theoretical - half_spread,
            ask_price: theoretical + half_spread,
            confidence_score: confidence,
            component_instruments: component_instruments.to_vec(),
            weights,
            calculation_time: Utc::now(),
        })
    }

    fn calculate_weights(
        &self,
        instruments: &[InstrumentId],
        _snapshot: &MarketSnapshot,
    ) -> EngineResult<Vec<f64>> {
        if instruments.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![1.0 / instruments.len() as f64; instruments.len()])
    }

    fn calculate_correlation(&self, a: &[Quote], b: &[Quote]) -> f64 {
        let mids_a: Vec<f64> = a.iter().filter_map(|q| q.mid().to_f64()).collect();
        let mids_b: Vec<f64> = b.iter().filter_map(|q| q.mid().to_f64()).collect();
        pearson_correlation(&mids_a, &mids_b).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot::new()
            .with_quote(Quote::new("ETH-USD", dec!(1999), dec!(2001), dec!(50), dec!(50)))
            .with_quote(Quote::new("BTC-USD", dec!(49990), dec!(50010), dec!(5), dec!(5)))
    }

    #[test]
    fn weights_are_normalized() {
        let model = BasketPricingModel::new();
        let weights = model
            .calculate_weights(&["ETH-USD".into(), "BTC-USD".into()], &snapshot())
            .unwrap();
        assert_eq!(weights.len(), 2);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_component_is_a_pricing_error() {
        let model = BasketPricingModel::new();
        let err = model
            .calculate_synthetic_price("X", &["NOPE-USD".into()], &snapshot())
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingQuote { .. }));
    }

    #[test]
    fn synthetic_price_interpolates_component_mids() {
        let model = BasketPricingModel::new();
        let synthetic = model
            .calculate_synthetic_price("ETH-USD", &["ETH-USD".into()], &snapshot())
            .unwrap();
        assert_eq!(synthetic.theoretical_price, dec!(2000));
        assert!(synthetic.confidence_score > 0.9);
    }

    #[test]
    fn mean_reversion_model_prices_at_the_rolling_mean() {
        let model = MeanReversionPricingModel::new(10);
        for mid in [100, 102, 104, 106] {
            let mid = Decimal::from(mid);
            let snap = MarketSnapshot::new().with_quote(Quote::new(
                "SOL-USD",
                mid - dec!(0.05),
                mid + dec!(0.05),
                dec!(50),
                dec!(50),
            ));
            let synthetic = model
                .calculate_synthetic_price("SOL-USD", &[], &snap)
                .unwrap();
            // The rolling mean lags an uptrend, so theoretical <= current mid
            assert!(synthetic.theoretical_price <= mid);
        }
    }

    #[test]
    fn mean_reversion_confidence_grows_with_history() {
        let model = MeanReversionPricingModel::new(4);
        let snap = MarketSnapshot::new().with_quote(Quote::new(
            "SOL-USD",
            dec!(99.95),
            dec!(100.05),
            dec!(50),
            dec!(50),
        ));
        let first = model
            .calculate_synthetic_price("SOL-USD", &[], &snap)
            .unwrap();
        for _ in 0..4 {
            model
                .calculate_synthetic_price("SOL-USD", &[], &snap)
                .unwrap();
        }
        let later = model
            .calculate_synthetic_price("SOL-USD", &[], &snap)
            .unwrap();
        assert!(later.confidence_score > first.confidence_score);
    }
}
