//! Market snapshot types consumed by every detector and engine

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type InstrumentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    /// We trade against the bid (we sell).
    Bid,
    /// We trade against the ask (we buy).
    Ask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub instrument_id: InstrumentId,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
}

impl Quote {
    pub fn new(
        instrument_id: impl Into<InstrumentId>,
        bid_price: Decimal,
        ask_price: Decimal,
        bid_size: Decimal,
        ask_size: Decimal,
    ) -> Self {
        Quote {
            instrument_id: instrument_id.into(),
            bid_price,
            ask_price,
            bid_size,
            ask_size,
            timestamp: Utc::now(),
            sequence_number: 0,
        }
    }

    pub fn mid(&self) -> Decimal {
        (self.bid_price + self.ask_price) / dec!(2)
    }

    pub fn spread(&self) -> Decimal {
        self.ask_price - self.bid_price
    }

    /// Spread as a fraction of mid, used as an implied-volatility proxy.
    pub fn relative_spread(&self) -> f64 {
        let mid = self.mid();
        if mid.is_zero() {
            return 0.0;
        }
        (self.spread() / mid).to_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub instrument_id: InstrumentId,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
    pub trade_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketDepth {
    pub instrument_id: InstrumentId,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Immutable per-cycle view of the market. Built once by the feed layer and
/// passed by shared reference; never mutated downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub quotes: HashMap<InstrumentId, Quote>,
    pub recent_trades: HashMap<InstrumentId, Vec<Trade>>,
    pub depth: HashMap<InstrumentId, MarketDepth>,
    pub snapshot_time: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new() -> Self {
        MarketSnapshot {
            quotes: HashMap::new(),
            recent_trades: HashMap::new(),
            depth: HashMap::new(),
            snapshot_time: Utc::now(),
        }
    }

    pub fn with_quote(mut self, quote: Quote) -> Self {
        self.quotes.insert(quote.instrument_id.clone(), quote);
        self
    }

    pub fn quote(&self, instrument: &str) -> Option<&Quote> {
        self.quotes.get(instrument)
    }
}

impl Default for MarketSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_mid_and_spread() {
        let q = Quote::new("BTC-USD", dec!(99.95), dec!(100.05), dec!(10), dec!(10));
        assert_eq!(q.mid(), dec!(100.00));
        assert_eq!(q.spread(), dec!(0.10));
        assert!((q.relative_spread() - 0.001).abs() < 1e-9);
    }
}
