//! Typed side-channel records produced alongside mispricing detection

use super::market::InstrumentId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Spot price on one venue against a reference price, with the economics of
/// closing the gap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceDiscrepancy {
    pub instrument_id: InstrumentId,
    pub exchange_id: String,
    pub spot_price: Decimal,
    pub reference_price: Decimal,
    pub price_difference: Decimal,
    pub percentage_discrepancy: f64,
    pub expected_profit_percentage: f64,
    pub required_capital: Decimal,
    pub estimated_transaction_cost: Decimal,
    pub net_profit_after_costs: Decimal,
    pub detection_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossExchangeOpportunity {
    pub instrument_id: InstrumentId,
    pub buy_exchange: String,
    pub sell_exchange: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub price_spread: Decimal,
    pub percentage_spread: f64,
    pub expected_profit: Decimal,
    pub required_capital: Decimal,
    pub capital_efficiency_ratio: f64,
    pub available_volume: Decimal,
    pub execution_probability: f64,
    pub detection_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivativePricingDiscrepancy {
    pub spot_instrument: InstrumentId,
    pub derivative_instrument: InstrumentId,
    pub spot_price: Decimal,
    pub derivative_market_price: Decimal,
    pub derivative_theoretical_price: Decimal,
    pub fair_value_deviation: f64,
    pub implied_volatility: f64,
    pub expected_profit: Decimal,
    pub required_margin: Decimal,
    pub profit_to_margin_ratio: f64,
    pub detection_time: DateTime<Utc>,
}

/// One basis observation for a (spot, derivative) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasisCalculation {
    pub spot_instrument: InstrumentId,
    pub derivative_instrument: InstrumentId,
    pub spot_price: Decimal,
    pub derivative_price: Decimal,
    pub basis_value: Decimal,
    pub basis_percentage: f64,
    pub theoretical_basis: f64,
    pub basis_deviation: f64,
    pub z_score: f64,
    pub calculation_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    LongSpread,
    ShortSpread,
    Neutral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatArbitrageSignal {
    pub instrument_1: InstrumentId,
    pub instrument_2: InstrumentId,
    pub price_ratio: f64,
    pub mean_ratio: f64,
    pub ratio_std_dev: f64,
    pub z_score: f64,
    pub correlation: f64,
    pub half_life: f64,
    pub signal_strength: f64,
    pub signal_type: SignalType,
    pub entry_threshold: f64,
    pub exit_threshold: f64,
    pub confidence_level: f64,
    pub signal_time: DateTime<Utc>,
}
