//! Desk configuration and environment variable handling

use crate::detectors::DetectionParameters;
use crate::engines::ArbitrageParameters;
use crate::sizing::RiskParameters;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::env;
use std::str::FromStr;

// Detection constants
pub const MIN_OBSERVATION_WINDOW_FLOOR: usize = 10;
pub const MAX_OBSERVATION_WINDOW: usize = 500;

// Engine constants
pub const DEFAULT_BASE_ORDER_SIZE: Decimal = dec!(100);
pub const EXECUTION_BUFFER_MINUTES: i64 = 5;

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|s| Decimal::from_str(&s).ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    // Detection
    pub min_deviation_threshold: f64,
    pub min_z_score: f64,
    pub min_confidence_level: f64,
    pub min_observation_window: usize,
    pub max_opportunity_duration_min: i64,
    // Engine / risk gate
    pub min_profit_threshold: f64,
    pub max_risk_per_trade: f64,
    pub max_correlation_risk: f64,
    pub max_market_impact: f64,
    pub max_slippage: f64,
    pub max_position_size: Decimal,
    pub max_holding_period_min: i64,
    pub min_liquidity_requirement: Decimal,
    // Sizing
    pub max_position_size_percentage: f64,
    pub portfolio_value: Decimal,
    pub base_order_size: Decimal,
    // Demo feed
    pub snapshot_interval_ms: u64,
    pub demo_cycles: u64,
}

impl Config {
    pub fn load() -> Self {
        Self {
            min_deviation_threshold: env_f64("MIN_DEVIATION_THRESHOLD", 0.005).max(0.0),
            min_z_score: env_f64("MIN_Z_SCORE", 2.0).max(0.0),
            min_confidence_level: env_f64("MIN_CONFIDENCE_LEVEL", 0.8).clamp(0.0, 1.0),
            min_observation_window: env::var("MIN_OBSERVATION_WINDOW")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50)
                .max(MIN_OBSERVATION_WINDOW_FLOOR)
                .min(MAX_OBSERVATION_WINDOW),
            max_opportunity_duration_min: env::var("MAX_OPPORTUNITY_DURATION_MIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
            min_profit_threshold: env_f64("MIN_PROFIT_THRESHOLD", 0.001).max(0.0),
            max_risk_per_trade: env_f64("MAX_RISK_PER_TRADE", 0.02).max(0.0),
            max_correlation_risk: env_f64("MAX_CORRELATION_RISK", 0.3).clamp(0.0, 1.0),
            max_market_impact: env_f64("MAX_MARKET_IMPACT", 0.005).max(0.0),
            max_slippage: env_f64("MAX_SLIPPAGE", 0.001).max(0.0),
            max_position_size: env_decimal("MAX_POSITION_SIZE", dec!(1000000)),
            max_holding_period_min: env::var("MAX_HOLDING_PERIOD_MIN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            min_liquidity_requirement: env_decimal("MIN_LIQUIDITY_REQUIREMENT", dec!(100000)),
            max_position_size_percentage: env_f64("MAX_POSITION_SIZE_PCT", 0.05).clamp(0.0, 1.0),
            portfolio_value: env_decimal("PORTFOLIO_VALUE", dec!(1000000)),
            base_order_size: env_decimal("BASE_ORDER_SIZE", DEFAULT_BASE_ORDER_SIZE),
            snapshot_interval_ms: env::var("SNAPSHOT_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            demo_cycles: env::var("DEMO_CYCLES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(120),
        }
    }

    pub fn detection_parameters(&self) -> DetectionParameters {
        DetectionParameters {
            min_deviation_threshold: self.min_deviation_threshold,
            min_z_score: self.min_z_score,
            min_confidence_level: self.min_confidence_level,
            min_observation_window: self.min_observation_window,
            max_opportunity_duration: chrono::Duration::minutes(self.max_opportunity_duration_min),
            ..DetectionParameters::default()
        }
    }

    pub fn arbitrage_parameters(&self) -> ArbitrageParameters {
        ArbitrageParameters {
            min_profit_threshold: self.min_profit_threshold,
            max_risk_per_trade: self.max_risk_per_trade,
            max_correlation_risk: self.max_correlation_risk,
            max_market_impact: self.max_market_impact,
            max_slippage: self.max_slippage,
            max_position_size: self.max_position_size,
            max_holding_period: chrono::Duration::minutes(self.max_holding_period_min),
            min_liquidity_requirement: self.min_liquidity_requirement,
            base_order_size: self.base_order_size,
            ..ArbitrageParameters::default()
        }
    }

    pub fn risk_parameters(&self) -> RiskParameters {
        RiskParameters {
            max_position_size_percentage: self.max_position_size_percentage,
            ..RiskParameters::default()
        }
    }
}
