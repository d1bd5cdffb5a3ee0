//! Pairs and mean-reversion structures
//!
//! Consumes Statistical and MeanReversion mispricings that carry at least
//! one hedge component and builds market-neutral spread trades. Correlation
//! risk is taken from a pair-correlation matrix, either set directly or
//! refreshed from observed mid-price history; unconfigured pairs fall back
//! to a conservative estimate that the default risk gate rejects, so
//! structures only trade once their correlations have been supplied.

use super::risk_gate::{apply_execution_estimates, apply_risk_metrics};
use super::{ArbitrageEngine, ArbitrageParameters, EngineCore, ErrorCallback, OpportunityCallback};
use crate::errors::{EngineError, EngineResult};
use crate::utils::math::{pearson_correlation, RollingWindow};
use crate::types::{
    ArbitrageLeg, ArbitrageOpportunity, ArbitrageType, InstrumentId, MarketSnapshot,
    MispricingOpportunity, MispricingType, Side,
};
use chrono::Utc;
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Assumed pair correlation when none has been configured. Deliberately low
/// enough that `1 - rho` trips the default correlation-risk ceiling.
const UNCONFIGURED_PAIR_CORRELATION: f64 = 0.6;

/// Mid-price observations retained per instrument for correlation refresh.
const CORRELATION_WINDOW: usize = 128;

/// Minimum overlapping observations before a refreshed correlation is trusted.
const MIN_CORRELATION_SAMPLES: usize = 10;

pub struct StatisticalArbitrageEngine {
    core: EngineCore,
    correlations: Mutex<HashMap<(InstrumentId, InstrumentId), f64>>,
    histories: Mutex<HashMap<InstrumentId, RollingWindow>>,
}

impl StatisticalArbitrageEngine {
    pub fn new(params: ArbitrageParameters) -> Self {
        StatisticalArbitrageEngine {
            core: EngineCore::new(params),
            correlations: Mutex::new(HashMap::new()),
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Stores the correlation symmetrically for both orderings of the pair.
    pub fn set_pair_correlation(
        &self,
        first: impl Into<InstrumentId>,
        second: impl Into<InstrumentId>,
        correlation: f64,
    ) {
        let first = first.into();
        let second = second.into();
        let mut matrix = self.correlations.lock().unwrap();
        matrix.insert((first.clone(), second.clone()), correlation);
        matrix.insert((second, first), correlation);
    }

    /// Recomputes the pair correlation from accumulated mid-price history and
    /// stores it in the matrix. Returns `None` until both instruments have
    /// enough overlapping observations.
    pub fn refresh_pair_correlation(
        &self,
        first: impl Into<InstrumentId>,
        second: impl Into<InstrumentId>,
    ) -> Option<f64> {
        let first = first.into();
        let second = second.into();
        let correlation = {
            let histories = self.histories.lock().unwrap();
            let a = histories.get(&first)?.values();
            let b = histories.get(&second)?.values();
            if a.len().min(b.len()) < MIN_CORRELATION_SAMPLES {
                return None;
            }
            pearson_correlation(&a, &b)?
        };
        self.set_pair_correlation(first, second, correlation);
        Some(correlation)
    }

    fn pair_correlation(&self, first: &InstrumentId, second: &InstrumentId) -> f64 {
        self.correlations
            .lock()
            .unwrap()
            .get(&(first.clone(), second.clone()))
            .copied()
            .unwrap_or(UNCONFIGURED_PAIR_CORRELATION)
    }

    /// The weakest target/component correlation drives the risk number.
    fn correlation_risk(&self, mispricing: &MispricingOpportunity) -> f64 {
        mispricing
            .component_instruments
            .iter()
            .map(|c| 1.0 - self.pair_correlation(&mispricing.target_instrument, c).abs())
            .fold(0.0, f64::max)
    }

    fn build_spread(
        &self,
        mispricing: &MispricingOpportunity,
        snapshot: &MarketSnapshot,
        params: &ArbitrageParameters,
    ) -> EngineResult<ArbitrageOpportunity> {
        let quote = snapshot
            .quote(&mispricing.target_instrument)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: mispricing.target_instrument.clone(),
            })?;

        let now = Utc::now();
        let ttl = (mispricing.expiry_time - now).min(params.max_holding_period);
        let mut opportunity = ArbitrageOpportunity::new(ArbitrageType::Statistical, ttl);

        let direction = if mispricing.market_price < mispricing.theoretical_price {
            1.0
        } else {
            -1.0
        };
        let (side, entry_price) = if direction > 0.0 {
            (Side::Ask, quote.ask_price)
        } else {
            (Side::Bid, quote.bid_price)
        };
        let base = params.base_order_size;
        opportunity.legs.push(ArbitrageLeg::new(
            mispricing.target_instrument.clone(),
            side,
            base,
            entry_price,
            direction,
        ));

        for (component, weight) in mispricing
            .component_instruments
            .iter()
            .zip(&mispricing.weights)
        {
            let hedge_weight = -direction * weight;
            let hedge_quote =
                snapshot
                    .quote(component)
                    .ok_or_else(|| EngineError::MissingQuote {
                        instrument: component.clone(),
                    })?;
            let (hedge_side, hedge_price) = if hedge_weight >= 0.0 {
                (Side::Ask, hedge_quote.ask_price)
            } else {
                (Side::Bid, hedge_quote.bid_price)
            };
            opportunity.legs.push(ArbitrageLeg::new(
                component.clone(),
                hedge_side,
                base * Decimal::from_f64(weight.abs()).unwrap_or(Decimal::ZERO),
                hedge_price,
                hedge_weight,
            ));
        }

        let edge = (mispricing.market_price - mispricing.theoretical_price).abs();
        opportunity.expected_profit = edge * base;
        opportunity.max_loss = opportunity.expected_profit / Decimal::TWO;
        opportunity.break_even_price = mispricing.theoretical_price;
        opportunity.profit_probability = mispricing.confidence_level;
        opportunity.estimated_duration_ms = ttl.num_milliseconds();
        opportunity.mispricing_source = Some(mispricing.clone());
        opportunity.correlation_risk = self.correlation_risk(mispricing);

        apply_execution_estimates(&mut opportunity, snapshot);
        apply_risk_metrics(&mut opportunity);
        Ok(opportunity)
    }
}

impl ArbitrageEngine for StatisticalArbitrageEngine {
    fn engine_name(&self) -> &'static str {
        "statistical"
    }

    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        {
            let mut histories = self.histories.lock().unwrap();
            for (instrument, quote) in &snapshot.quotes {
                if let Some(mid) = quote.mid().to_f64() {
                    histories
                        .entry(instrument.clone())
                        .or_insert_with(|| RollingWindow::new(CORRELATION_WINDOW))
                        .push(mid);
                }
            }
        }
        self.core.absorb_snapshot(snapshot);
    }

    fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()> {
        if !matches!(
            mispricing.mispricing_type,
            MispricingType::Statistical | MispricingType::MeanReversion
        ) {
            return Ok(());
        }
        if mispricing.component_instruments.is_empty() {
            debug!(
                instrument = %mispricing.target_instrument,
                "no hedge components, not a spread candidate"
            );
            return Ok(());
        }
        let params = self.core.params();
        if mispricing.confidence_level < params.min_confidence_level {
            return Ok(());
        }
        let Some(snapshot) = self.core.snapshot() else {
            return Ok(());
        };
        let opportunity = self.build_spread(mispricing, &snapshot, &params)?;
        self.core.admit(opportunity);
        Ok(())
    }

    fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        self.core.active()
    }

    fn validate_opportunity(&self, opportunity: &mut ArbitrageOpportunity) -> bool {
        self.core.validate_against_cache(opportunity)
    }

    fn get_active_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        self.core.active()
    }

    fn get_opportunity(&self, opportunity_id: &str) -> Option<ArbitrageOpportunity> {
        self.core.find(opportunity_id)
    }

    fn clear_opportunities(&self) {
        self.core.clear();
    }

    fn set_opportunity_callback(&self, callback: OpportunityCallback) {
        self.core.callbacks.set_opportunity(callback);
    }

    fn set_expiry_callback(&self, callback: OpportunityCallback) {
        self.core.callbacks.set_expiry(callback);
    }

    fn set_error_callback(&self, callback: ErrorCallback) {
        self.core.callbacks.set_error(callback);
    }

    fn update_parameters(&self, params: ArbitrageParameters) -> EngineResult<()> {
        params.validate()?;
        self.core.set_params(params);
        Ok(())
    }
}
