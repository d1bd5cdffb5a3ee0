//! Spot versus perpetual basis capture
//!
//! Registered spot/perpetual pairs are scanned for a basis that survives
//! the funding carry accrued over the holding period. A rich perpetual is
//! sold against spot; a cheap one is bought against a spot sale. Funding
//! rates are quoted per eight-hour period, the usual perpetual convention.

use super::risk_gate::{apply_execution_estimates, apply_risk_metrics};
use super::{ArbitrageEngine, ArbitrageParameters, EngineCore, ErrorCallback, OpportunityCallback};
use crate::errors::{EngineError, EngineResult};
use crate::types::{
    ArbitrageLeg, ArbitrageOpportunity, ArbitrageType, InstrumentId, MarketSnapshot,
    MispricingOpportunity, MispricingType, Side,
};
use rust_decimal::prelude::*;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

const FUNDING_PERIOD_HOURS: f64 = 8.0;
/// Spot and its perpetual track each other tightly.
const PAIR_CORRELATION_RISK: f64 = 0.1;

#[derive(Default)]
struct PairRegistry {
    /// perpetual -> spot
    pairs: HashMap<InstrumentId, InstrumentId>,
    /// perpetual -> funding rate per eight-hour period
    funding_rates: HashMap<InstrumentId, f64>,
}

pub struct SpotFundingPerpetualEngine {
    core: EngineCore,
    registry: Mutex<PairRegistry>,
}

impl SpotFundingPerpetualEngine {
    pub fn new(params: ArbitrageParameters) -> Self {
        SpotFundingPerpetualEngine {
            core: EngineCore::new(params),
            registry: Mutex::new(PairRegistry::default()),
        }
    }

    pub fn register_pair(
        &self,
        spot: impl Into<InstrumentId>,
        perpetual: impl Into<InstrumentId>,
    ) {
        self.registry
            .lock()
            .unwrap()
            .pairs
            .insert(perpetual.into(), spot.into());
    }

    pub fn update_funding_rate(&self, perpetual: impl Into<InstrumentId>, rate: f64) {
        self.registry
            .lock()
            .unwrap()
            .funding_rates
            .insert(perpetual.into(), rate);
    }

    pub fn pair_count(&self) -> usize {
        self.registry.lock().unwrap().pairs.len()
    }

    /// Basis net of the funding carry accrued over the holding period.
    fn net_edge(
        &self,
        spot_mid: f64,
        perp_mid: f64,
        funding_rate: f64,
        params: &ArbitrageParameters,
    ) -> Option<f64> {
        if spot_mid <= 0.0 {
            return None;
        }
        let basis = (perp_mid - spot_mid) / spot_mid;
        let holding_hours = params.max_holding_period.num_minutes() as f64 / 60.0;
        let carry = funding_rate * holding_hours / FUNDING_PERIOD_HOURS;
        Some(basis - carry)
    }

    fn build_pair(
        &self,
        spot: &InstrumentId,
        perpetual: &InstrumentId,
        edge: f64,
        snapshot: &MarketSnapshot,
        params: &ArbitrageParameters,
        source: Option<&MispricingOpportunity>,
    ) -> EngineResult<ArbitrageOpportunity> {
        let spot_quote = snapshot
            .quote(spot)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: spot.clone(),
            })?;
        let perp_quote = snapshot
            .quote(perpetual)
            .ok_or_else(|| EngineError::MissingQuote {
                instrument: perpetual.clone(),
            })?;

        // Positive edge: perpetual is rich, so long spot and short the perp.
        let (spot_side, spot_price, perp_side, perp_price, sign) = if edge >= 0.0 {
            (Side::Ask, spot_quote.ask_price, Side::Bid, perp_quote.bid_price, 1.0)
        } else {
            (Side::Bid, spot_quote.bid_price, Side::Ask, perp_quote.ask_price, -1.0)
        };

        let size = params.base_order_size;
        let mut opportunity = ArbitrageOpportunity::new(
            ArbitrageType::SpotFundingPerpetual,
            params.max_holding_period,
        );
        opportunity
            .legs
            .push(ArbitrageLeg::new(spot.clone(), spot_side, size, spot_price, sign));
        opportunity.legs.push(ArbitrageLeg::new(
            perpetual.clone(),
            perp_side,
            size,
            perp_price,
            -sign,
        ));

        opportunity.expected_profit = size
            * spot_quote.mid()
            * Decimal::from_f64(edge.abs()).unwrap_or(Decimal::ZERO);
        opportunity.max_loss = opportunity.expected_profit / Decimal::TWO;
        opportunity.break_even_price = perp_quote.mid();
        opportunity.profit_probability = source.map_or(0.9, |m| m.confidence_level);
        opportunity.estimated_duration_ms = params.max_holding_period.num_milliseconds();
        opportunity.mispricing_source = source.cloned();
        opportunity.correlation_risk = PAIR_CORRELATION_RISK;

        apply_execution_estimates(&mut opportunity, snapshot);
        apply_risk_metrics(&mut opportunity);
        Ok(opportunity)
    }

    fn has_active_pair(&self, spot: &InstrumentId, perpetual: &InstrumentId) -> bool {
        self.core.active().iter().any(|opp| {
            opp.legs.iter().any(|l| &l.instrument_id == spot)
                && opp.legs.iter().any(|l| &l.instrument_id == perpetual)
        })
    }
}

impl ArbitrageEngine for SpotFundingPerpetualEngine {
    fn engine_name(&self) -> &'static str {
        "spot_funding"
    }

    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.core.absorb_snapshot(snapshot);
    }

    /// Basis anomalies on a registered perpetual are re-evaluated against
    /// the live funding rate before structuring.
    fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()> {
        if mispricing.mispricing_type != MispricingType::SpreadAnomaly {
            return Ok(());
        }
        let params = self.core.params();
        if mispricing.confidence_level < params.min_confidence_level {
            return Ok(());
        }
        let (spot, funding_rate) = {
            let registry = self.registry.lock().unwrap();
            let Some(spot) = registry.pairs.get(&mispricing.target_instrument).cloned() else {
                return Ok(());
            };
            let rate = registry
                .funding_rates
                .get(&mispricing.target_instrument)
                .copied()
                .unwrap_or(0.0);
            (spot, rate)
        };
        let Some(snapshot) = self.core.snapshot() else {
            return Ok(());
        };
        let (Some(spot_quote), Some(perp_quote)) = (
            snapshot.quote(&spot),
            snapshot.quote(&mispricing.target_instrument),
        ) else {
            return Ok(());
        };
        let (Some(spot_mid), Some(perp_mid)) =
            (spot_quote.mid().to_f64(), perp_quote.mid().to_f64())
        else {
            return Ok(());
        };
        let Some(edge) = self.net_edge(spot_mid, perp_mid, funding_rate, &params) else {
            return Ok(());
        };
        if edge.abs() < params.min_profit_threshold {
            debug!(
                perpetual = %mispricing.target_instrument,
                edge = edge,
                "funding carry absorbs the basis"
            );
            return Ok(());
        }
        let opportunity = self.build_pair(
            &spot,
            &mispricing.target_instrument,
            edge,
            &snapshot,
            &params,
            Some(mispricing),
        )?;
        self.core.admit(opportunity);
        Ok(())
    }

    fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        let Some(snapshot) = self.core.snapshot() else {
            return Vec::new();
        };
        let params = self.core.params();
        let (pairs, rates) = {
            let registry = self.registry.lock().unwrap();
            (registry.pairs.clone(), registry.funding_rates.clone())
        };
        let mut admitted = Vec::new();

        for (perpetual, spot) in &pairs {
            let (Some(spot_quote), Some(perp_quote)) =
                (snapshot.quote(spot), snapshot.quote(perpetual))
            else {
                continue;
            };
            let (Some(spot_mid), Some(perp_mid)) =
                (spot_quote.mid().to_f64(), perp_quote.mid().to_f64())
            else {
                continue;
            };
            let rate = rates.get(perpetual).copied().unwrap_or(0.0);
            let Some(edge) = self.net_edge(spot_mid, perp_mid, rate, &params) else {
                continue;
            };
            if edge.abs() < params.min_profit_threshold {
                continue;
            }
            if self.has_active_pair(spot, perpetual) {
                continue;
            }
            match self.build_pair(spot, perpetual, edge, &snapshot, &params, None) {
                Ok(opportunity) => {
                    debug!(
                        perpetual = %perpetual,
                        edge = edge,
                        "basis survives the funding carry"
                    );
                    let id = opportunity.opportunity_id.clone();
                    if self.core.admit(opportunity) {
                        if let Some(opp) = self.core.find(&id) {
                            admitted.push(opp);
                        }
                    }
                }
                Err(error) => {
                    self.core.callbacks.fire_error(&error.to_string());
                }
            }
        }
        admitted
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
