//! Cross-engine orchestration
//!
//! Owns one engine of every kind, fans market data and mispricings out to
//! the enabled ones, and assembles a deduplicated portfolio of their active
//! opportunities: ranked by expected profit, stripped of conflicting net
//! exposure, and cut off at the configured capital, correlation, and count
//! limits. Disabling an engine suppresses fan-out and reporting but leaves
//! its state intact for re-enablement.

use super::{
    ArbitrageEngine, ArbitrageParameters, CrossExchangeReplicationEngine, ErrorCallback,
    GeneralArbitrageEngine, MultiInstrumentBasketEngine, OpportunityCallback,
    SpotFundingPerpetualEngine, StatisticalArbitrageEngine, TriangularArbitrageEngine,
};
use crate::errors::EngineResult;
use crate::pricing::PricingModel;
use crate::types::{ArbitrageOpportunity, ArbitrageType, MarketSnapshot, MispricingOpportunity};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    General,
    Statistical,
    Triangular,
    SpotFunding,
    CrossExchange,
    Basket,
}

impl EngineKind {
    pub const ALL: [EngineKind; 6] = [
        EngineKind::General,
        EngineKind::Statistical,
        EngineKind::Triangular,
        EngineKind::SpotFunding,
        EngineKind::CrossExchange,
        EngineKind::Basket,
    ];
}

#[derive(Debug, Clone)]
pub struct CoordinatorLimits {
    /// Combined gross notional across the selected portfolio.
    pub max_total_capital: Decimal,
    /// Combined correlation-risk budget.
    pub max_total_correlation_risk: f64,
    pub max_opportunities: usize,
}

impl Default for CoordinatorLimits {
    fn default() -> Self {
        CoordinatorLimits {
            max_total_capital: dec!(5000000),
            max_total_correlation_risk: 1.0,
            max_opportunities: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorReport {
    pub opportunity_counts: HashMap<String, usize>,
    pub total_expected_profit: Decimal,
    pub total_capital_required: Decimal,
    pub top_opportunities: Vec<ArbitrageOpportunity>,
}

/// Profit-descending rank, conflict stripping, then greedy admission under
/// the portfolio limits. Ties on profit break toward lower VaR.
fn select_portfolio(
    mut candidates: Vec<ArbitrageOpportunity>,
    limits: &CoordinatorLimits,
) -> Vec<ArbitrageOpportunity> {
    candidates.sort_by(|a, b| {
        b.expected_profit
            .cmp(&a.expected_profit)
            .then(a.value_at_risk.cmp(&b.value_at_risk))
    });

    let mut selected: Vec<ArbitrageOpportunity> = Vec::new();
    let mut capital = Decimal::ZERO;
    let mut correlation_budget = 0.0;

    for candidate in candidates {
        if selected.len() >= limits.max_opportunities {
            break;
        }
        if selected.iter().any(|kept| kept.conflicts_with(&candidate)) {
            continue;
        }
        if capital + candidate.total_cost > limits.max_total_capital {
            continue;
        }
        if correlation_budget + candidate.correlation_risk > limits.max_total_correlation_risk {
            continue;
        }
        capital += candidate.total_cost;
        correlation_budget += candidate.correlation_risk;
        selected.push(candidate);
    }
    selected
}

pub struct ComprehensiveCoordinator {
    general: Arc<GeneralArbitrageEngine>,
    statistical: Arc<StatisticalArbitrageEngine>,
    triangular: Arc<TriangularArbitrageEngine>,
    spot_funding: Arc<SpotFundingPerpetualEngine>,
    cross_exchange: Arc<CrossExchangeReplicationEngine>,
    basket: Arc<MultiInstrumentBasketEngine>,
    enabled: Mutex<HashSet<EngineKind>>,
    limits: Mutex<CoordinatorLimits>,
}

impl ComprehensiveCoordinator {
    pub fn new(params: ArbitrageParameters, model: Arc<dyn PricingModel>) -> Self {
        ComprehensiveCoordinator {
            general: Arc::new(GeneralArbitrageEngine::new(params.clone())),
            statistical: Arc::new(StatisticalArbitrageEngine::new(params.clone())),
            triangular: Arc::new(TriangularArbitrageEngine::new(params.clone())),
            spot_funding: Arc::new(SpotFundingPerpetualEngine::new(params.clone())),
            cross_exchange: Arc::new(CrossExchangeReplicationEngine::new(params.clone())),
            basket: Arc::new(MultiInstrumentBasketEngine::new(params, model)),
            enabled: Mutex::new(EngineKind::ALL.into_iter().collect()),
            limits: Mutex::new(CoordinatorLimits::default()),
        }
    }

    pub fn general(&self) -> Arc<GeneralArbitrageEngine> {
        self.general.clone()
    }

    pub fn statistical(&self) -> Arc<StatisticalArbitrageEngine> {
        self.statistical.clone()
    }

    pub fn triangular(&self) -> Arc<TriangularArbitrageEngine> {
        self.triangular.clone()
    }

    pub fn spot_funding(&self) -> Arc<SpotFundingPerpetualEngine> {
        self.spot_funding.clone()
    }

    pub fn cross_exchange(&self) -> Arc<CrossExchangeReplicationEngine> {
        self.cross_exchange.clone()
    }

    pub fn basket(&self) -> Arc<MultiInstrumentBasketEngine> {
        self.basket.clone()
    }

    pub fn set_engine_enabled(&self, kind: EngineKind, enabled: bool) {
        let mut set = self.enabled.lock().unwrap();
        if enabled {
            set.insert(kind);
        } else {
            set.remove(&kind);
        }
    }

    pub fn is_engine_enabled(&self, kind: EngineKind) -> bool {
        self.enabled.lock().unwrap().contains(&kind)
    }

    pub fn set_limits(&self, limits: CoordinatorLimits) {
        *self.limits.lock().unwrap() = limits;
    }

    fn engine(&self, kind: EngineKind) -> &dyn ArbitrageEngine {
        match kind {
            EngineKind::General => self.general.as_ref(),
            EngineKind::Statistical => self.statistical.as_ref(),
            EngineKind::Triangular => self.triangular.as_ref(),
            EngineKind::SpotFunding => self.spot_funding.as_ref(),
            EngineKind::CrossExchange => self.cross_exchange.as_ref(),
            EngineKind::Basket => self.basket.as_ref(),
        }
    }

    fn enabled_kinds(&self) -> Vec<EngineKind> {
        let set = self.enabled.lock().unwrap();
        EngineKind::ALL
            .into_iter()
            .filter(|k| set.contains(k))
            .collect()
    }

    pub fn update_market_data(&self, snapshot: &MarketSnapshot) {
        for kind in self.enabled_kinds() {
            self.engine(kind).update_market_data(snapshot);
        }
    }

    /// Fans one mispricing out to every enabled engine. Engines ignore
    /// mispricings outside their domain; the first collaborator failure
    /// aborts the fan-out and propagates.
    pub fn process_mispricing(&self, mispricing: &MispricingOpportunity) -> EngineResult<()> {
        for kind in self.enabled_kinds() {
            self.engine(kind).process_mispricing(mispricing)?;
        }
        Ok(())
    }

    /// Runs every enabled engine's own identification pass, then selects a
    /// non-conflicting portfolio from the combined active sets.
    pub fn identify_opportunities(&self) -> Vec<ArbitrageOpportunity> {
        let mut candidates = Vec::new();
        for kind in self.enabled_kinds() {
            let engine = self.engine(kind);
            engine.identify_opportunities();
            candidates.extend(engine.get_active_opportunities());
        }
        let limits = self.limits.lock().unwrap().clone();
        let selected = select_portfolio(candidates, &limits);
        info!(
            selected = selected.len(),
            "portfolio selection completed"
        );
        selected
    }

    pub fn clear_opportunities(&self) {
        for kind in EngineKind::ALL {
            self.engine(kind).clear_opportunities();
        }
    }

    pub fn set_opportunity_callback(&self, callback: OpportunityCallback) {
        for kind in EngineKind::ALL {
            self.engine(kind).set_opportunity_callback(callback.clone());
        }
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        for kind in EngineKind::ALL {
            self.engine(kind).set_error_callback(callback.clone());
        }
    }

    pub fn report(&self, top_n: usize) -> CoordinatorReport {
        let selected = self.identify_opportunities();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut profit = Decimal::ZERO;
        let mut capital = Decimal::ZERO;
        for opp in &selected {
            *counts.entry(type_label(opp.arbitrage_type).to_string()).or_insert(0) += 1;
            profit += opp.expected_profit;
            capital += opp.total_cost;
        }
        CoordinatorReport {
            opportunity_counts: counts,
            total_expected_profit: profit,
            total_capital_required: capital,
            top_opportunities: selected.into_iter().take(top_n).collect(),
        }
    }
}

fn type_label(arbitrage_type: ArbitrageType) -> &'static str {
    match arbitrage_type {
        ArbitrageType::Pure => "pure",
        ArbitrageType::Statistical => "statistical",
        ArbitrageType::Triangular => "triangular",
        ArbitrageType::CalendarSpread => "calendar_spread",
        ArbitrageType::InterMarketSpread => "inter_market_spread",
        ArbitrageType::SpotFundingPerpetual => "spot_funding_perpetual",
        ArbitrageType::CrossExchangeReplication => "cross_exchange_replication",
        ArbitrageType::MultiInstrumentBasket => "multi_instrument_basket",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::BasketPricingModel;
    use crate::types::{ArbitrageLeg, MispricingType, Quote, Side};
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot::new().with_quote(Quote::new(
            "BTC-USD",
            dec!(99.95),
            dec!(100.05),
            dec!(10000),
            dec!(10000),
        ))
    }

    fn coordinator() -> ComprehensiveCoordinator {
        ComprehensiveCoordinator::new(
            ArbitrageParameters::default(),
            Arc::new(BasketPricingModel::new()),
        )
    }

    fn statistical_mispricing() -> MispricingOpportunity {
        MispricingOpportunity::new(
            "BTC-USD",
            MispricingType::Statistical,
            dec!(100),
            dec!(103),
            -0.029,
            3.1,
            0.92,
            Duration::minutes(30),
        )
    }

    fn bare_opportunity(
        profit: Decimal,
        cost: Decimal,
        correlation: f64,
        weight: f64,
    ) -> ArbitrageOpportunity {
        let mut opp = ArbitrageOpportunity::new(ArbitrageType::Pure, Duration::minutes(30));
        let side = if weight >= 0.0 { Side::Ask } else { Side::Bid };
        opp.legs
            .push(ArbitrageLeg::new("BTC-USD", side, dec!(1), dec!(100), weight));
        opp.expected_profit = profit;
        opp.total_cost = cost;
        opp.correlation_risk = correlation;
        opp
    }

    #[test]
    fn fanned_out_mispricing_lands_in_the_portfolio() {
        let coord = coordinator();
        coord.update_market_data(&snapshot());
        coord.process_mispricing(&statistical_mispricing()).unwrap();
        let portfolio = coord.identify_opportunities();
        assert_eq!(portfolio.len(), 1);
        assert_eq!(portfolio[0].arbitrage_type, ArbitrageType::Pure);
    }

    #[test]
    fn disabled_engine_is_suppressed_but_keeps_state() {
        let coord = coordinator();
        coord.update_market_data(&snapshot());
        coord.process_mispricing(&statistical_mispricing()).unwrap();
        coord.set_engine_enabled(EngineKind::General, false);
        assert!(coord.identify_opportunities().is_empty());

        coord.set_engine_enabled(EngineKind::General, true);
        assert_eq!(coord.identify_opportunities().len(), 1);
    }

    #[test]
    fn conflicting_exposure_keeps_the_higher_rank() {
        let long = bare_opportunity(dec!(500), dec!(1000), 0.1, 1.0);
        let short = bare_opportunity(dec!(200), dec!(1000), 0.1, -1.0);
        let selected = select_portfolio(vec![short, long], &CoordinatorLimits::default());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].expected_profit, dec!(500));
    }

    #[test]
    fn capital_limit_is_respected() {
        let a = bare_opportunity(dec!(500), dec!(3000000), 0.1, 1.0);
        let b = bare_opportunity(dec!(400), dec!(3000000), 0.1, 0.5);
        let selected = select_portfolio(vec![a, b], &CoordinatorLimits::default());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].expected_profit, dec!(500));
    }

    #[test]
    fn opportunity_count_is_capped() {
        let candidates: Vec<_> = (0..5)
            .map(|i| bare_opportunity(Decimal::from(100 + i), dec!(1000), 0.05, 1.0))
            .collect();
        let limits = CoordinatorLimits {
            max_opportunities: 2,
            ..CoordinatorLimits::default()
        };
        let selected = select_portfolio(candidates, &limits);
        assert_eq!(selected.len(), 2);
        assert!(selected[0].expected_profit >= selected[1].expected_profit);
    }

    #[test]
    fn report_aggregates_profit_and_capital() {
        let coord = coordinator();
        coord.update_market_data(&snapshot());
        coord.process_mispricing(&statistical_mispricing()).unwrap();
        let report = coord.report(5);
        assert_eq!(report.opportunity_counts.get("pure"), Some(&1));
        assert!(report.total_expected_profit > Decimal::ZERO);
        assert!(report.total_capital_required > Decimal::ZERO);
        assert_eq!(report.top_opportunities.len(), 1);
    }
}
