//! Arbitrage Desk Engine - Main Entry Point
//!
//! Simulated-feed demo: a random-walk quote stream is pushed through the
//! full detection, aggregation, and engine-coordination pipeline.

use arbdesk::*;
use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::time;
use tracing::{error, info, warn};

use arbdesk::detectors::{
    BasisCalculator, CrossExchangeDetector, EnhancedCompositeDetector, MispricingDetector,
    RealTimeDiscrepancyDetector, StatArbSignalGenerator, StatisticalDetector,
    SyntheticPriceComparator, TriangularDetector, VolatilityDetector,
};
use arbdesk::engines::ComprehensiveCoordinator;
use arbdesk::pricing::BasketPricingModel;
use arbdesk::sizing::KellySizer;

/// Random-walk mid prices for the demo instruments.
struct SimulatedFeed {
    btc: f64,
    eth: f64,
    perp_premium: f64,
    rng: rand::rngs::ThreadRng,
}

impl SimulatedFeed {
    fn new() -> Self {
        SimulatedFeed {
            btc: 50000.0,
            eth: 2000.0,
            perp_premium: 1.0005,
            rng: rand::rng(),
        }
    }

    fn step(&mut self) {
        self.btc *= 1.0 + self.rng.random_range(-0.0015..0.0015);
        self.eth *= 1.0 + self.rng.random_range(-0.0015..0.0015);
        self.perp_premium *= 1.0 + self.rng.random_range(-0.0002..0.0002);
    }

    fn quote(&self, instrument: &str, mid: f64, spread_bps: f64, size: Decimal) -> Quote {
        let half = mid * spread_bps / 20000.0;
        let bid = Decimal::from_f64(mid - half).unwrap_or(Decimal::ONE);
        let ask = Decimal::from_f64(mid + half).unwrap_or(Decimal::ONE);
        Quote::new(instrument, bid, ask, size, size)
    }

    fn snapshot(&self) -> MarketSnapshot {
        let cross = self.btc / self.eth;
        let index = 0.3 * self.eth + 0.7 * self.btc;
        MarketSnapshot::new()
            .with_quote(self.quote("BTC-USD", self.btc, 2.0, dec!(10000)))
            .with_quote(self.quote("ETH-USD", self.eth, 2.5, dec!(20000)))
            .with_quote(self.quote("BTC-ETH", cross, 4.0, dec!(5000)))
            .with_quote(self.quote("BTC-PERP", self.btc * self.perp_premium, 2.0, dec!(10000)))
            .with_quote(self.quote("MAJORS-IDX", index, 3.0, dec!(5000)))
    }
}

fn build_detector(model: Arc<BasketPricingModel>) -> Arc<EnhancedCompositeDetector> {
    let params = CONFIG.detection_parameters();
    let detector = Arc::new(EnhancedCompositeDetector::new());

    detector.add_detector(Arc::new(StatisticalDetector::new(params.clone())));
    detector.add_detector(Arc::new(VolatilityDetector::new(params.clone())));

    let triangular = TriangularDetector::new(params.clone());
    triangular.add_triangle(
        "btc-eth-usd",
        ["BTC-USD".into(), "ETH-USD".into(), "BTC-ETH".into()],
    );
    detector.add_detector(Arc::new(triangular));

    let basis = BasisCalculator::new(params.clone());
    basis.add_instrument_pair("BTC-USD", "BTC-PERP");
    detector.add_detector(Arc::new(basis));

    let stat_arb = StatArbSignalGenerator::new(params.clone());
    stat_arb.add_pair("ETH-USD", "BTC-USD");
    detector.add_detector(Arc::new(stat_arb));

    detector.attach_cross_exchange(Arc::new(CrossExchangeDetector::new(params.clone())));
    detector.attach_discrepancy(Arc::new(RealTimeDiscrepancyDetector::new(params.clone())));

    let comparator = SyntheticPriceComparator::new(params, model);
    comparator.add_synthetic_target("MAJORS-IDX", vec!["ETH-USD".into(), "BTC-USD".into()]);
    detector.attach_synthetic_comparator(Arc::new(comparator));

    detector
}

fn build_coordinator(model: Arc<BasketPricingModel>) -> ComprehensiveCoordinator {
    let coordinator = ComprehensiveCoordinator::new(CONFIG.arbitrage_parameters(), model);

    coordinator.general().attach_sizer(
        Arc::new(KellySizer::new()),
        Portfolio::new(CONFIG.portfolio_value),
        CONFIG.risk_parameters(),
    );
    coordinator
        .statistical()
        .set_pair_correlation("ETH-USD", "BTC-USD", 0.85);
    coordinator.triangular().add_triangle(
        "btc-eth-usd",
        ["BTC-USD".into(), "ETH-USD".into(), "BTC-ETH".into()],
    );
    coordinator.spot_funding().register_pair("BTC-USD", "BTC-PERP");
    coordinator.spot_funding().update_funding_rate("BTC-PERP", 0.0001);
    coordinator.cross_exchange().register_exchange("primary", 0.001, 20);
    coordinator.basket().define_basket(
        "majors",
        "MAJORS-IDX",
        vec!["ETH-USD".into(), "BTC-USD".into()],
    );
    coordinator
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    utils::setup_output_directories()?;
    let _logging_guard = utils::setup_logging()?;

    let config = CONFIG.clone();
    info!("Arbitrage Desk Engine v0.3.0");
    info!("  Observation window: {}", config.min_observation_window);
    info!("  Min deviation: {}", config.min_deviation_threshold);
    info!("  Min z-score: {}", config.min_z_score);
    info!("  Min profit threshold: {}", config.min_profit_threshold);
    info!("  Portfolio value: {}", config.portfolio_value);
    info!("  Cycles: {} every {} ms", config.demo_cycles, config.snapshot_interval_ms);

    let model = Arc::new(BasketPricingModel::new());
    let detector = build_detector(model.clone());
    let coordinator = Arc::new(build_coordinator(model));

    detector.set_detection_callback(Arc::new(|mispricing: &MispricingOpportunity| {
        info!(
            instrument = %mispricing.target_instrument,
            kind = ?mispricing.mispricing_type,
            deviation = mispricing.deviation_percentage,
            z_score = mispricing.z_score,
            "mispricing detected"
        );
    }));
    coordinator.set_error_callback(Arc::new(|message: &str| {
        warn!(message, "engine reported an error");
    }));

    let mut feed = SimulatedFeed::new();
    let mut interval = time::interval(time::Duration::from_millis(config.snapshot_interval_ms));
    let started = Utc::now();

    for cycle in 0..config.demo_cycles {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }

        feed.step();
        let snapshot = feed.snapshot();
        detector.update_market_data(&snapshot);
        coordinator.update_market_data(&snapshot);

        let classified = detector.detect_and_classify();
        for mispricing in &classified.opportunities {
            if let Err(e) = coordinator.process_mispricing(mispricing) {
                error!(error = %e, "mispricing processing failed");
            }
        }

        if cycle > 0 && cycle % 30 == 0 {
            let report = coordinator.report(5);
            info!(
                cycle,
                detections = classified.metrics.opportunity_count,
                avg_confidence = classified.metrics.average_confidence,
                "cycle summary"
            );
            match serde_json::to_string(&report) {
                Ok(json) => info!(report = %json, "coordinator report"),
                Err(e) => warn!(error = %e, "report serialization failed"),
            }
        }
    }

    let report = coordinator.report(10);
    info!(
        runtime_secs = (Utc::now() - started).num_seconds(),
        portfolio = report.top_opportunities.len(),
        expected_profit = %report.total_expected_profit,
        capital = %report.total_capital_required,
        "demo complete"
    );
    Ok(())
}
