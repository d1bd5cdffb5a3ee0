//! Full detection-to-validation pipeline exercised end to end.

use arbdesk::detectors::{
    DetectionParameters, MispricingDetector, StatisticalDetector,
};
use arbdesk::engines::{
    ArbitrageEngine, ArbitrageParameters, ComprehensiveCoordinator, GeneralArbitrageEngine,
};
use arbdesk::pricing::BasketPricingModel;
use arbdesk::types::{ArbitrageStatus, MarketSnapshot, Quote};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn btc_snapshot(price: Decimal) -> MarketSnapshot {
    MarketSnapshot::new().with_quote(Quote::new(
        "BTC-USD",
        price - dec!(0.05),
        price + dec!(0.05),
        dec!(10000),
        dec!(10000),
    ))
}

/// Alternating jitter around 100 so the deviation history has variance,
/// then a 3% dislocation.
fn feed_history(mut push: impl FnMut(MarketSnapshot)) {
    for i in 0..60 {
        let price = if i % 2 == 0 { dec!(99.9) } else { dec!(100.1) };
        push(btc_snapshot(price));
    }
    push(btc_snapshot(dec!(103)));
}

#[test]
fn detected_dislocation_becomes_a_validated_opportunity() {
    let detector = StatisticalDetector::new(DetectionParameters::default());
    let engine = GeneralArbitrageEngine::new(ArbitrageParameters::default());

    feed_history(|snapshot| {
        detector.update_market_data(&snapshot);
        engine.update_market_data(&snapshot);
    });

    let mispricings = detector.detect_opportunities();
    assert_eq!(mispricings.len(), 1);
    let mispricing = &mispricings[0];
    assert!(mispricing.deviation_percentage > 0.02);
    assert!(mispricing.confidence_level > 0.8);

    for m in &mispricings {
        engine.process_mispricing(m).unwrap();
    }

    let active = engine.get_active_opportunities();
    assert_eq!(active.len(), 1);
    let opportunity = &active[0];
    assert_eq!(opportunity.status, ArbitrageStatus::Validated);
    assert!(opportunity.validation_time.is_some());
    assert!(!opportunity.legs.is_empty());
    assert!(opportunity.expected_profit > Decimal::ZERO);
    assert!(opportunity.mispricing_source.is_some());
}

#[test]
fn coordinator_assembles_a_portfolio_from_the_same_feed() {
    let detector = StatisticalDetector::new(DetectionParameters::default());
    let coordinator = ComprehensiveCoordinator::new(
        ArbitrageParameters::default(),
        Arc::new(BasketPricingModel::new()),
    );

    feed_history(|snapshot| {
        detector.update_market_data(&snapshot);
        coordinator.update_market_data(&snapshot);
    });

    for mispricing in detector.detect_opportunities() {
        coordinator.process_mispricing(&mispricing).unwrap();
    }

    let portfolio = coordinator.identify_opportunities();
    assert_eq!(portfolio.len(), 1);
    assert_eq!(portfolio[0].status, ArbitrageStatus::Validated);

    let report = coordinator.report(5);
    assert_eq!(report.top_opportunities.len(), 1);
    assert!(report.total_expected_profit > Decimal::ZERO);
    assert!(report.total_capital_required > Decimal::ZERO);
}

#[test]
fn quiet_market_produces_no_portfolio() {
    let detector = StatisticalDetector::new(DetectionParameters::default());
    let coordinator = ComprehensiveCoordinator::new(
        ArbitrageParameters::default(),
        Arc::new(BasketPricingModel::new()),
    );

    for i in 0..60 {
        let price = if i % 2 == 0 { dec!(99.9) } else { dec!(100.1) };
        let snapshot = btc_snapshot(price);
        detector.update_market_data(&snapshot);
        coordinator.update_market_data(&snapshot);
    }

    assert!(detector.detect_opportunities().is_empty());
    assert!(coordinator.identify_opportunities().is_empty());
}
