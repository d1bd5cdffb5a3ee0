//! Property checks over the significance predicate, severity grading, and
//! the opportunity lifecycle.

use arbdesk::detectors::DetectionParameters;
use arbdesk::types::{
    ArbitrageOpportunity, ArbitrageStatus, ArbitrageType, MispricingSeverity,
};
use chrono::Duration;
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = ArbitrageStatus> {
    prop_oneof![
        Just(ArbitrageStatus::Identified),
        Just(ArbitrageStatus::Validated),
        Just(ArbitrageStatus::Executing),
        Just(ArbitrageStatus::Completed),
        Just(ArbitrageStatus::Failed),
        Just(ArbitrageStatus::Expired),
    ]
}

proptest! {
    #[test]
    fn significance_requires_every_gate(
        deviation in -0.05f64..0.05,
        z_score in -6.0f64..6.0,
        confidence in 0.0f64..1.0,
    ) {
        let params = DetectionParameters::default();
        let expected = deviation.abs() > params.min_deviation_threshold
            && z_score.abs() > params.min_z_score
            && confidence > params.min_confidence_level;
        prop_assert_eq!(
            params.is_significant_deviation(deviation, z_score, confidence),
            expected
        );
    }

    #[test]
    fn severity_is_monotonic(a in 0.0f64..0.2, b in 0.0f64..0.2) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(
            MispricingSeverity::from_deviation(lo) <= MispricingSeverity::from_deviation(hi)
        );
    }

    #[test]
    fn terminal_states_absorb_every_transition(target in status_strategy()) {
        for terminal in [
            ArbitrageStatus::Completed,
            ArbitrageStatus::Failed,
            ArbitrageStatus::Expired,
        ] {
            let mut opp =
                ArbitrageOpportunity::new(ArbitrageType::Pure, Duration::minutes(30));
            opp.status = terminal;
            prop_assert!(opp.transition(target).is_err());
        }
    }

    #[test]
    fn lifecycle_never_skips_validation(target in status_strategy()) {
        let mut opp = ArbitrageOpportunity::new(ArbitrageType::Pure, Duration::minutes(30));
        let allowed = matches!(target, ArbitrageStatus::Validated | ArbitrageStatus::Expired);
        prop_assert_eq!(opp.transition(target).is_ok(), allowed);
    }
}
