//! Detector aggregation
//!
//! `CompositeDetector` fans snapshots out to an ordered set of children and
//! fans their detections back in through the shared consolidation pass.
//! Child insertion order is the ranking tie-break. Callback registration is
//! forwarded to every child, including children added afterwards.
//!
//! `EnhancedCompositeDetector` layers typed side-channel collection and
//! aggregate capital metrics on top.

use super::{
    consolidate_opportunities, CrossExchangeDetector, DetectionCallback, DetectionParameters,
    ExpiryCallback, MispricingDetector, RealTimeDiscrepancyDetector, SyntheticPriceComparator,
};
use crate::errors::EngineResult;
use crate::types::{
    CrossExchangeOpportunity, DerivativePricingDiscrepancy, MarketSnapshot, MispricingOpportunity,
    PriceDiscrepancy,
};
use rust_decimal::prelude::*;
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CompositeSlots {
    children: Vec<Arc<dyn MispricingDetector>>,
    detection_callback: Option<DetectionCallback>,
    expiry_callback: Option<ExpiryCallback>,
}

pub struct CompositeDetector {
    slots: Mutex<CompositeSlots>,
}

impl CompositeDetector {
    pub fn new() -> Self {
        CompositeDetector {
            slots: Mutex::new(CompositeSlots::default()),
        }
    }

    /// Registers a child; callbacks already set on the composite are
    /// forwarded to it immediately.
    pub fn add_detector(&self, detector: Arc<dyn MispricingDetector>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(callback) = &slots.detection_callback {
            detector.set_detection_callback(callback.clone());
        }
        if let Some(callback) = &slots.expiry_callback {
            detector.set_expiry_callback(callback.clone());
        }
        slots.children.push(detector);
    }

    /// Removes the child at `index`; out-of-range is a no-op.
    pub fn remove_detector(&self, index: usize) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if index < slots.children.len() {
            slots.children.remove(index);
            true
        } else {
            false
        }
    }

    pub fn detector_count(&self) -> usize {
        self.slots.lock().unwrap().children.len()
    }

    fn children(&self) -> Vec<Arc<dyn MispricingDetector>> {
        self.slots.lock().unwrap().children.clone()
    }
}

impl Default for CompositeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MispricingDetector for CompositeDetector {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        // Children are cloned out so their own callbacks run unlocked.
        for child in self.children() {
            child.update_market_data(snapshot);
        }
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        let mut gathered = Vec::new();
        for child in self.children() {
            gathered.extend(child.detect_opportunities());
        }
        consolidate_opportunities(gathered)
    }

    fn set_detection_callback(&self, callback: DetectionCallback) {
        let mut slots = self.slots.lock().unwrap();
        for child in &slots.children {
            child.set_detection_callback(callback.clone());
        }
        slots.detection_callback = Some(callback);
    }

    fn set_expiry_callback(&self, callback: ExpiryCallback) {
        let mut slots = self.slots.lock().unwrap();
        for child in &slots.children {
            child.set_expiry_callback(callback.clone());
        }
        slots.expiry_callback = Some(callback);
    }

    fn update_parameters(&self, params: DetectionParameters) -> EngineResult<()> {
        params.validate()?;
        for child in self.children() {
            child.update_parameters(params.clone())?;
        }
        Ok(())
    }
}

/// Capital and quality metrics over one classified detection cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateDetectionMetrics {
    pub opportunity_count: usize,
    pub total_profit_potential: Decimal,
    pub total_capital_required: Decimal,
    /// Profit potential per unit of deployed capital.
    pub portfolio_efficiency_ratio: f64,
    pub average_confidence: f64,
}

/// One classified detection cycle from the enhanced aggregator.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedDetections {
    pub opportunities: Vec<MispricingOpportunity>,
    pub cross_exchange: Vec<CrossExchangeOpportunity>,
    pub price_discrepancies: Vec<PriceDiscrepancy>,
    pub derivative_discrepancies: Vec<DerivativePricingDiscrepancy>,
    pub metrics: AggregateDetectionMetrics,
}

impl ClassifiedDetections {
    fn compute_metrics(&mut self) {
        let opportunities = &self.opportunities;
        self.metrics.opportunity_count = opportunities.len();
        self.metrics.total_profit_potential =
            opportunities.iter().map(|o| o.expected_profit).sum();
        if !opportunities.is_empty() {
            self.metrics.average_confidence = opportunities
                .iter()
                .map(|o| o.confidence_level)
                .sum::<f64>()
                / opportunities.len() as f64;
        }
        // Capital comes from the typed channels; the plain opportunity
        // records do not carry a capital requirement.
        let capital: Decimal = self
            .cross_exchange
            .iter()
            .map(|c| c.required_capital)
            .chain(self.price_discrepancies.iter().map(|d| d.required_capital))
            .chain(
                self.derivative_discrepancies
                    .iter()
                    .map(|d| d.required_margin),
            )
            .sum();
        self.metrics.total_capital_required = capital;
        self.metrics.portfolio_efficiency_ratio = if capital > Decimal::ZERO {
            (self.metrics.total_profit_potential / capital)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };
    }
}

pub struct EnhancedCompositeDetector {
    composite: CompositeDetector,
    cross_exchange: Mutex<Option<Arc<CrossExchangeDetector>>>,
    discrepancy: Mutex<Option<Arc<RealTimeDiscrepancyDetector>>>,
    comparator: Mutex<Option<Arc<SyntheticPriceComparator>>>,
}

impl EnhancedCompositeDetector {
    pub fn new() -> Self {
        EnhancedCompositeDetector {
            composite: CompositeDetector::new(),
            cross_exchange: Mutex::new(None),
            discrepancy: Mutex::new(None),
            comparator: Mutex::new(None),
        }
    }

    pub fn add_detector(&self, detector: Arc<dyn MispricingDetector>) {
        self.composite.add_detector(detector);
    }

    /// Registers the venue-spread detector both as a child and as the
    /// cross-exchange side-channel source.
    pub fn attach_cross_exchange(&self, detector: Arc<CrossExchangeDetector>) {
        self.composite.add_detector(detector.clone());
        *self.cross_exchange.lock().unwrap() = Some(detector);
    }

    pub fn attach_discrepancy(&self, detector: Arc<RealTimeDiscrepancyDetector>) {
        self.composite.add_detector(detector.clone());
        *self.discrepancy.lock().unwrap() = Some(detector);
    }

    pub fn attach_synthetic_comparator(&self, detector: Arc<SyntheticPriceComparator>) {
        self.composite.add_detector(detector.clone());
        *self.comparator.lock().unwrap() = Some(detector);
    }

    pub fn detector_count(&self) -> usize {
        self.composite.detector_count()
    }

    /// One full cycle: detect, rank, and split out the typed channels.
    pub fn detect_and_classify(&self) -> ClassifiedDetections {
        let mut classified = ClassifiedDetections {
            opportunities: self.composite.detect_opportunities(),
            cross_exchange: self
                .cross_exchange
                .lock()
                .unwrap()
                .as_ref()
                .map(|d| d.get_active_cross_exchange_opportunities())
                .unwrap_or_default(),
            price_discrepancies: self
                .discrepancy
                .lock()
                .unwrap()
                .as_ref()
                .map(|d| d.get_active_discrepancies())
                .unwrap_or_default(),
            derivative_discrepancies: self
                .comparator
                .lock()
                .unwrap()
                .as_ref()
                .map(|d| d.get_active_derivative_discrepancies())
                .unwrap_or_default(),
            metrics: AggregateDetectionMetrics::default(),
        };
        classified.compute_metrics();
        classified
    }
}

impl Default for EnhancedCompositeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MispricingDetector for EnhancedCompositeDetector {
    fn update_market_data(&self, snapshot: &MarketSnapshot) {
        self.composite.update_market_data(snapshot);
    }

    fn detect_opportunities(&self) -> Vec<MispricingOpportunity> {
        self.composite.detect_opportunities()
    }

    fn set_detection_callback(&self, callback: DetectionCallback) {
        self.composite.set_detection_callback(callback);
    }

    fn set_expiry_callback(&self, callback: ExpiryCallback) {
        self.composite.set_expiry_callback(callback);
    }

    fn update_parameters(&self, params: DetectionParameters) -> EngineResult<()> {
        self.composite.update_parameters(params)
    }
}
