//! Minimal portfolio view consumed by the sizing contract

use super::market::InstrumentId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub portfolio_id: String,
    pub portfolio_value: Decimal,
    /// Net open notional per instrument.
    pub positions: HashMap<InstrumentId, Decimal>,
}

impl Portfolio {
    pub fn new(portfolio_value: Decimal) -> Self {
        Portfolio {
            portfolio_id: format!("PF-{}", uuid::Uuid::new_v4().simple()),
            portfolio_value,
            positions: HashMap::new(),
        }
    }

    pub fn gross_exposure(&self) -> Decimal {
        self.positions.values().map(|v| v.abs()).sum()
    }
}
