//! Rolling-window statistics shared by the detector family

use std::collections::VecDeque;

/// Bounded drop-oldest history of observations.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        RollingWindow {
            values: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn values(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        if self.values.len() < 2 {
            return None;
        }
        let variance = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.values.len() as f64;
        Some(variance.sqrt())
    }

    /// Z-score of `current` against the window; zero when dispersion vanishes.
    pub fn z_score(&self, current: f64) -> f64 {
        match (self.mean(), self.std_dev()) {
            (Some(mean), Some(std)) if std > f64::EPSILON => (current - mean) / std,
            _ => 0.0,
        }
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    if values.len() < 2 {
        return None;
    }
    let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

/// Annualized realized volatility from a price series (daily observations).
pub fn realized_volatility(prices: &[f64]) -> Option<f64> {
    let returns = log_returns(prices);
    std_dev(&returns).map(|s| s * 252f64.sqrt())
}

pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);
    let mean_a = mean(a)?;
    let mean_b = mean(b)?;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denom = (var_a * var_b).sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some((cov / denom).clamp(-1.0, 1.0))
}

/// Mean-reversion half-life of a series via an AR(1) fit on lagged values.
pub fn ar1_half_life(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return None;
    }
    let lagged = &values[..values.len() - 1];
    let current = &values[1..];
    let mean_lag = mean(lagged)?;
    let mean_cur = mean(current)?;
    let mut cov = 0.0;
    let mut var = 0.0;
    for i in 0..lagged.len() {
        cov += (lagged[i] - mean_lag) * (current[i] - mean_cur);
        var += (lagged[i] - mean_lag) * (lagged[i] - mean_lag);
    }
    if var <= f64::EPSILON {
        return None;
    }
    let beta = cov / var;
    if beta <= 0.0 || beta >= 1.0 {
        return None;
    }
    Some(-(2f64.ln()) / beta.ln())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_evicts_oldest_at_capacity() {
        let mut w = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.values(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn z_score_is_zero_without_dispersion() {
        let mut w = RollingWindow::new(10);
        for _ in 0..5 {
            w.push(2.0);
        }
        assert_eq!(w.z_score(3.0), 0.0);
    }

    #[test]
    fn z_score_matches_hand_computation() {
        let mut w = RollingWindow::new(10);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.push(v);
        }
        // mean 3, population stddev sqrt(2)
        let z = w.z_score(5.0);
        assert!((z - 2.0 / 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn correlation_of_identical_series_is_one() {
        let a = [1.0, 2.0, 3.0, 4.0];
        assert!((pearson_correlation(&a, &a).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn half_life_requires_mean_reversion() {
        // Trending series has beta >= 1, no half-life
        let trend: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert!(ar1_half_life(&trend).is_none());
    }
}
