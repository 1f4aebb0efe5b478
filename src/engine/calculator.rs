//! Grid level math - pure functions, no side effects

use serde::{Deserialize, Serialize};

/// Price rounding for the traded instrument.
///
/// The reference market quotes whole quote-currency prices, so the default
/// is zero decimals. This is the substitution point for venues with finer
/// ticks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePrecision {
    pub decimals: u32,
}

impl Default for PricePrecision {
    fn default() -> Self {
        Self { decimals: 0 }
    }
}

impl PricePrecision {
    pub fn round(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.decimals as i32);
        (price * factor).round() / factor
    }
}

/// Arithmetic ladder: `count + 1` prices from `lower` to `upper` inclusive,
/// each rounded to the instrument precision.
pub fn levels(lower: f64, upper: f64, count: u32, precision: PricePrecision) -> Vec<f64> {
    let step = step(lower, upper, count);
    (0..=count)
        .map(|i| precision.round(lower + step * i as f64))
        .collect()
}

/// Price distance between adjacent ladder rungs
pub fn step(lower: f64, upper: f64, count: u32) -> f64 {
    (upper - lower) / count as f64
}

/// Order quantity for one grid level.
///
/// The venue takes quote-denominated order sizes, so the investment per
/// grid is the quantity. A base-denominated venue would divide by the
/// level price instead; keep that substitution here.
pub fn quantity_per_level(investment_per_grid: f64, _level_price: f64) -> f64 {
    investment_per_grid
}
