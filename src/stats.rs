//! Summary statistics over extracted prices.
//!
//! Averages and medians are rounded to the currency's minor unit (two
//! decimals) with round-half-away-from-zero on the `f64` value, which is what
//! [`f64::round`] does. Min and max are reported exactly as extracted.

use serde::{Deserialize, Serialize};

/// Summary of one search's prices. Built once per search, never updated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceStatistics {
    pub average: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

impl PriceStatistics {
    /// Reduce `prices` to summary statistics.
    ///
    /// An empty slice is a valid input and yields all zeroes.
    ///
    /// ```rust
    /// use price_lens::PriceStatistics;
    ///
    /// let stats = PriceStatistics::from_prices(&[10.0, 20.0, 30.0, 40.0]);
    /// assert_eq!(stats.median, 25.0);
    /// assert_eq!(stats.count, 4);
    /// ```
    pub fn from_prices(prices: &[f64]) -> Self {
        if prices.is_empty() {
            return Self::default();
        }

        let mut sorted = prices.to_vec();
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = prices.iter().sum();
        let average = sum / count as f64;

        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Self {
            average: round_minor_units(average),
            median: round_minor_units(median),
            min: sorted[0],
            max: sorted[count - 1],
            count,
        }
    }
}

/// Round to two decimal places, ties away from zero.
pub fn round_minor_units(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
