//! Currency token extraction from recognized text.
//!
//! A token is the currency marker, at most one whitespace character, then an
//! amount. The amount is either comma-grouped thousands (`1,250`) or a plain
//! digit run (`1499`) of ASCII digits, with an optional one or two digit
//! fraction. Anything that does not convert to a finite, strictly positive
//! value is dropped.

use crate::PipelineError;
use regex::Regex;

#[derive(Debug, Clone)]
pub struct PriceExtractor {
    marker: String,
    pattern: Regex,
}

impl PriceExtractor {
    /// Build an extractor for prices prefixed with `marker` (e.g. `"R"`).
    pub fn new(marker: &str) -> Result<Self, PipelineError> {
        let marker = marker.trim();
        if marker.is_empty() {
            return Err(PipelineError::ConfigurationError(
                "Currency marker must not be empty".to_string(),
            ));
        }

        let pattern = format!(
            r"{}\s?((?:[0-9]{{1,3}}(?:,[0-9]{{3}})+|[0-9]+)(?:\.[0-9]{{1,2}})?)",
            regex::escape(marker)
        );
        let pattern = Regex::new(&pattern)
            .map_err(|e| PipelineError::ConfigurationError(format!("Invalid price pattern: {e}")))?;

        Ok(Self {
            marker: marker.to_string(),
            pattern,
        })
    }

    /// Extract prices in the order they appear in `text`.
    ///
    /// Repeated prices are kept; each one is a separate listing on the page.
    ///
    /// ```rust
    /// use price_lens::PriceExtractor;
    ///
    /// let extractor = PriceExtractor::new("R").unwrap();
    /// let prices = extractor.extract("R 1,250.00 and R0 and R99.5");
    /// assert_eq!(prices, vec![1250.0, 99.5]);
    /// ```
    pub fn extract(&self, text: &str) -> Vec<f64> {
        self.pattern
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .filter_map(|amount| parse_amount(amount.as_str()))
            .collect()
    }

    /// Render `price` the way the catalog shows it, e.g. `R 1,499.50`.
    pub fn format(&self, price: f64) -> String {
        format!("{} {}", self.marker, group_thousands(price))
    }
}

fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value > 0.0)
}

fn group_thousands(price: f64) -> String {
    let fixed = format!("{price:.2}");
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let digits: Vec<char> = whole.chars().collect();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*digit);
    }

    format!("{grouped}.{fraction}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> PriceExtractor {
        PriceExtractor::new("R").unwrap()
    }

    #[test]
    fn test_noisy_text_keeps_only_positive_prices_in_order() {
        let prices = extractor().extract("R 1,250.00 and R0 and R99.5");
        assert_eq!(prices, vec![1250.0, 99.5]);
    }

    #[test]
    fn test_plain_and_grouped_amounts() {
        let text = "Galaxy A15 R2,999\niPhone R 21,499.00 Cable R99 Charger R1499.50";
        let prices = extractor().extract(text);
        assert_eq!(prices, vec![2999.0, 21499.0, 99.0, 1499.5]);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let prices = extractor().extract("R 349 R 349 R 349");
        assert_eq!(prices, vec![349.0, 349.0, 349.0]);
    }

    #[test]
    fn test_zero_and_malformed_tokens_are_dropped() {
        let text = "R0.00 R 0 R-50 R.99 Rabc R, total: R 12.5";
        let prices = extractor().extract(text);
        assert_eq!(prices, vec![12.5]);
    }

    #[test]
    fn test_fraction_is_at_most_two_digits() {
        let prices = extractor().extract("R19.999");
        assert_eq!(prices, vec![19.99]);
    }

    #[test]
    fn test_only_one_whitespace_after_marker() {
        assert!(extractor().extract("R   100").is_empty());
        assert_eq!(extractor().extract("R\t100"), vec![100.0]);
    }

    #[test]
    fn test_no_tokens() {
        assert!(extractor().extract("").is_empty());
        assert!(extractor().extract("no prices on this page").is_empty());
    }

    #[test]
    fn test_only_ascii_digits_are_amounts() {
        let prices = extractor().extract("R12\u{0663} R\u{00A0}50");
        assert_eq!(prices, vec![12.0, 50.0]);
    }

    #[test]
    fn test_marker_is_escaped() {
        let extractor = PriceExtractor::new("$").unwrap();
        assert_eq!(extractor.extract("was $1,000.00 now $899"), vec![1000.0, 899.0]);
        assert!(extractor.extract("R100").is_empty());
    }

    #[test]
    fn test_empty_marker_rejected() {
        assert!(matches!(
            PriceExtractor::new("  "),
            Err(PipelineError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_format() {
        let extractor = extractor();
        assert_eq!(extractor.format(999.0), "R 999.00");
        assert_eq!(extractor.format(1499.5), "R 1,499.50");
        assert_eq!(extractor.format(1234567.891), "R 1,234,567.89");
    }

    #[test]
    fn test_formatted_prices_extract_back() {
        let extractor = extractor();
        let prices = vec![0.01, 5.0, 99.5, 749.0, 999.99, 1000.0, 1499.5, 25_000.0, 1_250_000.75];
        let text = prices
            .iter()
            .map(|p| extractor.format(*p))
            .collect::<Vec<_>>()
            .join(" | ");
        assert_eq!(extractor.extract(&text), prices);
    }
}
