//! Search pipeline orchestrating acquisition, recognition and extraction
//!
//! [`PricePipeline`] is the only entry point callers need: hand it a search
//! term and it returns either a complete [`PipelineResult`] or a typed
//! [`PipelineError`]. Stages run strictly in order and any failure ends the
//! run; there are no retries at this layer.

use crate::acquisition::PageAcquisition;
use crate::browser::{BrowserLauncher, ChromiumLauncher};
use crate::ocr::{TesseractRecognizer, TextRecognizer};
use crate::{
    Config, ErrorSeverity, Metrics, PerformanceTracker, PipelineError, PriceExtractor,
    PriceStatistics, SearchRequest,
};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of one successful search.
///
/// Serializes to the public response shape:
/// `{searchTerm, timestamp, results: {totalPricesFound, prices, stats}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub search_term: String,
    /// ISO-8601 UTC time the result was assembled
    pub timestamp: String,
    pub results: PriceResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceResults {
    pub total_prices_found: usize,
    pub prices: Vec<f64>,
    pub stats: PriceStatistics,
}

impl PipelineResult {
    pub fn new(search_term: impl Into<String>, prices: Vec<f64>) -> Self {
        let stats = PriceStatistics::from_prices(&prices);
        Self {
            search_term: search_term.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            results: PriceResults {
                total_prices_found: prices.len(),
                prices,
                stats,
            },
        }
    }
}

/// A search currently running.
#[derive(Debug, Clone, Serialize)]
pub struct InFlightSearch {
    pub id: String,
    pub term: String,
    pub started_at: DateTime<Utc>,
}

/// Removes its registry entry when the run ends, however it ends.
struct InFlightGuard {
    registry: Arc<DashMap<String, InFlightSearch>>,
    id: String,
}

impl InFlightGuard {
    fn register(registry: &Arc<DashMap<String, InFlightSearch>>, request: &SearchRequest) -> Self {
        registry.insert(
            request.id.clone(),
            InFlightSearch {
                id: request.id.clone(),
                term: request.term.clone(),
                started_at: Utc::now(),
            },
        );
        Self {
            registry: Arc::clone(registry),
            id: request.id.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Price discovery pipeline
///
/// # Examples
///
/// ```rust,no_run
/// use price_lens::{Config, PricePipeline};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pipeline = PricePipeline::new(Config::default())?;
///
///     let result = pipeline.run("phone").await?;
///     println!(
///         "{} prices, median {}",
///         result.results.total_prices_found, result.results.stats.median
///     );
///     Ok(())
/// }
/// ```
pub struct PricePipeline {
    acquisition: PageAcquisition,
    recognizer: Arc<dyn TextRecognizer>,
    extractor: PriceExtractor,
    config: Config,
    limiter: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, InFlightSearch>>,
    metrics: Arc<Metrics>,
    performance: Arc<PerformanceTracker>,
}

impl PricePipeline {
    /// Build a pipeline backed by Chromium and the tesseract engine.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let launcher = Arc::new(ChromiumLauncher::new(config.clone()));
        let recognizer = Arc::new(TesseractRecognizer::new(
            &config.ocr,
            config.timeouts.recognition,
        ));
        Self::with_components(config, launcher, recognizer)
    }

    /// Build a pipeline around caller-supplied browser and OCR adapters.
    pub fn with_components(
        config: Config,
        launcher: Arc<dyn BrowserLauncher>,
        recognizer: Arc<dyn TextRecognizer>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        let extractor = PriceExtractor::new(&config.site.currency_marker)?;
        let acquisition = PageAcquisition::new(
            launcher,
            config.site.clone(),
            config.timeouts.clone(),
            config.scroll.clone(),
        );

        Ok(Self {
            acquisition,
            recognizer,
            extractor,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_searches)),
            in_flight: Arc::new(DashMap::new()),
            metrics: Arc::new(Metrics::new()),
            performance: Arc::new(PerformanceTracker::default()),
            config,
        })
    }

    /// Run one search end to end.
    ///
    /// The term is validated before anything else, so an invalid term never
    /// launches a browser. The whole run, including any wait for capacity,
    /// is bounded by the request timeout; when it fires the abandoned
    /// browser session is closed in the background.
    pub async fn run(&self, term: &str) -> Result<PipelineResult, PipelineError> {
        let start = Instant::now();

        let outcome = match SearchRequest::new(term) {
            Ok(request) => {
                let span = info_span!("search", request_id = %request.id, term = %request.term);
                self.run_request(&request).instrument(span).await
            }
            Err(e) => Err(e),
        };

        self.record(start.elapsed(), &outcome).await;
        outcome
    }

    async fn run_request(&self, request: &SearchRequest) -> Result<PipelineResult, PipelineError> {
        let limit = self.config.timeouts.request;

        match timeout(limit, self.run_limited(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Search exceeded {:?}, abandoned", limit);
                Err(PipelineError::Timeout(limit))
            }
        }
    }

    async fn run_limited(&self, request: &SearchRequest) -> Result<PipelineResult, PipelineError> {
        let _permit = self.limiter.acquire().await?;
        let _flight = InFlightGuard::register(&self.in_flight, request);
        self.metrics.set_active_searches(self.in_flight.len());

        info!("Search started");
        self.metrics.record_start();

        let stage_start = Instant::now();
        let page = self.acquisition.acquire(request).await?;
        self.metrics.record_stage("acquisition", stage_start.elapsed());
        self.metrics
            .set_browser_sessions(self.acquisition.launcher().active_sessions());

        let stage_start = Instant::now();
        let text = self.recognizer.recognize(&page.image).await?;
        self.metrics.record_stage("recognition", stage_start.elapsed());
        drop(page);
        debug!("Recognized {} characters", text.len());

        let result = self.analyze_text(&request.term, &text);
        info!(
            "Search finished with {} prices",
            result.results.total_prices_found
        );
        Ok(result)
    }

    /// Extract and summarize prices from already recognized text.
    pub fn analyze_text(&self, term: &str, text: &str) -> PipelineResult {
        PipelineResult::new(term, self.extractor.extract(text))
    }

    /// Recognize, extract and summarize prices from a captured image.
    pub async fn analyze_image(
        &self,
        term: &str,
        image: &[u8],
    ) -> Result<PipelineResult, PipelineError> {
        let text = self.recognizer.recognize(image).await?;
        Ok(self.analyze_text(term, &text))
    }

    async fn record(&self, elapsed: Duration, outcome: &Result<PipelineResult, PipelineError>) {
        self.performance.record_request_time(elapsed).await;

        match outcome {
            Ok(result) => self
                .metrics
                .record_success(elapsed, result.results.total_prices_found),
            Err(e) => {
                let elapsed_label = crate::format_duration(elapsed);
                match e.severity() {
                    ErrorSeverity::Low => info!("Search ended after {}: {}", elapsed_label, e),
                    ErrorSeverity::Medium => warn!("Search failed after {}: {}", elapsed_label, e),
                    ErrorSeverity::High => error!("Search failed after {}: {}", elapsed_label, e),
                }
                self.metrics.record_failure(elapsed, e);
                self.performance.record_error(e.kind()).await;
            }
        }
        self.metrics.set_active_searches(self.in_flight.len());
    }

    pub fn launcher(&self) -> &Arc<dyn BrowserLauncher> {
        self.acquisition.launcher()
    }

    pub fn recognizer(&self) -> &Arc<dyn TextRecognizer> {
        &self.recognizer
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn performance(&self) -> &Arc<PerformanceTracker> {
        &self.performance
    }

    pub fn in_flight(&self) -> Vec<InFlightSearch> {
        self.in_flight.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent_searches
    }

    /// Stop accepting searches and wait up to `grace` for running ones.
    ///
    /// Searches started after this fail with [`PipelineError::Overloaded`].
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down search pipeline...");
        self.limiter.close();

        let deadline = Instant::now() + grace;
        while !self.in_flight.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.in_flight.len();
        if remaining > 0 {
            warn!("{} searches still running at shutdown", remaining);
        }
        info!("Search pipeline shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_to_response_shape() {
        let result = PipelineResult::new("phone", vec![999.0, 1499.5, 749.0]);
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["searchTerm"], "phone");
        assert_eq!(json["results"]["totalPricesFound"], 3);
        assert_eq!(json["results"]["prices"][1], 1499.5);
        assert_eq!(json["results"]["stats"]["average"], 1082.5);
        assert_eq!(json["results"]["stats"]["count"], 3);

        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(timestamp.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_empty_result_has_zero_stats() {
        let result = PipelineResult::new("nothing", Vec::new());
        assert_eq!(result.results.total_prices_found, 0);
        assert_eq!(result.results.stats, PriceStatistics::default());
    }

    #[test]
    fn test_in_flight_guard_removes_entry() {
        let registry = Arc::new(DashMap::new());
        let request = SearchRequest::new("tv").unwrap();

        let guard = InFlightGuard::register(&registry, &request);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&request.id).unwrap().term, "tv");

        drop(guard);
        assert!(registry.is_empty());
    }
}
