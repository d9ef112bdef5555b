use crate::{ErrorKind, PipelineError};
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Metric handles for the search pipeline.
///
/// Handles are registered against whatever recorder is installed when this
/// is built; with no recorder they are no-ops.
pub struct Metrics {
    pub searches_started: Counter,
    pub searches_completed: Counter,
    pub searches_failed: Counter,
    pub search_duration: Histogram,
    pub prices_found: Histogram,
    pub active_searches: Gauge,
    pub browser_sessions: Gauge,
    pub memory_usage: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            searches_started: register_counter!("price_lens_searches_started_total"),
            searches_completed: register_counter!("price_lens_searches_completed_total"),
            searches_failed: register_counter!("price_lens_searches_failed_total"),
            search_duration: register_histogram!("price_lens_search_duration_seconds"),
            prices_found: register_histogram!("price_lens_prices_found"),
            active_searches: register_gauge!("price_lens_active_searches"),
            browser_sessions: register_gauge!("price_lens_browser_sessions"),
            memory_usage: register_gauge!("price_lens_memory_usage_bytes"),
        }
    }

    pub fn record_start(&self) {
        self.searches_started.increment(1);
    }

    pub fn record_stage(&self, stage: &'static str, duration: Duration) {
        metrics::histogram!(
            "price_lens_stage_duration_seconds",
            duration.as_secs_f64(),
            "stage" => stage
        );
    }

    pub fn record_success(&self, duration: Duration, prices: usize) {
        self.searches_completed.increment(1);
        self.search_duration.record(duration.as_secs_f64());
        self.prices_found.record(prices as f64);
    }

    pub fn record_failure(&self, duration: Duration, error: &PipelineError) {
        self.searches_failed.increment(1);
        self.search_duration.record(duration.as_secs_f64());
        metrics::increment_counter!("price_lens_errors_total", "kind" => error.kind().as_str());
    }

    pub fn set_active_searches(&self, count: usize) {
        self.active_searches.set(count as f64);
    }

    pub fn set_browser_sessions(&self, count: usize) {
        self.browser_sessions.set(count as f64);
    }

    pub fn record_memory_usage(&self, bytes: usize) {
        self.memory_usage.set(bytes as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global Prometheus recorder.
///
/// Must run before any [`Metrics`] is created for the handles to report.
/// Fails if another recorder is already installed.
pub fn install_prometheus() -> Result<PrometheusHandle, PipelineError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| PipelineError::ConfigurationError(format!("Metrics recorder: {e}")))?;
    info!("Prometheus recorder installed");
    Ok(handle)
}

/// Periodically samples process memory into [`Metrics`].
pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            collection_interval: Duration::from_secs(10),
        }
    }

    pub fn start_collection(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let interval = self.collection_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                interval_timer.tick().await;
                if let Some(memory) = crate::resident_memory_bytes() {
                    metrics.record_memory_usage(memory);
                }
            }
        })
    }
}

/// Rolling window of recent search outcomes, reported by the health check.
pub struct PerformanceTracker {
    request_times: Arc<RwLock<VecDeque<Duration>>>,
    error_rates: Arc<RwLock<HashMap<ErrorKind, usize>>>,
    failures: Arc<RwLock<usize>>,
    max_samples: usize,
}

impl PerformanceTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            request_times: Arc::new(RwLock::new(VecDeque::new())),
            error_rates: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(0)),
            max_samples: max_samples.max(1),
        }
    }

    pub async fn record_request_time(&self, duration: Duration) {
        let mut times = self.request_times.write().await;
        times.push_back(duration);

        if times.len() > self.max_samples {
            times.pop_front();
        }
    }

    pub async fn record_error(&self, kind: ErrorKind) {
        *self.error_rates.write().await.entry(kind).or_insert(0) += 1;
        *self.failures.write().await += 1;
    }

    pub async fn get_performance_stats(&self) -> PerformanceStats {
        let times = self.request_times.read().await;
        let errors = self.error_rates.read().await;

        let total_requests = times.len();
        let average_duration = if total_requests > 0 {
            times.iter().map(|d| d.as_secs_f64()).sum::<f64>() / total_requests as f64
        } else {
            0.0
        };

        let p95_duration = if total_requests > 0 {
            let mut sorted_times: Vec<_> = times.iter().copied().collect();
            sorted_times.sort();
            let p95_index = ((total_requests as f64 * 0.95) as usize).min(total_requests - 1);
            sorted_times[p95_index].as_secs_f64()
        } else {
            0.0
        };

        PerformanceStats {
            total_requests,
            total_failures: *self.failures.read().await,
            average_duration,
            p95_duration,
            error_rates: errors
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub total_requests: usize,
    pub total_failures: usize,
    pub average_duration: f64,
    pub p95_duration: f64,
    pub error_rates: HashMap<String, usize>,
}
