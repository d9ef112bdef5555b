use crate::{InFlightSearch, PerformanceStats, PricePipeline};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Resident memory above this is critical; above 80% of it is a warning
    pub max_memory_usage: usize,
    /// Share of search slots in use that counts as a warning
    pub busy_ratio: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_memory_usage: 2 * 1024 * 1024 * 1024,
            busy_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub browser: HealthLevel,
    pub ocr: HealthLevel,
    pub capacity: HealthLevel,
    pub resources: HealthLevel,
    pub in_flight: usize,
    /// Searches running when the check was taken
    pub running: Vec<InFlightSearch>,
    pub max_concurrent: usize,
    pub browser_sessions: usize,
    pub memory_bytes: Option<usize>,
    pub performance: PerformanceStats,
    pub timestamp: DateTime<Utc>,
}

pub struct SystemHealthChecker {
    pipeline: Arc<PricePipeline>,
    thresholds: HealthThresholds,
}

impl SystemHealthChecker {
    pub fn new(pipeline: Arc<PricePipeline>) -> Self {
        Self {
            pipeline,
            thresholds: HealthThresholds::default(),
        }
    }

    pub async fn check_system_health(&self) -> HealthStatus {
        let start_time = Instant::now();

        let browser = self.check_browser_health();
        let ocr = self.check_ocr_health();
        let capacity = self.check_capacity();
        let memory_bytes = crate::resident_memory_bytes();
        let resources = self.check_resource_health(memory_bytes);

        let overall = [browser, ocr, capacity, resources]
            .into_iter()
            .max()
            .unwrap_or(HealthLevel::Healthy);

        info!(
            "Health check completed in {:?}: {:?}",
            start_time.elapsed(),
            overall
        );

        HealthStatus {
            overall,
            browser,
            ocr,
            capacity,
            resources,
            in_flight: self.pipeline.in_flight_count(),
            running: self.pipeline.in_flight(),
            max_concurrent: self.pipeline.max_concurrent(),
            browser_sessions: self.pipeline.launcher().active_sessions(),
            memory_bytes,
            performance: self.pipeline.performance().get_performance_stats().await,
            timestamp: Utc::now(),
        }
    }

    fn check_browser_health(&self) -> HealthLevel {
        if self.pipeline.launcher().is_available() {
            HealthLevel::Healthy
        } else {
            error!("No Chrome/Chromium executable found");
            HealthLevel::Critical
        }
    }

    fn check_ocr_health(&self) -> HealthLevel {
        if self.pipeline.recognizer().is_available() {
            HealthLevel::Healthy
        } else {
            error!("OCR engine not found");
            HealthLevel::Critical
        }
    }

    fn check_capacity(&self) -> HealthLevel {
        let in_flight = self.pipeline.in_flight_count();
        let limit = self.pipeline.max_concurrent().max(1);
        let ratio = in_flight as f64 / limit as f64;

        if ratio >= self.thresholds.busy_ratio {
            warn!("Search capacity high: {}/{} slots in use", in_flight, limit);
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn check_resource_health(&self, memory_bytes: Option<usize>) -> HealthLevel {
        let Some(memory_usage) = memory_bytes else {
            return HealthLevel::Healthy;
        };

        if memory_usage > self.thresholds.max_memory_usage {
            error!(
                "Resource health critical: memory usage {}",
                crate::format_bytes(memory_usage)
            );
            HealthLevel::Critical
        } else if memory_usage > self.thresholds.max_memory_usage * 8 / 10 {
            warn!(
                "Resource health warning: memory usage {}",
                crate::format_bytes(memory_usage)
            );
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    /// Log a health summary every `interval_duration` until aborted.
    pub fn start_periodic_health_checks(
        self: Arc<Self>,
        interval_duration: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = interval(interval_duration);

            loop {
                interval_timer.tick().await;
                let health_status = self.check_system_health().await;

                match health_status.overall {
                    HealthLevel::Healthy => info!("System health: OK"),
                    HealthLevel::Warning => warn!(
                        "System health: WARNING - Browser: {:?}, OCR: {:?}, Capacity: {:?}, Resources: {:?}",
                        health_status.browser,
                        health_status.ocr,
                        health_status.capacity,
                        health_status.resources
                    ),
                    HealthLevel::Critical => error!(
                        "System health: CRITICAL - Browser: {:?}, OCR: {:?}, Capacity: {:?}, Resources: {:?}",
                        health_status.browser,
                        health_status.ocr,
                        health_status.capacity,
                        health_status.resources
                    ),
                }
            }
        })
    }
}
