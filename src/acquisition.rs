//! Page acquisition: render a search results page into a single image.
//!
//! One call owns one browser session from launch to teardown. The session is
//! held in a [`SessionGuard`], so it is closed on success, on every error and
//! when the calling future is dropped mid-stage.

use crate::browser::{BrowserLauncher, BrowserSession, SessionGuard};
use crate::{PipelineError, ScrollSettings, SearchRequest, SiteSettings, Timeouts};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const CONSENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Full-page capture of a search results page. Lives only in memory.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub image: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// How the lazy-content scroll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOutcome {
    pub iterations: u32,
    pub reached_bottom: bool,
}

pub struct PageAcquisition {
    launcher: Arc<dyn BrowserLauncher>,
    site: SiteSettings,
    timeouts: Timeouts,
    scroll: ScrollSettings,
}

impl PageAcquisition {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        site: SiteSettings,
        timeouts: Timeouts,
        scroll: ScrollSettings,
    ) -> Self {
        Self {
            launcher,
            site,
            timeouts,
            scroll,
        }
    }

    pub fn launcher(&self) -> &Arc<dyn BrowserLauncher> {
        &self.launcher
    }

    /// Launch, navigate, dismiss consent, scroll, capture, tear down.
    pub async fn acquire(&self, request: &SearchRequest) -> Result<RenderedPage, PipelineError> {
        let url = self.site.search_url(&request.term)?;
        let start = Instant::now();

        let session = self.launcher.launch().await?;
        let mut guard = SessionGuard::new(session, self.timeouts.session_close);

        let outcome = self.drive(guard.session(), &url).await;
        guard.release().await;

        if let Ok(page) = &outcome {
            info!(
                "Acquired {} capture for '{}' in {}",
                crate::format_bytes(page.image.len()),
                request.term,
                crate::format_duration(start.elapsed())
            );
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        url: &url::Url,
    ) -> Result<RenderedPage, PipelineError> {
        debug!("Navigating to {}", url);
        match timeout(self.timeouts.navigation, session.navigate(url)).await {
            Ok(result) => result?,
            Err(_) => return Err(PipelineError::NavigationTimeout(self.timeouts.navigation)),
        }

        if let Some(selector) = &self.site.consent_selector {
            let dismissed = dismiss_consent(session, selector, self.timeouts.consent_wait).await;
            debug!("Consent control dismissed: {}", dismissed);
        }

        let scrolled = scroll_to_bottom(session, &self.scroll).await;
        debug!(
            "Scrolled {} times (reached bottom: {})",
            scrolled.iterations, scrolled.reached_bottom
        );

        let image = match timeout(self.timeouts.capture, session.capture_full_page()).await {
            Ok(Ok(image)) => image,
            Ok(Err(e @ PipelineError::CaptureFailure(_))) => return Err(e),
            Ok(Err(e)) => return Err(PipelineError::CaptureFailure(e.to_string())),
            Err(_) => {
                return Err(PipelineError::CaptureFailure(format!(
                    "capture did not finish within {:?}",
                    self.timeouts.capture
                )))
            }
        };

        if image.is_empty() {
            return Err(PipelineError::CaptureFailure(
                "browser returned an empty capture".to_string(),
            ));
        }

        Ok(RenderedPage {
            image,
            captured_at: Utc::now(),
        })
    }
}

/// Click the consent control if it shows up within `wait`.
///
/// Never fails: a missing control or a failed click just means the page is
/// captured as is.
pub async fn dismiss_consent(
    session: &mut dyn BrowserSession,
    selector: &str,
    wait: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }

        match timeout(remaining, session.click_if_present(selector)).await {
            Ok(Ok(true)) => return true,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => debug!("Consent click failed: {}", e),
            Err(_) => return false,
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        sleep(CONSENT_POLL_INTERVAL.min(remaining)).await;
    }
}

/// Scroll in fixed steps until the measured bottom is reached or the
/// iteration cap is hit.
///
/// The height is re-measured before every step because it grows as listings
/// load. Scripting errors end the loop early; a partially scrolled page is
/// still captured.
pub async fn scroll_to_bottom(
    session: &mut dyn BrowserSession,
    settings: &ScrollSettings,
) -> ScrollOutcome {
    let mut position = 0.0_f64;
    let mut iterations = 0;

    while iterations < settings.max_iterations {
        let metrics = match session.scroll_metrics().await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Could not measure page, stopping scroll: {}", e);
                return ScrollOutcome {
                    iterations,
                    reached_bottom: false,
                };
            }
        };

        if position >= metrics.bottom() {
            return ScrollOutcome {
                iterations,
                reached_bottom: true,
            };
        }

        if let Err(e) = session.scroll_by(settings.distance_px).await {
            warn!("Scroll step failed, stopping scroll: {}", e);
            return ScrollOutcome {
                iterations,
                reached_bottom: false,
            };
        }

        position += f64::from(settings.distance_px);
        iterations += 1;
        sleep(settings.interval).await;
    }

    warn!(
        "Scroll cap of {} steps hit before the page bottom",
        settings.max_iterations
    );
    ScrollOutcome {
        iterations,
        reached_bottom: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::ScrollMetrics;
    use async_trait::async_trait;
    use url::Url;

    #[derive(Default)]
    struct ScriptedPage {
        scroll_height: f64,
        growth_per_step: f64,
        scrolls: u32,
        clicks: u32,
        consent_after: Option<u32>,
        fail_metrics: bool,
    }

    #[async_trait]
    impl BrowserSession for ScriptedPage {
        async fn navigate(&mut self, _url: &Url) -> Result<(), PipelineError> {
            Ok(())
        }

        async fn click_if_present(&mut self, _selector: &str) -> Result<bool, PipelineError> {
            self.clicks += 1;
            Ok(matches!(self.consent_after, Some(n) if self.clicks >= n))
        }

        async fn scroll_by(&mut self, _distance_px: u32) -> Result<(), PipelineError> {
            self.scrolls += 1;
            self.scroll_height += self.growth_per_step;
            Ok(())
        }

        async fn scroll_metrics(&mut self) -> Result<ScrollMetrics, PipelineError> {
            if self.fail_metrics {
                return Err(PipelineError::CaptureFailure("detached".to_string()));
            }
            Ok(ScrollMetrics {
                scroll_height: self.scroll_height,
                viewport_height: 1000.0,
            })
        }

        async fn capture_full_page(&mut self) -> Result<Vec<u8>, PipelineError> {
            Ok(vec![1])
        }

        async fn close(self: Box<Self>) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn scroll_settings(max_iterations: u32) -> ScrollSettings {
        ScrollSettings {
            distance_px: 400,
            interval: Duration::from_millis(200),
            max_iterations,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_stops_at_bottom() {
        let mut page = ScriptedPage {
            scroll_height: 2000.0,
            ..Default::default()
        };

        let outcome = scroll_to_bottom(&mut page, &scroll_settings(150)).await;
        // bottom = 1000, reached after 3 steps of 400
        assert_eq!(outcome, ScrollOutcome { iterations: 3, reached_bottom: true });
        assert_eq!(page.scrolls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scroll_cap_bounds_growing_page() {
        let mut page = ScriptedPage {
            scroll_height: 2000.0,
            growth_per_step: 800.0,
            ..Default::default()
        };

        let outcome = scroll_to_bottom(&mut page, &scroll_settings(5)).await;
        assert_eq!(outcome, ScrollOutcome { iterations: 5, reached_bottom: false });
        assert_eq!(page.scrolls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_page_needs_no_scroll() {
        let mut page = ScriptedPage {
            scroll_height: 600.0,
            ..Default::default()
        };

        let outcome = scroll_to_bottom(&mut page, &scroll_settings(150)).await;
        assert!(outcome.reached_bottom);
        assert_eq!(page.scrolls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_error_ends_scroll_quietly() {
        let mut page = ScriptedPage {
            fail_metrics: true,
            ..Default::default()
        };

        let outcome = scroll_to_bottom(&mut page, &scroll_settings(150)).await;
        assert_eq!(outcome.iterations, 0);
        assert!(!outcome.reached_bottom);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consent_absent_gives_up_after_wait() {
        let mut page = ScriptedPage::default();
        let started = tokio::time::Instant::now();

        let dismissed = dismiss_consent(&mut page, "button", Duration::from_secs(3)).await;
        assert!(!dismissed);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(page.clicks > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consent_clicked_once_it_appears() {
        let mut page = ScriptedPage {
            consent_after: Some(3),
            ..Default::default()
        };

        assert!(dismiss_consent(&mut page, "button", Duration::from_secs(3)).await);
        assert_eq!(page.clicks, 3);
    }
}
