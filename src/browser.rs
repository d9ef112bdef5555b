//! Headless browser sessions.
//!
//! [`BrowserLauncher`] and [`BrowserSession`] are the ports the acquisition
//! stage drives; [`ChromiumLauncher`] is the production adapter. A launcher
//! is stateless and shared across requests, while every session is one
//! browser process owned by exactly one request.
//!
//! [`SessionGuard`] ties a session's lifetime to a scope: release it
//! explicitly on the normal path, and if the owning future is dropped
//! (error, panic unwind, cancellation) the guard closes it in the background.

use crate::{create_browser_config, Config, PipelineError};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventDomContentEventFired, NavigateParams,
};
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Page geometry used to decide when scrolling has reached the bottom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_height: f64,
    pub viewport_height: f64,
}

impl ScrollMetrics {
    /// Scroll offset at which the viewport shows the end of the document.
    pub fn bottom(&self) -> f64 {
        (self.scroll_height - self.viewport_height).max(0.0)
    }
}

/// Starts browser sessions. Shared by all requests.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, PipelineError>;

    /// Sessions launched and not yet closed.
    fn active_sessions(&self) -> usize;

    /// Whether a browser can be launched at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// One running browser with a single page.
///
/// Methods carry no time bounds of their own; callers wrap them.
#[async_trait]
pub trait BrowserSession: Send {
    async fn navigate(&mut self, url: &Url) -> Result<(), PipelineError>;

    /// Click the first element matching `selector`. `Ok(false)` if none.
    async fn click_if_present(&mut self, selector: &str) -> Result<bool, PipelineError>;

    async fn scroll_by(&mut self, distance_px: u32) -> Result<(), PipelineError>;

    async fn scroll_metrics(&mut self) -> Result<ScrollMetrics, PipelineError>;

    /// PNG of the whole document, not only the viewport.
    async fn capture_full_page(&mut self) -> Result<Vec<u8>, PipelineError>;

    /// Terminate the browser process.
    async fn close(self: Box<Self>) -> Result<(), PipelineError>;
}

/// Owns a session until it is released.
pub struct SessionGuard {
    session: Option<Box<dyn BrowserSession>>,
    close_timeout: Duration,
}

impl SessionGuard {
    pub fn new(session: Box<dyn BrowserSession>, close_timeout: Duration) -> Self {
        Self {
            session: Some(session),
            close_timeout,
        }
    }

    pub fn session(&mut self) -> &mut dyn BrowserSession {
        self.session
            .as_deref_mut()
            .expect("session is present until released")
    }

    /// Close the session and wait for it to go away.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            close_session(session, self.close_timeout).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let close_timeout = self.close_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Session dropped before release, closing in background");
                handle.spawn(close_session(session, close_timeout));
            }
            Err(_) => {
                warn!("No runtime to close browser session; dropping it");
            }
        }
    }
}

async fn close_session(session: Box<dyn BrowserSession>, close_timeout: Duration) {
    match tokio::time::timeout(close_timeout, session.close()).await {
        Ok(Ok(())) => debug!("Browser session closed"),
        Ok(Err(e)) => warn!("Browser session closed with error: {}", e),
        Err(_) => warn!(
            "Browser session did not close within {:?}; process killed on drop",
            close_timeout
        ),
    }
}

/// Launches one Chromium process per session.
pub struct ChromiumLauncher {
    config: Config,
    active: Arc<AtomicUsize>,
}

impl ChromiumLauncher {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, PipelineError> {
        let profile_dir = std::env::temp_dir().join(format!(
            "price-lens-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::create_dir_all(&profile_dir).await.map_err(|e| {
            PipelineError::LaunchFailure(format!("Failed to create profile dir: {e}"))
        })?;

        let browser_config = create_browser_config(&self.config, &profile_dir)?;

        let (browser, mut handler) = match Browser::launch(browser_config).await {
            Ok(launched) => launched,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&profile_dir).await;
                return Err(PipelineError::LaunchFailure(e.to_string()));
            }
        };

        // The handler drives all CDP traffic and must be polled for the
        // browser to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP handler error: {}", e);
                }
            }
            debug!("CDP handler stream ended");
        });

        self.active.fetch_add(1, Ordering::Relaxed);
        let mut session = ChromiumSession {
            browser,
            handler: handler_task,
            page: None,
            profile_dir,
            navigation_timeout: self.config.timeouts.navigation,
            active: Arc::clone(&self.active),
        };

        if let Err(e) = session.open_page(&self.config).await {
            let _ = Box::new(session).close().await;
            return Err(e);
        }

        info!("Browser session launched");
        Ok(Box::new(session))
    }

    fn active_sessions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    fn is_available(&self) -> bool {
        self.config.browser.resolve_executable().is_some()
    }
}

pub struct ChromiumSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Option<Page>,
    profile_dir: PathBuf,
    navigation_timeout: Duration,
    active: Arc<AtomicUsize>,
}

impl ChromiumSession {
    async fn open_page(&mut self, config: &Config) -> Result<(), PipelineError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| PipelineError::LaunchFailure(e.to_string()))?;

        let viewport = &config.browser.viewport;
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(false)
            .build()
            .map_err(PipelineError::LaunchFailure)?;

        page.execute(metrics)
            .await
            .map_err(|e| PipelineError::LaunchFailure(e.to_string()))?;

        self.page = Some(page);
        Ok(())
    }

    fn page(&self) -> Result<&Page, PipelineError> {
        self.page
            .as_ref()
            .ok_or_else(|| PipelineError::Navigation("no page open".to_string()))
    }

    async fn evaluate_number(&self, expression: &str) -> Result<f64, PipelineError> {
        self.page()?
            .evaluate(expression)
            .await
            .map_err(|e| PipelineError::CaptureFailure(e.to_string()))?
            .into_value::<f64>()
            .map_err(|e| PipelineError::CaptureFailure(e.to_string()))
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    /// Resolves once the initial document is parsed; subresources may
    /// still be loading.
    async fn navigate(&mut self, url: &Url) -> Result<(), PipelineError> {
        let bound = self.navigation_timeout;
        let page = self.page()?;

        // Subscribe first so the event cannot fire before we listen.
        let mut dom_ready = page
            .event_listener::<EventDomContentEventFired>()
            .await
            .map_err(|e| navigation_error(e, bound))?;

        let response = page
            .execute(NavigateParams::new(url.as_str()))
            .await
            .map_err(|e| navigation_error(e, bound))?;
        if let Some(error_text) = &response.result.error_text {
            return Err(PipelineError::Navigation(error_text.clone()));
        }

        match dom_ready.next().await {
            Some(_) => Ok(()),
            None => Err(PipelineError::Navigation(
                "page closed before the document was parsed".to_string(),
            )),
        }
    }

    async fn click_if_present(&mut self, selector: &str) -> Result<bool, PipelineError> {
        let element = match self.page()?.find_element(selector).await {
            Ok(element) => element,
            Err(_) => return Ok(false),
        };

        element
            .click()
            .await
            .map_err(|e| PipelineError::CaptureFailure(e.to_string()))?;
        Ok(true)
    }

    async fn scroll_by(&mut self, distance_px: u32) -> Result<(), PipelineError> {
        self.page()?
            .evaluate(format!("window.scrollBy(0, {distance_px})"))
            .await
            .map_err(|e| PipelineError::CaptureFailure(e.to_string()))?;
        Ok(())
    }

    async fn scroll_metrics(&mut self) -> Result<ScrollMetrics, PipelineError> {
        let scroll_height = self
            .evaluate_number("document.body ? document.body.scrollHeight : 0")
            .await?;
        let viewport_height = self.evaluate_number("window.innerHeight").await?;

        Ok(ScrollMetrics {
            scroll_height,
            viewport_height,
        })
    }

    async fn capture_full_page(&mut self) -> Result<Vec<u8>, PipelineError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        self.page()?
            .screenshot(params)
            .await
            .map_err(|e| PipelineError::CaptureFailure(e.to_string()))
    }

    async fn close(mut self: Box<Self>) -> Result<(), PipelineError> {
        if let Some(page) = self.page.take() {
            let _ = page.close().await;
        }

        let closed = self.browser.close().await;
        if closed.is_err() {
            let _ = self.browser.kill().await;
        }
        let _ = self.browser.wait().await;
        self.handler.abort();

        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            debug!("Could not remove {}: {}", self.profile_dir.display(), e);
        }

        closed
            .map(|_| ())
            .map_err(|e| PipelineError::LaunchFailure(format!("browser close failed: {e}")))
    }
}

fn navigation_error(error: CdpError, bound: Duration) -> PipelineError {
    match error {
        CdpError::Timeout => PipelineError::NavigationTimeout(bound),
        other => PipelineError::Navigation(other.to_string()),
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.handler.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FlagSession {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BrowserSession for FlagSession {
        async fn navigate(&mut self, _url: &Url) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn click_if_present(&mut self, _selector: &str) -> Result<bool, PipelineError> {
            Ok(false)
        }
        async fn scroll_by(&mut self, _distance_px: u32) -> Result<(), PipelineError> {
            Ok(())
        }
        async fn scroll_metrics(&mut self) -> Result<ScrollMetrics, PipelineError> {
            Ok(ScrollMetrics {
                scroll_height: 0.0,
                viewport_height: 0.0,
            })
        }
        async fn capture_full_page(&mut self) -> Result<Vec<u8>, PipelineError> {
            Ok(Vec::new())
        }
        async fn close(self: Box<Self>) -> Result<(), PipelineError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_cdp_timeout_is_navigation_timeout() {
        let bound = Duration::from_secs(60);
        assert!(matches!(
            navigation_error(CdpError::Timeout, bound),
            PipelineError::NavigationTimeout(d) if d == bound
        ));
        assert!(matches!(
            navigation_error(CdpError::NoResponse, bound),
            PipelineError::Navigation(_)
        ));
    }

    #[test]
    fn test_scroll_bottom_never_negative() {
        let metrics = ScrollMetrics {
            scroll_height: 500.0,
            viewport_height: 1080.0,
        };
        assert_eq!(metrics.bottom(), 0.0);

        let metrics = ScrollMetrics {
            scroll_height: 5000.0,
            viewport_height: 1000.0,
        };
        assert_eq!(metrics.bottom(), 4000.0);
    }

    #[tokio::test]
    async fn test_guard_release_closes_session() {
        let closed = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::new(
            Box::new(FlagSession {
                closed: closed.clone(),
            }),
            Duration::from_secs(1),
        );

        guard.release().await;
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guard_drop_closes_session_in_background() {
        let closed = Arc::new(AtomicBool::new(false));
        let guard = SessionGuard::new(
            Box::new(FlagSession {
                closed: closed.clone(),
            }),
            Duration::from_secs(1),
        );

        drop(guard);
        for _ in 0..10 {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_launcher_starts_with_no_sessions() {
        let launcher = ChromiumLauncher::new(Config::default());
        assert_eq!(launcher.active_sessions(), 0);
    }
}
