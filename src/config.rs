//! Configuration management with serde serialization/deserialization
//!
//! This module provides all configuration structures for the price pipeline:
//! the target site, browser launch settings, stage timeouts, the lazy-content
//! scroll loop, the OCR engine and the HTTP service.

use crate::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Placeholder substituted with the encoded search term.
pub const QUERY_PLACEHOLDER: &str = "{query}";

/// Longest search term accepted, in characters.
pub const MAX_TERM_LENGTH: usize = 256;

/// Main configuration structure for the price pipeline
///
/// Every section falls back to its defaults, so a config file only needs to
/// name the values it changes.
///
/// # Examples
///
/// ```rust
/// use price_lens::Config;
///
/// let config = Config::default();
/// assert_eq!(config.site.currency_marker, "R");
///
/// let config = Config {
///     max_concurrent_searches: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Catalog site searched for prices
    pub site: SiteSettings,

    /// Headless browser launch settings
    pub browser: BrowserSettings,

    /// Per-stage and whole-request time bounds
    pub timeouts: Timeouts,

    /// Incremental scrolling used to trigger lazily loaded listings
    pub scroll: ScrollSettings,

    /// Text recognition engine settings
    pub ocr: OcrSettings,

    /// HTTP service settings
    pub server: ServerSettings,

    /// Maximum number of pipelines running at once (default: CPU count)
    ///
    /// Every running pipeline owns a full browser process, so this bounds
    /// memory as much as CPU.
    pub max_concurrent_searches: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site: SiteSettings::default(),
            browser: BrowserSettings::default(),
            timeouts: Timeouts::default(),
            scroll: ScrollSettings::default(),
            ocr: OcrSettings::default(),
            server: ServerSettings::default(),
            max_concurrent_searches: num_cpus::get().max(1),
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing fields keep their defaults.
    pub async fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: &str| Err(PipelineError::ConfigurationError(msg.to_string()));

        if self.max_concurrent_searches == 0 {
            return fail("Max concurrent searches must be greater than 0");
        }

        if self.site.currency_marker.trim().is_empty() {
            return fail("Currency marker must not be empty");
        }

        if !self.site.search_url_template.contains(QUERY_PLACEHOLDER) {
            return fail("Search URL template must contain {query}");
        }

        self.site.search_url("probe")?;

        if self.browser.viewport.width == 0 || self.browser.viewport.height == 0 {
            return fail("Viewport dimensions must be greater than 0");
        }

        let t = &self.timeouts;
        if [t.navigation, t.consent_wait, t.capture, t.recognition, t.request, t.session_close]
            .iter()
            .any(|d| d.is_zero())
        {
            return fail("Timeouts must be greater than 0");
        }

        if t.request < t.navigation {
            return fail("Request timeout must not be shorter than the navigation timeout");
        }

        if self.scroll.distance_px == 0 {
            return fail("Scroll distance must be greater than 0");
        }

        if self.scroll.max_iterations == 0 {
            return fail("Scroll iteration cap must be greater than 0");
        }

        if self.ocr.language.trim().is_empty() {
            return fail("OCR language must not be empty");
        }

        Ok(())
    }
}

/// Catalog site searched for prices
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SiteSettings {
    /// Search results URL; `{query}` is replaced with the encoded term
    pub search_url_template: String,

    /// Marker that prefixes every price on the rendered page (default: "R")
    pub currency_marker: String,

    /// CSS selector of the cookie/consent button dismissed before scrolling
    ///
    /// Set to `None` to skip consent handling entirely.
    pub consent_selector: Option<String>,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            search_url_template: "https://www.takealot.com/all?qsearch={query}".to_string(),
            currency_marker: "R".to_string(),
            consent_selector: Some(r#"button[class*="cookie"]"#.to_string()),
        }
    }
}

impl SiteSettings {
    /// Build the search results URL for `term`.
    ///
    /// The term is form-encoded, so spaces become `+` and reserved
    /// characters are percent-escaped.
    pub fn search_url(&self, term: &str) -> Result<Url, PipelineError> {
        let encoded: String = url::form_urlencoded::byte_serialize(term.as_bytes()).collect();
        let raw = self.search_url_template.replace(QUERY_PLACEHOLDER, &encoded);

        let url = crate::validate_url(&raw).map_err(|e| {
            PipelineError::ConfigurationError(format!("Invalid search URL {raw}: {e}"))
        })?;

        Ok(url)
    }
}

/// Headless browser launch settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Viewport the page is rendered at
    pub viewport: Viewport,

    /// Custom User-Agent string
    pub user_agent: Option<String>,

    /// Additional command-line switches appended verbatim
    pub extra_args: Vec<String>,

    /// Run without a visible window (default: true)
    pub headless: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            chrome_path: None,
            viewport: Viewport::default(),
            user_agent: None,
            extra_args: Vec::new(),
            headless: true,
        }
    }
}

impl BrowserSettings {
    /// Resolve the browser executable: explicit path, then
    /// `PRICE_LENS_CHROME`, then the usual binary names on `PATH`.
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        if let Some(path) = &self.chrome_path {
            return Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("PRICE_LENS_CHROME") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        ["google-chrome", "chromium", "chromium-browser", "chrome"]
            .iter()
            .find_map(|name| which::which(name).ok())
    }
}

/// Browser viewport configuration
///
/// ```rust
/// use price_lens::Viewport;
///
/// let desktop = Viewport::default();
/// assert_eq!(desktop.width, 1920);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    ///
    /// Values above 1.0 render text with more pixels per glyph, which helps
    /// recognition at the cost of a larger capture.
    pub device_scale_factor: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
        }
    }
}

/// Stage time bounds, serialized as milliseconds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    /// Navigation to the search results page (default: 60s)
    #[serde(with = "duration_ms")]
    pub navigation: Duration,

    /// Wait for the consent control to appear (default: 3s)
    #[serde(with = "duration_ms")]
    pub consent_wait: Duration,

    /// Full-page screenshot capture (default: 30s)
    #[serde(with = "duration_ms")]
    pub capture: Duration,

    /// OCR engine run (default: 60s)
    #[serde(with = "duration_ms")]
    pub recognition: Duration,

    /// Whole pipeline, start to response (default: 120s)
    #[serde(with = "duration_ms")]
    pub request: Duration,

    /// Orderly browser shutdown before the process is killed (default: 5s)
    #[serde(with = "duration_ms")]
    pub session_close: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(60),
            consent_wait: Duration::from_secs(3),
            capture: Duration::from_secs(30),
            recognition: Duration::from_secs(60),
            request: Duration::from_secs(120),
            session_close: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// Deadline chromiumoxide applies to each CDP command.
    ///
    /// Kept above every stage bound so the stage timers always fire first and
    /// report their own error kind.
    pub fn cdp_command(&self) -> Duration {
        self.navigation.max(self.capture) + self.session_close
    }
}

/// Scroll loop that makes the page load its lazy listings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrollSettings {
    /// Pixels scrolled per step (default: 400)
    pub distance_px: u32,

    /// Pause between steps (default: 200ms)
    #[serde(with = "duration_ms")]
    pub interval: Duration,

    /// Hard cap on steps; pages that keep growing stop here (default: 150)
    pub max_iterations: u32,
}

impl Default for ScrollSettings {
    fn default() -> Self {
        Self {
            distance_px: 400,
            interval: Duration::from_millis(200),
            max_iterations: 150,
        }
    }
}

/// OCR engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Path to the `tesseract` executable (default: found on PATH)
    pub binary: Option<String>,

    /// Trained language data to use (default: "eng")
    pub language: String,

    /// Tesseract page segmentation mode (`--psm`)
    pub page_segmentation_mode: Option<u8>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            binary: None,
            language: "eng".to_string(),
            page_segmentation_mode: None,
        }
    }
}

/// HTTP service settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
    /// Expose Prometheus text at `/metrics`
    pub enable_metrics: bool,
    /// Allow cross-origin callers
    pub cors: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            enable_metrics: false,
            cors: true,
        }
    }
}

/// A validated search request
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub id: String,
    pub term: String,
}

impl SearchRequest {
    /// Validate `term` and assign a fresh request id.
    ///
    /// Surrounding whitespace is dropped; blank terms, terms with control
    /// characters and overly long terms are rejected.
    pub fn new(term: &str) -> Result<Self, PipelineError> {
        let term = term.trim();

        if term.is_empty() {
            return Err(PipelineError::InvalidInput(
                "Search term is required".to_string(),
            ));
        }

        if term.chars().any(char::is_control) {
            return Err(PipelineError::InvalidInput(
                "Search term must not contain control characters".to_string(),
            ));
        }

        if term.chars().count() > MAX_TERM_LENGTH {
            return Err(PipelineError::InvalidInput(format!(
                "Search term longer than {MAX_TERM_LENGTH} characters"
            )));
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            term: term.to_string(),
        })
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// ```rust
/// use price_lens::{Config, get_chrome_args};
///
/// let args = get_chrome_args(&Config::default());
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn get_chrome_args(config: &Config) -> Vec<String> {
    let browser = &config.browser;

    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-features=TranslateUI".to_string(),
        format!(
            "--window-size={},{}",
            browser.viewport.width, browser.viewport.height
        ),
    ];

    if let Some(user_agent) = &browser.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args.extend(browser.extra_args.iter().cloned());

    args
}

/// Build the chromiumoxide launch configuration.
///
/// Each launch passes its own throwaway `profile_dir`, so concurrent
/// sessions never share cookies, cache or storage.
pub fn create_browser_config(
    config: &Config,
    profile_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, PipelineError> {
    use chromiumoxide::browser::BrowserConfig;

    let browser = &config.browser;
    let mut builder = BrowserConfig::builder()
        .window_size(browser.viewport.width, browser.viewport.height)
        .user_data_dir(profile_dir)
        .request_timeout(config.timeouts.cdp_command())
        .args(get_chrome_args(config));

    builder = if browser.headless {
        builder.new_headless_mode()
    } else {
        builder.with_head()
    };

    if let Some(chrome_path) = browser.resolve_executable() {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(PipelineError::LaunchFailure)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.timeouts.navigation, Duration::from_secs(60));
        assert_eq!(config.timeouts.consent_wait, Duration::from_secs(3));
        assert_eq!(config.scroll.distance_px, 400);
        assert_eq!(config.scroll.interval, Duration::from_millis(200));
        assert!(config.max_concurrent_searches >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cdp_deadline_outlasts_stage_bounds() {
        let mut timeouts = Timeouts::default();
        assert_eq!(timeouts.cdp_command(), Duration::from_secs(65));
        assert!(timeouts.cdp_command() > timeouts.navigation);

        timeouts.capture = Duration::from_secs(90);
        assert_eq!(timeouts.cdp_command(), Duration::from_secs(95));
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"timeouts": {"navigation": 5000}, "scroll": {"max_iterations": 3}}"#)
                .unwrap();
        assert_eq!(config.timeouts.navigation, Duration::from_secs(5));
        assert_eq!(config.timeouts.request, Duration::from_secs(120));
        assert_eq!(config.scroll.max_iterations, 3);
        assert_eq!(config.scroll.distance_px, 400);
        assert_eq!(config.site.currency_marker, "R");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.timeouts.request = Duration::from_secs(10);
        assert!(matches!(config.validate(), Err(PipelineError::ConfigurationError(_))));

        let mut config = Config::default();
        config.site.search_url_template = "https://example.com/search".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.site.search_url_template = "ftp://example.com/?q={query}".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scroll.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.site.currency_marker = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_search_url_encodes_term() {
        let site = SiteSettings::default();
        let url = site.search_url("samsung phone & case").unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.takealot.com/all?qsearch=samsung+phone+%26+case"
        );
        let term = url
            .query_pairs()
            .find(|(k, _)| k == "qsearch")
            .map(|(_, v)| v.into_owned());
        assert_eq!(term.as_deref(), Some("samsung phone & case"));
    }

    #[test]
    fn test_search_request_validation() {
        assert!(matches!(SearchRequest::new(""), Err(PipelineError::InvalidInput(_))));
        assert!(matches!(SearchRequest::new("   \t"), Err(PipelineError::InvalidInput(_))));
        assert!(matches!(SearchRequest::new("tv\u{0}"), Err(PipelineError::InvalidInput(_))));
        assert!(SearchRequest::new(&"a".repeat(MAX_TERM_LENGTH + 1)).is_err());

        let request = SearchRequest::new("  phone ").unwrap();
        assert_eq!(request.term, "phone");
        assert!(!request.id.is_empty());
    }

    #[test]
    fn test_chrome_args_generation() {
        let mut config = Config::default();
        config.browser.user_agent = Some("price-lens".to_string());
        config.browser.extra_args = vec!["--lang=en-ZA".to_string()];
        let args = get_chrome_args(&config);

        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-setuid-sandbox".to_string()));
        assert!(args.contains(&"--window-size=1920,1080".to_string()));
        assert!(args.contains(&"--user-agent=price-lens".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--lang=en-ZA"));
    }

    #[test]
    fn test_explicit_chrome_path_wins() {
        let settings = BrowserSettings {
            chrome_path: Some("/opt/chrome/chrome".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve_executable(),
            Some(PathBuf::from("/opt/chrome/chrome"))
        );
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"max_concurrent_searches": 4, "server": {"port": 8081}}"#)
            .await
            .unwrap();

        let config = Config::from_file(&path).await.unwrap();
        assert_eq!(config.max_concurrent_searches, 4);
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.bind, "0.0.0.0");

        let missing = Config::from_file(&dir.path().join("missing.json")).await;
        assert!(matches!(missing, Err(PipelineError::IoError(_))));
    }
}
