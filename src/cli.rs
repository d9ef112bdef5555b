use crate::{
    batch, AppState, BatchEntry, BatchRunner, Config, ErrorBody, HealthLevel, MetricsCollector,
    PricePipeline, ProgressTracker, SystemHealthChecker,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "price-lens")]
#[command(about = "Price discovery from rendered catalog search pages")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Maximum concurrent searches")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Whole-search timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the price API over HTTP
    Serve {
        #[arg(short, long, help = "Server port")]
        port: Option<u16>,

        #[arg(long, help = "Bind address")]
        bind: Option<String>,

        #[arg(long, help = "Expose Prometheus metrics at /metrics")]
        metrics: bool,
    },

    /// Run one search and print the result as JSON
    Search {
        term: String,

        #[arg(long, help = "Pretty-print the JSON output")]
        pretty: bool,
    },

    /// Run one search per line of a file, writing JSON Lines
    Batch {
        #[arg(short, long, help = "Input file containing search terms (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Output file (default: stdout)")]
        output: Option<PathBuf>,

        #[arg(short, long, help = "Searches run at once (default: max concurrent)")]
        concurrency: Option<usize>,

        #[arg(long, help = "Progress reporting interval in seconds")]
        progress_interval: Option<u64>,
    },

    /// Extract prices from a text file, e.g. saved OCR output
    Extract {
        file: PathBuf,

        #[arg(long, help = "Search term reported in the result")]
        term: Option<String>,
    },

    /// Recognize and extract prices from a captured image
    Recognize {
        file: PathBuf,

        #[arg(long, help = "Search term reported in the result")]
        term: Option<String>,
    },

    /// Validate configuration
    Validate {
        #[arg(help = "Configuration file to validate")]
        config: PathBuf,
    },

    /// Show dependency and capacity health
    Health,
}

impl Commands {
    /// Whether this command needs the Prometheus recorder.
    pub fn wants_metrics(&self, config: &Config) -> bool {
        matches!(self, Commands::Serve { metrics, .. } if *metrics || config.server.enable_metrics)
    }
}

impl Cli {
    /// Apply command-line overrides on top of file or default settings.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent_searches = max_concurrent;
        }
        if let Some(timeout) = self.timeout {
            config.timeouts.request = Duration::from_secs(timeout);
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.browser.chrome_path = Some(chrome_path.clone());
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    pub pipeline: Arc<PricePipeline>,
    prometheus: Option<PrometheusHandle>,
}

impl CliRunner {
    pub fn new(config: Config, prometheus: Option<PrometheusHandle>) -> anyhow::Result<Self> {
        let pipeline = Arc::new(PricePipeline::new(config.clone())?);
        Ok(Self {
            config,
            pipeline,
            prometheus,
        })
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Serve { port, bind, .. } => self.run_server(port, bind).await,
            Commands::Search { term, pretty } => self.run_search(&term, pretty).await,
            Commands::Batch {
                input,
                output,
                concurrency,
                progress_interval,
            } => {
                self.run_batch(&input, output.as_deref(), concurrency, progress_interval)
                    .await
            }
            Commands::Extract { file, term } => self.run_extract(&file, term).await,
            Commands::Recognize { file, term } => self.run_recognize(&file, term).await,
            Commands::Validate { config } => self.validate_config(&config).await,
            Commands::Health => self.show_health().await,
        }
    }

    pub async fn run_server(&self, port: Option<u16>, bind: Option<String>) -> anyhow::Result<()> {
        let bind = bind.unwrap_or_else(|| self.config.server.bind.clone());
        let port = port.unwrap_or(self.config.server.port);
        let addr = bind_address(&bind, port)?;

        let mut state = AppState::new(self.pipeline.clone());
        if let Some(handle) = &self.prometheus {
            state = state.with_prometheus(handle.clone());
        }

        let collector = MetricsCollector::new(self.pipeline.metrics().clone()).start_collection();
        let health = Arc::new(SystemHealthChecker::new(self.pipeline.clone()))
            .start_periodic_health_checks(Duration::from_secs(60));

        let served = crate::serve(
            addr,
            state,
            self.config.server.cors,
            crate::shutdown_signal(),
        )
        .await;

        collector.abort();
        health.abort();
        served?;
        Ok(())
    }

    pub async fn run_search(&self, term: &str, pretty: bool) -> anyhow::Result<()> {
        match self.pipeline.run(term).await {
            Ok(result) => {
                println!("{}", to_json(&result, pretty)?);
                Ok(())
            }
            Err(e) => {
                let body = ErrorBody {
                    error: e.kind().as_str().to_string(),
                    message: e.to_string(),
                };
                println!("{}", to_json(&body, pretty)?);
                bail!(e)
            }
        }
    }

    pub async fn run_batch(
        &self,
        input: &Path,
        output: Option<&Path>,
        concurrency: Option<usize>,
        progress_interval: Option<u64>,
    ) -> anyhow::Result<()> {
        let terms = batch::read_terms(input)
            .await
            .with_context(|| format!("Failed to read {}", input.display()))?;
        info!("Loaded {} search terms from {}", terms.len(), input.display());

        let progress_tracker = Arc::new(ProgressTracker::new(terms.len()));

        if let Some(interval) = progress_interval {
            let tracker = progress_tracker.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(interval.max(1)));

                while !tracker.is_complete() {
                    interval.tick().await;
                    let progress = tracker.get_progress();

                    info!(
                        "Progress: {}/{} ({:.1}%) - Success: {}, Errors: {}, Rate: {:.2}/s, ETA: {:?}",
                        progress.completed,
                        progress.total,
                        progress.percent(),
                        progress.success,
                        progress.errors,
                        progress.rate,
                        progress.eta
                    );
                }
            });
        }

        let concurrency = concurrency.unwrap_or(self.config.max_concurrent_searches);
        let runner = BatchRunner::new(self.pipeline.clone(), concurrency);
        let entries = runner.run(terms, progress_tracker.clone()).await;

        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let mut file = fs::File::create(path).await?;
                batch::write_json_lines(&mut file, &entries).await?;
                info!("Results written to {}", path.display());
            }
            None => {
                let mut stdout = tokio::io::stdout();
                batch::write_json_lines(&mut stdout, &entries).await?;
            }
        }

        let failed = entries.iter().filter(|e| !e.is_success()).count();
        for entry in &entries {
            if let BatchEntry::Failed(failure) = entry {
                warn!("'{}' failed: {}", failure.search_term, failure.message);
            }
        }

        let progress = progress_tracker.get_progress();
        info!(
            "Batch completed in {}. Success: {}, Errors: {}",
            crate::format_duration(progress.elapsed),
            entries.len() - failed,
            failed
        );
        Ok(())
    }

    pub async fn run_extract(&self, file: &Path, term: Option<String>) -> anyhow::Result<()> {
        let text = fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let term = term.unwrap_or_else(|| file_label(file));

        let result = self.pipeline.analyze_text(&term, &text);
        println!("{}", to_json(&result, true)?);
        Ok(())
    }

    pub async fn run_recognize(&self, file: &Path, term: Option<String>) -> anyhow::Result<()> {
        let image = fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let term = term.unwrap_or_else(|| file_label(file));

        let result = self.pipeline.analyze_image(&term, &image).await?;
        println!("{}", to_json(&result, true)?);
        Ok(())
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::from_file(config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Search URL: {}", config.site.search_url_template);
        println!("  Currency marker: {}", config.site.currency_marker);
        println!("  Max concurrent: {}", config.max_concurrent_searches);
        println!("  Navigation timeout: {:?}", config.timeouts.navigation);
        println!("  Request timeout: {:?}", config.timeouts.request);
        println!(
            "  Scroll: {}px every {:?}, at most {} steps",
            config.scroll.distance_px, config.scroll.interval, config.scroll.max_iterations
        );
        println!(
            "  Viewport: {}x{}",
            config.browser.viewport.width, config.browser.viewport.height
        );

        Ok(())
    }

    pub async fn show_health(&self) -> anyhow::Result<()> {
        let status = SystemHealthChecker::new(self.pipeline.clone())
            .check_system_health()
            .await;

        println!("System Health Check");
        println!("==================");
        println!("Overall: {:?}", status.overall);
        println!("  Browser: {:?}", status.browser);
        println!("  OCR engine: {:?}", status.ocr);
        println!(
            "  Capacity: {:?} ({}/{} searches)",
            status.capacity, status.in_flight, status.max_concurrent
        );
        match status.memory_bytes {
            Some(bytes) => println!(
                "  Resources: {:?} ({} resident)",
                status.resources,
                crate::format_bytes(bytes)
            ),
            None => println!("  Resources: {:?}", status.resources),
        }

        if status.overall == HealthLevel::Critical {
            bail!("System health is critical");
        }
        Ok(())
    }
}

/// `bind` is a bare IP address, v4 or v6.
fn bind_address(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address {bind}"))?;
    Ok(SocketAddr::new(ip, port))
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T, pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks DEBUG over INFO.
/// Logs go to stderr so stdout carries only command output.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_accepts_v4_and_v6() {
        assert_eq!(bind_address("0.0.0.0", 3000).unwrap().to_string(), "0.0.0.0:3000");
        assert_eq!(bind_address("::", 3000).unwrap().to_string(), "[::]:3000");
        assert_eq!(bind_address("::1", 8080).unwrap().port(), 8080);
        assert!(bind_address("localhost", 3000).is_err());
    }

    #[test]
    fn test_parse_search() {
        let cli = Cli::try_parse_from(["price-lens", "search", "air fryer", "--pretty"]).unwrap();
        match cli.command {
            Commands::Search { term, pretty } => {
                assert_eq!(term, "air fryer");
                assert!(pretty);
            }
            _ => panic!("expected search"),
        }
    }

    #[test]
    fn test_global_overrides() {
        let cli = Cli::try_parse_from([
            "price-lens",
            "serve",
            "--port",
            "8080",
            "--timeout",
            "90",
            "--max-concurrent",
            "2",
            "--chrome-path",
            "/usr/bin/chromium",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.timeouts.request, Duration::from_secs(90));
        assert_eq!(config.max_concurrent_searches, 2);
        assert_eq!(config.browser.chrome_path.as_deref(), Some("/usr/bin/chromium"));
        assert!(matches!(cli.command, Commands::Serve { port: Some(8080), .. }));
    }

    #[test]
    fn test_wants_metrics() {
        let mut config = Config::default();
        let serve = Cli::try_parse_from(["price-lens", "serve"]).unwrap().command;
        assert!(!serve.wants_metrics(&config));

        config.server.enable_metrics = true;
        assert!(serve.wants_metrics(&config));

        let serve = Cli::try_parse_from(["price-lens", "serve", "--metrics"])
            .unwrap()
            .command;
        assert!(serve.wants_metrics(&Config::default()));

        let health = Cli::try_parse_from(["price-lens", "health"]).unwrap().command;
        assert!(!health.wants_metrics(&config));
    }

    #[test]
    fn test_batch_requires_input() {
        assert!(Cli::try_parse_from(["price-lens", "batch"]).is_err());
    }

    #[test]
    fn test_file_label() {
        assert_eq!(file_label(Path::new("/tmp/ocr/phones.txt")), "phones");
    }
}
