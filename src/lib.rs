//! # Price Lens
//!
//! Price discovery from catalog search pages that only reveal their prices
//! once rendered. A search term goes in; a headless Chrome session renders
//! the results page, scrolls it until lazily loaded listings appear and
//! captures it whole; an OCR engine turns the capture into text; currency
//! tokens are pulled out of the text and summarized.
//!
//! ## Pipeline
//!
//! | Stage | Module | Fails with |
//! |-------|--------|------------|
//! | Validate term | [`config`] | `InvalidInput` |
//! | Launch, navigate, consent, scroll, capture | [`acquisition`], [`browser`] | `LaunchFailure`, `NavigationTimeout`, `CaptureFailure` |
//! | Text recovery | [`ocr`] | `RecognitionFailure` |
//! | Token extraction | [`extract`] | never |
//! | Statistics | [`stats`] | never |
//!
//! Every search launches its own browser and always closes it, whether the
//! search succeeds, fails or is cancelled. Finding zero prices is a success
//! with all-zero statistics.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use price_lens::{Config, PricePipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = PricePipeline::new(Config::default())?;
//!     let result = pipeline.run("phone").await?;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! price-lens serve --port 3000 --metrics
//! price-lens search "air fryer" --pretty
//! price-lens batch --input terms.txt --output results.jsonl --concurrency 2
//! price-lens recognize capture.png
//! ```
//!
//! The HTTP service answers `GET /api/prices?search=<term>`.

/// Configuration, search requests and browser launch settings
pub mod config;

/// Error types and error classification
pub mod error;

/// Summary statistics over extracted prices
pub mod stats;

/// Currency token extraction
pub mod extract;

/// OCR text recovery
pub mod ocr;

/// Browser session ports and the Chromium adapter
pub mod browser;

/// Rendering a search page into a full-page capture
pub mod acquisition;

/// Search pipeline orchestration
pub mod pipeline;

/// HTTP service
pub mod server;

/// Concurrent multi-term runs
pub mod batch;

/// Command-line interface implementation
pub mod cli;

/// Health reporting
pub mod health;

/// Metrics collection and Prometheus export
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use self::acquisition::*;
pub use self::batch::*;
pub use self::browser::*;
pub use self::cli::*;
pub use self::config::*;
pub use self::error::*;
pub use self::extract::*;
pub use self::health::*;
pub use self::metrics::*;
pub use self::ocr::*;
pub use self::pipeline::*;
pub use self::server::*;
pub use self::stats::*;
pub use self::utils::*;
