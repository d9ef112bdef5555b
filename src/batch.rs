//! Many searches, one pipeline each.
//!
//! Fan-out happens only across searches: every term gets its own run with
//! its own browser session, and at most `concurrency` run at once.

use crate::{PipelineError, PipelineResult, PricePipeline};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// One line of batch output.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Found(PipelineResult),
    Failed(BatchFailure),
}

impl BatchEntry {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchEntry::Found(_))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub search_term: String,
    pub error: String,
    pub message: String,
}

impl BatchFailure {
    fn from_error(term: &str, error: &PipelineError) -> Self {
        Self {
            search_term: term.to_string(),
            error: error.kind().as_str().to_string(),
            message: error.to_string(),
        }
    }
}

pub struct BatchRunner {
    pipeline: Arc<PricePipeline>,
    concurrency: usize,
}

impl BatchRunner {
    pub fn new(pipeline: Arc<PricePipeline>, concurrency: usize) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
        }
    }

    /// Run every term and return the entries in input order.
    pub async fn run(&self, terms: Vec<String>, progress: Arc<ProgressTracker>) -> Vec<BatchEntry> {
        info!(
            "Running {} searches, {} at a time",
            terms.len(),
            self.concurrency
        );
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let tasks: Vec<_> = terms
            .iter()
            .cloned()
            .map(|term| {
                let pipeline = self.pipeline.clone();
                let semaphore = semaphore.clone();
                let progress = progress.clone();

                tokio::spawn(async move {
                    let entry = match semaphore.acquire_owned().await {
                        Ok(_permit) => match pipeline.run(&term).await {
                            Ok(result) => BatchEntry::Found(result),
                            Err(e) => BatchEntry::Failed(BatchFailure::from_error(&term, &e)),
                        },
                        Err(closed) => {
                            let error = PipelineError::from(closed);
                            BatchEntry::Failed(BatchFailure::from_error(&term, &error))
                        }
                    };
                    progress.record_completion(entry.is_success());
                    entry
                })
            })
            .collect();

        let mut entries = Vec::with_capacity(tasks.len());
        for (term, task) in terms.iter().zip(futures::future::join_all(tasks).await) {
            let entry = task.unwrap_or_else(|e| {
                warn!("Search task for '{}' aborted: {}", term, e);
                progress.record_completion(false);
                BatchEntry::Failed(BatchFailure {
                    search_term: term.clone(),
                    error: "internal".to_string(),
                    message: e.to_string(),
                })
            });
            entries.push(entry);
        }

        entries
    }
}

/// Read search terms, one per line. Blank lines and `#` comments are skipped.
pub async fn read_terms(path: &Path) -> Result<Vec<String>, PipelineError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_terms(&content))
}

fn parse_terms(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Write `entries` as JSON Lines.
pub async fn write_json_lines<W>(writer: &mut W, entries: &[BatchEntry]) -> Result<(), PipelineError>
where
    W: AsyncWrite + Unpin,
{
    for entry in entries {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
    }
    writer.flush().await?;
    debug!("Wrote {} batch entries", entries.len());
    Ok(())
}

pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_completion(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let completed = self.completed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed();

        let rate = if elapsed.as_secs_f64() > 0.0 {
            completed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let eta = if completed > 0 && rate > 0.0 {
            let remaining = self.total.saturating_sub(completed);
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        };

        ProgressInfo {
            total: self.total,
            completed,
            errors,
            success: completed.saturating_sub(errors),
            elapsed,
            rate,
            eta,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed) >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub success: usize,
    pub elapsed: Duration,
    pub rate: f64,
    pub eta: Option<Duration>,
}

impl ProgressInfo {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}
