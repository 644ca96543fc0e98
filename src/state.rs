//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by multiple HTTP request handlers
//! simultaneously.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Multiple HTTP requests run simultaneously and all need access to the same state
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time (but not both)
//! - **Why needed**: Multiple requests can read config simultaneously, but only one can update it
//!
//! ### CancellationToken
//! - **Purpose**: One shutdown signal every in-flight job listens to
//! - **Child tokens**: Each job gets `shutdown.child_token()`, so cancelling
//!   one job never touches the others, but shutting down cancels them all
//!
//! ## What is shared:
//! - **config**: Runtime-updatable settings
//! - **metrics**: HTTP and job counters
//! - **pipeline**: The single transcription pipeline; its gate is what
//!   bounds concurrent engine processes across all requests

use crate::config::AppConfig;
use crate::transcription::{TranscriptResult, TranscriptionFailure, TranscriptionPipeline};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// The main application state that's shared across all HTTP request handlers.
///
/// ## Thread Safety Pattern:
/// Mutable data sits behind `Arc<RwLock<T>>`. The pipeline is immutable
/// once built and synchronizes internally, so a plain `Arc` is enough.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by middleware and by the transcription handler
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Shared job pipeline
    pub pipeline: Arc<TranscriptionPipeline>,

    /// Cancelled once when the server begins shutting down
    pub shutdown: CancellationToken,

    /// When the server started (never changes, so no Arc<RwLock> needed)
    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests and jobs.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of HTTP errors (4xx and 5xx) since server start
    pub error_count: u64,

    /// Transcription job outcomes
    pub jobs: JobMetrics,

    /// Detailed metrics for each API endpoint, keyed like "GET /health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Outcome counters for transcription jobs.
///
/// ## Invariant:
/// Once every submitted job has finished,
/// `submitted == succeeded + process_failed + process_crashed + empty_output + cancelled`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobMetrics {
    pub submitted: u64,
    pub succeeded: u64,
    pub process_failed: u64,
    pub process_crashed: u64,
    pub empty_output: u64,
    pub cancelled: u64,

    /// Sum of `processing_time_ms` over successful jobs
    pub total_processing_ms: u64,
}

/// Detailed performance metrics for a specific API endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState around an already-built pipeline.
    pub fn new(config: AppConfig, pipeline: TranscriptionPipeline) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            pipeline: Arc::new(pipeline),
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    // A panic while holding one of these locks leaves plain data behind,
    // so a poisoned lock is still safe to use.
    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    /// Account one finished HTTP request, globally and under its endpoint key.
    ///
    /// The first request for an endpoint creates its [`EndpointMetric`].
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Count a job handed to the pipeline.
    pub fn record_job_submitted(&self) {
        self.write_metrics().jobs.submitted += 1;
    }

    /// Count how a job ended.
    pub fn record_job_outcome(&self, result: &TranscriptResult) {
        let mut metrics = self.write_metrics();
        let jobs = &mut metrics.jobs;
        match result {
            Ok(transcript) => {
                jobs.succeeded += 1;
                jobs.total_processing_ms += transcript.processing_time_ms;
            }
            Err(TranscriptionFailure::ProcessFailed { .. }) => jobs.process_failed += 1,
            Err(TranscriptionFailure::ProcessCrashed { .. }) => jobs.process_crashed += 1,
            Err(TranscriptionFailure::EmptyOutput) => jobs.empty_output += 1,
            Err(TranscriptionFailure::Cancelled) => jobs.cancelled += 1,
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// ## Why a snapshot:
    /// Clones the data so we don't hold the lock while serializing the HTTP response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl JobMetrics {
    /// Jobs that ended without a transcript.
    pub fn failed(&self) -> u64 {
        self.process_failed + self.process_crashed + self.empty_output + self.cancelled
    }

    /// Jobs submitted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.submitted.saturating_sub(self.succeeded + self.failed())
    }

    /// Mean processing time of successful jobs, queueing included.
    pub fn average_processing_ms(&self) -> f64 {
        if self.succeeded > 0 {
            self.total_processing_ms as f64 / self.succeeded as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Calculate the average response time for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0 // No requests yet, so no average to calculate
        }
    }

    /// Calculate the error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
