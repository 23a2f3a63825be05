//! # Application State Management
//!
//! Shared state handed to every HTTP request handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the validated configuration, immutable after startup
//! - **model**: the process-wide model readiness manager
//! - **transcriber**: the upload pipeline bound to that manager
//! - **metrics**: request and transcription counters updated by middleware and handlers
//!
//! ## Thread Safety:
//! Immutable parts are shared with `Arc`. The metrics are the only mutable data and sit
//! behind `Arc<RwLock<_>>`: many readers (the `/metrics` endpoint) or one writer (a
//! finishing request) at a time. A poisoned lock is recovered rather than propagated.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::config::AppConfig;
use crate::transcription::{ModelManager, Transcriber};

/// The main application state shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (read-only at runtime)
    pub config: Arc<AppConfig>,

    /// Owner of the acoustic model and its readiness state
    pub model: Arc<ModelManager>,

    /// Upload-to-transcript pipeline
    pub transcriber: Arc<Transcriber>,

    /// Request and transcription metrics, updated by every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Transcriptions currently between upload and response
    pub active_transcriptions: u32,

    /// Outcome counters for `/upload`
    pub transcriptions: TranscriptionMetrics,

    /// Per-endpoint statistics, keyed by `"METHOD /path"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Outcome counters for completed transcriptions.
#[derive(Debug, Default, Clone)]
pub struct TranscriptionMetrics {
    pub succeeded: u64,
    pub failed: u64,

    /// Failures broken down by error kind (`unsupported_format`, ...)
    pub failures_by_kind: HashMap<&'static str, u64>,

    /// Seconds of canonical audio transcribed successfully
    pub audio_seconds: f64,

    /// Milliseconds spent in inference for successful transcriptions
    pub processing_ms: u64,
}

/// Detailed performance metrics for a specific API endpoint.
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
    /// Build the shared state around an already-created model manager.
    ///
    /// The manager is created (and its load started) by the caller so that startup
    /// order stays visible in `main`.
    pub fn new(config: AppConfig, model: Arc<ModelManager>) -> Self {
        let transcriber = Arc::new(Transcriber::new(Arc::clone(&model), &config));
        Self {
            config: Arc::new(config),
            model,
            transcriber,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    /// Increment the total error counter (called for every 4xx/5xx response).
    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record timing and outcome for one request to `endpoint` (e.g. `"POST /upload"`).
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Mark a transcription as started.
    ///
    /// The returned guard must be finished with [`ActiveTranscription::succeeded`] or
    /// [`ActiveTranscription::failed`]. A guard dropped unfinished (the client went
    /// away mid-request) is counted as a `cancelled` failure.
    pub fn begin_transcription(&self) -> ActiveTranscription {
        self.write_metrics().active_transcriptions += 1;
        ActiveTranscription {
            metrics: Arc::clone(&self.metrics),
            finished: false,
        }
    }

    /// Copy of the current metrics, so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// One in-flight transcription, counted in `active_transcriptions` until it ends.
#[must_use = "an unfinished transcription is recorded as cancelled when dropped"]
pub struct ActiveTranscription {
    metrics: Arc<RwLock<AppMetrics>>,
    finished: bool,
}

impl ActiveTranscription {
    pub fn succeeded(mut self, audio_seconds: f64, processing_ms: u64) {
        self.finished = true;
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_transcriptions = metrics.active_transcriptions.saturating_sub(1);
        metrics.transcriptions.succeeded += 1;
        metrics.transcriptions.audio_seconds += audio_seconds;
        metrics.transcriptions.processing_ms += processing_ms;
    }

    pub fn failed(mut self, kind: &'static str) {
        self.finished = true;
        self.record_failure(kind);
    }

    fn record_failure(&self, kind: &'static str) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_transcriptions = metrics.active_transcriptions.saturating_sub(1);
        metrics.transcriptions.failed += 1;
        *metrics.transcriptions.failures_by_kind.entry(kind).or_default() += 1;
    }
}

impl Drop for ActiveTranscription {
    fn drop(&mut self) {
        if !self.finished {
            self.record_failure("cancelled");
        }
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds (0.0 before the first request).
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl TranscriptionMetrics {
    /// Seconds of audio transcribed per second of inference (>1.0 is faster than real
    /// time).
    pub fn real_time_factor(&self) -> f64 {
        if self.processing_ms > 0 {
            self.audio_seconds * 1000.0 / self.processing_ms as f64
        } else {
            0.0
        }
    }
}
