//! # Application State Management
//!
//! Shared state handed to every request handler through `web::Data`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! Every actix worker thread holds a clone of `AppState`; the `Arc`s inside
//! make those clones point at the same configuration, service and metrics.
//!
//! ### RwLock for metrics
//! Every request updates the counters, and `/metrics` reads them. A
//! `std::sync::RwLock` is enough because the critical sections never await.
//!
//! ### Immutable configuration
//! Configuration is read once at startup and never changes afterwards, so it
//! is a plain `Arc<AppConfig>` with no lock.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use crate::config::AppConfig;
use crate::transcription::TranscriptionService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Validation + decoding + inference pipeline for `POST /asr`
    pub service: Arc<TranscriptionService>,

    /// Updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, service: Arc<TranscriptionService>) -> Self {
        Self {
            config: Arc::new(config),
            service,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// A panic while holding the lock only ever leaves counters half-bumped,
    /// so a poisoned lock is still usable.
    fn metrics_read(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_write(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_write().error_count += 1;
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Clone the counters so the lock is released before serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn model_id(&self) -> &str {
        self.service.engine().model_id()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// State wired to a scripted model, for handler and middleware tests.
#[cfg(test)]
pub(crate) fn test_state(script: Vec<u32>) -> AppState {
    test_state_with(AppConfig::default(), script)
}

#[cfg(test)]
pub(crate) fn test_state_with(config: AppConfig, script: Vec<u32>) -> AppState {
    use crate::transcription::model::testing::ScriptedModel;
    use crate::transcription::TranscriptionEngine;

    let engine = TranscriptionEngine::new(Arc::new(ScriptedModel::new(script)), &config.performance);
    let service = TranscriptionService::new(Arc::new(engine), &config.audio);
    AppState::new(config, Arc::new(service))
}
