//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **Config**: runtime-updatable `AppConfig`
//! - **Metrics**: request counters and realtime session bookkeeping
//! - **Transcription engine**: owns the process-wide model cache
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread holds a reference to the same data
//! - **RwLock**: many concurrent readers or one writer
//!
//! Locks are only held for a few field updates and never across an `.await`.
//! A poisoned lock is recovered rather than propagated; the data inside is
//! plain counters and config, always in a consistent state.

use crate::audio::session::SessionPolicy;
use crate::config::AppConfig;
use crate::transcription::TranscriptionEngine;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and session counters, updated by middleware and sessions
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Shared by realtime sessions and the upload endpoint
    pub engine: Arc<TranscriptionEngine>,

    /// Device the models run on, for reporting
    pub device: String,

    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and realtime sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,

    /// Realtime sessions currently open
    pub active_sessions: u32,
    /// Realtime sessions opened since start
    pub sessions_opened: u64,
    /// Upgrades refused because the session limit was reached
    pub sessions_rejected: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<TranscriptionEngine>, device: impl Into<String>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            engine,
            device: device.into(),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    /// Session knobs for a connection opened now.
    pub fn session_policy(&self) -> SessionPolicy {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        SessionPolicy {
            chunk_threshold: config.realtime.chunk_threshold,
            min_audio_bytes: config.realtime.min_audio_bytes,
            default_model: config.models.default_model,
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one finished request for an endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a realtime session slot.
    ///
    /// Check and increment happen under one write lock, so two upgrades
    /// racing for the last slot cannot both succeed.
    pub fn try_start_session(&self) -> bool {
        let limit = self.get_config().realtime.max_concurrent_sessions;
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions as usize >= limit {
            metrics.sessions_rejected += 1;
            return false;
        }
        metrics.active_sessions += 1;
        metrics.sessions_opened += 1;
        true
    }

    /// Release a slot taken by [`AppState::try_start_session`].
    pub fn end_session(&self) {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Consistent copy of the metrics, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
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
