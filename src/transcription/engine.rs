//! # Transcription Engine
//!
//! The single entry point both the realtime sessions and the upload endpoint
//! use to turn audio bytes into text.
//!
//! ## Key Responsibilities:
//! - **Model resolution**: fetch (or lazily load) the model from the [`ModelCache`]
//! - **Off-loop inference**: run the blocking model call on tokio's blocking pool
//! - **Option mapping**: translate the requested action into model parameters
//! - **Performance monitoring**: count requests, failures and processing time

use crate::transcription::cache::{ModelCache, ModelLoadError};
use crate::transcription::model::{ActionKind, ModelIdentifier, TranscribeOptions};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;

/// Why a transcription produced no text.
#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error("{model} model failed: {message}")]
    Inference {
        model: ModelIdentifier,
        message: String,
    },

    /// The blocking task panicked or was cancelled.
    #[error("inference worker failed: {0}")]
    Worker(String),
}

/// Text produced for one audio blob.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionResult {
    /// Trimmed model output; may be empty when nothing was recognised
    pub text: String,
    pub model: ModelIdentifier,
    pub audio_bytes: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Default)]
struct EngineMetrics {
    total_requests: u64,
    failed_requests: u64,
    total_audio_bytes: u64,
    total_processing_time_ms: u64,
}

/// Performance statistics for the transcription engine.
#[derive(Debug, Clone, Serialize)]
pub struct EnginePerformanceStats {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_audio_mb: f64,
    pub average_processing_time_ms: u64,
    pub success_rate: f32,
}

/// Shared transcription front-end over the model cache.
///
/// ## Thread Safety:
/// Cheap to share behind an `Arc`; all mutable state is the metrics block.
pub struct TranscriptionEngine {
    cache: Arc<ModelCache>,
    /// Deployment-wide language hint, used when the action does not imply one
    language_hint: Option<String>,
    metrics: RwLock<EngineMetrics>,
}

impl TranscriptionEngine {
    pub fn new(cache: Arc<ModelCache>, language_hint: Option<String>) -> Self {
        Self {
            cache,
            language_hint,
            metrics: RwLock::new(EngineMetrics::default()),
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    /// Model parameters for an action, including the deployment language hint.
    pub fn options_for(
        &self,
        action: ActionKind,
        target_language: Option<&str>,
    ) -> TranscribeOptions {
        TranscribeOptions::for_action(action, target_language, self.language_hint.as_deref())
    }

    /// Transcribe one self-contained audio blob.
    ///
    /// ## Process:
    /// 1. Acquire the model (may trigger a one-time load)
    /// 2. Run inference on the blocking pool and await it
    /// 3. Trim the text and record metrics
    ///
    /// The caller's task is suspended, never blocked, for the whole call.
    pub async fn transcribe(
        &self,
        model_id: ModelIdentifier,
        audio: Vec<u8>,
        options: TranscribeOptions,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let start_time = Instant::now();
        let audio_bytes = audio.len();

        let result = self.run(model_id, audio, options).await;
        let processing_time_ms = start_time.elapsed().as_millis() as u64;
        self.record(audio_bytes, processing_time_ms, result.is_ok()).await;

        let text = result?;
        tracing::debug!(
            model = %model_id,
            audio_bytes,
            processing_time_ms,
            "Transcription result: '{}'",
            text
        );

        Ok(TranscriptionResult {
            text,
            model: model_id,
            audio_bytes,
            processing_time_ms,
        })
    }

    async fn run(
        &self,
        model_id: ModelIdentifier,
        audio: Vec<u8>,
        options: TranscribeOptions,
    ) -> Result<String, TranscriptionError> {
        let model = self.cache.acquire(model_id).await?;

        let outcome = tokio::task::spawn_blocking(move || model.transcribe(&audio, &options))
            .await
            .map_err(|e| TranscriptionError::Worker(e.to_string()))?;

        outcome
            .map(|text| text.trim().to_string())
            .map_err(|e| TranscriptionError::Inference {
                model: model_id,
                message: format!("{:#}", e),
            })
    }

    async fn record(&self, audio_bytes: usize, processing_time_ms: u64, success: bool) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.total_audio_bytes += audio_bytes as u64;
        metrics.total_processing_time_ms += processing_time_ms;
        if !success {
            metrics.failed_requests += 1;
        }
    }

    /// Get performance statistics for the transcription engine.
    pub async fn get_performance_stats(&self) -> EnginePerformanceStats {
        let metrics = self.metrics.read().await;

        EnginePerformanceStats {
            total_requests: metrics.total_requests,
            failed_requests: metrics.failed_requests,
            total_audio_mb: metrics.total_audio_bytes as f64 / (1024.0 * 1024.0),
            average_processing_time_ms: if metrics.total_requests > 0 {
                metrics.total_processing_time_ms / metrics.total_requests
            } else {
                0
            },
            success_rate: if metrics.total_requests > 0 {
                (metrics.total_requests - metrics.failed_requests) as f32
                    / metrics.total_requests as f32
            } else {
                0.0
            },
        }
    }
}
