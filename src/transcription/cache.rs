//! # Model Cache
//!
//! Process-wide, lazily populated cache of loaded speech models, keyed by
//! [`ModelIdentifier`]. Constructed once at startup and shared through
//! `AppState`.
//!
//! ## Guarantees:
//! - **One load per model**: concurrent first requests for the same model
//!   trigger exactly one load; everyone gets the same instance
//! - **Independent models**: loading `turbo` never blocks a request for an
//!   already-loaded `small`, and two different models can load at once
//! - **Failures are not cached**: a failed load leaves the model unloaded and
//!   the next request tries again
//!
//! ## Locking Strategy:
//! Each identifier owns a `tokio::sync::Mutex` that serialises loading only.
//! The lock is moved into the blocking load task, so it stays held until the
//! load really finishes even if the requesting session disconnects midway.
//! Inference never touches it.

use crate::transcription::backend::{ModelLoader, SpeechModel};
use crate::transcription::model::ModelIdentifier;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Mutex;

/// Loading status of one model, as reported by `/api/v1/models`.
///
/// ## State Transitions:
/// NotLoaded → Loading → Loaded
/// Loading → Error → Loading (on the next request)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Loaded {
        loaded_at: DateTime<Utc>,
        load_time_ms: u64,
    },
    Error {
        message: String,
        error_at: DateTime<Utc>,
    },
}

impl ModelStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelStatus::Loaded { .. })
    }
}

/// A model could not be made available.
#[derive(Debug, Clone, Error)]
#[error("Failed to load model {model_id}: {cause}")]
pub struct ModelLoadError {
    pub model_id: ModelIdentifier,
    pub cause: String,
}

impl ModelLoadError {
    fn new(model_id: ModelIdentifier, cause: impl Into<String>) -> Self {
        Self {
            model_id,
            cause: cause.into(),
        }
    }
}

struct SlotState {
    model: Option<Arc<dyn SpeechModel>>,
    status: ModelStatus,
}

/// Per-identifier cache entry.
struct ModelSlot {
    /// Serialises loads of this identifier. Never held during inference.
    load_lock: Arc<Mutex<()>>,
    state: RwLock<SlotState>,
}

impl ModelSlot {
    fn new() -> Self {
        Self {
            load_lock: Arc::new(Mutex::new(())),
            state: RwLock::new(SlotState {
                model: None,
                status: ModelStatus::NotLoaded,
            }),
        }
    }

    fn loaded(&self) -> Option<Arc<dyn SpeechModel>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .model
            .clone()
    }

    fn status(&self) -> ModelStatus {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .status
            .clone()
    }

    fn set_status(&self, status: ModelStatus) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).status = status;
    }

    fn store(&self, model: Arc<dyn SpeechModel>, load_time_ms: u64) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.model = Some(model);
        state.status = ModelStatus::Loaded {
            loaded_at: Utc::now(),
            load_time_ms,
        };
    }

    fn fail(&self, message: String) {
        self.set_status(ModelStatus::Error {
            message,
            error_at: Utc::now(),
        });
    }
}

/// Shared cache of loaded models.
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    slots: HashMap<ModelIdentifier, Arc<ModelSlot>>,
}

impl ModelCache {
    /// Create an empty cache. Nothing is loaded until first use.
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let slots = ModelIdentifier::ALL
            .iter()
            .map(|id| (*id, Arc::new(ModelSlot::new())))
            .collect();
        Self { loader, slots }
    }

    fn slot(&self, model_id: ModelIdentifier) -> Arc<ModelSlot> {
        // Every identifier gets a slot in `new`, so indexing cannot miss.
        self.slots[&model_id].clone()
    }

    /// Return the loaded model for `model_id`, loading it on first use.
    ///
    /// ## Process:
    /// 1. Fast path: return the cached instance without taking the load lock
    /// 2. Take the identifier's load lock (other identifiers are unaffected)
    /// 3. Re-check: a concurrent caller may have finished the load meanwhile
    /// 4. Load on the blocking pool, publish the instance, release the lock
    pub async fn acquire(
        &self,
        model_id: ModelIdentifier,
    ) -> Result<Arc<dyn SpeechModel>, ModelLoadError> {
        let slot = self.slot(model_id);
        if let Some(model) = slot.loaded() {
            return Ok(model);
        }

        let guard = slot.load_lock.clone().lock_owned().await;
        if let Some(model) = slot.loaded() {
            tracing::debug!(model = %model_id, "Model loaded by a concurrent request");
            return Ok(model);
        }

        tracing::info!(model = %model_id, "Loading model on first use");
        slot.set_status(ModelStatus::Loading);

        let loader = self.loader.clone();
        let load_slot = slot.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let start = Instant::now();
            let result = loader.load(model_id);
            match &result {
                Ok(model) => {
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    load_slot.store(model.clone(), elapsed_ms);
                    tracing::info!(model = %model_id, load_time_ms = elapsed_ms, "Model ready");
                }
                Err(e) => {
                    tracing::error!(model = %model_id, "Model load failed: {:#}", e);
                    load_slot.fail(format!("{:#}", e));
                }
            }
            result
        });

        match handle.await {
            Ok(Ok(model)) => Ok(model),
            Ok(Err(e)) => Err(ModelLoadError::new(model_id, format!("{:#}", e))),
            Err(join_error) => {
                let message = format!("loader task failed: {}", join_error);
                slot.fail(message.clone());
                Err(ModelLoadError::new(model_id, message))
            }
        }
    }

    /// Current status of one model.
    pub fn status(&self, model_id: ModelIdentifier) -> ModelStatus {
        self.slot(model_id).status()
    }

    /// Status of every known model, smallest first.
    pub fn statuses(&self) -> Vec<(ModelIdentifier, ModelStatus)> {
        ModelIdentifier::ALL
            .iter()
            .map(|id| (*id, self.status(*id)))
            .collect()
    }

    /// Identifiers currently resident in memory.
    pub fn loaded_models(&self) -> Vec<ModelIdentifier> {
        ModelIdentifier::ALL
            .iter()
            .copied()
            .filter(|id| self.slot(*id).loaded().is_some())
            .collect()
    }
}
