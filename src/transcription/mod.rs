//! # Transcription Module
//!
//! Speech-to-text for the realtime sessions and the upload endpoint, using
//! Whisper models via the Candle-rs framework.
//!
//! ## Key Components:
//! - **Model identifiers**: the closed set of loadable models and client actions
//! - **Backend seams**: `ModelLoader` / `SpeechModel` traits the core depends on
//! - **Whisper backend**: Candle implementation of those traits
//! - **Model cache**: lazily loads each model once and shares it process-wide
//! - **Transcription engine**: runs inference off the async workers
//!
//! ## Whisper Models:
//! - **small**: ~244MB, fastest
//! - **medium**: ~769MB, default for new sessions
//! - **turbo**: ~1.6GB, large-v3 turbo, best accuracy

pub mod model;       // Model identifiers, actions and decoding options
pub mod backend;     // Loader / model traits
pub mod whisper;     // Candle Whisper implementation
pub mod cache;       // Process-wide model cache
pub mod engine;      // Transcription front-end

pub use cache::{ModelCache, ModelLoadError, ModelStatus};
pub use engine::{TranscriptionEngine, TranscriptionError};
pub use model::{ActionKind, ModelIdentifier};
