//! # Speech Model Seams
//!
//! The session core never talks to Candle directly. It sees two traits:
//!
//! - [`ModelLoader`]: produces a ready model for an identifier (slow, blocking)
//! - [`SpeechModel`]: turns one audio blob into text (slow, blocking)
//!
//! The production implementation lives in `whisper.rs`; tests plug in the
//! fakes from [`testing`].

use crate::transcription::model::{ModelIdentifier, TranscribeOptions};
use anyhow::Result;
use std::sync::Arc;

/// A loaded speech-recognition model.
///
/// ## Rust Concepts:
/// - **Send + Sync**: one instance is shared by every session through an `Arc`
///   and invoked from blocking worker threads
pub trait SpeechModel: Send + Sync {
    /// Transcribe (or translate) one self-contained audio blob.
    ///
    /// The bytes are whatever the client sent: a WAV file, a webm/opus blob,
    /// an mp3 upload. Decoding is the model's job.
    fn transcribe(&self, audio: &[u8], options: &TranscribeOptions) -> Result<String>;
}

/// Loads models on demand. Called at most once per identifier at a time.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model_id: ModelIdentifier) -> Result<Arc<dyn SpeechModel>>;
}
