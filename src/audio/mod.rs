//! # Audio Session Module
//!
//! Everything that happens to audio between the WebSocket and the model.
//!
//! ## Key Components:
//! - **Chunk Buffer**: accumulates opaque binary fragments until a drain
//! - **Session**: per-connection state machine (config, buffer, drains, replies)
//! - **Processor**: decodes container bytes into 16kHz mono PCM for the model
//!
//! ## Audio Format:
//! Clients stream fragments of one compressed container (typically webm/opus
//! from `MediaRecorder`). Fragments are never inspected here; they are only
//! concatenated and handed to the model, which decodes them.

// WebSocket handler is in src/websocket.rs at the root level
pub mod buffer;       // Chunk accumulation
pub mod processor;    // Container decoding to PCM
pub mod session;      // Session state machine
