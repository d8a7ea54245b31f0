//! # Realtime Session State Machine
//!
//! One [`RealtimeSession`] per WebSocket connection. The session owns its
//! configuration and chunk buffer, decides when to drain, runs the drained
//! bytes through the transcription engine and produces the reply frames. It
//! never touches the socket; the actor in `websocket.rs` feeds it frames one
//! at a time and writes whatever it returns.
//!
//! ## Session Lifecycle:
//! 1. **AwaitingInput**: initial state; every inbound frame is handled here
//! 2. **Closed**: terminal; entered exactly once through [`RealtimeSession::close`],
//!    which runs the final drain over any residual audio
//!
//! ## Drain Kinds:
//! - **Periodic**: threshold reached on a binary frame → partial result
//! - **Flush**: client sent `{"type":"flush"}` → final segment, then `done`
//! - **Closing**: connection gone → final segment, errors only logged

use crate::audio::buffer::ChunkBuffer;
use crate::transcription::{ActionKind, ModelIdentifier, TranscriptionEngine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Rejected `config` frame. Reported in-band; the session keeps its old config.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionConfigError {
    #[error("Invalid JSON configuration")]
    MalformedJson,

    #[error("Invalid configuration: {0}")]
    InvalidValue(String),

    #[error("Invalid configuration: target_language is required for translate_language")]
    MissingTargetLanguage,
}

/// Per-session transcription settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    pub model_id: ModelIdentifier,
    pub action: ActionKind,
    pub target_language: Option<String>,
}

impl SessionConfig {
    /// `{default_model, transcribe, none}`
    pub fn new(default_model: ModelIdentifier) -> Self {
        Self {
            model_id: default_model,
            action: ActionKind::Transcribe,
            target_language: None,
        }
    }

    /// Validate every field first, then overwrite the whole config.
    ///
    /// Omitted fields fall back to the deployment defaults rather than keeping
    /// their previous values, so each `config` frame fully describes the
    /// session. On error nothing changes.
    pub fn apply(
        &mut self,
        model: Option<&str>,
        action: Option<&str>,
        target_language: Option<&str>,
        default_model: ModelIdentifier,
    ) -> Result<(), SessionConfigError> {
        let model_id = match model {
            Some(name) => name
                .parse::<ModelIdentifier>()
                .map_err(|e| SessionConfigError::InvalidValue(e.to_string()))?,
            None => default_model,
        };
        let action = match action {
            Some(name) => name
                .parse::<ActionKind>()
                .map_err(|e| SessionConfigError::InvalidValue(e.to_string()))?,
            None => ActionKind::Transcribe,
        };
        let target_language = target_language
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .map(str::to_string);

        if action.requires_target_language() && target_language.is_none() {
            return Err(SessionConfigError::MissingTargetLanguage);
        }

        *self = Self {
            model_id,
            action,
            target_language,
        };
        Ok(())
    }
}

/// Knobs shared by every session opened with the same application config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Binary frames per periodic drain
    pub chunk_threshold: usize,
    /// Drains smaller than this are skipped silently
    pub min_audio_bytes: usize,
    pub default_model: ModelIdentifier,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            chunk_threshold: 2,
            min_audio_bytes: 1024,
            default_model: ModelIdentifier::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingInput,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainKind {
    Periodic,
    Flush,
    Closing,
}

/// Control replies, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    ConfigAck { message: String },
    Error { message: String },
    Done,
}

/// Transcription result frame. Untagged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionMessage {
    pub text: String,
    pub is_partial: bool,
    pub is_final_segment: bool,
}

/// Every frame the server can send on a realtime connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(ControlReply),
    Transcription(TranscriptionMessage),
}

impl ServerMessage {
    pub fn config_ack(message: impl Into<String>) -> Self {
        ServerMessage::Control(ControlReply::ConfigAck {
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Control(ControlReply::Error {
            message: message.into(),
        })
    }

    pub fn done() -> Self {
        ServerMessage::Control(ControlReply::Done)
    }

    pub fn partial(text: String) -> Self {
        ServerMessage::Transcription(TranscriptionMessage {
            text,
            is_partial: true,
            is_final_segment: false,
        })
    }

    pub fn final_segment(text: String) -> Self {
        ServerMessage::Transcription(TranscriptionMessage {
            text,
            is_partial: false,
            is_final_segment: true,
        })
    }
}

/// Inbound text frame, before validation.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    model: Option<String>,
    action: Option<String>,
    target_language: Option<String>,
}

/// Counters reported when the session ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub transcriptions: u64,
    pub failures: u64,
}

/// State of one realtime transcription connection.
pub struct RealtimeSession {
    id: String,
    config: SessionConfig,
    buffer: ChunkBuffer,
    state: SessionState,
    policy: SessionPolicy,
    engine: Arc<TranscriptionEngine>,
    stats: SessionStats,
}

impl RealtimeSession {
    pub fn new(id: String, engine: Arc<TranscriptionEngine>, policy: SessionPolicy) -> Self {
        Self {
            id,
            config: SessionConfig::new(policy.default_model),
            buffer: ChunkBuffer::new(),
            state: SessionState::AwaitingInput,
            policy,
            engine,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Handle one control text frame.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }

        let frame: ControlFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Unparseable control frame: {}", e);
                return vec![ServerMessage::error(SessionConfigError::MalformedJson.to_string())];
            }
        };

        match frame.kind.as_deref() {
            Some("config") => vec![self.handle_config(frame)],
            Some("flush") => self.handle_flush().await,
            other => {
                tracing::warn!(session_id = %self.id, "Ignoring control frame of type {:?}", other);
                Vec::new()
            }
        }
    }

    fn handle_config(&mut self, frame: ControlFrame) -> ServerMessage {
        let result = self.config.apply(
            frame.model.as_deref(),
            frame.action.as_deref(),
            frame.target_language.as_deref(),
            self.policy.default_model,
        );

        match result {
            Ok(()) => {
                tracing::info!(
                    session_id = %self.id,
                    model = %self.config.model_id,
                    action = %self.config.action,
                    target_language = ?self.config.target_language,
                    "Session configured"
                );
                ServerMessage::config_ack("Configuration received")
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Rejected configuration: {}", e);
                ServerMessage::error(e.to_string())
            }
        }
    }

    async fn handle_flush(&mut self) -> Vec<ServerMessage> {
        let mut replies = Vec::new();
        if let Some(reply) = self.drain_and_transcribe(DrainKind::Flush).await {
            replies.push(reply);
        }
        replies.push(ServerMessage::done());
        replies
    }

    /// Handle one binary audio fragment.
    pub async fn handle_binary(&mut self, fragment: &[u8]) -> Vec<ServerMessage> {
        if self.state == SessionState::Closed || !self.buffer.append(fragment) {
            return Vec::new();
        }
        self.stats.chunks_received += 1;
        self.stats.bytes_received += fragment.len() as u64;

        if !self.buffer.should_flush(self.policy.chunk_threshold) {
            return Vec::new();
        }
        self.drain_and_transcribe(DrainKind::Periodic)
            .await
            .into_iter()
            .collect()
    }

    /// Enter the terminal state, transcribing whatever audio is still buffered.
    ///
    /// Runs at most once; later calls are no-ops. Failures are logged only,
    /// since the client is gone.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;

        if let Some(ServerMessage::Transcription(message)) =
            self.drain_and_transcribe(DrainKind::Closing).await
        {
            tracing::info!(
                session_id = %self.id,
                "Final segment after disconnect: '{}'",
                message.text
            );
        }

        tracing::info!(
            session_id = %self.id,
            chunks = self.stats.chunks_received,
            bytes = self.stats.bytes_received,
            transcriptions = self.stats.transcriptions,
            failures = self.stats.failures,
            "Session closed"
        );
    }

    /// Drain the buffer and run the pipeline over the drained bytes.
    ///
    /// The config is read once here, so a `config` frame can only affect
    /// drains that start after it.
    async fn drain_and_transcribe(&mut self, kind: DrainKind) -> Option<ServerMessage> {
        let audio = self.buffer.drain();
        if audio.is_empty() {
            return None;
        }
        if audio.len() < self.policy.min_audio_bytes {
            tracing::debug!(
                session_id = %self.id,
                bytes = audio.len(),
                "Skipping drain below minimum audio size"
            );
            return None;
        }

        let config = self.config.clone();
        let options = self
            .engine
            .options_for(config.action, config.target_language.as_deref());

        match self.engine.transcribe(config.model_id, audio, options).await {
            Ok(result) => {
                self.stats.transcriptions += 1;
                if result.text.is_empty() {
                    return None;
                }
                Some(match kind {
                    DrainKind::Periodic => ServerMessage::partial(result.text),
                    DrainKind::Flush | DrainKind::Closing => ServerMessage::final_segment(result.text),
                })
            }
            Err(e) => {
                self.stats.failures += 1;
                if kind == DrainKind::Closing {
                    tracing::warn!(session_id = %self.id, "Final transcription failed: {}", e);
                    None
                } else {
                    tracing::error!(session_id = %self.id, "Transcription failed: {}", e);
                    Some(ServerMessage::error(format!("Transcription error: {}", e)))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::backend::testing::FakeLoader;
    use crate::transcription::model::Task;
    use crate::transcription::ModelCache;

    fn session_with(loader: &Arc<FakeLoader>) -> RealtimeSession {
        let cache = Arc::new(ModelCache::new(loader.clone()));
        let engine = Arc::new(TranscriptionEngine::new(cache, None));
        RealtimeSession::new("test-session".to_string(), engine, SessionPolicy::default())
    }

    fn json(message: &ServerMessage) -> serde_json::Value {
        serde_json::to_value(message).unwrap()
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(
            json(&ServerMessage::config_ack("Configuration received")),
            serde_json::json!({"type": "config_ack", "message": "Configuration received"})
        );
        assert_eq!(json(&ServerMessage::done()), serde_json::json!({"type": "done"}));
        assert_eq!(
            json(&ServerMessage::partial("hi".into())),
            serde_json::json!({"text": "hi", "is_partial": true, "is_final_segment": false})
        );
        assert_eq!(
            json(&ServerMessage::final_segment("bye".into())),
            serde_json::json!({"text": "bye", "is_partial": false, "is_final_segment": true})
        );
    }

    #[test]
    fn test_config_apply_is_all_or_nothing() {
        let mut config = SessionConfig::new(ModelIdentifier::Medium);
        config
            .apply(Some("small"), Some("translate_english"), None, ModelIdentifier::Medium)
            .unwrap();
        assert_eq!(config.model_id, ModelIdentifier::Small);

        let before = config.clone();
        assert!(matches!(
            config.apply(Some("small"), Some("shout"), None, ModelIdentifier::Medium),
            Err(SessionConfigError::InvalidValue(_))
        ));
        assert_eq!(
            config.apply(Some("turbo"), Some("translate_language"), Some("  "), ModelIdentifier::Medium),
            Err(SessionConfigError::MissingTargetLanguage)
        );
        assert_eq!(config, before);

        config.apply(None, None, None, ModelIdentifier::Medium).unwrap();
        assert_eq!(config, SessionConfig::new(ModelIdentifier::Medium));
    }

    #[tokio::test]
    async fn test_config_frame_is_acknowledged() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        let replies = session
            .handle_text(r#"{"type":"config","model":"small","action":"transcribe"}"#)
            .await;
        assert_eq!(replies, vec![ServerMessage::config_ack("Configuration received")]);
        assert_eq!(session.config().model_id, ModelIdentifier::Small);
    }

    #[tokio::test]
    async fn test_bad_config_reports_error_and_keeps_session() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        let replies = session.handle_text(r#"{"type":"config","model":"bogus"}"#).await;
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            ServerMessage::Control(ControlReply::Error { message }) => {
                assert!(message.starts_with("Invalid configuration"));
                assert!(message.contains("bogus"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(session.state(), SessionState::AwaitingInput);
        assert_eq!(session.config().model_id, ModelIdentifier::Medium);

        let replies = session.handle_text("{not json").await;
        assert_eq!(replies, vec![ServerMessage::error("Invalid JSON configuration")]);

        let replies = session.handle_text(r#"{"type":"config","model":"turbo"}"#).await;
        assert_eq!(replies, vec![ServerMessage::config_ack("Configuration received")]);
    }

    #[tokio::test]
    async fn test_unknown_frame_type_is_ignored() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        assert!(session.handle_text(r#"{"type":"pause"}"#).await.is_empty());
        assert!(session.handle_text(r#"{"model":"small"}"#).await.is_empty());
        assert_eq!(session.config(), &SessionConfig::new(ModelIdentifier::Medium));
    }

    #[tokio::test]
    async fn test_threshold_triggers_one_partial_per_two_frames() {
        let loader = Arc::new(FakeLoader::new());
        loader.reply_with("hello");
        let mut session = session_with(&loader);

        assert!(session.handle_binary(&[1; 600]).await.is_empty());
        let replies = session.handle_binary(&[2; 600]).await;
        assert_eq!(replies, vec![ServerMessage::partial("hello".into())]);

        let calls = loader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].audio.len(), 1200);
        assert_eq!(&calls[0].audio[..600], &[1; 600][..]);
        assert_eq!(calls[0].model_id, ModelIdentifier::Medium);

        // Counter restarted: one more frame is not enough.
        assert!(session.handle_binary(&[3; 600]).await.is_empty());
        assert_eq!(loader.calls().len(), 1);
        session.handle_binary(&[4; 600]).await;
        assert_eq!(loader.calls().len(), 2);
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_small_and_empty_chunks_are_not_errors() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        assert!(session.handle_binary(&[]).await.is_empty());
        assert!(session.handle_binary(&[1; 100]).await.is_empty());
        // Threshold reached but only 200 bytes drained.
        assert!(session.handle_binary(&[2; 100]).await.is_empty());
        assert!(loader.calls().is_empty());
        assert_eq!(session.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_flush_drains_below_threshold() {
        let loader = Arc::new(FakeLoader::new());
        loader.reply_with("tail");
        let mut session = session_with(&loader);

        session.handle_binary(&[9; 2048]).await;
        let replies = session.handle_text(r#"{"type":"flush"}"#).await;
        assert_eq!(
            replies,
            vec![ServerMessage::final_segment("tail".into()), ServerMessage::done()]
        );
        assert_eq!(loader.calls().len(), 1);

        // Empty buffer: done only, no model call.
        let replies = session.handle_text(r#"{"type":"flush"}"#).await;
        assert_eq!(replies, vec![ServerMessage::done()]);
        assert_eq!(loader.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_of_tiny_tail_sends_done_only() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        session.handle_binary(&[1; 500]).await;
        let replies = session.handle_text(r#"{"type":"flush"}"#).await;
        assert_eq!(replies, vec![ServerMessage::done()]);
        assert!(loader.calls().is_empty());
    }

    #[tokio::test]
    async fn test_blank_result_emits_nothing() {
        let loader = Arc::new(FakeLoader::new());
        loader.reply_with("   ");
        let mut session = session_with(&loader);

        session.handle_binary(&[1; 1024]).await;
        assert!(session.handle_binary(&[1; 1024]).await.is_empty());
        assert_eq!(loader.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_inference_failure_reports_and_continues() {
        let loader = Arc::new(FakeLoader::new());
        loader.fail_inference("corrupt container");
        let mut session = session_with(&loader);

        session.handle_binary(&[1; 1024]).await;
        let replies = session.handle_binary(&[1; 1024]).await;
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            ServerMessage::Control(ControlReply::Error { message }) => {
                assert!(message.starts_with("Transcription error:"));
                assert!(message.contains("corrupt container"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(session.buffered_bytes(), 0);
        assert_eq!(session.stats().failures, 1);

        loader.reply_with("recovered");
        session.handle_binary(&[1; 1024]).await;
        let replies = session.handle_binary(&[1; 1024]).await;
        assert_eq!(replies, vec![ServerMessage::partial("recovered".into())]);
    }

    #[tokio::test]
    async fn test_model_load_failure_reports_and_retries() {
        let loader = Arc::new(FakeLoader::new());
        loader.fail_loads(ModelIdentifier::Medium, 1);
        let mut session = session_with(&loader);

        session.handle_binary(&[1; 1024]).await;
        let replies = session.handle_binary(&[1; 1024]).await;
        assert!(matches!(
            &replies[..],
            [ServerMessage::Control(ControlReply::Error { .. })]
        ));

        session.handle_binary(&[1; 1024]).await;
        let replies = session.handle_binary(&[1; 1024]).await;
        assert!(matches!(&replies[..], [ServerMessage::Transcription(_)]));
        assert_eq!(loader.load_count(ModelIdentifier::Medium), 2);
    }

    #[tokio::test]
    async fn test_close_transcribes_residual_audio_once() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        session.handle_binary(&[5; 3000]).await;
        session.close().await;
        session.close().await;

        let calls = loader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].audio, vec![5; 3000]);
        assert_eq!(session.state(), SessionState::Closed);

        // Frames after close are dropped.
        assert!(session.handle_binary(&[1; 4096]).await.is_empty());
        assert!(session.handle_text(r#"{"type":"flush"}"#).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_suppresses_failures() {
        let loader = Arc::new(FakeLoader::new());
        loader.fail_inference("boom");
        let mut session = session_with(&loader);

        session.handle_binary(&[5; 3000]).await;
        session.close().await;
        assert_eq!(session.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_config_applies_to_next_drain_only() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        session.handle_binary(&[1; 1024]).await;
        session.handle_binary(&[1; 1024]).await;

        session
            .handle_text(r#"{"type":"config","model":"small","action":"translate_language","target_language":"fr"}"#)
            .await;
        session.handle_binary(&[1; 1024]).await;
        session.handle_binary(&[1; 1024]).await;

        let calls = loader.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].model_id, ModelIdentifier::Medium);
        assert_eq!(calls[0].options.task, Task::Transcribe);
        assert_eq!(calls[0].options.language, None);
        assert_eq!(calls[1].model_id, ModelIdentifier::Small);
        assert_eq!(calls[1].options.language.as_deref(), Some("fr"));
    }

    #[tokio::test]
    async fn test_translate_english_uses_translate_task() {
        let loader = Arc::new(FakeLoader::new());
        let mut session = session_with(&loader);

        session
            .handle_text(r#"{"type":"config","model":"small","action":"translate_english"}"#)
            .await;
        session.handle_binary(&[1; 2048]).await;
        session.handle_text(r#"{"type":"flush"}"#).await;

        assert_eq!(loader.calls()[0].options.task, Task::Translate);
    }
}
