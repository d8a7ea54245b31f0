//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_REALTIME__CHUNK_THRESHOLD`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore so that field names containing a
//! single underscore (`chunk_threshold`, `max_file_size`) survive intact.

use crate::transcription::ModelIdentifier;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(Serialize, Deserialize)]**: the same struct feeds the `config`
///   crate (defaults layer) and is returned as JSON by `GET /api/v1/config`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub realtime: RealtimeConfig,
    pub upload: UploadConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins. Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Speech model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model used by new sessions and by `config` frames that omit `model`
    pub default_model: ModelIdentifier,
    /// HuggingFace cache directory; `None` uses the hf-hub default
    pub cache_dir: Option<String>,
    /// `auto`, `cpu`, `cuda` or `metal`
    pub device: String,
    /// Language hint for plain transcription (ISO 639-1); `None` auto-detects
    pub language_hint: Option<String>,
    /// ffmpeg binary used to decode non-WAV containers
    pub ffmpeg_path: String,
}

/// Realtime WebSocket session settings.
///
/// ## Tuning guidelines:
/// - Lower `chunk_threshold`: faster partial results, more (and smaller) model calls
/// - `min_audio_bytes`: drains below this size are skipped, they rarely decode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub chunk_threshold: usize,
    pub min_audio_bytes: usize,
    pub max_concurrent_sessions: usize,
    /// Largest accepted WebSocket frame in bytes
    pub max_frame_bytes: usize,
    /// How often the server pings a realtime client
    pub heartbeat_interval_ms: u64,
    /// A client silent for this long is disconnected
    pub client_timeout_ms: u64,
}

/// File upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_file_size: usize,
    pub allowed_content_types: Vec<String>,
    /// Extensions including the leading dot, lowercase
    pub allowed_extensions: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
                cors_origins: Vec::new(),
            },
            models: ModelsConfig {
                default_model: ModelIdentifier::Medium,
                cache_dir: None,
                device: "auto".to_string(),
                language_hint: None,
                ffmpeg_path: "ffmpeg".to_string(),
            },
            realtime: RealtimeConfig {
                chunk_threshold: 2,
                min_audio_bytes: 1024,
                max_concurrent_sessions: 10,
                max_frame_bytes: 4 * 1024 * 1024,
                heartbeat_interval_ms: 30_000,
                client_timeout_ms: 60_000,
            },
            upload: UploadConfig {
                max_file_size: 100 * 1024 * 1024,  // 100MB
                allowed_content_types: [
                    "audio/mpeg",
                    "audio/mp4",
                    "audio/wav",
                    "audio/ogg",
                    "audio/webm",
                    "audio/flac",
                    "audio/aac",
                    "audio/3gpp",
                    "audio/3gpp2",
                    "audio/amr",
                    "application/octet-stream",  // Fallback for undetected types
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                allowed_extensions: [
                    ".mp3", ".m4a", ".wav", ".opus", ".ogg", ".flac", ".aac", ".webm", ".mp4",
                    ".3gp", ".amr",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_MODELS__DEFAULT_MODEL=turbo`: Override the default model
    /// - `APP_UPLOAD__ALLOWED_EXTENSIONS=.wav,.mp3`: Lists are comma separated
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .with_list_parse_key("upload.allowed_content_types")
                    .with_list_parse_key("upload.allowed_extensions"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.realtime.chunk_threshold == 0 {
            return Err(anyhow!("Chunk threshold must be greater than 0"));
        }

        if self.realtime.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.realtime.max_frame_bytes == 0 {
            return Err(anyhow!("Max frame size must be greater than 0"));
        }

        if self.realtime.heartbeat_interval_ms == 0 {
            return Err(anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.realtime.client_timeout_ms <= self.realtime.heartbeat_interval_ms {
            return Err(anyhow!("Client timeout must be longer than the heartbeat interval"));
        }

        if self.upload.max_file_size == 0 {
            return Err(anyhow!("Max upload file size must be greater than 0"));
        }

        if self.models.device.parse::<crate::device::DevicePreference>().is_err() {
            return Err(anyhow!(
                "Unknown device '{}' (expected auto, cpu, cuda or metal)",
                self.models.device
            ));
        }

        if let Some(lang) = &self.models.language_hint {
            if lang.trim().is_empty() {
                return Err(anyhow!("Language hint cannot be blank"));
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only fields present in the JSON change. For example
    /// `{"realtime": {"chunk_threshold": 3}}` leaves everything else alone.
    /// The result is validated; on error the caller keeps its old copy.
    ///
    /// Server address and model cache location are startup-only and ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(models) = partial_config.get("models") {
            if let Some(model) = models.get("default_model").and_then(|v| v.as_str()) {
                self.models.default_model = model.parse()?;
            }
            if let Some(hint) = models.get("language_hint") {
                self.models.language_hint = hint.as_str().map(str::to_string);
            }
        }

        if let Some(realtime) = partial_config.get("realtime") {
            if let Some(threshold) = realtime.get("chunk_threshold").and_then(|v| v.as_u64()) {
                self.realtime.chunk_threshold = threshold as usize;
            }
            if let Some(min_bytes) = realtime.get("min_audio_bytes").and_then(|v| v.as_u64()) {
                self.realtime.min_audio_bytes = min_bytes as usize;
            }
            if let Some(sessions) = realtime
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.realtime.max_concurrent_sessions = sessions as usize;
            }
        }

        if let Some(upload) = partial_config.get("upload") {
            if let Some(size) = upload.get("max_file_size").and_then(|v| v.as_u64()) {
                self.upload.max_file_size = size as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.models.default_model, ModelIdentifier::Medium);
        assert_eq!(config.realtime.chunk_threshold, 2);
        assert_eq!(config.realtime.min_audio_bytes, 1024);
        assert_eq!(config.upload.max_file_size, 100 * 1024 * 1024);
        assert!(config.upload.allowed_extensions.contains(&".webm".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.realtime.chunk_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.models.device = "tpu".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.realtime.client_timeout_ms = config.realtime.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"realtime": {"chunk_threshold": 4}, "models": {"default_model": "turbo"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.realtime.chunk_threshold, 4);
        assert_eq!(config.models.default_model, ModelIdentifier::Turbo);
        // Other fields should remain unchanged
        assert_eq!(config.realtime.min_audio_bytes, 1024);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config
            .update_from_json(r#"{"models": {"default_model": "large"}}"#)
            .is_err());
        assert!(config
            .update_from_json(r#"{"realtime": {"max_concurrent_sessions": 0}}"#)
            .is_err());
    }

    #[test]
    fn test_defaults_survive_config_crate_round_trip() {
        let built: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default()).unwrap())
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(built.models.cache_dir, None);
        assert_eq!(built.upload.allowed_extensions.len(), 11);
    }
}
