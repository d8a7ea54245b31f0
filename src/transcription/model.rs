//! # Model Identifiers and Transcription Options
//!
//! Strongly typed names for the Whisper variants the service can load and the
//! actions a client can request. These are the only values allowed to cross
//! the protocol boundary into the session core; anything else is rejected
//! while parsing.
//!
//! ## Whisper variants:
//! - **small**: ~244MB, quick enough for live captions on CPU
//! - **medium**: ~769MB, default for new sessions
//! - **turbo**: ~1.6GB, large-v3 with a pruned decoder, best accuracy per second

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Identifier of one loadable Whisper variant, used as the model cache key.
///
/// ## Rust Concepts:
/// - **Copy**: the identifier is a tiny tag, so it is passed by value everywhere
/// - **Hash + Eq**: required to use it as a `HashMap` key in the model cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelIdentifier {
    Small,
    Medium,
    Turbo,
}

impl ModelIdentifier {
    /// Every variant, in ascending size order.
    pub const ALL: [ModelIdentifier; 3] = [
        ModelIdentifier::Small,
        ModelIdentifier::Medium,
        ModelIdentifier::Turbo,
    ];

    /// Wire name used in JSON messages and form fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelIdentifier::Small => "small",
            ModelIdentifier::Medium => "medium",
            ModelIdentifier::Turbo => "turbo",
        }
    }

    /// Get the HuggingFace model repository name.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelIdentifier::Small => "openai/whisper-small",
            ModelIdentifier::Medium => "openai/whisper-medium",
            ModelIdentifier::Turbo => "openai/whisper-large-v3-turbo",
        }
    }

    /// Approximate size of the weights in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelIdentifier::Small => 244,
            ModelIdentifier::Medium => 769,
            ModelIdentifier::Turbo => 1620,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelIdentifier::Small => "Fast, suitable for live captions",
            ModelIdentifier::Medium => "Good accuracy, handles technical vocabulary",
            ModelIdentifier::Turbo => "Best accuracy, large-v3 with a pruned decoder",
        }
    }
}

impl std::str::FromStr for ModelIdentifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "small" => Ok(ModelIdentifier::Small),
            "medium" => Ok(ModelIdentifier::Medium),
            "turbo" => Ok(ModelIdentifier::Turbo),
            _ => Err(anyhow!(
                "'{}' is not a valid model (expected one of: small, medium, turbo)",
                s
            )),
        }
    }
}

impl std::fmt::Display for ModelIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client wants done with the audio.
///
/// The wire names (`translate_english`, `translate_language`) are the ones the
/// web client sends; the variant names describe the behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "transcribe")]
    Transcribe,
    #[serde(rename = "translate_english")]
    TranslateToEnglish,
    #[serde(rename = "translate_language")]
    TranslateToLanguage,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Transcribe => "transcribe",
            ActionKind::TranslateToEnglish => "translate_english",
            ActionKind::TranslateToLanguage => "translate_language",
        }
    }

    /// Whether this action is meaningless without a target language.
    pub fn requires_target_language(&self) -> bool {
        matches!(self, ActionKind::TranslateToLanguage)
    }
}

impl std::str::FromStr for ActionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transcribe" => Ok(ActionKind::Transcribe),
            "translate_english" => Ok(ActionKind::TranslateToEnglish),
            "translate_language" => Ok(ActionKind::TranslateToLanguage),
            _ => Err(anyhow!(
                "'{}' is not a valid action (expected one of: transcribe, translate_english, translate_language)",
                s
            )),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoder task understood by the speech model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Transcribe,
    Translate,
}

/// Parameters handed to the speech model together with the audio bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscribeOptions {
    pub task: Task,
    /// Language hint (ISO 639-1 code). `None` lets the model detect it.
    pub language: Option<String>,
}

impl TranscribeOptions {
    /// Map a requested action onto model parameters.
    ///
    /// ## Mapping:
    /// - `transcribe` → transcribe task, deployment language hint (if any)
    /// - `translate_english` → translate task (Whisper only translates into English)
    /// - `translate_language` → transcribe task with the target language as the
    ///   decoding hint. Whisper cannot translate into arbitrary languages, so
    ///   no translation happens here.
    pub fn for_action(
        action: ActionKind,
        target_language: Option<&str>,
        default_language: Option<&str>,
    ) -> Self {
        match action {
            ActionKind::Transcribe => Self {
                task: Task::Transcribe,
                language: default_language.map(str::to_string),
            },
            ActionKind::TranslateToEnglish => Self {
                task: Task::Translate,
                language: default_language.map(str::to_string),
            },
            ActionKind::TranslateToLanguage => Self {
                task: Task::Transcribe,
                language: target_language
                    .or(default_language)
                    .map(str::to_string),
            },
        }
    }
}
