//! # Whisper Backend (Candle)
//!
//! Production [`SpeechModel`] and [`ModelLoader`] built on `candle-transformers`.
//!
//! ## Loading Process:
//! 1. Resolve `config.json`, `tokenizer.json` and `model.safetensors` through the
//!    HuggingFace cache (downloading on first use)
//! 2. Memory-map the weights onto the selected device
//! 3. Build the log-mel filterbank matching the model's mel bin count
//! 4. Look up the special tokens the decoder prompt needs
//!
//! ## Inference:
//! Audio is decoded to 16kHz mono, converted to a log-mel spectrogram and fed
//! through the encoder in 30 second windows. Each window is decoded greedily
//! without timestamps; the window texts are joined with spaces.

use crate::audio::processor::{AudioDecoder, TARGET_SAMPLE_RATE};
use crate::transcription::backend::{ModelLoader, SpeechModel};
use crate::transcription::model::{ModelIdentifier, Task, TranscribeOptions};
use anyhow::{anyhow, Context, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio, Config};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

/// Language codes in Whisper's token order.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Token ids the decoder prompt is assembled from.
#[derive(Debug, Clone)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    translate: u32,
    no_timestamps: u32,
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Tokenizer has no '{}' token", token))
        };

        let languages = LANGUAGES
            .iter()
            .filter_map(|code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|token| (*code, token))
            })
            .collect();

        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            translate: id(m::TRANSLATE_TOKEN)?,
            no_timestamps: id(m::NO_TIMESTAMPS_TOKEN)?,
            languages,
        })
    }

    fn language(&self, code: &str) -> Option<u32> {
        let code = code.to_lowercase();
        self.languages
            .iter()
            .find(|(candidate, _)| *candidate == code)
            .map(|(_, token)| *token)
    }
}

/// A loaded Whisper model ready for inference.
///
/// ## Thread Safety:
/// Candle's decoder keeps a key/value cache, so forward passes need `&mut`.
/// The network sits behind a `Mutex`; concurrent callers take turns.
pub struct WhisperModel {
    id: ModelIdentifier,
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    suppress_mask: Tensor,
    device: Device,
    decoder: AudioDecoder,
}

impl WhisperModel {
    /// Load a Whisper model through the HuggingFace cache.
    pub fn load(id: ModelIdentifier, options: &WhisperLoader) -> Result<Self> {
        tracing::info!("Loading Whisper {} model from {}...", id, id.repo_name());
        let start_time = std::time::Instant::now();

        let mut builder = hf_hub::api::sync::ApiBuilder::new()
            .with_progress(false)
            .with_token(options.hf_token.clone());
        if let Some(cache_dir) = &options.cache_dir {
            tracing::debug!("Using model cache dir: {:?}", cache_dir);
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder.build().context("Failed to create HuggingFace API client")?;
        let repo = api.model(id.repo_name().to_string());

        let config_file = repo
            .get("config.json")
            .with_context(|| format!("Failed to fetch config.json from {}", id.repo_name()))?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .with_context(|| format!("Failed to fetch tokenizer.json from {}", id.repo_name()))?;
        let weights_file = repo
            .get("model.safetensors")
            .with_context(|| format!("Failed to fetch model.safetensors from {}", id.repo_name()))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &options.device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        let mel_filters = mel_filter_bank(m::N_FFT, config.num_mel_bins, TARGET_SAMPLE_RATE);
        let suppress_mask = suppress_mask(&config, tokens.no_timestamps, &options.device)?;

        tracing::info!(
            "Whisper {} model loaded in {:.2}s ({} mel bins, {} languages)",
            id,
            start_time.elapsed().as_secs_f64(),
            config.num_mel_bins,
            tokens.languages.len()
        );

        Ok(Self {
            id,
            model: Mutex::new(model),
            config,
            tokenizer,
            tokens,
            mel_filters,
            suppress_mask,
            device: options.device.clone(),
            decoder: AudioDecoder::new(options.ffmpeg_path.clone()),
        })
    }

    /// Run the encoder/decoder over already-decoded 16kHz samples.
    fn transcribe_pcm(&self, pcm: &[f32], options: &TranscribeOptions) -> Result<String> {
        let n_mels = self.config.num_mel_bins;
        let mel = audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?;
        let (_, _, total_frames) = mel.dims3()?;

        // The mel spectrogram is padded; only walk the frames that hold audio.
        let content_frames = (pcm.len() / m::HOP_LENGTH).clamp(1, total_frames);

        let mut model = self.model.lock().unwrap_or_else(|e| e.into_inner());

        let language = match options.language.as_deref() {
            Some(code) => match self.tokens.language(code) {
                Some(token) => Some(token),
                None => {
                    tracing::warn!("Unknown language hint '{}', detecting instead", code);
                    None
                }
            },
            None => None,
        };
        let language = match language {
            Some(token) => token,
            None => {
                let window = usize::min(total_frames, m::N_FRAMES);
                self.detect_language(&mut model, &mel.narrow(2, 0, window)?)?
            }
        };

        let mut segments = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let window = usize::min(total_frames - seek, m::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, window)?;
            let tokens = self.decode_segment(&mut model, &mel_segment, options.task, language)?;
            let text = self
                .tokenizer
                .decode(&tokens, true)
                .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
            let text = text.trim();
            if !text.is_empty() {
                segments.push(text.to_string());
            }
            seek += m::N_FRAMES;
        }

        Ok(segments.join(" "))
    }

    /// Pick the most likely language token from the first decoder step.
    fn detect_language(&self, model: &mut m::model::Whisper, mel: &Tensor) -> Result<u32> {
        if self.tokens.languages.is_empty() {
            return Err(anyhow!("Model vocabulary has no language tokens"));
        }

        let features = model.encoder.forward(mel, true)?;
        let prompt = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder.forward(&prompt, &features, true)?;
        let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let ids: Vec<u32> = self.tokens.languages.iter().map(|(_, id)| *id).collect();
        let candidates = Tensor::new(ids.as_slice(), &self.device)?;
        let best = logits
            .index_select(&candidates, 0)?
            .argmax(D::Minus1)?
            .to_scalar::<u32>()? as usize;

        let (code, token) = self.tokens.languages[best];
        tracing::debug!("Detected language '{}' for {} model", code, self.id);
        Ok(token)
    }

    /// Greedy decoding of one 30 second window.
    fn decode_segment(
        &self,
        model: &mut m::model::Whisper,
        mel: &Tensor,
        task: Task,
        language: u32,
    ) -> Result<Vec<u32>> {
        let features = model.encoder.forward(mel, true)?;

        let task_token = match task {
            Task::Transcribe => self.tokens.transcribe,
            Task::Translate => self.tokens.translate,
        };
        let mut tokens = vec![self.tokens.sot, language, task_token, self.tokens.no_timestamps];
        let prompt_len = tokens.len();
        let sample_len = self.config.max_target_positions / 2;

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_mask)?;
            let next = logits.argmax(D::Minus1)?.to_scalar::<u32>()?;

            if next == self.tokens.eot || tokens.len() >= self.config.max_target_positions {
                break;
            }
            tokens.push(next);
        }

        Ok(tokens.split_off(prompt_len))
    }
}

impl SpeechModel for WhisperModel {
    fn transcribe(&self, audio: &[u8], options: &TranscribeOptions) -> Result<String> {
        let start_time = std::time::Instant::now();
        let pcm = self.decoder.decode(audio)?;
        let text = self.transcribe_pcm(&pcm, options)?;

        tracing::debug!(
            "Whisper {} processed {:.2}s of audio in {:.2}s: '{}'",
            self.id,
            pcm.len() as f64 / TARGET_SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64(),
            text
        );
        Ok(text)
    }
}

/// Loads [`WhisperModel`]s onto one device.
#[derive(Debug, Clone)]
pub struct WhisperLoader {
    pub device: Device,
    pub cache_dir: Option<PathBuf>,
    pub hf_token: Option<String>,
    pub ffmpeg_path: String,
}

impl ModelLoader for WhisperLoader {
    fn load(&self, model_id: ModelIdentifier) -> Result<Arc<dyn SpeechModel>> {
        Ok(Arc::new(WhisperModel::load(model_id, self)?))
    }
}

/// Logit mask that removes the configured suppressed tokens and the
/// no-timestamps marker from the sampling pool.
fn suppress_mask(config: &Config, no_timestamps: u32, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..config.vocab_size as u32)
        .map(|token| {
            if token == no_timestamps || config.suppress_tokens.contains(&token) {
                f32::NEG_INFINITY
            } else {
                0.0
            }
        })
        .collect();
    Ok(Tensor::new(mask.as_slice(), device)?)
}

fn hz_to_mel(hz: f64) -> f64 {
    // Slaney scale: linear below 1kHz, logarithmic above.
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        mel * F_SP
    }
}

/// Slaney-normalised triangular mel filterbank, row-major `[n_mels][n_fft/2 + 1]`.
///
/// Matches the filters Whisper was trained with, so the weights do not need
/// the precomputed `mel_filters.npz` shipped with the Python package.
pub fn mel_filter_bank(n_fft: usize, n_mels: usize, sample_rate: u32) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * nyquist / (n_freqs - 1) as f64)
        .collect();

    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for bin in 0..n_mels {
        let (lower, center, upper) = (mel_points[bin], mel_points[bin + 1], mel_points[bin + 2]);
        let enorm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[bin * n_freqs + k] = (weight * enorm) as f32;
        }
    }
    filters
}
