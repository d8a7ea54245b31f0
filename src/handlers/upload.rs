//! # File Upload Transcription
//!
//! `POST /v1/transcribe/upload` (also `/api/v1/transcribe/upload`): one-shot
//! transcription of a whole audio file through the same engine and model
//! cache the realtime sessions use.
//!
//! ## Request:
//! Multipart form with the parts `file`, `model`, `action` and optionally
//! `target_language`.
//!
//! ## Response:
//! ```json
//! {"model": "small", "action": "transcribe", "text": "Hello world", "target_language": null}
//! ```
//!
//! ## Status Codes:
//! - **400**: unsupported file type, or `translate_language` without a target
//! - **413**: file larger than `upload.max_file_size`
//! - **422**: missing part, unknown model or action, malformed multipart body
//! - **500**: model load or inference failure

use crate::config::UploadConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::{ActionKind, ModelIdentifier};
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

const SUPPORTED_FORMATS: &str = "MP3, M4A, WAV, OPUS, OGG, FLAC, AAC, WebM, MP4, 3GP, AMR";

/// Parts longer than this are not form values.
const MAX_TEXT_FIELD_BYTES: usize = 1024;

/// Successful upload response.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub model: ModelIdentifier,
    pub action: ActionKind,
    pub text: String,
    pub target_language: Option<String>,
}

/// The audio part of the form.
#[derive(Debug, Default)]
struct UploadedFile {
    filename: Option<String>,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// Raw form values, before any of them is interpreted.
#[derive(Debug, Default)]
struct UploadForm {
    file: Option<UploadedFile>,
    model: Option<String>,
    action: Option<String>,
    target_language: Option<String>,
}

/// Check an upload against the allow-lists.
///
/// A file passes when either its content type or its extension is allowed;
/// browsers often send `application/octet-stream` or nothing at all.
pub fn validate_upload(
    filename: Option<&str>,
    content_type: Option<&str>,
    config: &UploadConfig,
) -> AppResult<()> {
    let type_allowed = content_type
        .map(|ct| config.allowed_content_types.iter().any(|allowed| allowed == ct))
        .unwrap_or(false);

    let extension_allowed = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .map(|ext| config.allowed_extensions.contains(&ext))
        .unwrap_or(false);

    if type_allowed || extension_allowed {
        return Ok(());
    }

    Err(AppError::ValidationError(format!(
        "Unsupported file type: {}. Supported formats: {}",
        content_type.unwrap_or("unknown"),
        SUPPORTED_FORMATS
    )))
}

/// Transcribe an uploaded audio file.
pub async fn transcribe_upload(
    state: web::Data<AppState>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let config = state.get_config();
    let form = read_form(payload, config.upload.max_file_size).await?;

    let file = form
        .file
        .ok_or_else(|| AppError::Unprocessable("Missing form field: file".to_string()))?;
    let model_id: ModelIdentifier = form
        .model
        .ok_or_else(|| AppError::Unprocessable("Missing form field: model".to_string()))?
        .parse()
        .map_err(|e: anyhow::Error| AppError::Unprocessable(e.to_string()))?;
    let action: ActionKind = form
        .action
        .ok_or_else(|| AppError::Unprocessable("Missing form field: action".to_string()))?
        .parse()
        .map_err(|e: anyhow::Error| AppError::Unprocessable(e.to_string()))?;

    let target_language = form
        .target_language
        .map(|lang| lang.trim().to_string())
        .filter(|lang| !lang.is_empty());
    if action.requires_target_language() && target_language.is_none() {
        return Err(AppError::BadRequest(
            "target_language is required for translate_language action".to_string(),
        ));
    }

    validate_upload(
        file.filename.as_deref(),
        file.content_type.as_deref(),
        &config.upload,
    )?;

    info!(
        model = %model_id,
        action = %action,
        filename = ?file.filename,
        "Transcribing upload of {} bytes",
        file.bytes.len()
    );

    let options = state.engine.options_for(action, target_language.as_deref());
    let result = state
        .engine
        .transcribe(model_id, file.bytes, options)
        .await
        .map_err(|e| {
            warn!(model = %model_id, "Upload transcription failed: {}", e);
            AppError::from(e)
        })?;

    Ok(HttpResponse::Ok().json(UploadResponse {
        model: model_id,
        action,
        text: result.text,
        target_language,
    }))
}

/// Collect the multipart parts, enforcing the file size limit while reading.
async fn read_form(mut payload: Multipart, max_file_size: usize) -> AppResult<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" => {
                let filename = field
                    .content_disposition()
                    .and_then(|cd| cd.get_filename())
                    .map(str::to_string);
                let content_type = field.content_type().map(|mime| mime.essence_str().to_string());
                let bytes = read_field(&mut field, max_file_size, |limit| {
                    AppError::PayloadTooLarge(format!(
                        "File too large. Maximum size: {}MB",
                        limit / (1024 * 1024)
                    ))
                })
                .await?;

                form.file = Some(UploadedFile {
                    filename,
                    content_type,
                    bytes,
                });
            }
            "model" => form.model = Some(read_text_field(&mut field, &name).await?),
            "action" => form.action = Some(read_text_field(&mut field, &name).await?),
            "target_language" => form.target_language = Some(read_text_field(&mut field, &name).await?),
            _ => {
                // Unknown parts are drained and ignored
                while let Some(chunk) = field.next().await {
                    chunk?;
                }
            }
        }
    }

    Ok(form)
}

async fn read_field(
    field: &mut Field,
    limit: usize,
    too_large: impl Fn(usize) -> AppError,
) -> AppResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > limit {
            return Err(too_large(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

async fn read_text_field(field: &mut Field, name: &str) -> AppResult<String> {
    let bytes = read_field(field, MAX_TEXT_FIELD_BYTES, |_| {
        AppError::Unprocessable(format!("Form field '{}' is too long", name))
    })
    .await?;

    String::from_utf8(bytes)
        .map(|value| value.trim().to_string())
        .map_err(|_| AppError::Unprocessable(format!("Form field '{}' is not valid UTF-8", name)))
}
