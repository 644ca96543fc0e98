//! # Transcription Endpoint
//!
//! `POST /api/v1/transcriptions` takes a `multipart/form-data` body:
//!
//! | field            | kind | default                       |
//! |------------------|------|-------------------------------|
//! | `audio_file`     | file | required                      |
//! | `model`          | text | `engine.model`                |
//! | `language`       | text | `engine.language`             |
//! | `initial_prompt` | text | `engine.initial_prompt`       |
//! | `output_format`  | text | `engine.output_format`        |
//!
//! The upload is written to `storage.audio_dir/<uuid>.<ext>` and handed to
//! the shared pipeline, which deletes it once the job is over. The response
//! is the [`Transcript`](crate::transcription::Transcript) as JSON, or an
//! error body whose `type` names the failure.

use crate::config::{AppConfig, StorageConfig};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::artifacts::ArtifactSet;
use crate::transcription::{OutputFormat, TranscriptionFailure, TranscriptionRequest};
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const AUDIO_FIELD: &str = "audio_file";
const DEFAULT_EXTENSION: &str = "oga";
const MAX_TEXT_FIELD_BYTES: usize = 4096;

/// Everything the client sent besides the audio bytes.
#[derive(Debug, Default)]
struct UploadForm {
    audio_path: Option<PathBuf>,
    model: Option<String>,
    language: Option<String>,
    initial_prompt: Option<String>,
    output_format: Option<String>,
}

pub async fn create_transcription(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> AppResult<HttpResponse> {
    if state.shutdown.is_cancelled() {
        return Err(TranscriptionFailure::Cancelled.into());
    }

    let config = state.get_config();

    // Owns the upload until the pipeline does, so early returns leave nothing behind
    let mut upload_guard = ArtifactSet::new();
    let form = read_form(&mut payload, &config.storage, &mut upload_guard).await?;
    let request = build_request(form, &config)?;

    let token = state.shutdown.child_token();
    let timer = config.job_timeout().map(|timeout| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!(timeout_secs = timeout.as_secs(), "Transcription job timed out");
            token.cancel();
        })
    });

    state.record_job_submitted();
    let result = state.pipeline.submit(request, &token).await;
    state.record_job_outcome(&result);

    if let Some(timer) = timer {
        timer.abort();
    }
    upload_guard.cleanup().log_warnings();

    let transcript = result?;
    Ok(HttpResponse::Ok().json(transcript))
}

async fn read_form(
    payload: &mut Multipart,
    storage: &StorageConfig,
    upload_guard: &mut ArtifactSet,
) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();

    while let Some(field) = payload.next().await {
        let mut field = field?;
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            AUDIO_FIELD => {
                if form.audio_path.is_some() {
                    return Err(AppError::BadRequest(format!(
                        "Only one '{}' field is allowed",
                        AUDIO_FIELD
                    )));
                }
                let path = upload_path(&storage.audio_dir, upload_filename(&field));
                upload_guard.track(&path);
                save_upload(&mut field, &path, storage.max_upload_bytes).await?;
                form.audio_path = Some(path);
            }
            "model" => form.model = Some(read_text(&mut field, &name).await?),
            "language" => form.language = Some(read_text(&mut field, &name).await?),
            "initial_prompt" => form.initial_prompt = Some(read_text(&mut field, &name).await?),
            "output_format" => form.output_format = Some(read_text(&mut field, &name).await?),
            _ => {
                tracing::debug!(field = %name, "Ignoring unknown form field");
                while let Some(chunk) = field.next().await {
                    chunk?;
                }
            }
        }
    }

    Ok(form)
}

fn upload_filename(field: &Field) -> Option<String> {
    field
        .content_disposition()
        .and_then(|disposition| disposition.get_filename())
        .map(str::to_string)
}

/// `<audio_dir>/<uuid>.<ext>`, keeping the client's extension when it is sane.
fn upload_path(audio_dir: &str, client_filename: Option<String>) -> PathBuf {
    let extension = client_filename
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());

    Path::new(audio_dir).join(format!("{}.{}", Uuid::new_v4(), extension))
}

async fn save_upload(field: &mut Field, path: &Path, limit: usize) -> Result<(), AppError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0usize;

    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        written += chunk.len();
        if written > limit {
            return Err(AppError::PayloadTooLarge(format!(
                "Audio file exceeds the {} byte limit",
                limit
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if written == 0 {
        return Err(AppError::BadRequest("Audio file is empty".to_string()));
    }

    tracing::debug!(path = %path.display(), bytes = written, "Upload saved");
    Ok(())
}

async fn read_text(field: &mut Field, name: &str) -> Result<String, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk?;
        if bytes.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
            return Err(AppError::BadRequest(format!("Field '{}' is too long", name)));
        }
        bytes.extend_from_slice(&chunk);
    }

    String::from_utf8(bytes)
        .map_err(|_| AppError::BadRequest(format!("Field '{}' must be valid UTF-8", name)))
}

/// Merge the form with the configured engine defaults.
fn build_request(form: UploadForm, config: &AppConfig) -> Result<TranscriptionRequest, AppError> {
    let audio_path = form
        .audio_path
        .ok_or_else(|| AppError::BadRequest(format!("Missing '{}' field", AUDIO_FIELD)))?;

    let engine = &config.engine;
    let model = non_empty(form.model).unwrap_or_else(|| engine.model.clone());
    let output_format = match non_empty(form.output_format) {
        Some(format) => format.parse::<OutputFormat>().map_err(AppError::BadRequest)?,
        None => engine.output_format,
    };

    let request = TranscriptionRequest::new(audio_path, &engine.output_dir, model)?
        .with_output_format(output_format)
        .with_language(form.language.unwrap_or_else(|| engine.language.clone()))
        .with_initial_prompt(form.initial_prompt.unwrap_or_else(|| engine.initial_prompt.clone()));

    Ok(request)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
