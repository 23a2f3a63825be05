//! # Upload Handler
//!
//! `POST /upload` accepts one multipart field named `file`, hands the bytes to the
//! [`Transcriber`](crate::transcription::Transcriber) and returns the transcript.
//!
//! Readiness is checked before the body is read, so a client polling a loading
//! server gets its 503 without streaming the whole file first.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::orchestrator::{supported_extension, unsupported_format};
use crate::transcription::Transcript;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use tracing::{info, warn};

const FILE_FIELD: &str = "file";

/// File received from the multipart body.
struct ReceivedFile {
    filename: String,
    bytes: Vec<u8>,
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /upload`
///
/// ## Request:
/// Multipart form data with an audio file field named "file"
///
/// ## Response:
/// ```json
/// {
///   "success": true,
///   "transcription": "xin chào các bạn",
///   "filename": "meeting.mp3",
///   "chunks": 2,
///   "duration_seconds": 30.0,
///   "processing_time_ms": 1840
/// }
/// ```
pub async fn upload_audio(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, AppError> {
    let active = state.begin_transcription();

    match receive_and_transcribe(&state, payload).await {
        Ok((filename, transcript)) => {
            active.succeeded(
                transcript.audio_duration_seconds,
                transcript.processing_time_ms,
            );
            info!(
                filename = %filename,
                chunks = transcript.chunks,
                duration_seconds = transcript.audio_duration_seconds,
                processing_time_ms = transcript.processing_time_ms,
                "upload transcribed"
            );

            Ok(HttpResponse::Ok().json(json!({
                "success": true,
                "transcription": transcript.text,
                "filename": filename,
                "chunks": transcript.chunks,
                "duration_seconds": transcript.audio_duration_seconds,
                "processing_time_ms": transcript.processing_time_ms
            })))
        }
        Err(e) => {
            active.failed(e.kind());
            warn!(kind = e.kind(), error = %e, "upload rejected");
            Err(e)
        }
    }
}

async fn receive_and_transcribe(
    state: &AppState,
    payload: Multipart,
) -> AppResult<(String, Transcript)> {
    state.model.handle()?;

    let max_bytes = state.config.upload.max_file_size_bytes;
    let file = read_file_field(payload, max_bytes).await?;

    let safe_name = sanitize_filename(&file.filename);
    let display_name = if safe_name.is_empty() {
        // Extension was already validated on the original name.
        match supported_extension(&file.filename) {
            Some(ext) => format!("upload.{}", ext),
            None => "upload".to_string(),
        }
    } else {
        safe_name
    };

    let transcript = state
        .transcriber
        .transcribe_upload(file.bytes, &file.filename)
        .await?;

    Ok((display_name, transcript))
}

/// Pull the `file` field out of the multipart stream.
///
/// The extension is checked as soon as the field headers arrive so unsupported
/// uploads are rejected before their content is buffered. Other fields are drained
/// and ignored.
async fn read_file_field(mut payload: Multipart, max_bytes: usize) -> AppResult<ReceivedFile> {
    let mut received: Option<ReceivedFile> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::BadRequest(format!("Multipart error: {}", e)))?;

        let (field_name, filename) = match field.content_disposition() {
            Some(cd) => (
                cd.get_name().map(str::to_string),
                cd.get_filename().map(str::to_string),
            ),
            None => (None, None),
        };

        if field_name.as_deref() != Some(FILE_FIELD) || received.is_some() {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
            }
            continue;
        }

        let filename = match filename {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(AppError::BadRequest("No file selected".to_string())),
        };

        if supported_extension(&filename).is_none() {
            return Err(unsupported_format(&filename));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| AppError::BadRequest(format!("Chunk error: {}", e)))?;
            if bytes.len() + chunk.len() > max_bytes {
                return Err(AppError::PayloadTooLarge(format!(
                    "{} exceeds the {} byte upload limit",
                    filename, max_bytes
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        received = Some(ReceivedFile { filename, bytes });
    }

    received.ok_or_else(|| AppError::BadRequest("No file uploaded".to_string()))
}

/// Reduce a client-supplied filename to a safe, flat ASCII name.
///
/// Only the final path component is kept; whitespace runs become `_`; anything but
/// ASCII letters, digits, `.`, `_` and `-` is dropped; leading and trailing `.`/`_`
/// are stripped. The result may be empty.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let joined = base.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}
