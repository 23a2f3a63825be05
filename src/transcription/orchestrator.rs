//! # Transcription Orchestrator
//!
//! Request-facing coordinator for one upload:
//!
//! 1. **Readiness**: fail fast with `ModelNotReady` / `ModelLoadFailure`
//! 2. **Extension**: reject anything outside [`SUPPORTED_EXTENSIONS`] before writing
//!    a single byte
//! 3. **Staging**: write the upload to `<token>_upload.<ext>` in the uploads directory
//! 4. **Normalize**: decode, downmix, resample to 16 kHz mono
//! 5. **Persist** (optional): write the canonical WAV to `<token>_converted.wav` and
//!    read it back
//! 6. **Inference**: chunked CTC transcription of the persisted WAV (or of the
//!    in-memory waveform when persistence is off)
//!
//! Staged files are `NamedTempFile`s, removed when they go out of scope on every exit
//! path. Steps 3 to 6 run on the blocking pool, behind a semaphore that bounds how many
//! transcriptions share the compute device. The permit is owned by the blocking task.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audio::{normalize, Waveform};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::transcription::engine::{self, Transcript};
use crate::transcription::readiness::{ModelHandle, ModelManager};

/// Accepted upload extensions, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "m4a", "ogg", "wma"];

/// Lowercased extension of `filename` if it is one we accept.
pub fn supported_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

#[derive(Debug, Clone)]
struct PipelineSettings {
    upload_dir: PathBuf,
    chunk_duration_seconds: u32,
    persist_canonical_wav: bool,
}

pub struct Transcriber {
    model: Arc<ModelManager>,
    settings: PipelineSettings,
    permits: Arc<Semaphore>,
}

impl Transcriber {
    pub fn new(model: Arc<ModelManager>, config: &AppConfig) -> Self {
        Self {
            model,
            settings: PipelineSettings {
                upload_dir: config.upload.dir.clone(),
                chunk_duration_seconds: config.model.chunk_duration_seconds,
                persist_canonical_wav: config.upload.persist_canonical_wav,
            },
            permits: Arc::new(Semaphore::new(config.performance.max_concurrent_transcriptions)),
        }
    }

    /// Transcriptions currently allowed to start without waiting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Transcribe one uploaded file.
    ///
    /// `filename` is only used for its extension; the bytes are staged under a
    /// request-unique name.
    pub async fn transcribe_upload(&self, bytes: Vec<u8>, filename: &str) -> AppResult<Transcript> {
        let handle = self.model.handle()?;
        let ext = supported_extension(filename).ok_or_else(|| unsupported_format(filename))?;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(format!("inference queue closed: {}", e)))?;

        // Held by the blocking task, so a dropped caller does not free the slot early.
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            run_pipeline(&handle, &bytes, &ext, &settings)
        })
        .await
        .map_err(|e| AppError::Internal(format!("transcription task failed: {}", e)))?
    }
}

pub(crate) fn unsupported_format(filename: &str) -> AppError {
    AppError::UnsupportedFormat(format!(
        "{}. Please use: {}",
        filename,
        SUPPORTED_EXTENSIONS.join(", ")
    ))
}

fn run_pipeline(
    handle: &ModelHandle,
    bytes: &[u8],
    ext: &str,
    settings: &PipelineSettings,
) -> AppResult<Transcript> {
    let token = Uuid::new_v4();
    let upload = stage(&settings.upload_dir, &format!("{token}_upload"), &format!(".{ext}"))?;
    write_upload(&upload, bytes)?;
    debug!(%token, path = %upload.path().display(), bytes = bytes.len(), "upload staged");

    let normalized = normalize(upload.path()).map_err(|e| {
        warn!(%token, error = %e, "audio normalization failed");
        AppError::from(e)
    })?;

    let (waveform, _converted) = if settings.persist_canonical_wav {
        let (converted, reloaded) = persist_canonical(&normalized, &settings.upload_dir, token)?;
        (reloaded, Some(converted))
    } else {
        (normalized, None)
    };

    info!(
        %token,
        seconds = waveform.duration_seconds(),
        samples = waveform.len(),
        "audio normalized, starting inference"
    );

    let transcript = engine::transcribe(&waveform, handle, settings.chunk_duration_seconds)?;
    Ok(transcript)
}

/// Write the canonical WAV to `<token>_converted.wav` and load it back; inference
/// runs on what was read from disk.
fn persist_canonical(
    waveform: &Waveform,
    dir: &Path,
    token: Uuid,
) -> AppResult<(NamedTempFile, Waveform)> {
    let converted = stage(dir, &format!("{token}_converted"), ".wav")?;
    waveform
        .write_wav(converted.path())
        .map_err(|e| AppError::Internal(format!("failed to write canonical WAV: {}", e)))?;
    let reloaded = Waveform::read_wav(converted.path())
        .map_err(|e| AppError::ConversionFailure(format!("canonical WAV unreadable: {}", e)))?;
    debug!(%token, path = %converted.path().display(), "canonical WAV persisted");
    Ok((converted, reloaded))
}

fn stage(dir: &Path, prefix: &str, suffix: &str) -> AppResult<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .rand_bytes(0)
        .tempfile_in(dir)
        .map_err(|e| AppError::Internal(format!("failed to stage file in {}: {}", dir.display(), e)))
}

fn write_upload(file: &NamedTempFile, bytes: &[u8]) -> AppResult<()> {
    let mut writer = file.as_file();
    writer
        .write_all(bytes)
        .and_then(|_| writer.flush())
        .map_err(|e| AppError::Internal(format!("failed to write upload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::testing::{
        gated_manager, ready_manager, wait_until, write_constant_wav, VALUE_A,
    };
    use candle_core::Device;
    use std::sync::mpsc;

    fn config_for(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.upload.dir = dir.to_path_buf();
        config
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn test_supported_extension() {
        assert_eq!(supported_extension("talk.MP3").as_deref(), Some("mp3"));
        assert_eq!(supported_extension("a.b.flac").as_deref(), Some("flac"));
        assert_eq!(supported_extension("clip.xyz"), None);
        assert_eq!(supported_extension("noextension"), None);
    }

    #[tokio::test]
    async fn test_long_stereo_upload_uses_two_windows() {
        let uploads = tempfile::tempdir().unwrap();
        let fixtures = tempfile::tempdir().unwrap();
        let path = fixtures.path().join("meeting.wav");
        write_constant_wav(&path, VALUE_A, 30.0, 44_100, 2);

        let transcriber = Transcriber::new(ready_manager().await, &config_for(uploads.path()));
        let bytes = std::fs::read(&path).unwrap();
        let transcript = transcriber.transcribe_upload(bytes, "meeting.wav").await.unwrap();

        assert_eq!(transcript.chunks, 2);
        assert_eq!(transcript.text, "a a");
        assert!((transcript.audio_duration_seconds - 30.0).abs() < 1e-9);
        assert!(dir_is_empty(uploads.path()));
    }

    #[tokio::test]
    async fn test_short_upload_single_window() {
        let uploads = tempfile::tempdir().unwrap();
        let fixtures = tempfile::tempdir().unwrap();
        let path = fixtures.path().join("note.wav");
        write_constant_wav(&path, VALUE_A, 5.0, 16_000, 1);

        let transcriber = Transcriber::new(ready_manager().await, &config_for(uploads.path()));
        let transcript = transcriber
            .transcribe_upload(std::fs::read(&path).unwrap(), "NOTE.WAV")
            .await
            .unwrap();

        assert_eq!(transcript.chunks, 1);
        assert_eq!(transcript.text, "a");
        assert!(dir_is_empty(uploads.path()));
    }

    #[tokio::test]
    async fn test_unknown_extension_writes_nothing() {
        let uploads = tempfile::tempdir().unwrap();
        let transcriber = Transcriber::new(ready_manager().await, &config_for(uploads.path()));

        let err = transcriber
            .transcribe_upload(b"whatever".to_vec(), "clip.xyz")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::UnsupportedFormat(_)));
        assert!(err.to_string().contains("mp3, wav, flac, m4a, ogg, wma"));
        assert!(dir_is_empty(uploads.path()));
    }

    #[tokio::test]
    async fn test_upload_while_loading_is_not_ready() {
        let uploads = tempfile::tempdir().unwrap();
        let manager = Arc::new(ModelManager::new(Device::Cpu));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        manager.start(move |device| {
            release_rx.recv().ok();
            Ok(crate::transcription::testing::fake_handle(device))
        });

        let transcriber = Transcriber::new(Arc::clone(&manager), &config_for(uploads.path()));
        let err = transcriber
            .transcribe_upload(b"RIFF".to_vec(), "clip.wav")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ModelNotReady(_)));
        assert!(err.is_retriable());
        assert!(dir_is_empty(uploads.path()));

        release_tx.send(()).unwrap();
        manager.settle().await;
    }

    #[tokio::test]
    async fn test_failed_model_reports_load_failure() {
        let uploads = tempfile::tempdir().unwrap();
        let manager = Arc::new(ModelManager::new(Device::Cpu));
        manager.start(|_| {
            Err(crate::transcription::wav2vec2::ModelLoadError::MissingArtifact(
                "config.json".into(),
            ))
        });
        manager.settle().await;

        let transcriber = Transcriber::new(manager, &config_for(uploads.path()));
        let err = transcriber
            .transcribe_upload(b"RIFF".to_vec(), "clip.wav")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ModelLoadFailure(_)));
    }

    #[tokio::test]
    async fn test_corrupt_wav_is_conversion_failure_and_cleaned_up() {
        let uploads = tempfile::tempdir().unwrap();
        let transcriber = Transcriber::new(ready_manager().await, &config_for(uploads.path()));

        let err = transcriber
            .transcribe_upload(b"this is not audio at all".repeat(64), "broken.wav")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ConversionFailure(_)), "got {err}");
        assert!(dir_is_empty(uploads.path()));
    }

    #[tokio::test]
    async fn test_undecodable_codec_is_unsupported_format() {
        let uploads = tempfile::tempdir().unwrap();
        let transcriber = Transcriber::new(ready_manager().await, &config_for(uploads.path()));

        // ASF header GUID, the container WMA audio ships in.
        let mut asf = vec![
            0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, 0xA6, 0xD9, 0x00, 0xAA, 0x00, 0x62,
            0xCE, 0x6C,
        ];
        asf.resize(4096, 0);
        let err = transcriber.transcribe_upload(asf, "song.wma").await.unwrap_err();

        assert!(matches!(err, AppError::UnsupportedFormat(_)), "got {err}");
        assert!(dir_is_empty(uploads.path()));
    }

    #[tokio::test]
    async fn test_persisting_disabled_still_transcribes() {
        let uploads = tempfile::tempdir().unwrap();
        let fixtures = tempfile::tempdir().unwrap();
        let path = fixtures.path().join("tone.wav");
        write_constant_wav(&path, VALUE_A, 2.0, 16_000, 1);

        let mut config = config_for(uploads.path());
        config.upload.persist_canonical_wav = false;
        let transcriber = Transcriber::new(ready_manager().await, &config);

        let transcript = transcriber
            .transcribe_upload(std::fs::read(&path).unwrap(), "tone.wav")
            .await
            .unwrap();
        assert_eq!(transcript.text, "a");
        assert!(dir_is_empty(uploads.path()));
    }

    fn staged_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_canonical_wav_is_reloaded_for_inference() {
        let dir = tempfile::tempdir().unwrap();
        let token = Uuid::new_v4();
        let samples: Vec<f32> = (0..16_000).map(|i| (i as f32 * 0.001).sin() * 0.5).collect();
        let waveform = Waveform::new(samples, 16_000);

        let (converted, reloaded) = persist_canonical(&waveform, dir.path(), token).unwrap();

        assert_eq!(staged_names(dir.path()), vec![format!("{token}_converted.wav")]);
        assert_eq!(reloaded, Waveform::read_wav(converted.path()).unwrap());
        assert_eq!(reloaded.sample_rate(), 16_000);
        assert_eq!(reloaded.len(), waveform.len());

        drop(converted);
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn test_abandoned_request_keeps_inference_slot_until_done() {
        let uploads = tempfile::tempdir().unwrap();
        let fixtures = tempfile::tempdir().unwrap();
        let path = fixtures.path().join("clip.wav");
        write_constant_wav(&path, VALUE_A, 2.0, 16_000, 1);

        let (manager, gate) = gated_manager().await;
        let transcriber = Arc::new(Transcriber::new(manager, &config_for(uploads.path())));
        let bytes = std::fs::read(&path).unwrap();

        let request = tokio::spawn({
            let transcriber = Arc::clone(&transcriber);
            async move { transcriber.transcribe_upload(bytes, "clip.wav").await }
        });

        // Both staged files exist while the model is running.
        wait_until(|| staged_names(uploads.path()).len() == 2).await;
        let names = staged_names(uploads.path());
        assert!(names[0].ends_with("_converted.wav"), "{names:?}");
        assert!(names[1].ends_with("_upload.wav"), "{names:?}");
        assert_eq!(transcriber.available_permits(), 0);

        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());
        assert_eq!(transcriber.available_permits(), 0);

        drop(gate);
        wait_until(|| transcriber.available_permits() == 1).await;
        wait_until(|| dir_is_empty(uploads.path())).await;
    }
}
