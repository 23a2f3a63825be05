//! # Model Readiness
//!
//! Owns the acoustic model for the lifetime of the process. Loading a multi-gigabyte
//! checkpoint takes long enough that the HTTP server starts first and the model is
//! built on a blocking-pool thread in the background.
//!
//! ## Lifecycle:
//! ```text
//! Unloaded ──start()──▶ Loading ──ok──▶ Ready
//!                                └─err─▶ Failed
//! ```
//! Transitions only move forward. There is no retry and no unload: a `Failed` model
//! stays failed until the process restarts.
//!
//! ## Publication:
//! The handle is written to a `OnceLock` before `Ready` is stored with release
//! ordering, so any reader that observes `Ready` (acquire) also sees the full handle.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use candle_core::Device;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ModelConfig;
use crate::device::{create_device_from_string, DeviceManager};
use crate::error::AppError;
use crate::transcription::processor::Wav2Vec2Processor;
use crate::transcription::wav2vec2::{AcousticModel, ModelLoadError, Wav2Vec2ForCtc};

/// Model definitions compiled into this binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    Wav2Vec2,
}

impl std::str::FromStr for ModelArchitecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wav2vec2" | "wav2vec2forctc" => Ok(ModelArchitecture::Wav2Vec2),
            _ => Err(format!("Unknown model architecture: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelArchitecture::Wav2Vec2 => write!(f, "wav2vec2"),
        }
    }
}

/// Readiness of the process-wide model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ReadinessState {
    Unloaded = 0,
    Loading = 1,
    Ready = 2,
    Failed = 3,
}

impl ReadinessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadinessState::Unloaded,
            1 => ReadinessState::Loading,
            2 => ReadinessState::Ready,
            _ => ReadinessState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessState::Unloaded => "unloaded",
            ReadinessState::Loading => "loading",
            ReadinessState::Ready => "ready",
            ReadinessState::Failed => "failed",
        }
    }
}

/// A loaded model and its paired processor, bound to one device.
pub struct ModelHandle {
    model: Box<dyn AcousticModel>,
    processor: Wav2Vec2Processor,
    device: Device,
}

impl ModelHandle {
    /// Pair a model with its processor, rejecting mismatched vocabularies.
    pub fn new(
        model: Box<dyn AcousticModel>,
        processor: Wav2Vec2Processor,
        device: Device,
    ) -> Result<Self, ModelLoadError> {
        if processor.vocab_size() != model.vocab_size() {
            return Err(ModelLoadError::VocabMismatch {
                processor: processor.vocab_size(),
                model: model.vocab_size(),
            });
        }
        Ok(Self {
            model,
            processor,
            device,
        })
    }

    /// Build the configured architecture from `config.dir` on `device`.
    pub fn load(config: &ModelConfig, device: &Device) -> Result<Self, ModelLoadError> {
        let architecture: ModelArchitecture = config
            .architecture
            .parse()
            .map_err(ModelLoadError::InvalidConfig)?;

        if !config.dir.is_dir() {
            return Err(ModelLoadError::MissingArtifact(config.dir.display().to_string()));
        }

        let processor = Wav2Vec2Processor::from_dir(&config.dir)?;
        let model: Box<dyn AcousticModel> = match architecture {
            ModelArchitecture::Wav2Vec2 => Box::new(Wav2Vec2ForCtc::from_dir(&config.dir, device)?),
        };

        Self::new(model, processor, device.clone())
    }

    pub fn model(&self) -> &dyn AcousticModel {
        self.model.as_ref()
    }

    pub fn processor(&self) -> &Wav2Vec2Processor {
        &self.processor
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Point-in-time view of the manager, served by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub state: ReadinessState,
    pub device: String,
    pub error: Option<String>,
    pub load_time_ms: Option<u64>,
}

impl ModelStatus {
    pub fn is_ready(&self) -> bool {
        self.state == ReadinessState::Ready
    }
}

/// Process-wide owner of the model and its readiness state.
pub struct ModelManager {
    state: AtomicU8,
    handle: OnceLock<Arc<ModelHandle>>,
    error: OnceLock<String>,
    load_time_ms: OnceLock<u64>,
    device: Device,
    device_label: String,
}

impl ModelManager {
    /// The device is fixed here, before any load starts, so `/status` can report it.
    pub fn new(device: Device) -> Self {
        let device_label = DeviceManager::label(&device);
        Self {
            state: AtomicU8::new(ReadinessState::Unloaded as u8),
            handle: OnceLock::new(),
            error: OnceLock::new(),
            load_time_ms: OnceLock::new(),
            device,
            device_label,
        }
    }

    pub fn from_preference(preference: &str) -> Self {
        Self::new(create_device_from_string(preference))
    }

    pub fn state(&self) -> ReadinessState {
        ReadinessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Begin the one-time background load.
    ///
    /// Returns `false` without doing anything if a load was already started. Must be
    /// called from within a tokio runtime.
    pub fn start<F>(self: &Arc<Self>, loader: F) -> bool
    where
        F: FnOnce(&Device) -> Result<ModelHandle, ModelLoadError> + Send + 'static,
    {
        if self
            .state
            .compare_exchange(
                ReadinessState::Unloaded as u8,
                ReadinessState::Loading as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!(state = self.state().as_str(), "model load already started; ignoring");
            return false;
        }

        info!(device = %self.device_label, "starting background model load");
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.run_loader(loader));
        true
    }

    fn run_loader<F>(&self, loader: F)
    where
        F: FnOnce(&Device) -> Result<ModelHandle, ModelLoadError>,
    {
        let started = Instant::now();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| loader(&self.device)))
            .unwrap_or_else(|payload| Err(ModelLoadError::Panicked(panic_message(payload.as_ref()))));

        match result {
            Ok(handle) => {
                let elapsed = started.elapsed();
                let _ = self.handle.set(Arc::new(handle));
                let _ = self.load_time_ms.set(elapsed.as_millis() as u64);
                self.state.store(ReadinessState::Ready as u8, Ordering::Release);
                info!(
                    device = %self.device_label,
                    load_time_s = elapsed.as_secs_f64(),
                    "model ready"
                );
            }
            Err(e) => {
                let _ = self.error.set(e.to_string());
                self.state.store(ReadinessState::Failed as u8, Ordering::Release);
                error!(device = %self.device_label, error = %e, "model load failed");
            }
        }
    }

    pub fn status(&self) -> ModelStatus {
        let state = self.state();
        ModelStatus {
            state,
            device: self.device_label.clone(),
            error: match state {
                ReadinessState::Failed => self.error.get().cloned(),
                _ => None,
            },
            load_time_ms: self.load_time_ms.get().copied(),
        }
    }

    /// Shared handle to the loaded model, or the reason there is none yet.
    pub fn handle(&self) -> Result<Arc<ModelHandle>, AppError> {
        match self.state() {
            ReadinessState::Ready => self.handle.get().cloned().ok_or_else(|| {
                AppError::Internal("model marked ready without a handle".to_string())
            }),
            ReadinessState::Failed => Err(AppError::ModelLoadFailure(
                self.error
                    .get()
                    .cloned()
                    .unwrap_or_else(|| "unknown error".to_string()),
            )),
            ReadinessState::Unloaded | ReadinessState::Loading => Err(AppError::ModelNotReady(
                "the model is still loading, please try again shortly".to_string(),
            )),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
impl ModelManager {
    /// Wait until the background load has finished one way or the other.
    pub(crate) async fn settle(&self) -> ReadinessState {
        for _ in 0..1000 {
            match self.state() {
                ReadinessState::Loading => {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await
                }
                state => return state,
            }
        }
        self.state()
    }
}
