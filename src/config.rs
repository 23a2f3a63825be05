//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_PORT, APP_MODEL_DIR, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: bind address and worker pool size
//! - **model**: where the acoustic model lives, which architecture and device to use,
//!   and how long each inference window is
//! - **upload**: staging directory and upload limits
//! - **performance**: how many transcriptions may touch the compute device at once

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub upload: UploadConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to
/// - `port`: TCP port number to listen on
/// - `workers`: number of HTTP worker threads serving requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// Acoustic model configuration.
///
/// ## Fields:
/// - `dir`: local directory holding `config.json`, `preprocessor_config.json`,
///   `vocab.json` and the weights (`model.safetensors` or `pytorch_model.bin`)
/// - `architecture`: compiled-in model definition to build from those artifacts
/// - `device`: device preference (`auto`, `cpu`, `cuda`, `metal`)
/// - `chunk_duration_seconds`: length of each inference window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub dir: PathBuf,
    pub architecture: String,
    pub device: String,
    pub chunk_duration_seconds: u32,
}

/// Upload staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Directory where request-scoped temp files are created.
    pub dir: PathBuf,
    /// Uploads larger than this are rejected with 413.
    pub max_file_size_bytes: usize,
    /// Write the canonical 16 kHz mono WAV next to the staged upload while the
    /// request is in flight.
    pub persist_canonical_wav: bool,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_transcriptions`: transcriptions allowed to run inference at the
///   same time. Accelerator memory is shared by all of them, so the default is 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_transcriptions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
                workers: 4,
            },
            model: ModelConfig {
                dir: PathBuf::from("./wav2vec2-vi"),
                architecture: "wav2vec2".to_string(),
                device: "auto".to_string(),
                chunk_duration_seconds: 15,
            },
            upload: UploadConfig {
                dir: PathBuf::from("uploads"),
                max_file_size_bytes: 100 * 1024 * 1024, // 100MB
                persist_canonical_wav: true,
            },
            performance: PerformanceConfig {
                max_concurrent_transcriptions: 1,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `APP_MODEL_DEVICE=cpu`: Force CPU inference
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore keeps field names such as `chunk_duration_seconds` intact:
            // APP_MODEL__CHUNK_DURATION_SECONDS=10
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
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
    ///
    /// ## What this checks:
    /// - Server port is not 0 and there is at least one worker
    /// - The model architecture is one this binary knows how to build
    /// - Inference windows are at least one second long
    /// - Upload limit and transcription concurrency are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.workers == 0 {
            return Err(anyhow::anyhow!("Server workers must be greater than 0"));
        }

        if self.model.architecture.parse::<crate::transcription::ModelArchitecture>().is_err() {
            return Err(anyhow::anyhow!(
                "Unknown model architecture: {}",
                self.model.architecture
            ));
        }

        if self.model.chunk_duration_seconds == 0 {
            return Err(anyhow::anyhow!("Chunk duration must be greater than 0 seconds"));
        }

        if self.upload.max_file_size_bytes == 0 {
            return Err(anyhow::anyhow!("Max upload size must be greater than 0"));
        }

        if self.performance.max_concurrent_transcriptions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent transcriptions must be greater than 0"
            ));
        }

        Ok(())
    }

    /// Flatten the configuration into `section.key -> value` pairs for the
    /// `/metrics` endpoint. Paths are rendered lossily.
    pub fn summary(&self) -> HashMap<&'static str, String> {
        let mut out = HashMap::new();
        out.insert("server.workers", self.server.workers.to_string());
        out.insert("model.dir", self.model.dir.display().to_string());
        out.insert("model.architecture", self.model.architecture.clone());
        out.insert("model.device", self.model.device.clone());
        out.insert(
            "model.chunk_duration_seconds",
            self.model.chunk_duration_seconds.to_string(),
        );
        out.insert("upload.dir", self.upload.dir.display().to_string());
        out.insert(
            "upload.max_file_size_bytes",
            self.upload.max_file_size_bytes.to_string(),
        );
        out.insert(
            "performance.max_concurrent_transcriptions",
            self.performance.max_concurrent_transcriptions.to_string(),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.model.chunk_duration_seconds, 15);
        assert_eq!(config.model.architecture, "wav2vec2");
        assert_eq!(config.upload.max_file_size_bytes, 100 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.chunk_duration_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_concurrent_transcriptions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_architecture_rejected() {
        let mut config = AppConfig::default();
        config.model.architecture = "whisper".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_lists_model_settings() {
        let summary = AppConfig::default().summary();
        assert_eq!(summary["model.chunk_duration_seconds"], "15");
        assert_eq!(summary["performance.max_concurrent_transcriptions"], "1");
    }
}
