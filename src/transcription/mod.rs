//! # Transcription Module
//!
//! Speech-to-text with a CTC acoustic model (wav2vec2 family) running on candle.
//!
//! ## Key Components:
//! - **Readiness**: one-time background model load and the Unloaded → Loading →
//!   Ready/Failed state the HTTP layer consults
//! - **Processor**: feature normalization and CTC decoding paired with the model
//! - **wav2vec2**: the compiled-in acoustic model definition
//! - **Engine**: fixed-window inference over long recordings with per-window memory
//!   release
//! - **Orchestrator**: validates and stages an upload, then runs normalize → engine
//!
//! ## Model Directory Layout:
//! - `config.json`: architecture hyper-parameters
//! - `preprocessor_config.json`: feature extractor settings
//! - `vocab.json` (+ optional `tokenizer_config.json`, `special_tokens_map.json`)
//! - `model.safetensors` or `pytorch_model.bin`

pub mod engine; // Chunked inference and transcript assembly
pub mod orchestrator; // Per-upload pipeline
pub mod processor; // Feature extractor + CTC tokenizer
pub mod readiness; // Model lifecycle and readiness state
pub mod wav2vec2; // Acoustic model definition

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{InferenceError, Transcript};
pub use orchestrator::Transcriber;
pub use readiness::{ModelArchitecture, ModelHandle, ModelManager, ReadinessState};
