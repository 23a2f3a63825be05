//! # Audio Processing Module
//!
//! Turns an uploaded audio file of any supported container/codec into the canonical
//! waveform the acoustic model accepts.
//!
//! ## Key Components:
//! - **Waveform**: mono f32 samples tagged with their sample rate, plus WAV I/O for the
//!   canonical intermediate file
//! - **Normalizer**: decode (symphonia) → mix to mono → band-limited resample (rubato)
//!
//! ## Canonical Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Channels**: Mono (1 channel)
//! - **Samples**: 32-bit float, nominally in [-1.0, 1.0]

pub mod normalizer; // Decode, downmix and resample arbitrary input audio
pub mod waveform; // Canonical waveform type and WAV persistence

pub use normalizer::{normalize, NormalizeError};
pub use waveform::{Waveform, CANONICAL_SAMPLE_RATE};
