//! # Chunked Inference Engine
//!
//! Runs the acoustic model over a canonical waveform in fixed-duration windows so that
//! arbitrarily long recordings fit in bounded accelerator memory.
//!
//! ## Per-window processing:
//! 1. **Featurize**: normalize the window and pad it to the model's receptive field
//! 2. **Forward**: one pass through the acoustic model, producing per-frame logits
//! 3. **Greedy decode**: arg-max over the class axis, then CTC collapse
//! 4. **Release**: every tensor of the window goes out of scope and the device is
//!    synchronized so the freed memory is reusable before the next window
//!
//! Windows are processed strictly in order on the calling thread. Fragments that decode
//! to nothing are skipped; the rest are joined with single spaces.

use std::ops::Range;
use std::time::Instant;

use candle_core::D;
use serde::Serialize;
use tracing::{debug, info};

use crate::audio::Waveform;
use crate::device::release_scratch;
use crate::transcription::readiness::ModelHandle;

/// Result of transcribing one waveform.
#[derive(Debug, Clone, Serialize)]
pub struct Transcript {
    /// Non-empty window fragments joined by single spaces, in window order; windows
    /// that decode to nothing are omitted
    pub text: String,

    /// Number of inference windows
    pub chunks: usize,

    /// Length of the canonical waveform (seconds)
    pub audio_duration_seconds: f64,

    /// Wall-clock time spent in inference (milliseconds)
    pub processing_time_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("window {chunk} of {total} failed: {source}")]
    Chunk {
        chunk: usize,
        total: usize,
        #[source]
        source: candle_core::Error,
    },

    #[error("waveform is empty")]
    EmptyWaveform,

    #[error("expected {expected} Hz audio, got {actual} Hz")]
    SampleRate { expected: u32, actual: u32 },

    #[error("window duration must be at least one second")]
    ZeroWindow,
}

/// Split `[0, len)` into consecutive ranges of at most `chunk_len` samples.
///
/// The ranges are non-overlapping, gap-free and cover the whole input; only the last
/// one may be shorter. `chunk_len` of zero is treated as one.
pub fn chunk_bounds(len: usize, chunk_len: usize) -> impl Iterator<Item = Range<usize>> {
    let chunk_len = chunk_len.max(1);
    (0..len)
        .step_by(chunk_len)
        .map(move |start| start..(start + chunk_len).min(len))
}

/// Transcribe `waveform` in windows of `chunk_duration_seconds`.
///
/// Deterministic for a given waveform and handle. Any window failure aborts the whole
/// call; partial transcripts are never returned.
pub fn transcribe(
    waveform: &Waveform,
    handle: &ModelHandle,
    chunk_duration_seconds: u32,
) -> Result<Transcript, InferenceError> {
    if chunk_duration_seconds == 0 {
        return Err(InferenceError::ZeroWindow);
    }
    if waveform.is_empty() {
        return Err(InferenceError::EmptyWaveform);
    }
    let expected = handle.processor().sampling_rate();
    if waveform.sample_rate() != expected {
        return Err(InferenceError::SampleRate {
            expected,
            actual: waveform.sample_rate(),
        });
    }

    let started = Instant::now();
    let chunk_len = chunk_duration_seconds as usize * waveform.sample_rate() as usize;
    let total = waveform.len().div_ceil(chunk_len);
    let samples = waveform.samples();

    let mut fragments: Vec<String> = Vec::with_capacity(total);
    for (index, bounds) in chunk_bounds(samples.len(), chunk_len).enumerate() {
        let fragment = transcribe_window(&samples[bounds.clone()], handle).map_err(|source| {
            InferenceError::Chunk {
                chunk: index + 1,
                total,
                source,
            }
        })?;

        debug!(
            window = index + 1,
            total,
            start = bounds.start,
            end = bounds.end,
            chars = fragment.len(),
            "window decoded"
        );

        if !fragment.is_empty() {
            fragments.push(fragment);
        }
    }

    let transcript = Transcript {
        text: fragments.join(" "),
        chunks: total,
        audio_duration_seconds: waveform.duration_seconds(),
        processing_time_ms: started.elapsed().as_millis() as u64,
    };

    info!(
        chunks = transcript.chunks,
        audio_s = transcript.audio_duration_seconds,
        elapsed_ms = transcript.processing_time_ms,
        chars = transcript.text.len(),
        "transcription finished"
    );
    Ok(transcript)
}

fn transcribe_window(window: &[f32], handle: &ModelHandle) -> candle_core::Result<String> {
    let device = handle.device();
    let fragment = {
        let model = handle.model();
        let input = handle
            .processor()
            .featurize(window, model.receptive_field(), device)?;
        let logits = model.forward(&input)?;
        let ids = logits.argmax(D::Minus1)?.squeeze(0)?.to_vec1::<u32>()?;
        handle.processor().decode(&ids)
    };
    release_scratch(device)?;
    Ok(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CANONICAL_SAMPLE_RATE;
    use crate::transcription::testing::{fake_handle, VALUE_A, VALUE_B};
    use candle_core::Device;

    fn constant(value: f32, seconds: usize) -> Vec<f32> {
        vec![value; seconds * CANONICAL_SAMPLE_RATE as usize]
    }

    #[test]
    fn test_chunk_bounds_cover_input() {
        let len = 480_000 + 1234;
        let bounds: Vec<_> = chunk_bounds(len, 240_000).collect();

        assert_eq!(bounds.len(), len.div_ceil(240_000));
        assert_eq!(bounds[0].start, 0);
        assert_eq!(bounds.last().unwrap().end, len);
        assert!(bounds.windows(2).all(|w| w[0].end == w[1].start));
        assert!(bounds.iter().all(|b| b.len() <= 240_000 && !b.is_empty()));
    }

    #[test]
    fn test_chunk_bounds_edge_cases() {
        assert_eq!(chunk_bounds(0, 10).count(), 0);
        assert_eq!(chunk_bounds(10, 10).collect::<Vec<_>>(), vec![0..10]);
        assert_eq!(chunk_bounds(3, 0).count(), 3);
    }

    #[test]
    fn test_thirty_seconds_yields_two_windows() {
        let handle = fake_handle(&Device::Cpu);
        let mut samples = constant(VALUE_A, 15);
        samples.extend(constant(VALUE_B, 15));
        let waveform = Waveform::new(samples, CANONICAL_SAMPLE_RATE);

        let transcript = transcribe(&waveform, &handle, 15).unwrap();
        assert_eq!(transcript.chunks, 2);
        assert_eq!(transcript.text, "a b");
        assert_eq!(transcript.audio_duration_seconds, 30.0);
    }

    #[test]
    fn test_short_audio_single_window_no_trailing_space() {
        let handle = fake_handle(&Device::Cpu);
        let waveform = Waveform::new(constant(VALUE_A, 5), CANONICAL_SAMPLE_RATE);

        let transcript = transcribe(&waveform, &handle, 15).unwrap();
        assert_eq!(transcript.chunks, 1);
        assert_eq!(transcript.text, "a");
    }

    #[test]
    fn test_silent_windows_are_skipped_in_join() {
        let handle = fake_handle(&Device::Cpu);
        let mut samples = constant(VALUE_A, 2);
        samples.extend(constant(0.0, 2));
        samples.extend(constant(VALUE_B, 1));
        let waveform = Waveform::new(samples, CANONICAL_SAMPLE_RATE);

        let transcript = transcribe(&waveform, &handle, 2).unwrap();
        assert_eq!(transcript.chunks, 3);
        assert_eq!(transcript.text, "a b");
    }

    #[test]
    fn test_window_shorter_than_receptive_field_is_padded() {
        let handle = fake_handle(&Device::Cpu);
        let mut samples = constant(VALUE_A, 1);
        samples.extend(vec![VALUE_B; 100]);
        let waveform = Waveform::new(samples, CANONICAL_SAMPLE_RATE);

        let transcript = transcribe(&waveform, &handle, 1).unwrap();
        assert_eq!(transcript.chunks, 2);
        assert_eq!(transcript.text, "a b");
    }

    #[test]
    fn test_transcription_is_deterministic() {
        let handle = fake_handle(&Device::Cpu);
        let samples: Vec<f32> = (0..16_000 * 7).map(|i| ((i / 4000) % 4) as f32).collect();
        let waveform = Waveform::new(samples, CANONICAL_SAMPLE_RATE);

        let first = transcribe(&waveform, &handle, 3).unwrap();
        let second = transcribe(&waveform, &handle, 3).unwrap();
        assert_eq!(first.text, second.text);
        assert_eq!(first.chunks, second.chunks);
    }

    #[test]
    fn test_failing_window_aborts_without_partial_result() {
        let handle = fake_handle(&Device::Cpu);
        let mut samples = constant(VALUE_A, 2);
        samples.extend(constant(f32::NAN, 2));
        let waveform = Waveform::new(samples, CANONICAL_SAMPLE_RATE);

        match transcribe(&waveform, &handle, 2) {
            Err(InferenceError::Chunk { chunk, total, .. }) => {
                assert_eq!(chunk, 2);
                assert_eq!(total, 2);
            }
            other => panic!("expected window failure, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_non_canonical_rate() {
        let handle = fake_handle(&Device::Cpu);
        let waveform = Waveform::new(vec![VALUE_A; 44_100], 44_100);
        assert!(matches!(
            transcribe(&waveform, &handle, 15),
            Err(InferenceError::SampleRate { .. })
        ));
    }
}
