//! # Waveform Normalizer
//!
//! Converts an arbitrary input audio file into the canonical form required by the model.
//!
//! ## Pipeline:
//! 1. **Probe**: symphonia picks a container reader, using the file extension as a hint
//! 2. **Decode**: every packet of the first audio track is decoded to interleaved f32
//! 3. **Downmix**: channels are averaged sample-wise into one
//! 4. **Resample**: windowed-sinc (band-limited) conversion to 16kHz with rubato; the
//!    resampler's group delay is trimmed and the output is cut to the exact expected length
//!
//! ## Error Classification:
//! - `Unsupported` → no reader for the container or no decoder for the codec
//!   (e.g. WMA inside ASF)
//! - everything else (corrupt stream, zero samples, zero channels, resampler failure) is
//!   a conversion failure

use std::fs::File;
use std::path::Path;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::audio::waveform::{Waveform, CANONICAL_SAMPLE_RATE};

/// Container extensions symphonia has a reader for in this build. A file carrying one of
/// these extensions that still fails to probe is treated as corrupt, not unsupported.
const READABLE_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "m4a", "ogg"];

/// Input frames fed to the resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("cannot decode this audio format: {0}")]
    Unsupported(String),

    #[error("failed to read audio file: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt audio stream: {0}")]
    Corrupt(String),

    #[error("audio contains no samples")]
    Empty,

    #[error("unsupported channel layout: {0}")]
    ChannelLayout(String),

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Decode `input_path` and return a mono waveform at [`CANONICAL_SAMPLE_RATE`].
pub fn normalize(input_path: &Path) -> Result<Waveform, NormalizeError> {
    let extension = input_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let (samples, channels, source_rate) = decode(input_path, extension.as_deref())?;
    debug!(
        path = %input_path.display(),
        channels,
        source_rate,
        frames = samples.len() / channels.max(1),
        "decoded audio"
    );

    let mono = downmix(&samples, channels)?;
    if mono.is_empty() {
        return Err(NormalizeError::Empty);
    }

    let resampled = if source_rate == CANONICAL_SAMPLE_RATE {
        mono
    } else {
        resample(&mono, source_rate, CANONICAL_SAMPLE_RATE)?
    };

    if resampled.is_empty() {
        return Err(NormalizeError::Empty);
    }

    Ok(Waveform::new(resampled, CANONICAL_SAMPLE_RATE))
}

/// Decode the first audio track into interleaved samples.
///
/// Returns `(interleaved_samples, channel_count, sample_rate)`.
fn decode(path: &Path, extension: Option<&str>) -> Result<(Vec<f32>, usize, u32), NormalizeError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| classify_probe_error(e, extension))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| NormalizeError::Corrupt("no audio track found".into()))?;

    let codec_params = track.codec_params.clone();
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| match e {
            SymphoniaError::Unsupported(what) => NormalizeError::Unsupported(what.to_string()),
            other => NormalizeError::Corrupt(format!("codec init: {other}")),
        })?;

    let mut samples: Vec<f32> = Vec::new();
    let mut channels = codec_params.channels.map(|c| c.count());
    let mut sample_rate = codec_params.sample_rate;
    let mut skipped_packets = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(NormalizeError::Corrupt(format!("packet read: {e}"))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) if is_recoverable(&e) => {
                skipped_packets += 1;
                warn!(error = %e, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(NormalizeError::Corrupt(format!("decode: {e}"))),
        };

        let spec = *decoded.spec();
        let packet_channels = spec.channels.count();
        match channels {
            None => channels = Some(packet_channels),
            Some(expected) if expected != packet_channels => {
                return Err(NormalizeError::ChannelLayout(format!(
                    "channel count changed mid-stream from {expected} to {packet_channels}"
                )));
            }
            Some(_) => {}
        }
        sample_rate.get_or_insert(spec.rate);

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if skipped_packets > 0 {
        warn!(skipped_packets, decoded_samples = samples.len(), "stream had damaged packets");
    }

    let channels = channels.unwrap_or(0);
    let sample_rate = sample_rate
        .filter(|&rate| rate > 0)
        .ok_or_else(|| NormalizeError::Corrupt("stream has no sample rate".into()))?;

    Ok((samples, channels, sample_rate))
}

/// A damaged packet only loses its own samples; decoding continues with the next one.
fn is_recoverable(err: &SymphoniaError) -> bool {
    matches!(err, SymphoniaError::DecodeError(_))
}

fn classify_probe_error(err: SymphoniaError, extension: Option<&str>) -> NormalizeError {
    let readable = extension.is_some_and(|ext| READABLE_EXTENSIONS.contains(&ext));
    match err {
        other if !readable => NormalizeError::Unsupported(format!(
            "{} ({other})",
            extension.unwrap_or("no extension")
        )),
        SymphoniaError::IoError(e) => NormalizeError::Io(e),
        other => NormalizeError::Corrupt(format!("probe failed: {other}")),
    }
}

/// Average interleaved channels sample-wise into a single channel.
fn downmix(interleaved: &[f32], channels: usize) -> Result<Vec<f32>, NormalizeError> {
    match channels {
        0 => Err(NormalizeError::ChannelLayout("stream reports zero channels".into())),
        1 => Ok(interleaved.to_vec()),
        n => Ok(interleaved
            .chunks_exact(n)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect()),
    }
}

/// Band-limited resampling of mono audio from `from_rate` to `to_rate`.
///
/// The output holds exactly `floor(len * to_rate / from_rate)` samples, aligned with the
/// input (the sinc filter's delay is dropped from the front).
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, NormalizeError> {
    if from_rate == 0 || to_rate == 0 {
        return Err(NormalizeError::Resample(format!(
            "invalid sample rates {from_rate} -> {to_rate}"
        )));
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let expected_len = (samples.len() as u128 * u128::from(to_rate) / u128::from(from_rate)) as usize;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| NormalizeError::Resample(format!("init: {e}")))?;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected_len + delay + RESAMPLE_CHUNK);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let input = [chunk];
        let resampled = resampler
            .process(&input[..], None)
            .map_err(|e| NormalizeError::Resample(format!("process: {e}")))?;
        output.extend_from_slice(&resampled[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let input = [remainder];
        let resampled = resampler
            .process_partial(Some(&input[..]), None)
            .map_err(|e| NormalizeError::Resample(format!("process tail: {e}")))?;
        output.extend_from_slice(&resampled[0]);
    }

    // Flush the filter until the delayed tail has come out.
    while output.len() < expected_len + delay {
        let resampled = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| NormalizeError::Resample(format!("flush: {e}")))?;
        if resampled[0].is_empty() {
            warn!(
                produced = output.len(),
                wanted = expected_len + delay,
                "resampler stopped producing output before the tail was flushed"
            );
            break;
        }
        output.extend_from_slice(&resampled[0]);
    }

    let start = delay.min(output.len());
    let end = (start + expected_len).min(output.len());
    Ok(output[start..end].to_vec())
}
