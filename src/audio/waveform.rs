//! # Canonical Waveform
//!
//! The only audio representation the inference engine accepts: a single channel of
//! f32 samples at [`CANONICAL_SAMPLE_RATE`]. When persisted to disk it is written as an
//! uncompressed 32-bit float WAV file.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Sample rate every waveform has after normalization.
pub const CANONICAL_SAMPLE_RATE: u32 = 16_000;

/// WAV `fmt ` audio format tag for IEEE float samples.
const WAV_FORMAT_IEEE_FLOAT: u16 = 3;

/// Single-channel audio buffer tagged with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Always 1; multi-channel audio never becomes a `Waveform`.
    #[cfg(test)]
    pub fn channels(&self) -> u16 {
        1
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    /// Write the waveform as a mono 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> std::io::Result<()> {
        let header = wav::Header::new(WAV_FORMAT_IEEE_FLOAT, 1, self.sample_rate, 32);
        let track = wav::BitDepth::ThirtyTwoFloat(self.samples.clone());
        let mut writer = BufWriter::new(File::create(path)?);
        wav::write(header, &track, &mut writer)?;
        Ok(())
    }

    /// Read a mono WAV file written by [`Waveform::write_wav`] (or any mono 8/16/24-bit
    /// PCM WAV).
    pub fn read_wav(path: &Path) -> std::io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let (header, data) = wav::read(&mut reader)?;

        if header.channel_count != 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected mono WAV, found {} channels", header.channel_count),
            ));
        }

        let samples = match data {
            wav::BitDepth::ThirtyTwoFloat(samples) => samples,
            wav::BitDepth::Sixteen(samples) => {
                samples.into_iter().map(|s| s as f32 / 32768.0).collect()
            }
            wav::BitDepth::TwentyFour(samples) => {
                samples.into_iter().map(|s| s as f32 / 8_388_608.0).collect()
            }
            wav::BitDepth::Eight(samples) => samples
                .into_iter()
                .map(|s| (s as f32 - 128.0) / 128.0)
                .collect(),
            wav::BitDepth::Empty => Vec::new(),
        };

        Ok(Self::new(samples, header.sampling_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration() {
        let waveform = Waveform::new(vec![0.0; 24_000], CANONICAL_SAMPLE_RATE);
        assert_eq!(waveform.duration_seconds(), 1.5);
        assert_eq!(waveform.channels(), 1);
        assert!(!waveform.is_empty());
    }

    #[test]
    fn test_canonical_wav_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converted.wav");
        let samples: Vec<f32> = (0..1600).map(|i| (i as f32 * 0.01).sin() * 0.5).collect();
        let waveform = Waveform::new(samples, CANONICAL_SAMPLE_RATE);

        waveform.write_wav(&path).unwrap();
        let read_back = Waveform::read_wav(&path).unwrap();

        assert_eq!(read_back.sample_rate(), CANONICAL_SAMPLE_RATE);
        assert_eq!(read_back.len(), 1600);
        assert!((read_back.samples()[100] - waveform.samples()[100]).abs() < 1e-6);
    }

    #[test]
    fn test_read_rejects_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let header = wav::Header::new(1, 2, 16_000, 16);
        let mut file = File::create(&path).unwrap();
        wav::write(header, &wav::BitDepth::Sixteen(vec![0; 64]), &mut file).unwrap();

        assert!(Waveform::read_wav(&path).is_err());
    }
}
