//! # Feature Processor
//!
//! The model's paired pre/post-processing, loaded from the same directory as the weights:
//!
//! - **Feature extractor** (`preprocessor_config.json`): zero-mean/unit-variance
//!   normalization of raw samples and minimum-length padding
//! - **CTC tokenizer** (`vocab.json`, optional `tokenizer_config.json` and
//!   `special_tokens_map.json`): turns per-frame class ids into text
//!
//! ## CTC Decoding:
//! 1. Collapse runs of identical ids
//! 2. Drop the blank (pad) token and sequence markers
//! 3. Map the word delimiter to a space
//! 4. Collapse whitespace and trim

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::transcription::wav2vec2::ModelLoadError;

const DEFAULT_PAD_TOKEN: &str = "<pad>";
const DEFAULT_WORD_DELIMITER: &str = "|";
const SEQUENCE_MARKERS: &[&str] = &["<s>", "</s>"];

#[derive(Debug, Clone, Deserialize)]
struct FeatureExtractorConfig {
    #[serde(default = "default_true")]
    do_normalize: bool,
    #[serde(default = "default_sampling_rate")]
    sampling_rate: u32,
    #[serde(default)]
    padding_value: f32,
}

fn default_true() -> bool {
    true
}

fn default_sampling_rate() -> u32 {
    16_000
}

/// Feature extractor plus CTC tokenizer for one model.
#[derive(Debug, Clone)]
pub struct Wav2Vec2Processor {
    do_normalize: bool,
    sampling_rate: u32,
    padding_value: f32,
    id_to_token: HashMap<u32, String>,
    pad_token_id: Option<u32>,
    word_delimiter: String,
    vocab_size: usize,
}

impl Wav2Vec2Processor {
    /// Build a processor from an in-memory vocabulary.
    #[cfg(test)]
    pub fn new(vocab: HashMap<String, u32>, do_normalize: bool) -> Self {
        Self::with_tokens(
            vocab,
            do_normalize,
            DEFAULT_PAD_TOKEN.to_string(),
            DEFAULT_WORD_DELIMITER.to_string(),
        )
    }

    fn with_tokens(
        vocab: HashMap<String, u32>,
        do_normalize: bool,
        pad_token: String,
        word_delimiter: String,
    ) -> Self {
        let pad_token_id = vocab.get(&pad_token).copied();
        let vocab_size = vocab.values().max().map_or(0, |&max| max as usize + 1);
        let id_to_token = vocab.into_iter().map(|(token, id)| (id, token)).collect();

        Self {
            do_normalize,
            sampling_rate: crate::audio::CANONICAL_SAMPLE_RATE,
            padding_value: 0.0,
            id_to_token,
            pad_token_id,
            word_delimiter,
            vocab_size,
        }
    }

    /// Load the processor artifacts from a model directory.
    pub fn from_dir(dir: &Path) -> Result<Self, ModelLoadError> {
        let extractor: FeatureExtractorConfig =
            read_json(&dir.join("preprocessor_config.json"), "preprocessor_config.json")?;

        let vocab_value: Value = read_json(&dir.join("vocab.json"), "vocab.json")?;
        let vocab = parse_vocab(vocab_value)?;

        let mut pad_token = DEFAULT_PAD_TOKEN.to_string();
        let mut word_delimiter = DEFAULT_WORD_DELIMITER.to_string();
        for file in ["special_tokens_map.json", "tokenizer_config.json"] {
            let path = dir.join(file);
            if !path.exists() {
                continue;
            }
            let value: Value = read_json(&path, file)?;
            if let Some(token) = token_field(&value, "pad_token") {
                pad_token = token;
            }
            if let Some(token) = token_field(&value, "word_delimiter_token") {
                word_delimiter = token;
            }
        }

        let mut processor = Self::with_tokens(vocab, extractor.do_normalize, pad_token, word_delimiter);
        processor.sampling_rate = extractor.sampling_rate;
        processor.padding_value = extractor.padding_value;

        debug!(
            vocab_size = processor.vocab_size,
            do_normalize = processor.do_normalize,
            sampling_rate = processor.sampling_rate,
            "loaded feature processor"
        );
        Ok(processor)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    /// Turn one window of raw samples into the model input tensor of shape `(1, n)`.
    ///
    /// Windows shorter than `min_len` are padded with the configured padding value after
    /// normalization, so the statistics only see real audio.
    pub fn featurize(
        &self,
        samples: &[f32],
        min_len: usize,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let mut values = if self.do_normalize {
            zero_mean_unit_var(samples)
        } else {
            samples.to_vec()
        };
        if values.len() < min_len {
            values.resize(min_len, self.padding_value);
        }
        let len = values.len();
        Tensor::from_vec(values, (1, len), device)
    }

    /// Greedy CTC decode of per-frame class ids.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut text = String::new();
        let mut previous: Option<u32> = None;

        for &id in ids {
            if previous == Some(id) {
                continue;
            }
            previous = Some(id);

            if Some(id) == self.pad_token_id {
                continue;
            }
            let Some(token) = self.id_to_token.get(&id) else {
                continue;
            };
            if SEQUENCE_MARKERS.contains(&token.as_str()) {
                continue;
            }
            if *token == self.word_delimiter {
                text.push(' ');
            } else {
                text.push_str(token);
            }
        }

        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

fn zero_mean_unit_var(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&x| x as f64).sum::<f64>() / n;
    let var = samples
        .iter()
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    let std = (var + 1e-7).sqrt();
    samples
        .iter()
        .map(|&x| ((x as f64 - mean) / std) as f32)
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    file: &'static str,
) -> Result<T, ModelLoadError> {
    if !path.exists() {
        return Err(ModelLoadError::MissingArtifact(path.display().to_string()));
    }
    let data = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| ModelLoadError::Json { file, source })
}

/// `vocab.json` is either a flat `token -> id` map or, for multilingual checkpoints,
/// a map of language code to such a map. The first language is used in that case.
fn parse_vocab(value: Value) -> Result<HashMap<String, u32>, ModelLoadError> {
    let Value::Object(map) = value else {
        return Err(ModelLoadError::InvalidConfig(
            "vocab.json must be a JSON object".to_string(),
        ));
    };

    let flat = match map.values().next() {
        Some(Value::Object(inner)) => inner.clone(),
        _ => map,
    };

    flat.into_iter()
        .map(|(token, id)| {
            id.as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .map(|id| (token.clone(), id))
                .ok_or_else(|| {
                    ModelLoadError::InvalidConfig(format!("vocab entry '{token}' has no integer id"))
                })
        })
        .collect()
}

/// Special tokens appear either as plain strings or as `{"content": "..."}` objects.
fn token_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vocab() -> HashMap<String, u32> {
        [("<pad>", 0), ("<s>", 1), ("</s>", 2), ("|", 3), ("a", 4), ("b", 5), ("ươ", 6)]
            .into_iter()
            .map(|(t, id)| (t.to_string(), id))
            .collect()
    }

    #[test]
    fn test_decode_collapses_repeats_and_blanks() {
        let processor = Wav2Vec2Processor::new(test_vocab(), true);
        // a a <pad> a | | b b <pad>
        assert_eq!(processor.decode(&[4, 4, 0, 4, 3, 3, 5, 5, 0]), "aa b");
    }

    #[test]
    fn test_decode_trims_delimiters_and_markers() {
        let processor = Wav2Vec2Processor::new(test_vocab(), true);
        assert_eq!(processor.decode(&[3, 1, 4, 3, 0, 3, 6, 2, 3]), "a ươ");
        assert_eq!(processor.decode(&[0, 0, 3, 0]), "");
        assert_eq!(processor.decode(&[]), "");
    }

    #[test]
    fn test_vocab_size_is_max_id_plus_one() {
        let processor = Wav2Vec2Processor::new(test_vocab(), true);
        assert_eq!(processor.vocab_size(), 7);
    }

    #[test]
    fn test_featurize_normalizes_and_pads() {
        let processor = Wav2Vec2Processor::new(test_vocab(), true);
        let samples: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let tensor = processor.featurize(&samples, 400, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 400]);

        let values: Vec<f32> = tensor.squeeze(0).unwrap().to_vec1().unwrap();
        let real = &values[..100];
        let mean: f32 = real.iter().sum::<f32>() / 100.0;
        let var: f32 = real.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 100.0;
        assert!(mean.abs() < 1e-4);
        assert!((var - 1.0).abs() < 1e-3);
        assert!(values[100..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_featurize_without_normalization_keeps_samples() {
        let processor = Wav2Vec2Processor::new(test_vocab(), false);
        let tensor = processor.featurize(&[0.25; 800], 400, &Device::Cpu).unwrap();
        let values: Vec<f32> = tensor.squeeze(0).unwrap().to_vec1().unwrap();
        assert_eq!(values.len(), 800);
        assert!(values.iter().all(|&v| v == 0.25));
    }

    #[test]
    fn test_from_dir_reads_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("preprocessor_config.json"),
            r#"{"do_normalize": true, "sampling_rate": 16000, "padding_value": 0.0,
                "feature_size": 1, "return_attention_mask": false}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("vocab.json"),
            r#"{"[PAD]": 0, "<s>": 1, "</s>": 2, "[UNK]": 3, "|": 4, "x": 5}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("tokenizer_config.json"),
            r#"{"pad_token": {"content": "[PAD]"}, "word_delimiter_token": "|"}"#,
        )
        .unwrap();

        let processor = Wav2Vec2Processor::from_dir(dir.path()).unwrap();
        assert_eq!(processor.vocab_size(), 6);
        assert_eq!(processor.decode(&[0, 5, 5, 0, 5, 4, 5]), "xx x");
    }

    #[test]
    fn test_from_dir_reports_missing_vocab() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("preprocessor_config.json"), "{}").unwrap();

        let err = Wav2Vec2Processor::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ModelLoadError::MissingArtifact(_)));
    }

    #[test]
    fn test_nested_multilingual_vocab() {
        let value: Value = serde_json::from_str(r#"{"vie": {"<pad>": 0, "a": 1}}"#).unwrap();
        let vocab = parse_vocab(value).unwrap();
        assert_eq!(vocab["a"], 1);
    }
}
