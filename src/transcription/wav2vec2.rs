//! # wav2vec2 for CTC
//!
//! Statically compiled wav2vec2 acoustic model built on candle. The same definition
//! covers both encoder variants published on the HuggingFace hub:
//!
//! - **post-norm** (`do_stable_layer_norm = false`, e.g. wav2vec2-base): group norm on
//!   the first conv layer only, layer norm before the encoder stack, residual-then-norm
//!   in every layer
//! - **stable pre-norm** (`do_stable_layer_norm = true`, e.g. wav2vec2-large-xlsr):
//!   layer norm on every conv layer, norm-then-residual in every layer, layer norm after
//!   the encoder stack
//!
//! ## Weights:
//! `model.safetensors` is memory-mapped; `pytorch_model.bin` is the fallback. Both
//! weight-norm encodings of the positional convolution are accepted
//! (`weight_g`/`weight_v` and `parametrizations.weight.original0/1`).

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, GroupNorm, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;
use tracing::info;

/// Failure while building a [`crate::transcription::ModelHandle`] from disk.
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("model artifact not found: {0}")]
    MissingArtifact(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {file}: {source}")]
    Json {
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    #[error("incompatible weights: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("processor vocabulary has {processor} entries but the model predicts {model} classes")]
    VocabMismatch { processor: usize, model: usize },

    #[error("model loader panicked: {0}")]
    Panicked(String),
}

/// What the inference engine needs from an acoustic model.
pub trait AcousticModel: Send + Sync {
    /// `(1, samples)` input values to `(1, frames, vocab)` logits.
    fn forward(&self, input_values: &Tensor) -> candle_core::Result<Tensor>;

    fn vocab_size(&self) -> usize;

    /// Shortest input that still yields one output frame.
    fn receptive_field(&self) -> usize;
}

/// Subset of the HuggingFace `config.json` this model reads.
#[derive(Debug, Clone, Deserialize)]
pub struct Wav2Vec2Config {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub conv_dim: Vec<usize>,
    pub conv_kernel: Vec<usize>,
    pub conv_stride: Vec<usize>,
    pub num_conv_pos_embeddings: usize,
    pub num_conv_pos_embedding_groups: usize,
    pub vocab_size: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_feat_extract_norm")]
    pub feat_extract_norm: String,
    #[serde(default)]
    pub conv_bias: bool,
    #[serde(default)]
    pub do_stable_layer_norm: bool,
}

fn default_eps() -> f64 {
    1e-5
}

fn default_feat_extract_norm() -> String {
    "group".to_string()
}

impl Wav2Vec2Config {
    pub fn from_file(path: &Path) -> Result<Self, ModelLoadError> {
        if !path.exists() {
            return Err(ModelLoadError::MissingArtifact(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ModelLoadError::Json {
            file: "config.json",
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ModelLoadError> {
        let layers = self.conv_dim.len();
        if layers == 0 || self.conv_kernel.len() != layers || self.conv_stride.len() != layers {
            return Err(ModelLoadError::InvalidConfig(
                "conv_dim, conv_kernel and conv_stride must be non-empty and equally long".into(),
            ));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ModelLoadError::InvalidConfig(format!(
                "hidden_size {} is not divisible by {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if !matches!(self.feat_extract_norm.as_str(), "group" | "layer") {
            return Err(ModelLoadError::InvalidConfig(format!(
                "unknown feat_extract_norm '{}'",
                self.feat_extract_norm
            )));
        }
        Ok(())
    }

    /// Samples covered by one output frame of the conv feature encoder.
    pub fn receptive_field(&self) -> usize {
        self.conv_kernel
            .iter()
            .zip(&self.conv_stride)
            .rev()
            .fold(1, |field, (&kernel, &stride)| (field - 1) * stride + kernel)
    }
}

enum ConvNorm {
    None,
    Layer(LayerNorm),
    Group(GroupNorm),
}

struct FeatureConvLayer {
    conv: Conv1d,
    norm: ConvNorm,
}

impl FeatureConvLayer {
    fn load(cfg: &Wav2Vec2Config, index: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let in_channels = if index == 0 { 1 } else { cfg.conv_dim[index - 1] };
        let out_channels = cfg.conv_dim[index];
        let conv_cfg = Conv1dConfig {
            stride: cfg.conv_stride[index],
            ..Default::default()
        };
        let conv = if cfg.conv_bias {
            candle_nn::conv1d(in_channels, out_channels, cfg.conv_kernel[index], conv_cfg, vb.pp("conv"))?
        } else {
            candle_nn::conv1d_no_bias(
                in_channels,
                out_channels,
                cfg.conv_kernel[index],
                conv_cfg,
                vb.pp("conv"),
            )?
        };

        let norm = match cfg.feat_extract_norm.as_str() {
            "layer" => ConvNorm::Layer(candle_nn::layer_norm(
                out_channels,
                cfg.layer_norm_eps,
                vb.pp("layer_norm"),
            )?),
            _ if index == 0 => ConvNorm::Group(candle_nn::group_norm(
                out_channels,
                out_channels,
                cfg.layer_norm_eps,
                vb.pp("layer_norm"),
            )?),
            _ => ConvNorm::None,
        };

        Ok(Self { conv, norm })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = match &self.norm {
            ConvNorm::None => xs,
            ConvNorm::Group(norm) => norm.forward(&xs)?,
            ConvNorm::Layer(norm) => norm
                .forward(&xs.transpose(1, 2)?.contiguous()?)?
                .transpose(1, 2)?
                .contiguous()?,
        };
        xs.gelu_erf()
    }
}

struct FeatureProjection {
    layer_norm: LayerNorm,
    projection: Linear,
}

impl FeatureProjection {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let dim = cfg.conv_dim[cfg.conv_dim.len() - 1];
        Ok(Self {
            layer_norm: candle_nn::layer_norm(dim, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            projection: candle_nn::linear(dim, cfg.hidden_size, vb.pp("projection"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.projection.forward(&self.layer_norm.forward(xs)?)
    }
}

/// Rebuild a weight-normalised conv kernel from its magnitude `g` and direction `v`.
fn weight_norm_conv(
    channels: usize,
    kernel: usize,
    cfg: Conv1dConfig,
    vb: VarBuilder,
) -> candle_core::Result<Conv1d> {
    let v_shape = (channels, channels / cfg.groups, kernel);
    let (g, v) = match (vb.get((1, 1, kernel), "weight_g"), vb.get(v_shape, "weight_v")) {
        (Ok(g), Ok(v)) => (g, v),
        _ => {
            let param = vb.pp("parametrizations").pp("weight");
            (param.get((1, 1, kernel), "original0")?, param.get(v_shape, "original1")?)
        }
    };

    // Norm over every axis except the kernel axis (PyTorch `weight_norm(dim=2)`).
    let norm = v.sqr()?.sum_keepdim(0)?.sum_keepdim(1)?.sqrt()?;
    let weight = v.broadcast_div(&norm)?.broadcast_mul(&g)?;
    let bias = vb.get(channels, "bias")?;
    Ok(Conv1d::new(weight, Some(bias), cfg))
}

struct PositionalConvEmbedding {
    conv: Conv1d,
}

impl PositionalConvEmbedding {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let conv_cfg = Conv1dConfig {
            padding: cfg.num_conv_pos_embeddings / 2,
            groups: cfg.num_conv_pos_embedding_groups,
            ..Default::default()
        };
        Ok(Self {
            conv: weight_norm_conv(
                cfg.hidden_size,
                cfg.num_conv_pos_embeddings,
                conv_cfg,
                vb.pp("conv"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let seq_len = xs.dim(1)?;
        let h = self.conv.forward(&xs.transpose(1, 2)?.contiguous()?)?;
        // An even kernel yields one extra frame; drop it.
        h.narrow(2, 0, seq_len)?.gelu_erf()?.transpose(1, 2)?.contiguous()
    }
}

struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = hidden / cfg.num_attention_heads;
        Ok(Self {
            q_proj: candle_nn::linear(hidden, hidden, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(hidden, hidden, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(hidden, hidden, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(hidden, hidden, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, frames, _) = xs.dims3()?;
        let split_heads = |t: Tensor| {
            t.reshape((batch, frames, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let q = split_heads((self.q_proj.forward(xs)? * self.scale)?)?;
        let k = split_heads(self.k_proj.forward(xs)?)?;
        let v = split_heads(self.v_proj.forward(xs)?)?;

        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, frames, self.num_heads * self.head_dim))?;
        self.out_proj.forward(&out)
    }
}

struct FeedForward {
    intermediate_dense: Linear,
    output_dense: Linear,
}

impl FeedForward {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            intermediate_dense: candle_nn::linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate_dense"),
            )?,
            output_dense: candle_nn::linear(
                cfg.intermediate_size,
                cfg.hidden_size,
                vb.pp("output_dense"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.output_dense
            .forward(&self.intermediate_dense.forward(xs)?.gelu_erf()?)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    layer_norm: LayerNorm,
    feed_forward: FeedForward,
    final_layer_norm: LayerNorm,
    pre_norm: bool,
}

impl EncoderLayer {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            attention: SelfAttention::load(cfg, vb.pp("attention"))?,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            feed_forward: FeedForward::load(cfg, vb.pp("feed_forward"))?,
            final_layer_norm: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("final_layer_norm"),
            )?,
            pre_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if self.pre_norm {
            let h = (xs + self.attention.forward(&self.layer_norm.forward(xs)?)?)?;
            &h + self.feed_forward.forward(&self.final_layer_norm.forward(&h)?)?
        } else {
            let h = self.layer_norm.forward(&(xs + self.attention.forward(xs)?)?)?;
            self.final_layer_norm
                .forward(&(&h + self.feed_forward.forward(&h)?)?)
        }
    }
}

struct Encoder {
    pos_conv_embed: PositionalConvEmbedding,
    layer_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    pre_norm: bool,
}

impl Encoder {
    fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::load(cfg, vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            pos_conv_embed: PositionalConvEmbedding::load(cfg, vb.pp("pos_conv_embed"))?,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            layers,
            pre_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = (xs + self.pos_conv_embed.forward(xs)?)?;
        if !self.pre_norm {
            h = self.layer_norm.forward(&h)?;
        }
        for layer in &self.layers {
            h = layer.forward(&h)?;
        }
        if self.pre_norm {
            h = self.layer_norm.forward(&h)?;
        }
        Ok(h)
    }
}

/// wav2vec2 encoder with a linear CTC head.
pub struct Wav2Vec2ForCtc {
    feature_extractor: Vec<FeatureConvLayer>,
    feature_projection: FeatureProjection,
    encoder: Encoder,
    lm_head: Linear,
    vocab_size: usize,
    receptive_field: usize,
}

impl Wav2Vec2ForCtc {
    pub fn load(cfg: &Wav2Vec2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let base = vb.pp("wav2vec2");
        let feature_extractor = (0..cfg.conv_dim.len())
            .map(|i| {
                FeatureConvLayer::load(cfg, i, base.pp(format!("feature_extractor.conv_layers.{i}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            feature_extractor,
            feature_projection: FeatureProjection::load(cfg, base.pp("feature_projection"))?,
            encoder: Encoder::load(cfg, base.pp("encoder"))?,
            lm_head: candle_nn::linear(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?,
            vocab_size: cfg.vocab_size,
            receptive_field: cfg.receptive_field(),
        })
    }

    /// Load `config.json` and the weights from a local model directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self, ModelLoadError> {
        let cfg = Wav2Vec2Config::from_file(&dir.join("config.json"))?;
        let weights = locate_weights(dir)?;

        info!(
            weights = %weights.display(),
            hidden_size = cfg.hidden_size,
            layers = cfg.num_hidden_layers,
            vocab = cfg.vocab_size,
            stable_layer_norm = cfg.do_stable_layer_norm,
            "building wav2vec2 model"
        );

        let vb = if weights.extension().is_some_and(|ext| ext == "safetensors") {
            // SAFETY: the file is opened read-only and not modified while mapped.
            unsafe { VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, device)? }
        } else {
            VarBuilder::from_pth(&weights, DType::F32, device)?
        };

        Ok(Self::load(&cfg, vb)?)
    }
}

fn locate_weights(dir: &Path) -> Result<PathBuf, ModelLoadError> {
    ["model.safetensors", "pytorch_model.bin"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| {
            ModelLoadError::MissingArtifact(format!(
                "{} (model.safetensors or pytorch_model.bin)",
                dir.display()
            ))
        })
}

impl AcousticModel for Wav2Vec2ForCtc {
    fn forward(&self, input_values: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = input_values.unsqueeze(1)?;
        for layer in &self.feature_extractor {
            h = layer.forward(&h)?;
        }
        let h = self
            .feature_projection
            .forward(&h.transpose(1, 2)?.contiguous()?)?;
        let h = self.encoder.forward(&h)?;
        self.lm_head.forward(&h)
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn receptive_field(&self) -> usize {
        self.receptive_field
    }
}
