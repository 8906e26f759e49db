//! wav2vec2 encoder with a CTC head, in candle.
//!
//! Mirrors the layout of the Hugging Face `Wav2Vec2ForCTC` checkpoints so the
//! published safetensors load without renaming:
//!
//! ```text
//! wav2vec2.feature_extractor.conv_layers.{i}.{conv,layer_norm}
//! wav2vec2.feature_projection.{layer_norm,projection}
//! wav2vec2.encoder.{pos_conv_embed.conv,layer_norm,layers.{i}.*}
//! lm_head
//! ```
//!
//! Both the post-norm (`base`/`large` 960h) and the pre-norm "stable layer
//! norm" (`large-lv60`) variants are supported.

use candle_core::{Module, Result, Tensor};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{
    conv1d, conv1d_no_bias, group_norm, layer_norm, linear, Conv1d, Conv1dConfig, GroupNorm,
    LayerNorm, Linear, VarBuilder,
};
use serde::Deserialize;

/// The subset of `config.json` the architecture needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Wav2Vec2Config {
    pub conv_dim: Vec<usize>,
    pub conv_kernel: Vec<usize>,
    pub conv_stride: Vec<usize>,
    pub conv_bias: bool,
    pub feat_extract_norm: String,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub layer_norm_eps: f64,
    pub num_conv_pos_embeddings: usize,
    pub num_conv_pos_embedding_groups: usize,
    pub do_stable_layer_norm: bool,
    pub vocab_size: usize,
    pub pad_token_id: u32,
}

impl Default for Wav2Vec2Config {
    fn default() -> Self {
        Self {
            conv_dim: vec![512; 7],
            conv_kernel: vec![10, 3, 3, 3, 3, 2, 2],
            conv_stride: vec![5, 2, 2, 2, 2, 2, 2],
            conv_bias: false,
            feat_extract_norm: "group".to_string(),
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            layer_norm_eps: 1e-5,
            num_conv_pos_embeddings: 128,
            num_conv_pos_embedding_groups: 16,
            do_stable_layer_norm: false,
            vocab_size: 32,
            pad_token_id: 0,
        }
    }
}

enum ConvNorm {
    Group(GroupNorm),
    Layer(LayerNorm),
}

struct FeatureConvLayer {
    conv: Conv1d,
    norm: Option<ConvNorm>,
}

impl FeatureConvLayer {
    fn load(vb: VarBuilder, cfg: &Wav2Vec2Config, index: usize) -> Result<Self> {
        let in_channels = if index == 0 { 1 } else { cfg.conv_dim[index - 1] };
        let out_channels = cfg.conv_dim[index];
        let kernel = cfg.conv_kernel[index];
        let conv_cfg = Conv1dConfig {
            stride: cfg.conv_stride[index],
            ..Default::default()
        };

        let conv = if cfg.conv_bias {
            conv1d(in_channels, out_channels, kernel, conv_cfg, vb.pp("conv"))?
        } else {
            conv1d_no_bias(in_channels, out_channels, kernel, conv_cfg, vb.pp("conv"))?
        };

        // "group" checkpoints normalise only the first layer, one group per channel
        let norm = match cfg.feat_extract_norm.as_str() {
            "layer" => Some(ConvNorm::Layer(layer_norm(
                out_channels,
                1e-5,
                vb.pp("layer_norm"),
            )?)),
            "group" if index == 0 => Some(ConvNorm::Group(group_norm(
                out_channels,
                out_channels,
                1e-5,
                vb.pp("layer_norm"),
            )?)),
            _ => None,
        };

        Ok(Self { conv, norm })
    }

    /// `[batch, channels, time]` in and out.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = match &self.norm {
            Some(ConvNorm::Group(norm)) => norm.forward(&xs)?,
            Some(ConvNorm::Layer(norm)) => xs
                .transpose(1, 2)?
                .contiguous()?
                .apply(norm)?
                .transpose(1, 2)?
                .contiguous()?,
            None => xs,
        };
        xs.gelu_erf()
    }
}

/// Grouped convolution over time, stored with weight normalisation.
struct PositionalConvEmbedding {
    conv: Conv1d,
    trim_last: bool,
}

impl PositionalConvEmbedding {
    fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let kernel = cfg.num_conv_pos_embeddings;
        let groups = cfg.num_conv_pos_embedding_groups;
        let hidden = cfg.hidden_size;

        // Older exports keep weight_g / weight_v, newer ones use parametrizations
        let (g_name, v_name) = if vb.contains_tensor("weight_g") {
            ("weight_g", "weight_v")
        } else {
            (
                "parametrizations.weight.original0",
                "parametrizations.weight.original1",
            )
        };
        let weight_g = vb.get((1, 1, kernel), g_name)?;
        let weight_v = vb.get((hidden, hidden / groups, kernel), v_name)?;
        let bias = vb.get(hidden, "bias")?;

        // weight = g * v / ||v||, norm taken over every dim except the kernel one
        let norm = weight_v.sqr()?.sum_keepdim(0)?.sum_keepdim(1)?.sqrt()?;
        let weight = weight_v.broadcast_mul(&weight_g.broadcast_div(&norm)?)?;

        let conv = Conv1d::new(
            weight,
            Some(bias),
            Conv1dConfig {
                padding: kernel / 2,
                groups,
                ..Default::default()
            },
        );

        Ok(Self {
            conv,
            trim_last: kernel % 2 == 0,
        })
    }

    /// `[batch, time, hidden]` in and out.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = xs.transpose(1, 2)?.contiguous()?;
        let mut xs = self.conv.forward(&xs)?;
        if self.trim_last {
            let len = xs.dim(2)?;
            xs = xs.narrow(2, 0, len - 1)?;
        }
        xs.gelu_erf()?.transpose(1, 2)?.contiguous()
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
    fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = hidden / cfg.num_attention_heads;
        Ok(Self {
            q_proj: linear(hidden, hidden, vb.pp("q_proj"))?,
            k_proj: linear(hidden, hidden, vb.pp("k_proj"))?,
            v_proj: linear(hidden, hidden, vb.pp("v_proj"))?,
            out_proj: linear(hidden, hidden, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, time, _) = xs.dims3()?;
        let split_heads = |t: Tensor| -> Result<Tensor> {
            t.reshape((batch, time, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let q = split_heads((self.q_proj.forward(xs)? * self.scale)?)?;
        let k = split_heads(self.k_proj.forward(xs)?)?;
        let v = split_heads(self.v_proj.forward(xs)?)?;

        let weights = softmax_last_dim(&q.matmul(&k.t()?.contiguous()?)?)?;
        let attended = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, time, self.num_heads * self.head_dim))?;

        self.out_proj.forward(&attended)
    }
}

struct FeedForward {
    intermediate_dense: Linear,
    output_dense: Linear,
}

impl FeedForward {
    fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        Ok(Self {
            intermediate_dense: linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate_dense"),
            )?,
            output_dense: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("output_dense"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
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
    fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention"), cfg)?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            feed_forward: FeedForward::load(vb.pp("feed_forward"), cfg)?,
            final_layer_norm: layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("final_layer_norm"),
            )?,
            pre_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        if self.pre_norm {
            let xs = (xs + self.attention.forward(&self.layer_norm.forward(xs)?)?)?;
            let ff = self
                .feed_forward
                .forward(&self.final_layer_norm.forward(&xs)?)?;
            xs + ff
        } else {
            let xs = (xs + self.attention.forward(xs)?)?;
            let xs = self.layer_norm.forward(&xs)?;
            let xs = (&xs + self.feed_forward.forward(&xs)?)?;
            self.final_layer_norm.forward(&xs)
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
    fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EncoderLayer::load(vb.pp("layers").pp(i), cfg))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pos_conv_embed: PositionalConvEmbedding::load(vb.pp("pos_conv_embed").pp("conv"), cfg)?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm"))?,
            layers,
            pre_norm: cfg.do_stable_layer_norm,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = (xs + self.pos_conv_embed.forward(xs)?)?;

        if !self.pre_norm {
            xs = self.layer_norm.forward(&xs)?;
        }
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        if self.pre_norm {
            xs = self.layer_norm.forward(&xs)?;
        }

        Ok(xs)
    }
}

/// Full acoustic model: raw normalised waveform in, CTC logits out.
pub struct Wav2Vec2ForCtc {
    feature_extractor: Vec<FeatureConvLayer>,
    projection_norm: LayerNorm,
    projection: Linear,
    encoder: Encoder,
    lm_head: Linear,
}

impl Wav2Vec2ForCtc {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let base = vb.pp("wav2vec2");
        let conv_vb = base.pp("feature_extractor").pp("conv_layers");

        let feature_extractor = (0..cfg.conv_dim.len())
            .map(|i| FeatureConvLayer::load(conv_vb.pp(i), cfg, i))
            .collect::<Result<Vec<_>>>()?;

        let last_conv_dim = cfg.conv_dim.last().copied().unwrap_or(512);
        let projection_vb = base.pp("feature_projection");

        Ok(Self {
            feature_extractor,
            projection_norm: layer_norm(
                last_conv_dim,
                cfg.layer_norm_eps,
                projection_vb.pp("layer_norm"),
            )?,
            projection: linear(last_conv_dim, cfg.hidden_size, projection_vb.pp("projection"))?,
            encoder: Encoder::load(base.pp("encoder"), cfg)?,
            lm_head: linear(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?,
        })
    }
}

impl Module for Wav2Vec2ForCtc {
    /// `input_values`: `[batch, samples]` → logits `[batch, frames, vocab]`.
    fn forward(&self, input_values: &Tensor) -> Result<Tensor> {
        let mut xs = input_values.unsqueeze(1)?;
        for layer in &self.feature_extractor {
            xs = layer.forward(&xs)?;
        }

        let xs = xs.transpose(1, 2)?.contiguous()?;
        let xs = self.projection.forward(&self.projection_norm.forward(&xs)?)?;
        let xs = self.encoder.forward(&xs)?;

        self.lm_head.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> Wav2Vec2Config {
        Wav2Vec2Config {
            conv_dim: vec![8, 8],
            conv_kernel: vec![10, 3],
            conv_stride: vec![5, 2],
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 32,
            num_conv_pos_embeddings: 4,
            num_conv_pos_embedding_groups: 2,
            vocab_size: 6,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let cfg: Wav2Vec2Config =
            serde_json::from_str(r#"{"hidden_size": 1024, "num_hidden_layers": 24}"#).unwrap();
        assert_eq!(cfg.hidden_size, 1024);
        assert_eq!(cfg.num_hidden_layers, 24);
        assert_eq!(cfg.conv_kernel, vec![10, 3, 3, 3, 3, 2, 2]);
        assert_eq!(cfg.vocab_size, 32);
    }

    #[test]
    fn test_forward_shape_with_random_weights() {
        for stable in [false, true] {
            let cfg = Wav2Vec2Config {
                do_stable_layer_norm: stable,
                ..tiny_config()
            };
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let model = Wav2Vec2ForCtc::load(vb, &cfg).unwrap();

            let input = Tensor::zeros((1, 400), DType::F32, &Device::Cpu).unwrap();
            let logits = model.forward(&input).unwrap();

            // 400 -> (400 - 10) / 5 + 1 = 79 -> (79 - 3) / 2 + 1 = 39 frames
            assert_eq!(logits.dims(), &[1, 39, 6]);
        }
    }
}
