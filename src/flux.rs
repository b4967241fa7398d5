//! Flux generation pipeline.
//!
//! Components of a Flux checkpoint:
//! - T5-XXL text encoder (quantized GGUF) for the main conditioning
//! - CLIP ViT-L text encoder (full precision) for the pooled vector
//! - Flow matching transformer, full precision BF16 or quantized Q8_0
//! - Autoencoder for latent decoding
//!
//! Denoising is plain Euler integration of the predicted velocity over a
//! timestep schedule, linear for schnell and resolution-shifted for dev.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use candle_core::quantized::QTensor;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{clip, flux, quantized_t5};
use candle_transformers::models::flux::WithForward;
use candle_transformers::quantized_var_builder::VarBuilder as QVarBuilder;
use image::RgbImage;
use tokenizers::processors::{template::TemplateProcessing, PostProcessorWrapper};
use tokenizers::{models::bpe::BPE, AddedToken, Tokenizer};
use tracing::{debug, info, warn};

use crate::device;
use crate::download::FluxFiles;
use crate::lora::{self, LoraAdapter};
use crate::pipeline::{rgb_image_from_tensor, GenOptions};
use crate::registry::FluxVariant;

/// Timestep schedules for the Euler sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxSchedule {
    /// Evenly spaced from 1.0 down to 0.0. What schnell was distilled for.
    Linear,
    /// Linear schedule warped towards high noise, stronger at higher
    /// resolutions. What dev expects.
    Shifted,
}

impl FluxSchedule {
    pub fn default_for(variant: FluxVariant) -> Self {
        match variant {
            FluxVariant::Dev => FluxSchedule::Shifted,
            FluxVariant::Schnell => FluxSchedule::Linear,
        }
    }
}

/// Timesteps for `steps` Euler steps, `steps + 1` boundaries from 1.0 to 0.0.
fn build_schedule(schedule: FluxSchedule, steps: usize, img_seq_len: usize) -> Vec<f64> {
    let linear = (0..=steps).map(|i| 1.0 - i as f64 / steps as f64);
    match schedule {
        FluxSchedule::Linear => linear.collect(),
        FluxSchedule::Shifted => {
            // Shift strength scales with the image token count, from 0.5 at
            // 256 tokens to 1.15 at 4096, matching the reference sampler.
            let mu = lerp(img_seq_len as f64, (256.0, 0.5), (4096.0, 1.15));
            linear.map(|t| time_shift(mu, 1.0, t)).collect()
        }
    }
}

fn lerp(x: f64, (x1, y1): (f64, f64), (x2, y2): (f64, f64)) -> f64 {
    y1 + (x - x1) * (y2 - y1) / (x2 - x1)
}

/// Warp a timestep towards the high noise end: e^mu / (e^mu + (1/t - 1)^sigma).
fn time_shift(mu: f64, sigma: f64, t: f64) -> f64 {
    if t <= 0.0 {
        return 0.0;
    }
    let e = mu.exp();
    e / (e + (1.0 / t - 1.0).powf(sigma))
}

fn transformer_config(variant: FluxVariant) -> flux::model::Config {
    match variant {
        FluxVariant::Dev => flux::model::Config::dev(),
        FluxVariant::Schnell => flux::model::Config::schnell(),
    }
}

fn autoencoder_config(variant: FluxVariant) -> flux::autoencoder::Config {
    match variant {
        FluxVariant::Dev => flux::autoencoder::Config::dev(),
        FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
    }
}

/// T5-XXL configuration (v1.1-xxl). Neither the Flux GGUF nor the SD3
/// bundled checkpoint ships a config file, so both parse this one.
pub(crate) const T5_XXL_CONFIG: &str = r#"{
    "vocab_size": 32128,
    "d_model": 4096,
    "d_kv": 64,
    "d_ff": 10240,
    "num_layers": 24,
    "num_heads": 64,
    "relative_attention_num_buckets": 32,
    "relative_attention_max_distance": 128,
    "dropout_rate": 0.1,
    "layer_norm_epsilon": 1e-6,
    "initializer_factor": 1.0,
    "feed_forward_proj": "gated-gelu",
    "tie_word_embeddings": false,
    "is_decoder": false,
    "is_encoder_decoder": false,
    "use_cache": true,
    "pad_token_id": 0,
    "eos_token_id": 1
}"#;

/// T5 text encoder providing the sequence conditioning.
pub struct T5TextEncoder {
    model: quantized_t5::T5EncoderModel,
    tokenizer: Tokenizer,
    device: Device,
    max_length: usize,
}

impl T5TextEncoder {
    /// Load the quantized T5 encoder from a GGUF file.
    pub fn load(gguf_path: &Path, tokenizer_path: &Path, device: Device) -> Result<Self> {
        info!(path = %gguf_path.display(), "Loading T5-XXL encoder (quantized)");

        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| {
            anyhow::anyhow!("Failed to load T5 tokenizer from {tokenizer_path:?}: {e}")
        })?;

        // city96's GGUF files use llama.cpp tensor naming while candle's T5
        // expects the original naming, so tensors are renamed during load.
        let vb = MappedQVarBuilder::from_gguf(gguf_path, &device, t5_tensor_name)?;
        let config: quantized_t5::Config = serde_json::from_str(T5_XXL_CONFIG)?;
        let model = quantized_t5::T5EncoderModel::load(vb.into(), &config)?;

        info!("✓ T5 encoder loaded");
        Ok(Self {
            model,
            tokenizer,
            device,
            max_length: 256,
        })
    }

    /// Encode a prompt to embeddings of shape `[1, 256, 4096]`.
    pub fn encode(&mut self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("T5 tokenization failed: {e}"))?;

        let mut tokens = encoding.get_ids().to_vec();
        if tokens.len() > self.max_length {
            tokens.truncate(self.max_length);
        } else {
            tokens.resize(self.max_length, 0);
        }

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&token_ids)?)
    }
}

/// CLIP ViT-L text encoder providing the pooled conditioning vector.
pub struct ClipTextEncoder {
    model: clip::text_model::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipTextEncoder {
    pub fn load(
        weights_path: &Path,
        vocab_path: &Path,
        merges_path: &Path,
        device: Device,
    ) -> Result<Self> {
        info!(path = %weights_path.display(), "Loading CLIP encoder");

        let tokenizer = load_clip_bpe_tokenizer(vocab_path, merges_path)?;

        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)? };
        // The checkpoint stores everything under a "text_model." prefix.
        let vb = vb.pp("text_model");

        let config = clip::text_model::ClipTextConfig {
            vocab_size: 49408,
            embed_dim: 768,
            activation: clip::text_model::Activation::QuickGelu,
            intermediate_size: 3072,
            max_position_embeddings: 77,
            pad_with: Some("<|endoftext|>".to_string()),
            num_hidden_layers: 12,
            num_attention_heads: 12,
            projection_dim: 768,
        };
        let model = clip::text_model::ClipTextTransformer::new(vb, &config)?;

        info!("✓ CLIP encoder loaded");
        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }

    /// Encode a prompt to a pooled embedding of shape `[1, 768]`.
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("CLIP tokenization failed: {e}"))?;

        let tokens = encoding.get_ids().to_vec();
        if tokens.len() != 77 {
            bail!("CLIP tokenization produced {} tokens, expected 77", tokens.len());
        }

        // Pooling takes the hidden state at the first end-of-text token.
        let eot_position = tokens
            .iter()
            .position(|&t| t == 49407)
            .unwrap_or(tokens.len() - 1);

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        let hidden_states = self.model.forward_with_mask(&token_ids, usize::MAX)?;
        Ok(hidden_states.i((0, eot_position))?.unsqueeze(0)?)
    }
}

/// Build the CLIP BPE tokenizer from vocab.json and merges.txt.
///
/// Prompts are bracketed with start/end of text and padded with end-of-text
/// to the fixed 77 token context.
fn load_clip_bpe_tokenizer(vocab_path: &Path, merges_path: &Path) -> Result<Tokenizer> {
    let bpe = BPE::from_file(&vocab_path.to_string_lossy(), &merges_path.to_string_lossy())
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build BPE tokenizer: {e}"))?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.add_special_tokens(&[
        AddedToken::from("<|startoftext|>", true),
        AddedToken::from("<|endoftext|>", true),
    ]);

    let processor = TemplateProcessing::builder()
        .try_single("<|startoftext|> $A <|endoftext|>")
        .map_err(|e| anyhow::anyhow!("Template processing failed: {e}"))?
        .special_tokens(vec![("<|startoftext|>", 49406), ("<|endoftext|>", 49407)])
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build processor: {e}"))?;
    tokenizer.with_post_processor(Some(PostProcessorWrapper::from(processor)));

    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::Fixed(77),
        pad_id: 49407,
        pad_token: "<|endoftext|>".to_string(),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: 77,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("Failed to set truncation: {e}"))?;

    Ok(tokenizer)
}

/// Latent autoencoder, decode side only.
pub struct VaeDecoder {
    model: flux::autoencoder::AutoEncoder,
    dtype: DType,
}

impl VaeDecoder {
    pub fn load(weights_path: &Path, variant: FluxVariant, device: &Device) -> Result<Self> {
        info!(path = %weights_path.display(), "Loading VAE decoder");

        let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };
        let model = flux::autoencoder::AutoEncoder::new(&autoencoder_config(variant), vb)?;

        info!("✓ VAE decoder loaded");
        Ok(Self { model, dtype })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Decode latents `[1, 16, H/8, W/8]` to an RGB tensor `[1, 3, H, W]`
    /// with values in `[-1, 1]`.
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.model.decode(latents)?)
    }
}

/// The flow matching transformer, in either precision.
pub enum FluxTransformer {
    FullPrecision(flux::model::Flux),
    Quantized(flux::quantized_model::Flux),
}

impl FluxTransformer {
    fn forward_velocity(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        vec_: &Tensor,
        guidance: Option<&Tensor>,
    ) -> Result<Tensor> {
        let v = match self {
            Self::FullPrecision(model) => {
                model.forward(img, img_ids, txt, txt_ids, timesteps, vec_, guidance)?
            }
            Self::Quantized(model) => {
                model.forward(img, img_ids, txt, txt_ids, timesteps, vec_, guidance)?
            }
        };
        Ok(v)
    }

    /// Activation dtype the sampling state must use.
    fn act_dtype(&self, device: &Device) -> DType {
        match self {
            Self::FullPrecision(_) => {
                if device.is_cuda() {
                    DType::BF16
                } else {
                    DType::F32
                }
            }
            Self::Quantized(_) => DType::F32,
        }
    }
}

/// Load the quantized transformer from a GGUF file.
fn load_quantized_transformer(
    gguf_path: &Path,
    variant: FluxVariant,
    device: &Device,
) -> Result<flux::quantized_model::Flux> {
    info!(path = %gguf_path.display(), "Loading Flux transformer (quantized Q8_0)");
    let vb = QVarBuilder::from_gguf(gguf_path, device)?;
    let model = flux::quantized_model::Flux::new(&transformer_config(variant), vb)?;
    info!("✓ Flux transformer loaded");
    Ok(model)
}

/// Load the full precision transformer, fusing LoRA deltas into the base
/// weights first when adapters are given.
///
/// Fusion computes W' = W + scale * (B @ A) per adapted layer before the
/// model is built, so sampling runs at full speed regardless of how many
/// adapters are applied.
fn load_full_transformer(
    safetensors_path: &Path,
    variant: FluxVariant,
    loras: &[(Arc<LoraAdapter>, f32)],
    device: &Device,
) -> Result<flux::model::Flux> {
    let dtype = if device.is_cuda() { DType::BF16 } else { DType::F32 };
    info!(
        path = %safetensors_path.display(),
        lora_count = loras.len(),
        "Loading Flux transformer (full precision)"
    );

    let cfg = transformer_config(variant);
    if loras.is_empty() {
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[safetensors_path], dtype, device)? };
        let model = flux::model::Flux::new(&cfg, vb)?;
        info!("✓ Flux transformer loaded");
        return Ok(model);
    }

    let mut tensors = candle_core::safetensors::load(safetensors_path, device)
        .with_context(|| format!("Failed to load {}", safetensors_path.display()))?;

    let mut fused = 0usize;
    let mut skipped = 0usize;
    for (adapter, strength) in loras {
        info!(
            name = %adapter.name,
            strength,
            weights = adapter.weight_count(),
            "Fusing LoRA adapter"
        );
        for (layer_name, weight) in &adapter.weights {
            let tensor_name = lora::weight_tensor_name(layer_name);
            let updated = match tensors.get(&tensor_name) {
                Some(base) => {
                    let delta = (weight.delta()? * weight.scale(*strength))?;
                    if base.dims() != delta.dims() {
                        warn!(
                            layer = %layer_name,
                            base = ?base.dims(),
                            delta = ?delta.dims(),
                            "LoRA shape mismatch, layer skipped"
                        );
                        None
                    } else {
                        let base_dtype = base.dtype();
                        Some((base.to_dtype(DType::F32)? + delta)?.to_dtype(base_dtype)?)
                    }
                }
                None => {
                    debug!(layer = %layer_name, "No matching base tensor for LoRA layer");
                    None
                }
            };
            match updated {
                Some(tensor) => {
                    tensors.insert(tensor_name, tensor);
                    fused += 1;
                }
                None => skipped += 1,
            }
        }
    }
    if fused == 0 {
        bail!("None of the LoRA layers matched the transformer, wrong adapter for this model?");
    }
    info!(fused, skipped, "✓ LoRA weights fused into base checkpoint");

    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    Ok(flux::model::Flux::new(&cfg, vb)?)
}

/// Complete Flux generation pipeline.
pub struct FluxPipeline {
    t5: T5TextEncoder,
    clip: ClipTextEncoder,
    vae: VaeDecoder,
    transformer: FluxTransformer,
    variant: FluxVariant,
    act_dtype: DType,
    device: Device,
}

impl FluxPipeline {
    /// Load all pipeline components from downloaded files.
    pub fn load(
        files: &FluxFiles,
        variant: FluxVariant,
        loras: &[(Arc<LoraAdapter>, f32)],
        device: &Device,
    ) -> Result<Self> {
        info!("Initializing Flux pipeline");

        if files.quantized && !loras.is_empty() {
            bail!(
                "LoRA adapters require the full precision transformer, \
                 drop --quantized to apply them"
            );
        }

        let t5 = T5TextEncoder::load(&files.t5_gguf, &files.t5_tokenizer, device.clone())?;
        let clip = ClipTextEncoder::load(
            &files.clip_weights,
            &files.clip_vocab,
            &files.clip_merges,
            device.clone(),
        )?;
        let vae = VaeDecoder::load(&files.vae_weights, variant, device)?;
        let transformer = if files.quantized {
            FluxTransformer::Quantized(load_quantized_transformer(
                &files.transformer,
                variant,
                device,
            )?)
        } else {
            FluxTransformer::FullPrecision(load_full_transformer(
                &files.transformer,
                variant,
                loras,
                device,
            )?)
        };
        let act_dtype = transformer.act_dtype(device);

        info!("✓ Flux pipeline initialized");
        Ok(Self {
            t5,
            clip,
            vae,
            transformer,
            variant,
            act_dtype,
            device: device.clone(),
        })
    }

    pub fn variant(&self) -> FluxVariant {
        self.variant
    }

    /// Generate one image from a prompt.
    pub fn generate(&mut self, prompt: &str, opts: &GenOptions) -> Result<RgbImage> {
        let preview: String = prompt.chars().take(50).collect();
        info!(
            prompt_preview = %preview,
            steps = opts.steps,
            size = format!("{}x{}", opts.width, opts.height),
            seed = opts.seed,
            "Starting Flux generation"
        );
        if opts.negative_prompt.is_some() {
            warn!("Negative prompts are ignored by Flux models");
        }

        let t5_emb = self.t5.encode(prompt)?.to_dtype(self.act_dtype)?;
        debug!(shape = ?t5_emb.dims(), "T5 embeddings");
        let clip_emb = self.clip.encode(prompt)?.to_dtype(self.act_dtype)?;
        debug!(shape = ?clip_emb.dims(), "CLIP embeddings");

        device::seed(&self.device, opts.seed);
        let img = flux::sampling::get_noise(1, opts.height, opts.width, &self.device)?
            .to_dtype(self.act_dtype)?;
        let state = flux::sampling::State::new(&t5_emb, &clip_emb, &img)?;

        let schedule = opts
            .flux_schedule
            .unwrap_or_else(|| FluxSchedule::default_for(self.variant));
        let timesteps = build_schedule(schedule, opts.steps, state.img.dim(1)?);

        // schnell is distilled without a guidance input.
        let guidance = match self.variant {
            FluxVariant::Dev => Some(opts.guidance),
            FluxVariant::Schnell => None,
        };

        let denoised = self.denoise(&state, &timesteps, guidance)?;
        let latents = flux::sampling::unpack(&denoised, opts.height, opts.width)?;
        debug!(shape = ?latents.dims(), "Latents unpacked");

        let image = self.vae.decode(&latents.to_dtype(self.vae.dtype())?)?;
        rgb_image_from_tensor(&image)
    }

    /// Euler sampling: x <- x + (t_next - t_curr) * v(x, t_curr).
    fn denoise(
        &self,
        state: &flux::sampling::State,
        timesteps: &[f64],
        guidance: Option<f64>,
    ) -> Result<Tensor> {
        let mut img = state.img.clone();
        let b_sz = img.dim(0)?;

        let guidance_tensor = match guidance {
            Some(g) => Some(Tensor::full(g as f32, b_sz, &self.device)?),
            None => None,
        };

        let total_steps = timesteps.len().saturating_sub(1);
        for (i, window) in timesteps.windows(2).enumerate() {
            let t_curr = window[0];
            let t_next = window[1];

            let t_vec = Tensor::full(t_curr as f32, b_sz, &self.device)?;
            let v = self.transformer.forward_velocity(
                &img,
                &state.img_ids,
                &state.txt,
                &state.txt_ids,
                &t_vec,
                &state.vec,
                guidance_tensor.as_ref(),
            )?;

            img = (img + (v * (t_next - t_curr))?)?;

            if (i + 1) % 5 == 0 || i + 1 == total_steps {
                debug!(step = i + 1, total = total_steps, "Denoising progress");
            }
        }
        Ok(img)
    }
}

// ============================================================================
// Quantized VarBuilder with tensor name mapping
// ============================================================================

/// VarBuilder for quantized tensors that renames them during load.
///
/// Needed for GGUF files exported with llama.cpp naming when the model
/// implementation expects the original checkpoint naming. The fields must
/// stay identical to candle's own quantized VarBuilder for the conversion
/// below to hold.
#[allow(dead_code)]
struct MappedQVarBuilder {
    data: Arc<HashMap<String, Arc<QTensor>>>,
    path: Vec<String>,
    device: Device,
}

impl MappedQVarBuilder {
    fn from_gguf<F>(path: &Path, device: &Device, rename_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> String,
    {
        use candle_core::quantized::gguf_file;

        let mut file = std::fs::File::open(path)?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| anyhow::anyhow!("Failed to read GGUF: {e}"))?;

        let mut data = HashMap::new();
        for tensor_name in content.tensor_infos.keys() {
            let tensor = content
                .tensor(&mut file, tensor_name, device)
                .map_err(|e| anyhow::anyhow!("Failed to load tensor {tensor_name}: {e}"))?;
            data.insert(rename_fn(tensor_name), Arc::new(tensor));
        }
        debug!(tensor_count = data.len(), "Loaded GGUF tensors with name mapping");

        Ok(Self {
            data: Arc::new(data),
            path: Vec::new(),
            device: device.clone(),
        })
    }
}

impl From<MappedQVarBuilder> for QVarBuilder {
    fn from(mapped: MappedQVarBuilder) -> Self {
        // candle exposes no constructor from preloaded tensors. Both types
        // hold (Arc<HashMap<String, Arc<QTensor>>>, Vec<String>, Device).
        unsafe { std::mem::transmute(mapped) }
    }
}

/// Map llama.cpp T5 tensor names to the naming candle's T5 expects.
fn t5_tensor_name(llama_name: &str) -> String {
    if llama_name == "token_embd.weight" {
        return "shared.weight".to_string();
    }
    if llama_name == "enc.output_norm.weight" {
        return "encoder.final_layer_norm.weight".to_string();
    }

    // enc.blk.{N}.{rest} -> encoder.block.{N}.{mapped rest}
    if llama_name.starts_with("enc.blk.") {
        let parts: Vec<&str> = llama_name.split('.').collect();
        if parts.len() >= 4 {
            let block_num = parts[2];
            let rest = parts[3..].join(".");
            let mapped_rest = match rest.as_str() {
                "attn_k.weight" => "layer.0.SelfAttention.k.weight",
                "attn_q.weight" => "layer.0.SelfAttention.q.weight",
                "attn_v.weight" => "layer.0.SelfAttention.v.weight",
                "attn_o.weight" => "layer.0.SelfAttention.o.weight",
                "attn_rel_b.weight" => "layer.0.SelfAttention.relative_attention_bias.weight",
                "attn_norm.weight" => "layer.0.layer_norm.weight",
                "ffn_gate.weight" => "layer.1.DenseReluDense.wi_0.weight",
                "ffn_up.weight" => "layer.1.DenseReluDense.wi_1.weight",
                "ffn_down.weight" => "layer.1.DenseReluDense.wo.weight",
                "ffn_norm.weight" => "layer.1.layer_norm.weight",
                _ => {
                    debug!(suffix = %rest, "Unknown tensor suffix in GGUF");
                    return llama_name.to_string();
                }
            };
            return format!("encoder.block.{block_num}.{mapped_rest}");
        }
    }

    debug!(tensor = %llama_name, "Unmapped tensor name in GGUF");
    llama_name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_schedule_spans_one_to_zero() {
        let ts = build_schedule(FluxSchedule::Linear, 4, 4096);
        assert_eq!(ts.len(), 5);
        assert_eq!(ts[0], 1.0);
        assert_eq!(ts[4], 0.0);
        for w in ts.windows(2) {
            assert!(w[1] < w[0], "schedule must be strictly decreasing");
        }
    }

    #[test]
    fn shifted_schedule_bends_towards_high_noise() {
        let linear = build_schedule(FluxSchedule::Linear, 28, 4096);
        let shifted = build_schedule(FluxSchedule::Shifted, 28, 4096);
        assert_eq!(shifted.len(), linear.len());
        assert!((shifted[0] - 1.0).abs() < 1e-9);
        assert!(shifted[28].abs() < 1e-9);
        for w in shifted.windows(2) {
            assert!(w[1] < w[0], "schedule must be strictly decreasing");
        }
        // At 4096 tokens the shift keeps midpoints above the linear line.
        assert!(shifted[14] > linear[14]);
    }

    #[test]
    fn schedule_defaults_follow_variant() {
        assert_eq!(FluxSchedule::default_for(FluxVariant::Dev), FluxSchedule::Shifted);
        assert_eq!(
            FluxSchedule::default_for(FluxVariant::Schnell),
            FluxSchedule::Linear
        );
    }

    #[test]
    fn t5_config_parses() {
        let config: Result<quantized_t5::Config, _> = serde_json::from_str(T5_XXL_CONFIG);
        assert!(config.is_ok(), "{:?}", config.err());
    }

    #[test]
    fn t5_names_map_to_checkpoint_layout() {
        assert_eq!(t5_tensor_name("token_embd.weight"), "shared.weight");
        assert_eq!(
            t5_tensor_name("enc.output_norm.weight"),
            "encoder.final_layer_norm.weight"
        );
        assert_eq!(
            t5_tensor_name("enc.blk.0.attn_q.weight"),
            "encoder.block.0.layer.0.SelfAttention.q.weight"
        );
        assert_eq!(
            t5_tensor_name("enc.blk.23.ffn_down.weight"),
            "encoder.block.23.layer.1.DenseReluDense.wo.weight"
        );
        // Unknown names pass through untouched.
        assert_eq!(t5_tensor_name("dec.blk.0.attn_q.weight"), "dec.blk.0.attn_q.weight");
    }
}
