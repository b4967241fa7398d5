//! Stable Diffusion 3 generation pipeline.
//!
//! Rectified flow with an MMDiT transformer conditioned on three text
//! encoders: CLIP-L and CLIP-G contribute a pooled vector plus the first 77
//! joint context tokens, T5-XXL the second 77. Every model including the
//! autoencoder loads from one bundled checkpoint file. Sampling is plain
//! Euler integration over a shifted timestep schedule, the family's
//! reference sampler.

use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};
use candle_transformers::models::mmdit::model::{Config as MmditConfig, MMDiT};
use candle_transformers::models::stable_diffusion::clip;
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use candle_transformers::models::t5;
use image::RgbImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::device;
use crate::download::Sd3Files;
use crate::flux::T5_XXL_CONFIG;
use crate::pipeline::{rgb_image_from_tensor, GenOptions};
use crate::sd::load_bpe_tokenizer;

/// Fixed token count of each encoder's slot in the joint context.
const CONTEXT_LEN: usize = 77;

/// Timestep shift of the reference sampler.
const TIME_SHIFT: f64 = 3.0;

/// Scale and shift mapping MMDiT latents into the VAE's input range.
const VAE_SCALE: f64 = 1.5305;
const VAE_SHIFT: f64 = 0.0609;

/// One CLIP tower of the triple text encoder.
struct ClipTower {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl ClipTower {
    fn load(
        vb: VarBuilder,
        config: clip::Config,
        vocab_path: &Path,
        merges_path: &Path,
        pad_token: &str,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = load_bpe_tokenizer(vocab_path, merges_path, pad_token)?;
        let model = clip::ClipTextTransformer::new(vb, &config)?;
        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    /// Penultimate layer states `[1, 77, width]` plus the final layer state
    /// at the first end-of-text token `[width]`.
    fn encode(&self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("CLIP tokenization failed: {e}"))?;
        let tokens = encoding.get_ids().to_vec();
        if tokens.len() != CONTEXT_LEN {
            bail!(
                "CLIP tokenization produced {} tokens, expected {CONTEXT_LEN}",
                tokens.len()
            );
        }
        // Pooling takes the hidden state at the first end-of-text token.
        let eot_position = tokens
            .iter()
            .position(|&t| t == 49407)
            .unwrap_or(tokens.len() - 1);

        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        let (final_states, penultimate) = self
            .model
            .forward_until_encoder_layer(&token_ids, usize::MAX, -2)?;
        let pooled = final_states.i((0, eot_position))?;
        Ok((penultimate, pooled))
    }
}

/// The three text towers combined into MMDiT conditioning.
struct Sd3TextEncoder {
    clip_l: ClipTower,
    clip_g: ClipTower,
    clip_g_projection: Linear,
    t5: t5::T5EncoderModel,
    t5_tokenizer: Tokenizer,
    device: Device,
}

impl Sd3TextEncoder {
    /// Load all three towers from the bundled checkpoint.
    ///
    /// `vb_t5` reads the same file at full precision: T5-XXL overflows in
    /// F16 while the CLIP towers are fine in the model dtype.
    fn load(
        files: &Sd3Files,
        vb: &VarBuilder,
        vb_t5: &VarBuilder,
        device: &Device,
    ) -> Result<Self> {
        info!("Loading text encoders (CLIP-L, CLIP-G, T5-XXL)");

        // CLIP-L pads with end-of-text as v1.5 does; the bigG tower pads
        // with "!" following OpenCLIP.
        let clip_l = ClipTower::load(
            vb.pp("text_encoders.clip_l.transformer.text_model"),
            clip::Config::sdxl(),
            &files.clip_l_vocab,
            &files.clip_l_merges,
            "<|endoftext|>",
            device,
        )?;
        let clip_g = ClipTower::load(
            vb.pp("text_encoders.clip_g.transformer.text_model"),
            clip::Config::sdxl2(),
            &files.clip_g_vocab,
            &files.clip_g_merges,
            "!",
            device,
        )?;
        let clip_g_projection = linear_no_bias(
            1280,
            1280,
            vb.pp("text_encoders.clip_g.transformer.text_projection"),
        )?;

        let t5_tokenizer = Tokenizer::from_file(&files.t5_tokenizer).map_err(|e| {
            anyhow::anyhow!(
                "Failed to load T5 tokenizer from {:?}: {e}",
                files.t5_tokenizer
            )
        })?;
        let config: t5::Config = serde_json::from_str(T5_XXL_CONFIG)?;
        let t5 = t5::T5EncoderModel::load(vb_t5.pp("text_encoders.t5xxl.transformer"), &config)
            .context("Failed to load the bundled T5-XXL encoder")?;

        info!("✓ Text encoders loaded");
        Ok(Self {
            clip_l,
            clip_g,
            clip_g_projection,
            t5,
            t5_tokenizer,
            device: device.clone(),
        })
    }

    fn encode_t5(&mut self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("T5 tokenization failed: {e}"))?;
        let mut tokens = encoding.get_ids().to_vec();
        tokens.resize(CONTEXT_LEN, 0);
        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        Ok(self.t5.forward(&token_ids)?)
    }

    /// Joint context `[1, 154, 4096]` and pooled vector `[1, 2048]`.
    fn encode(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let (l_states, l_pooled) = self.clip_l.encode(prompt)?;
        let (g_states, g_pooled) = self.clip_g.encode(prompt)?;
        let g_pooled = self
            .clip_g_projection
            .forward(&g_pooled.unsqueeze(0)?)?
            .squeeze(0)?;
        let pooled = Tensor::cat(&[&l_pooled, &g_pooled], 0)?.unsqueeze(0)?;

        // The CLIP states concatenate to 2048 channels and are zero padded
        // up to the 4096 of the T5 states before joining along the sequence.
        let clip_states = Tensor::cat(&[&l_states, &g_states], D::Minus1)?
            .pad_with_zeros(D::Minus1, 0, 2048)?;
        let t5_states = self.encode_t5(prompt)?.to_dtype(clip_states.dtype())?;
        let context = Tensor::cat(&[&clip_states, &t5_states], 1)?;
        Ok((context, pooled))
    }
}

/// Load the MMDiT transformer from the bundled checkpoint.
fn load_mmdit(vb: &VarBuilder) -> Result<MMDiT> {
    info!("Loading MMDiT transformer");
    let model = MMDiT::new(
        &MmditConfig::sd3_medium(),
        false,
        vb.pp("model.diffusion_model"),
    )?;
    info!("✓ MMDiT transformer loaded");
    Ok(model)
}

/// Build the 16 channel autoencoder from the bundled checkpoint.
///
/// The checkpoint stores VAE weights under the original sgm naming, so
/// every lookup is renamed from the diffusers style names candle asks for.
fn load_vae(vb: &VarBuilder) -> Result<AutoEncoderKL> {
    info!("Loading VAE");
    let config = AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 16,
        norm_num_groups: 32,
        use_quant_conv: false,
        use_post_quant_conv: false,
    };
    let vb = vb.clone().rename_f(vae_tensor_name).pp("first_stage_model");
    let model = AutoEncoderKL::new(vb, 3, 3, config)?;
    info!("✓ VAE loaded");
    Ok(model)
}

/// Map the diffusers style VAE names candle requests onto the sgm naming
/// used inside the checkpoint.
fn vae_tensor_name(diffusers_name: &str) -> String {
    let parts: Vec<&str> = diffusers_name.split('.').collect();
    let mut mapped: Vec<String> = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        match parts[i] {
            "down_blocks" => mapped.push("down".to_string()),
            "mid_block" => mapped.push("mid".to_string()),
            "up_blocks" => {
                mapped.push("up".to_string());
                // The up block order is reversed between the two layouts.
                if let Some(n) = parts.get(i + 1).and_then(|p| p.parse::<usize>().ok()) {
                    mapped.push((3 - n).to_string());
                    i += 1;
                }
            }
            "resnets" if i > 0 && parts[i - 1] == "mid_block" => {
                match parts.get(i + 1) {
                    Some(&"0") => mapped.push("block_1".to_string()),
                    Some(&"1") => mapped.push("block_2".to_string()),
                    _ => {}
                }
                i += 1;
            }
            "resnets" => mapped.push("block".to_string()),
            "downsamplers" => {
                mapped.push("downsample".to_string());
                i += 1;
            }
            "upsamplers" => {
                mapped.push("upsample".to_string());
                i += 1;
            }
            "attentions" => {
                mapped.push("attn_1".to_string());
                i += 1;
            }
            "conv_shortcut" => mapped.push("nin_shortcut".to_string()),
            "group_norm" => mapped.push("norm".to_string()),
            "query" => mapped.push("q".to_string()),
            "key" => mapped.push("k".to_string()),
            "value" => mapped.push("v".to_string()),
            "proj_attn" => mapped.push("proj_out".to_string()),
            "conv_norm_out" => mapped.push("norm_out".to_string()),
            other => mapped.push(other.to_string()),
        }
        i += 1;
    }
    mapped.join(".")
}

/// Sigma boundaries for `steps` Euler steps, from 1.0 down to 0.0, warped
/// towards the high noise end: shift * t / (1 + (shift - 1) * t).
fn build_schedule(steps: usize) -> Vec<f64> {
    (0..=steps)
        .map(|i| 1.0 - i as f64 / steps as f64)
        .map(|t| TIME_SHIFT * t / (1.0 + (TIME_SHIFT - 1.0) * t))
        .collect()
}

/// Complete Stable Diffusion 3 generation pipeline.
pub struct Sd3Pipeline {
    text: Sd3TextEncoder,
    mmdit: MMDiT,
    vae: AutoEncoderKL,
    dtype: DType,
    device: Device,
}

impl Sd3Pipeline {
    /// Load all pipeline components from the bundled checkpoint.
    pub fn load(files: &Sd3Files, device: &Device) -> Result<Self> {
        info!("Initializing Stable Diffusion 3 pipeline");

        let dtype = if device.is_cuda() {
            DType::F16
        } else {
            DType::F32
        };
        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, device)? };
        let vb_t5 = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, device)?
        };

        let text = Sd3TextEncoder::load(files, &vb, &vb_t5, device)?;
        let mmdit = load_mmdit(&vb)?;
        let vae = load_vae(&vb)?;

        info!("✓ Stable Diffusion 3 pipeline initialized");
        Ok(Self {
            text,
            mmdit,
            vae,
            dtype,
            device: device.clone(),
        })
    }

    /// Generate one image from a prompt.
    pub fn generate(&mut self, prompt: &str, opts: &GenOptions) -> Result<RgbImage> {
        let preview: String = prompt.chars().take(50).collect();
        info!(
            prompt_preview = %preview,
            steps = opts.steps,
            guidance = opts.guidance,
            size = format!("{}x{}", opts.width, opts.height),
            seed = opts.seed,
            "Starting Stable Diffusion 3 generation"
        );

        let use_cfg = opts.guidance > 1.0;
        let (cond_context, cond_pooled) = self.text.encode(prompt)?;
        let (context, pooled) = if use_cfg {
            let uncond = opts.negative_prompt.as_deref().unwrap_or("");
            let (uncond_context, uncond_pooled) = self.text.encode(uncond)?;
            (
                Tensor::cat(&[uncond_context, cond_context], 0)?,
                Tensor::cat(&[uncond_pooled, cond_pooled], 0)?,
            )
        } else {
            (cond_context, cond_pooled)
        };
        debug!(shape = ?context.dims(), "Joint text context ready");

        device::seed(&self.device, opts.seed);
        let mut latents = Tensor::randn(
            0f32,
            1f32,
            (1, 16, opts.height / 8, opts.width / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;

        let sigmas = build_schedule(opts.steps);
        let total_steps = opts.steps;
        for (i, window) in sigmas.windows(2).enumerate() {
            let s_curr = window[0];
            let s_next = window[1];

            let latent_input = if use_cfg {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            // The transformer embeds timesteps on the usual 0..1000 range
            // and wants them in F32 whatever the model dtype.
            let batch = latent_input.dim(0)?;
            let timestep = Tensor::full((s_curr * 1000.0) as f32, batch, &self.device)?;

            let velocity = self
                .mmdit
                .forward(&latent_input, &timestep, &pooled, &context, None)?;
            let velocity = if use_cfg {
                let chunks = velocity.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * opts.guidance)?)?
            } else {
                velocity
            };

            latents = (latents + (velocity * (s_next - s_curr))?)?;

            if (i + 1) % 5 == 0 || i + 1 == total_steps {
                debug!(step = i + 1, total = total_steps, "Denoising progress");
            }
        }

        let latents = ((latents / VAE_SCALE)? + VAE_SHIFT)?;
        let image = self.vae.decode(&latents)?;
        rgb_image_from_tensor(&image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_spans_one_to_zero() {
        let sigmas = build_schedule(4);
        assert_eq!(sigmas.len(), 5);
        assert_eq!(sigmas[0], 1.0);
        assert_eq!(sigmas[4], 0.0);
        for w in sigmas.windows(2) {
            assert!(w[1] < w[0], "schedule must be strictly decreasing");
        }
    }

    #[test]
    fn schedule_bends_towards_high_noise() {
        // shift(0.5) = 3 * 0.5 / (1 + 2 * 0.5) = 0.75
        let sigmas = build_schedule(2);
        assert!((sigmas[1] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn vae_names_map_to_checkpoint_layout() {
        assert_eq!(
            vae_tensor_name("first_stage_model.decoder.up_blocks.0.resnets.0.conv1.weight"),
            "first_stage_model.decoder.up.3.block.0.conv1.weight"
        );
        assert_eq!(
            vae_tensor_name("first_stage_model.decoder.up_blocks.2.upsamplers.0.conv.weight"),
            "first_stage_model.decoder.up.1.upsample.conv.weight"
        );
        assert_eq!(
            vae_tensor_name("first_stage_model.decoder.mid_block.attentions.0.query.weight"),
            "first_stage_model.decoder.mid.attn_1.q.weight"
        );
        assert_eq!(
            vae_tensor_name("first_stage_model.decoder.mid_block.attentions.0.group_norm.bias"),
            "first_stage_model.decoder.mid.attn_1.norm.bias"
        );
        assert_eq!(
            vae_tensor_name("first_stage_model.decoder.mid_block.resnets.1.norm1.weight"),
            "first_stage_model.decoder.mid.block_2.norm1.weight"
        );
        assert_eq!(
            vae_tensor_name("first_stage_model.encoder.down_blocks.1.downsamplers.0.conv.weight"),
            "first_stage_model.encoder.down.1.downsample.conv.weight"
        );
        assert_eq!(
            vae_tensor_name("first_stage_model.encoder.down_blocks.0.resnets.0.conv_shortcut.bias"),
            "first_stage_model.encoder.down.0.block.0.nin_shortcut.bias"
        );
        assert_eq!(
            vae_tensor_name("first_stage_model.decoder.conv_norm_out.weight"),
            "first_stage_model.decoder.norm_out.weight"
        );
        // Names with no diffusers counterpart pass through untouched.
        assert_eq!(
            vae_tensor_name("first_stage_model.decoder.conv_in.bias"),
            "first_stage_model.decoder.conv_in.bias"
        );
    }
}
