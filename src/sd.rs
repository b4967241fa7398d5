//! Stable Diffusion generation pipeline.
//!
//! Classic latent diffusion: a CLIP text encoder conditions a UNet that
//! denoises a 4 channel latent, decoded by the KL autoencoder. Supports the
//! v1.5 and v2.1 checkpoint families, which differ in CLIP width, padding
//! token and prediction target.

use std::path::Path;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip,
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{PredictionType, Scheduler, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
};
use image::RgbImage;
use tokenizers::processors::{template::TemplateProcessing, PostProcessorWrapper};
use tokenizers::{models::bpe::BPE, AddedToken, Tokenizer};
use tracing::{debug, info};

use crate::device;
use crate::download::SdFiles;
use crate::pipeline::{rgb_image_from_tensor, GenOptions, SolverKind};
use crate::registry::SdVersion;

/// Latents are scaled by this factor between the UNet and the autoencoder.
const VAE_SCALE: f64 = 0.18215;

const CONTEXT_LEN: usize = 77;

impl SdVersion {
    fn config(&self) -> stable_diffusion::StableDiffusionConfig {
        match self {
            SdVersion::V1_5 => stable_diffusion::StableDiffusionConfig::v1_5(None, None, None),
            SdVersion::V2_1 => stable_diffusion::StableDiffusionConfig::v2_1(None, None, None),
        }
    }

    /// Token used to pad prompts up to the context length.
    fn pad_token(&self) -> &'static str {
        match self {
            SdVersion::V1_5 => "<|endoftext|>",
            SdVersion::V2_1 => "!",
        }
    }

    /// Training target of the UNet, needed by every solver.
    fn prediction_type(&self) -> PredictionType {
        match self {
            SdVersion::V1_5 => PredictionType::Epsilon,
            SdVersion::V2_1 => PredictionType::VPrediction,
        }
    }
}

/// CLIP text encoder producing the full `[1, 77, hidden]` hidden states the
/// UNet cross-attends to.
struct SdTextEncoder {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    device: Device,
}

impl SdTextEncoder {
    fn load(files: &SdFiles, version: SdVersion, device: &Device) -> Result<Self> {
        info!(path = %files.clip_weights.display(), "Loading CLIP encoder");

        let config = version.config();
        let tokenizer =
            load_bpe_tokenizer(&files.clip_vocab, &files.clip_merges, version.pad_token())?;
        // The encoder itself always runs in F32, conditioning is cheap.
        let model = stable_diffusion::build_clip_transformer(
            &config.clip,
            &files.clip_weights,
            device,
            DType::F32,
        )?;

        info!("✓ CLIP encoder loaded");
        Ok(Self {
            model,
            tokenizer,
            device: device.clone(),
        })
    }

    fn encode(&self, prompt: &str) -> Result<Tensor> {
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
        let token_ids = Tensor::new(&tokens[..], &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&token_ids)?)
    }
}

/// Build the CLIP BPE tokenizer from vocab.json and merges.txt.
///
/// v1.5 pads with the end of text token, v2.1 with "!", so the pad id is
/// looked up in the vocab rather than hardcoded. SD3 reuses this for both
/// of its CLIP towers.
pub(crate) fn load_bpe_tokenizer(
    vocab_path: &Path,
    merges_path: &Path,
    pad_token: &str,
) -> Result<Tokenizer> {
    let bpe = BPE::from_file(&vocab_path.to_string_lossy(), &merges_path.to_string_lossy())
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build BPE tokenizer: {e}"))?;

    let mut tokenizer = Tokenizer::new(bpe);
    tokenizer.add_special_tokens(&[
        AddedToken::from("<|startoftext|>", true),
        AddedToken::from("<|endoftext|>", true),
    ]);

    let bos = token_id(&tokenizer, "<|startoftext|>")?;
    let eos = token_id(&tokenizer, "<|endoftext|>")?;
    let pad_id = token_id(&tokenizer, pad_token)?;

    let processor = TemplateProcessing::builder()
        .try_single("<|startoftext|> $A <|endoftext|>")
        .map_err(|e| anyhow::anyhow!("Template processing failed: {e}"))?
        .special_tokens(vec![("<|startoftext|>", bos), ("<|endoftext|>", eos)])
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build processor: {e}"))?;
    tokenizer.with_post_processor(Some(PostProcessorWrapper::from(processor)));

    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::Fixed(CONTEXT_LEN),
        pad_id,
        pad_token: pad_token.to_string(),
        ..Default::default()
    }));
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: CONTEXT_LEN,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("Failed to set truncation: {e}"))?;

    Ok(tokenizer)
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow::anyhow!("Token {token:?} not present in CLIP vocab"))
}

/// Build the requested solver over the checkpoint's prediction target.
fn build_solver(
    solver: SolverKind,
    prediction_type: PredictionType,
    steps: usize,
) -> Result<Box<dyn Scheduler>> {
    match solver {
        SolverKind::Ddim => Ok(DDIMSchedulerConfig {
            prediction_type,
            ..Default::default()
        }
        .build(steps)?),
        SolverKind::EulerAncestral => Ok(EulerAncestralDiscreteSchedulerConfig {
            prediction_type,
            ..Default::default()
        }
        .build(steps)?),
    }
}

/// Complete Stable Diffusion generation pipeline.
pub struct SdPipeline {
    text: SdTextEncoder,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    version: SdVersion,
    dtype: DType,
    device: Device,
}

impl SdPipeline {
    /// Load all pipeline components from downloaded files.
    pub fn load(files: &SdFiles, version: SdVersion, device: &Device) -> Result<Self> {
        info!(?version, "Initializing Stable Diffusion pipeline");

        let dtype = if device.is_cuda() { DType::F16 } else { DType::F32 };
        let config = version.config();

        let text = SdTextEncoder::load(files, version, device)?;

        info!(path = %files.vae_weights.display(), "Loading VAE");
        let vae = config.build_vae(&files.vae_weights, device, dtype)?;

        info!(path = %files.unet_weights.display(), "Loading UNet");
        let unet = config.build_unet(&files.unet_weights, device, 4, false, dtype)?;

        info!("✓ Stable Diffusion pipeline initialized");
        Ok(Self {
            text,
            unet,
            vae,
            version,
            dtype,
            device: device.clone(),
        })
    }

    pub fn version(&self) -> SdVersion {
        self.version
    }

    /// Generate one image from a prompt.
    ///
    /// Guidance at or below 1.0 disables classifier-free guidance, halving
    /// the UNet work per step.
    pub fn generate(&mut self, prompt: &str, opts: &GenOptions) -> Result<RgbImage> {
        let preview: String = prompt.chars().take(50).collect();
        info!(
            prompt_preview = %preview,
            steps = opts.steps,
            guidance = opts.guidance,
            size = format!("{}x{}", opts.width, opts.height),
            seed = opts.seed,
            "Starting Stable Diffusion generation"
        );

        let use_cfg = opts.guidance > 1.0;
        let mut scheduler = build_solver(opts.solver, self.version.prediction_type(), opts.steps)?;

        let cond = self.text.encode(prompt)?;
        let text_embeddings = if use_cfg {
            let uncond = self
                .text
                .encode(opts.negative_prompt.as_deref().unwrap_or(""))?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;
        debug!(shape = ?text_embeddings.dims(), "Text embeddings");

        device::seed(&self.device, opts.seed);
        let latent_shape = (1, 4, opts.height / 8, opts.width / 8);
        let mut latents = (Tensor::randn(0f32, 1f32, latent_shape, &self.device)?
            .to_dtype(self.dtype)?
            * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        let total_steps = timesteps.len();
        for (i, &timestep) in timesteps.iter().enumerate() {
            let latent_input = if use_cfg {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;

            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if use_cfg {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * opts.guidance)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;

            if (i + 1) % 5 == 0 || i + 1 == total_steps {
                debug!(step = i + 1, total = total_steps, "Denoising progress");
            }
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        rgb_image_from_tensor(&image)
    }
}
