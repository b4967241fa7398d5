//! Family dispatch over the generation pipelines.
//!
//! A model id resolves either to a catalog entry with a known weight layout
//! or to an arbitrary hub repo. Unknown repos are probed: first with the
//! Stable Diffusion layout, then as a Flux dev finetune, keeping whichever
//! loads. Everything downstream of loading (options, timing, the PNG sink)
//! is shared between families.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{ImageFormat, RgbImage};
use tracing::{info, warn};

use crate::download::{FluxSources, ModelFetcher};
use crate::flux::{FluxPipeline, FluxSchedule};
use crate::lora::LoraAdapter;
use crate::registry::{
    FluxVariant, GenDefaults, ResolvedModel, SdVersion, WeightLayout, FLUX_DEV_REPO,
};
use crate::sd::SdPipeline;
use crate::sd3::Sd3Pipeline;

/// Transformer file names tried when probing a repo as a Flux finetune.
const FLUX_PROBE_FILES: &[&str] = &["flux1-dev.safetensors", "diffusion_pytorch_model.safetensors"];

/// Solvers for the Stable Diffusion family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverKind {
    Ddim,
    /// Ancestral Euler, better quality at low step counts. The default.
    EulerAncestral,
}

impl std::str::FromStr for SolverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ddim" => Ok(SolverKind::Ddim),
            "euler-a" | "euler-ancestral" => Ok(SolverKind::EulerAncestral),
            other => bail!("Unknown solver {other:?}, expected ddim or euler-a"),
        }
    }
}

impl std::fmt::Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverKind::Ddim => write!(f, "ddim"),
            SolverKind::EulerAncestral => write!(f, "euler-a"),
        }
    }
}

impl std::str::FromStr for FluxSchedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(FluxSchedule::Linear),
            "shifted" => Ok(FluxSchedule::Shifted),
            other => bail!("Unknown schedule {other:?}, expected linear or shifted"),
        }
    }
}

/// Settings for one generation call.
#[derive(Debug, Clone)]
pub struct GenOptions {
    pub steps: usize,
    /// Guidance scale. At or below 1.0, classifier-free guidance is off for
    /// the Stable Diffusion families; for Flux dev this is the distilled
    /// guidance input.
    pub guidance: f64,
    pub width: usize,
    pub height: usize,
    pub seed: u64,
    pub negative_prompt: Option<String>,
    pub solver: SolverKind,
    /// Flux timestep schedule override, variant default when unset.
    pub flux_schedule: Option<FluxSchedule>,
}

impl GenOptions {
    pub fn from_defaults(defaults: &GenDefaults) -> Self {
        Self {
            steps: defaults.steps,
            guidance: defaults.guidance,
            width: defaults.width,
            height: defaults.height,
            seed: 42,
            negative_prompt: None,
            solver: SolverKind::EulerAncestral,
            flux_schedule: None,
        }
    }

    /// UNet, MMDiT and Flux latents all require dimensions on a 64px grid.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value % 64 != 0 {
                bail!("{name} must be a positive multiple of 64, got {value}");
            }
        }
        if self.steps == 0 {
            bail!("steps must be at least 1");
        }
        Ok(())
    }
}

/// A loaded text to image pipeline of any family.
pub enum Pipeline {
    StableDiffusion(SdPipeline),
    StableDiffusion3(Sd3Pipeline),
    Flux(FluxPipeline),
}

impl Pipeline {
    /// Load the pipeline for a resolved model, downloading weights as needed.
    pub async fn load(
        model: &ResolvedModel,
        fetcher: &ModelFetcher,
        device: &Device,
        quantized: bool,
        loras: &[(Arc<LoraAdapter>, f32)],
    ) -> Result<Self> {
        match model {
            ResolvedModel::Known(entry) => match &entry.layout {
                WeightLayout::Sd(version) => {
                    check_sd_flags(quantized, loras)?;
                    let files = fetcher.fetch_sd(entry.id).await?;
                    Ok(Self::StableDiffusion(SdPipeline::load(
                        &files, *version, device,
                    )?))
                }
                WeightLayout::Sd3(layout) => {
                    check_sd_flags(quantized, loras)?;
                    let files = fetcher.fetch_sd3(layout.into()).await?;
                    Ok(Self::StableDiffusion3(Sd3Pipeline::load(&files, device)?))
                }
                WeightLayout::Flux(layout) => {
                    let files = fetcher.fetch_flux(layout.into(), quantized).await?;
                    Ok(Self::Flux(FluxPipeline::load(
                        &files,
                        layout.variant,
                        loras,
                        device,
                    )?))
                }
            },
            ResolvedModel::Unknown(id) => {
                Self::load_unknown(id, fetcher, device, quantized, loras).await
            }
        }
    }

    /// Probe an uncataloged repo: Stable Diffusion layout first, then a Flux
    /// dev finetune. The first failure is logged, not fatal.
    async fn load_unknown(
        id: &str,
        fetcher: &ModelFetcher,
        device: &Device,
        quantized: bool,
        loras: &[(Arc<LoraAdapter>, f32)],
    ) -> Result<Self> {
        info!(model = %id, "Model not in catalog, probing repo layout");

        let sd_attempt = async {
            check_sd_flags(quantized, loras)?;
            let files = fetcher.fetch_sd(id).await?;
            SdPipeline::load(&files, SdVersion::V1_5, device)
        };
        match sd_attempt.await {
            Ok(pipeline) => return Ok(Self::StableDiffusion(pipeline)),
            Err(e) => {
                warn!(model = %id, error = %e, "Not loadable as Stable Diffusion, trying Flux")
            }
        }

        let mut last_err = None;
        for &transformer_file in FLUX_PROBE_FILES {
            let sources = FluxSources {
                base_repo: FLUX_DEV_REPO,
                transformer_repo: id,
                transformer_file,
                gguf: None,
            };
            match fetcher.fetch_flux(sources, quantized).await {
                Ok(files) => {
                    let pipeline = FluxPipeline::load(&files, FluxVariant::Dev, loras, device)?;
                    return Ok(Self::Flux(pipeline));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No transformer file candidates")))
            .with_context(|| format!("Model {id} could not be loaded as Stable Diffusion or Flux"))
    }

    pub fn family_name(&self) -> &'static str {
        match self {
            Pipeline::StableDiffusion(_) => "stable-diffusion",
            Pipeline::StableDiffusion3(_) => "stable-diffusion-3",
            Pipeline::Flux(_) => "flux",
        }
    }

    /// Options a checkpoint was tuned for. Catalog entries carry their own;
    /// probed repos fall back to family defaults.
    pub fn default_options(&self, model: &ResolvedModel) -> GenOptions {
        let defaults = match model {
            ResolvedModel::Known(entry) => entry.defaults,
            ResolvedModel::Unknown(_) => match self {
                Pipeline::StableDiffusion(_) => GenDefaults {
                    steps: 30,
                    guidance: 7.0,
                    width: 512,
                    height: 512,
                },
                // Only reachable through the catalog, but the defaults match.
                Pipeline::StableDiffusion3(_) => GenDefaults {
                    steps: 28,
                    guidance: 7.0,
                    width: 1024,
                    height: 1024,
                },
                Pipeline::Flux(pipeline) => match pipeline.variant() {
                    FluxVariant::Dev => GenDefaults {
                        steps: 28,
                        guidance: 3.5,
                        width: 1024,
                        height: 1024,
                    },
                    FluxVariant::Schnell => GenDefaults {
                        steps: 4,
                        guidance: 0.0,
                        width: 1024,
                        height: 1024,
                    },
                },
            },
        };
        GenOptions::from_defaults(&defaults)
    }

    /// Generate one image.
    pub fn generate(&mut self, prompt: &str, opts: &GenOptions) -> Result<RgbImage> {
        opts.validate()?;
        match self {
            Pipeline::StableDiffusion(pipeline) => pipeline.generate(prompt, opts),
            Pipeline::StableDiffusion3(pipeline) => pipeline.generate(prompt, opts),
            Pipeline::Flux(pipeline) => pipeline.generate(prompt, opts),
        }
    }

    /// Generate and write a PNG, reporting the wall clock time the way the
    /// interactive loop expects it.
    pub fn generate_to_file(
        &mut self,
        model_name: &str,
        prompt: &str,
        opts: &GenOptions,
        output: &Path,
    ) -> Result<()> {
        let start = Instant::now();
        let image = self.generate(prompt, opts)?;
        image
            .save_with_format(output, ImageFormat::Png)
            .with_context(|| format!("Failed to write {}", output.display()))?;
        let elapsed = start.elapsed().as_secs_f64();

        println!("--- {model_name}: {elapsed:.2} seconds ---");
        info!(path = %output.display(), "✓ Image saved");
        Ok(())
    }
}

fn check_sd_flags(quantized: bool, loras: &[(Arc<LoraAdapter>, f32)]) -> Result<()> {
    if quantized {
        bail!("No quantized build is available for Stable Diffusion models");
    }
    if !loras.is_empty() {
        bail!("LoRA adapters are only supported for Flux models");
    }
    Ok(())
}

/// Convert a decoded image tensor `[1, 3, H, W]` with values in `[-1, 1]`
/// into an RGB image buffer.
pub fn rgb_image_from_tensor(tensor: &Tensor) -> Result<RgbImage> {
    let (_batch, channels, height, width) = tensor.dims4()?;
    if channels != 3 {
        bail!("Expected a 3 channel image tensor, got {channels} channels");
    }
    let image = tensor.clamp(-1f32, 1f32)?;
    let image = ((image + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
    let image = image.squeeze(0)?.permute((1, 2, 0))?;
    let pixels = image.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("Image buffer size mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn options() -> GenOptions {
        GenOptions::from_defaults(&GenDefaults {
            steps: 30,
            guidance: 7.0,
            width: 512,
            height: 512,
        })
    }

    #[test]
    fn defaults_carry_over() {
        let opts = options();
        assert_eq!(opts.steps, 30);
        assert_eq!(opts.guidance, 7.0);
        assert_eq!(opts.seed, 42);
        assert_eq!(opts.solver, SolverKind::EulerAncestral);
        assert!(opts.flux_schedule.is_none());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn dimensions_must_sit_on_the_latent_grid() {
        let mut opts = options();
        opts.width = 500;
        assert!(opts.validate().is_err());

        let mut opts = options();
        opts.height = 0;
        assert!(opts.validate().is_err());

        let mut opts = options();
        opts.steps = 0;
        assert!(opts.validate().is_err());

        let mut opts = options();
        opts.width = 1024;
        opts.height = 768;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn solver_names_parse() {
        assert_eq!("ddim".parse::<SolverKind>().unwrap(), SolverKind::Ddim);
        assert_eq!(
            "euler-a".parse::<SolverKind>().unwrap(),
            SolverKind::EulerAncestral
        );
        assert_eq!(
            "Euler-Ancestral".parse::<SolverKind>().unwrap(),
            SolverKind::EulerAncestral
        );
        assert!("dpm".parse::<SolverKind>().is_err());
    }

    #[test]
    fn schedule_names_parse() {
        assert_eq!("linear".parse::<FluxSchedule>().unwrap(), FluxSchedule::Linear);
        assert_eq!("shifted".parse::<FluxSchedule>().unwrap(), FluxSchedule::Shifted);
        assert!("auto".parse::<FluxSchedule>().is_err());
    }

    #[test]
    fn tensor_conversion_maps_value_range() {
        let device = Device::Cpu;
        // R channel at -1, G at 0, B at 1 for a 2x2 image.
        let mut values = Vec::new();
        values.extend(std::iter::repeat(-1f32).take(4));
        values.extend(std::iter::repeat(0f32).take(4));
        values.extend(std::iter::repeat(1f32).take(4));
        let tensor = Tensor::from_vec(values, (1, 3, 2, 2), &device).unwrap();

        let image = rgb_image_from_tensor(&tensor).unwrap();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0), &image::Rgb([0u8, 127, 255]));
        assert_eq!(image.get_pixel(1, 1), &image::Rgb([0u8, 127, 255]));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let device = Device::Cpu;
        let tensor = Tensor::from_vec(vec![-5f32, 5.0, 0.0], (1, 3, 1, 1), &device).unwrap();
        let image = rgb_image_from_tensor(&tensor).unwrap();
        assert_eq!(image.get_pixel(0, 0), &image::Rgb([0u8, 255, 127]));
    }

    #[test]
    fn non_rgb_tensor_is_rejected() {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((1, 4, 2, 2), candle_core::DType::F32, &device).unwrap();
        assert!(rgb_image_from_tensor(&tensor).is_err());
    }
}
