//! Text to image generation with Stable Diffusion and Flux
//!
//! One tool wrapping three local model families behind a shared pipeline
//! interface, built on the Candle ML framework, plus the small satellites
//! that grew around it: a prompt form server, a PNG to CSV flattener for
//! classifier training data, and a client for a managed prediction endpoint.
//!
//! ## Features
//!
//! - **Three model families**: Stable Diffusion 1.5/2.1, Stable Diffusion 3
//!   medium and FLUX.1 dev/schnell
//! - **Catalog + probing**: known checkpoints resolve by alias, unknown hub
//!   repos are probed as Stable Diffusion first, then as a Flux finetune
//! - **Quantized Flux**: GGUF transformer and T5 encoder for smaller VRAM
//! - **LoRA fusion**: adapters are fused into full precision Flux weights
//! - **Reproducible**: seed control for consistent results
//!
//! ## Usage
//!
//! ```rust,ignore
//! use text2img::download::ModelFetcher;
//! use text2img::pipeline::Pipeline;
//! use text2img::{device, registry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let model = registry::resolve("sd1.5");
//!     let fetcher = ModelFetcher::new(None)?;
//!     let device = device::select(false)?;
//!
//!     let mut pipeline = Pipeline::load(&model, &fetcher, &device, false, &[]).await?;
//!     let opts = pipeline.default_options(&model);
//!     pipeline.generate_to_file(
//!         model.name(),
//!         "a cat sitting on a windowsill",
//!         &opts,
//!         std::path::Path::new("cat.png"),
//!     )?;
//!
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod download;
pub mod flux;
pub mod img2csv;
pub mod lora;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod sd;
pub mod sd3;
pub mod serve;
pub mod token;
pub mod video;
