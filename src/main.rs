//! CLI entry point for the text2img generation tool

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::DType;
use clap::{Args, Parser, Subcommand};
use text2img::download::ModelFetcher;
use text2img::flux::FluxSchedule;
use text2img::lora::LoraAdapter;
use text2img::pipeline::{GenOptions, Pipeline, SolverKind};
use text2img::registry::{self, FluxVariant, ResolvedModel, WeightLayout};
use text2img::remote::{self, HostedClient, HostedParams};
use text2img::video::VideoOptions;
use text2img::{device, img2csv, serve, token, video};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "text2img")]
#[command(version = "0.1.0")]
#[command(about = "Text to image generation with Stable Diffusion and Flux", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Model selection flags shared by the local generation commands.
#[derive(Args)]
struct ModelArgs {
    /// Model id or catalog alias
    ///
    /// Cataloged: sd1.5, sd2.1, sd3, flux-dev, flux-schnell, awportrait.
    /// Any other hub repo id is probed as Stable Diffusion first, then as
    /// a Flux dev finetune.
    #[arg(short, long, default_value = "sd1.5")]
    model: String,

    /// Use the quantized GGUF transformer (Flux only)
    #[arg(short, long)]
    quantized: bool,

    /// File holding a HuggingFace Hub token
    ///
    /// Overrides the HF_TOKEN environment variable. Needed for gated
    /// checkpoints such as FLUX.1-dev and Stable Diffusion 3.
    #[arg(long)]
    hf_token_file: Option<PathBuf>,
}

/// Sampling flags shared by `generate` and `video`.
#[derive(Args)]
struct SamplingArgs {
    /// Denoising steps (model default when unset)
    #[arg(long)]
    steps: Option<usize>,

    /// Guidance scale (model default when unset)
    ///
    /// For Stable Diffusion, values at or below 1.0 disable
    /// classifier-free guidance. For FLUX.1-dev this is the distilled
    /// guidance input; schnell ignores it.
    #[arg(long)]
    guidance: Option<f64>,

    /// Output width in pixels, must be a multiple of 64
    #[arg(long)]
    width: Option<usize>,

    /// Output height in pixels, must be a multiple of 64
    #[arg(long)]
    height: Option<usize>,

    /// Random seed for reproducibility
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Negative prompt (Stable Diffusion families; Flux ignores it)
    #[arg(long)]
    negative_prompt: Option<String>,

    /// Solver for Stable Diffusion sampling: ddim or euler-a
    #[arg(long, default_value = "euler-a")]
    solver: SolverKind,

    /// Flux timestep schedule: linear or shifted (variant default when unset)
    #[arg(long)]
    schedule: Option<FluxSchedule>,

    /// Path to a LoRA safetensors file, repeatable
    ///
    /// Adapters are fused into the transformer weights, so they require
    /// a full precision Flux model.
    #[arg(short, long)]
    lora: Vec<PathBuf>,

    /// LoRA strength (0.0-2.0)
    ///
    /// - 0.0 = no effect
    /// - 1.0 = full strength (recommended)
    /// - 1.5-2.0 = amplified effect
    #[arg(long, default_value = "1.0")]
    lora_strength: f32,

    /// Run on the CPU even when an accelerator is available
    #[arg(long)]
    cpu: bool,
}

/// Flags for the managed prediction endpoint.
#[derive(Args)]
struct RemoteArgs {
    /// Text prompt
    #[arg(short, long)]
    prompt: String,

    /// Cloud project id
    #[arg(long)]
    project: Option<String>,

    /// Endpoint region
    #[arg(long, default_value = "us-central1")]
    location: String,

    /// Published model to call
    #[arg(short, long, default_value = "imagen-3.0-generate-001")]
    model: String,

    /// Full endpoint URL, overrides --project/--location/--model
    #[arg(long)]
    endpoint: Option<String>,

    /// File holding the bearer token
    ///
    /// Falls back to the REMOTE_ACCESS_TOKEN environment variable.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Number of images to request
    #[arg(long, default_value = "1")]
    count: u32,

    /// Aspect ratio of the requested images
    #[arg(long, default_value = "1:1")]
    aspect_ratio: String,

    /// Safety filter level forwarded to the endpoint
    #[arg(long, default_value = "block_some")]
    safety_filter: String,

    /// Person generation policy forwarded to the endpoint
    #[arg(long, default_value = "allow_adult")]
    person_generation: String,

    /// Directory the output images are written into
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the weights for a cataloged model
    ///
    /// Fetches everything the model needs from the HuggingFace Hub into
    /// the local hub cache: tokenizers, text encoders, autoencoder and
    /// the transformer or UNet. Later runs reuse the cache.
    Download {
        #[command(flatten)]
        model: ModelArgs,
    },

    /// Generate images from text prompts
    ///
    /// With --prompt a single image is generated. Without it, prompts are
    /// read interactively from stdin until end of file, one image per
    /// line, each overwriting the output file.
    Generate {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// Text prompt (interactive stdin loop when unset)
        #[arg(short, long)]
        prompt: Option<String>,

        /// Output PNG path (defaults to <model-name>.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a short looping clip from one prompt
    ///
    /// Renders one still per frame, advancing the seed each time, and
    /// assembles the frames into an animated GIF.
    Video {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        sampling: SamplingArgs,

        /// Text prompt (read from stdin when unset)
        #[arg(short, long)]
        prompt: Option<String>,

        /// Number of frames to render
        #[arg(long, default_value = "24")]
        frames: usize,

        /// Playback speed of the clip
        #[arg(long, default_value = "8")]
        fps: u32,

        /// Output GIF path
        #[arg(short, long, default_value = video::DEFAULT_OUTPUT)]
        output: PathBuf,
    },

    /// Flatten a directory of PNG images into CSV training rows
    ///
    /// Each image becomes one row: every pixel as three channel values,
    /// with the label appended as the last field. The output file is
    /// replaced on every run.
    Img2csv {
        /// Directory scanned recursively for .png files
        #[arg(short, long, default_value = img2csv::DEFAULT_DIR)]
        dir: PathBuf,

        /// Output CSV path
        #[arg(short, long, default_value = img2csv::DEFAULT_OUTPUT)]
        output: PathBuf,

        /// Label written as the last field of every row
        #[arg(short, long, default_value = img2csv::DEFAULT_LABEL)]
        label: String,
    },

    /// Serve the HTML prompt form
    Serve {
        /// Bind address
        #[arg(long, default_value = serve::DEFAULT_HOST)]
        host: String,

        /// Bind port
        #[arg(long, default_value_t = serve::DEFAULT_PORT)]
        port: u16,
    },

    /// Generate through a managed prediction endpoint
    ///
    /// Sends the prompt to a hosted image model over HTTPS and saves the
    /// returned images as output-image.png, output-image-2.png, and so on.
    Remote {
        #[command(flatten)]
        args: RemoteArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Download { model } => run_download(model).await,

        Commands::Generate {
            model,
            sampling,
            prompt,
            output,
        } => run_generate(model, sampling, prompt, output).await,

        Commands::Video {
            model,
            sampling,
            prompt,
            frames,
            fps,
            output,
        } => run_video(model, sampling, prompt, frames, fps, output).await,

        Commands::Img2csv { dir, output, label } => {
            let summary = img2csv::convert_dir(&dir, &output, &label)?;
            println!(
                "✓ Converted {} images into {}",
                summary.rows,
                output.display()
            );
            Ok(())
        }

        Commands::Serve { host, port } => serve::run(&host, port).await,

        Commands::Remote { args } => run_remote(args).await,
    }
}

async fn run_download(model_args: ModelArgs) -> Result<()> {
    let model = registry::resolve(&model_args.model);
    let entry = match &model {
        ResolvedModel::Known(entry) => entry,
        ResolvedModel::Unknown(id) => {
            eprintln!("❌ Error: {id} is not in the model catalog");
            eprintln!();
            eprintln!("Cataloged models:");
            for entry in registry::MODEL_CATALOG {
                eprintln!("  {:<40} ({})", entry.id, entry.aliases.join(", "));
            }
            eprintln!();
            eprintln!("Uncataloged repos are downloaded on demand by `generate`.");
            std::process::exit(1);
        }
    };

    println!();
    println!("Fetching weights for {} from the HuggingFace Hub", entry.id);
    let gated_repo = match &entry.layout {
        WeightLayout::Flux(layout) if layout.variant == FluxVariant::Dev => Some(layout.base_repo),
        WeightLayout::Sd3(layout) => Some(layout.weights_repo),
        _ => None,
    };
    if let Some(repo) = gated_repo {
        println!();
        println!(
            "⚠️  {} weights are gated. You need to:",
            registry::model_name(repo)
        );
        println!("  1. Accept the license at: https://huggingface.co/{repo}");
        println!("  2. Set HF_TOKEN or pass --hf-token-file");
        println!("  3. Get a token from: https://huggingface.co/settings/tokens");
    }
    println!();

    let hub_token = token::resolve_hub_token(model_args.hf_token_file.as_deref())?;
    let fetcher = ModelFetcher::new(hub_token)?;
    match &entry.layout {
        WeightLayout::Sd(_) => {
            let files = fetcher.fetch_sd(entry.id).await?;
            print_file_locations(&files.describe());
        }
        WeightLayout::Sd3(layout) => {
            let files = fetcher.fetch_sd3(layout.into()).await?;
            print_file_locations(&files.describe());
        }
        WeightLayout::Flux(layout) => {
            let files = fetcher
                .fetch_flux(layout.into(), model_args.quantized)
                .await?;
            print_file_locations(&files.describe());
        }
    }
    Ok(())
}

fn print_file_locations(files: &[(&'static str, &PathBuf)]) {
    println!();
    println!("✓ All files downloaded");
    println!();
    println!("File locations:");
    for (label, path) in files {
        println!("  {label:<12} {}", path.display());
    }
    println!();
}

async fn run_generate(
    model_args: ModelArgs,
    sampling: SamplingArgs,
    prompt: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let model = registry::resolve(&model_args.model);
    let (mut pipeline, opts) = load_pipeline(&model, &model_args, &sampling).await?;

    let output = output.unwrap_or_else(|| PathBuf::from(registry::output_filename(model.id())));
    let name = model.name();

    match prompt {
        Some(prompt) => pipeline.generate_to_file(name, &prompt, &opts, &output),
        None => prompt_loop(&mut pipeline, name, &opts, &output),
    }
}

async fn run_video(
    model_args: ModelArgs,
    sampling: SamplingArgs,
    prompt: Option<String>,
    frames: usize,
    fps: u32,
    output: PathBuf,
) -> Result<()> {
    let model = registry::resolve(&model_args.model);
    let (mut pipeline, mut opts) = load_pipeline(&model, &model_args, &sampling).await?;
    if sampling.steps.is_none() && matches!(pipeline, Pipeline::StableDiffusion(_)) {
        opts.steps = video::DEFAULT_STEPS;
    }

    let name = model.name();
    let prompt = match prompt {
        Some(prompt) => prompt,
        None => read_prompt(name)?,
    };

    let video_opts = VideoOptions { frames, fps };
    video::generate_to_file(&mut pipeline, name, &prompt, &opts, &video_opts, &output)
}

async fn run_remote(args: RemoteArgs) -> Result<()> {
    let endpoint = match (args.endpoint, args.project) {
        (Some(endpoint), _) => endpoint,
        (None, Some(project)) => remote::endpoint_for(&project, &args.location, &args.model),
        (None, None) => {
            eprintln!("❌ Error: pass --endpoint or --project to pick the endpoint");
            std::process::exit(1);
        }
    };

    let access_token = token::resolve_remote_token(args.token_file.as_deref())?;
    let client = HostedClient::new(endpoint, access_token);
    let params = HostedParams {
        sample_count: args.count,
        aspect_ratio: args.aspect_ratio,
        safety_filter_level: args.safety_filter,
        person_generation: args.person_generation,
    };

    let paths = client
        .generate_to_files(&args.prompt, &params, &args.output_dir)
        .await?;
    println!();
    println!("✓ Saved {} image(s):", paths.len());
    for path in &paths {
        println!("  {}", path.display());
    }
    Ok(())
}

/// Load the pipeline for a model and fold flag overrides into its default
/// generation options.
async fn load_pipeline(
    model: &ResolvedModel,
    model_args: &ModelArgs,
    sampling: &SamplingArgs,
) -> Result<(Pipeline, GenOptions)> {
    // Reject bad flag values before any multi-gigabyte download starts
    for (name, value) in [("width", sampling.width), ("height", sampling.height)] {
        if let Some(value) = value {
            if value == 0 || value % 64 != 0 {
                eprintln!("❌ Error: {name} must be a positive multiple of 64, got {value}");
                std::process::exit(1);
            }
        }
    }
    if sampling.steps == Some(0) {
        eprintln!("❌ Error: steps must be at least 1");
        std::process::exit(1);
    }

    // Validate LoRA files exist
    for path in &sampling.lora {
        if !path.exists() {
            eprintln!("❌ Error: LoRA file not found: {}", path.display());
            eprintln!();
            eprintln!("Where to find FLUX LoRAs:");
            eprintln!("  • CivitAI: https://civitai.com/models?types=LORA&baseModels=Flux.1%20D");
            eprintln!("  • HuggingFace: https://huggingface.co/models?search=flux+lora");
            std::process::exit(1);
        }
    }
    if sampling.lora_strength < 0.0 || sampling.lora_strength > 2.0 {
        eprintln!(
            "⚠️  Warning: LoRA strength {} is outside recommended range [0.0, 2.0]",
            sampling.lora_strength
        );
    }

    device::describe_cuda_devices();
    let device = device::select(sampling.cpu)?;
    println!("✓ Using device: {device:?}");

    let loras = sampling
        .lora
        .iter()
        .map(|path| {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "adapter".to_string());
            LoraAdapter::load(path, name, &device, DType::F32)
                .map(|adapter| (adapter, sampling.lora_strength))
        })
        .collect::<Result<Vec<_>>>()?;

    let hub_token = token::resolve_hub_token(model_args.hf_token_file.as_deref())?;
    let fetcher = ModelFetcher::new(hub_token)?;
    let pipeline = Pipeline::load(model, &fetcher, &device, model_args.quantized, &loras).await?;

    let mut opts = pipeline.default_options(model);
    if let Some(steps) = sampling.steps {
        opts.steps = steps;
    }
    if let Some(guidance) = sampling.guidance {
        opts.guidance = guidance;
    }
    if let Some(width) = sampling.width {
        opts.width = width;
    }
    if let Some(height) = sampling.height {
        opts.height = height;
    }
    opts.seed = sampling.seed;
    opts.negative_prompt = sampling.negative_prompt.clone();
    opts.solver = sampling.solver;
    opts.flux_schedule = sampling.schedule;

    Ok((pipeline, opts))
}

/// Read prompts from stdin until end of file, generating one image per
/// non-empty line.
fn prompt_loop(
    pipeline: &mut Pipeline,
    name: &str,
    opts: &GenOptions,
    output: &Path,
) -> Result<()> {
    let stdin = std::io::stdin();
    let mut line = String::new();
    loop {
        print!("{name}> ");
        std::io::stdout().flush()?;
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        pipeline.generate_to_file(name, prompt, opts, output)?;
    }
}

/// One blocking console read with the model name as the prompt.
fn read_prompt(name: &str) -> Result<String> {
    print!("{name}> ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let prompt = line.trim();
    if prompt.is_empty() {
        anyhow::bail!("Empty prompt");
    }
    Ok(prompt.to_string())
}
