//! Checkpoint downloads from the Hugging Face Hub.
//!
//! Files land in the hub cache and are reused across runs, so "download" is
//! a no-op after the first call. Stable Diffusion repos ship the diffusers
//! layout (tokenizer, text encoder, VAE and UNet as separate files);
//! Stable Diffusion 3 bundles every model into one checkpoint file with
//! only tokenizers fetched separately; Flux repos ship a single transformer
//! file next to the autoencoder and both text encoder tokenizers, with the
//! T5 encoder itself pulled as a quantized GGUF from a community repo.

use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use tracing::info;

use crate::registry::{FluxLayout, GgufSource, Sd3Layout};

/// Repo and file for the quantized T5-XXL encoder (~9GB). The full precision
/// encoder is another 40GB and adds nothing for conditioning.
const T5_GGUF_REPO: &str = "city96/t5-v1_1-xxl-encoder-gguf";
const T5_GGUF_FILE: &str = "t5-v1_1-xxl-encoder-Q8_0.gguf";

/// The SD3 checkpoint bundles the T5 weights but no tokenizer; this export
/// carries the v1.1-xxl tokenizer as a single ungated json file.
const T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
const T5_TOKENIZER_FILE: &str = "t5-v1_1-xxl.tokenizer.json";

/// Hub locations of one Flux checkpoint's pieces.
///
/// Catalog entries convert into this; repos outside the catalog build it
/// directly with borrowed ids.
#[derive(Debug, Clone, Copy)]
pub struct FluxSources<'a> {
    pub base_repo: &'a str,
    pub transformer_repo: &'a str,
    pub transformer_file: &'a str,
    pub gguf: Option<GgufSource>,
}

impl<'a> From<&'a FluxLayout> for FluxSources<'a> {
    fn from(layout: &'a FluxLayout) -> Self {
        Self {
            base_repo: layout.base_repo,
            transformer_repo: layout.transformer_repo,
            transformer_file: layout.transformer_file,
            gguf: layout.gguf,
        }
    }
}

/// Hub locations of one Stable Diffusion 3 checkpoint's pieces.
#[derive(Debug, Clone, Copy)]
pub struct Sd3Sources<'a> {
    pub tokenizer_repo: &'a str,
    pub weights_repo: &'a str,
    pub weights_file: &'a str,
}

impl<'a> From<&'a Sd3Layout> for Sd3Sources<'a> {
    fn from(layout: &'a Sd3Layout) -> Self {
        Self {
            tokenizer_repo: layout.tokenizer_repo,
            weights_repo: layout.weights_repo,
            weights_file: layout.weights_file,
        }
    }
}

/// Hub client used by every download in the tool.
pub struct ModelFetcher {
    api: Api,
}

impl ModelFetcher {
    /// Create a fetcher, authenticating with the given token when present.
    pub fn new(token: Option<String>) -> Result<Self> {
        let api = match token {
            Some(token) => ApiBuilder::new()
                .with_token(Some(token))
                .build()
                .context("Failed to create Hub API client")?,
            None => Api::new().context("Failed to create Hub API client")?,
        };
        Ok(Self { api })
    }

    async fn get(&self, repo_id: &str, file: &str) -> Result<PathBuf> {
        let repo = self.api.repo(hf_hub::Repo::model(repo_id.to_string()));
        let path = repo
            .get(file)
            .await
            .with_context(|| format!("Failed to download {repo_id}/{file}"))?;
        info!("  ✓ {}/{}: {}", repo_id, file, path.display());
        Ok(path)
    }

    /// Download everything a Stable Diffusion checkpoint needs.
    ///
    /// Roughly 5GB for v1.5 class repos. Files download in parallel.
    pub async fn fetch_sd(&self, repo_id: &str) -> Result<SdFiles> {
        info!("Downloading Stable Diffusion weights from {repo_id}");

        let (clip_vocab, clip_merges, clip_weights, vae_weights, unet_weights) = tokio::try_join!(
            self.get(repo_id, "tokenizer/vocab.json"),
            self.get(repo_id, "tokenizer/merges.txt"),
            self.get(repo_id, "text_encoder/model.safetensors"),
            self.get(repo_id, "vae/diffusion_pytorch_model.safetensors"),
            self.get(repo_id, "unet/diffusion_pytorch_model.safetensors"),
        )?;

        Ok(SdFiles {
            clip_vocab,
            clip_merges,
            clip_weights,
            vae_weights,
            unet_weights,
        })
    }

    /// Download everything a Stable Diffusion 3 checkpoint needs.
    ///
    /// The bundled checkpoint (~15GB) carries MMDiT, both CLIP encoders,
    /// T5-XXL and the VAE; only tokenizer files come from other repos.
    pub async fn fetch_sd3(&self, sources: Sd3Sources<'_>) -> Result<Sd3Files> {
        info!(
            "Downloading Stable Diffusion 3 weights from {} (tokenizers from {})",
            sources.weights_repo, sources.tokenizer_repo
        );

        let (weights, clip_l_vocab, clip_l_merges, clip_g_vocab, clip_g_merges, t5_tokenizer) =
            tokio::try_join!(
                self.get(sources.weights_repo, sources.weights_file),
                self.get(sources.tokenizer_repo, "tokenizer/vocab.json"),
                self.get(sources.tokenizer_repo, "tokenizer/merges.txt"),
                self.get(sources.tokenizer_repo, "tokenizer_2/vocab.json"),
                self.get(sources.tokenizer_repo, "tokenizer_2/merges.txt"),
                self.get(T5_TOKENIZER_REPO, T5_TOKENIZER_FILE),
            )?;

        Ok(Sd3Files {
            weights,
            clip_l_vocab,
            clip_l_merges,
            clip_g_vocab,
            clip_g_merges,
            t5_tokenizer,
        })
    }

    /// Download everything a Flux checkpoint needs.
    ///
    /// The transformer is ~24GB in full precision or ~12GB as Q8_0 GGUF;
    /// T5 adds ~9GB and the rest is about 1GB. First download takes a while.
    pub async fn fetch_flux(&self, sources: FluxSources<'_>, quantized: bool) -> Result<FluxFiles> {
        info!(
            "Downloading Flux weights from {} (components from {})",
            sources.transformer_repo, sources.base_repo
        );

        let transformer = async {
            if quantized {
                let gguf = sources
                    .gguf
                    .context("No quantized GGUF export is known for this model")?;
                self.get(gguf.repo, gguf.file).await
            } else {
                self.get(sources.transformer_repo, sources.transformer_file)
                    .await
            }
        };

        let (transformer, t5_gguf, t5_tokenizer, clip_weights, clip_vocab, clip_merges, vae_weights) =
            tokio::try_join!(
                transformer,
                self.get(T5_GGUF_REPO, T5_GGUF_FILE),
                self.get(sources.base_repo, "tokenizer_2/tokenizer.json"),
                self.get(sources.base_repo, "text_encoder/model.safetensors"),
                self.get(sources.base_repo, "tokenizer/vocab.json"),
                self.get(sources.base_repo, "tokenizer/merges.txt"),
                self.get(sources.base_repo, "ae.safetensors"),
            )?;

        Ok(FluxFiles {
            transformer,
            quantized,
            t5_gguf,
            t5_tokenizer,
            clip_weights,
            clip_vocab,
            clip_merges,
            vae_weights,
        })
    }
}

/// Local paths of a Stable Diffusion checkpoint.
#[derive(Debug, Clone)]
pub struct SdFiles {
    pub clip_vocab: PathBuf,
    pub clip_merges: PathBuf,
    pub clip_weights: PathBuf,
    pub vae_weights: PathBuf,
    pub unet_weights: PathBuf,
}

impl SdFiles {
    pub fn describe(&self) -> Vec<(&'static str, &PathBuf)> {
        vec![
            ("CLIP vocab", &self.clip_vocab),
            ("CLIP merges", &self.clip_merges),
            ("CLIP encoder", &self.clip_weights),
            ("VAE", &self.vae_weights),
            ("UNet", &self.unet_weights),
        ]
    }
}

/// Local paths of a Stable Diffusion 3 checkpoint.
#[derive(Debug, Clone)]
pub struct Sd3Files {
    /// Single file bundling MMDiT, CLIP-L, CLIP-G, T5-XXL and the VAE.
    pub weights: PathBuf,
    pub clip_l_vocab: PathBuf,
    pub clip_l_merges: PathBuf,
    pub clip_g_vocab: PathBuf,
    pub clip_g_merges: PathBuf,
    pub t5_tokenizer: PathBuf,
}

impl Sd3Files {
    pub fn describe(&self) -> Vec<(&'static str, &PathBuf)> {
        vec![
            ("Checkpoint", &self.weights),
            ("CLIP-L vocab", &self.clip_l_vocab),
            ("CLIP-L merges", &self.clip_l_merges),
            ("CLIP-G vocab", &self.clip_g_vocab),
            ("CLIP-G merges", &self.clip_g_merges),
            ("T5 tokenizer", &self.t5_tokenizer),
        ]
    }
}

/// Local paths of a Flux checkpoint.
#[derive(Debug, Clone)]
pub struct FluxFiles {
    /// Transformer weights, safetensors or GGUF depending on `quantized`.
    pub transformer: PathBuf,
    pub quantized: bool,
    pub t5_gguf: PathBuf,
    pub t5_tokenizer: PathBuf,
    pub clip_weights: PathBuf,
    pub clip_vocab: PathBuf,
    pub clip_merges: PathBuf,
    pub vae_weights: PathBuf,
}

impl FluxFiles {
    pub fn describe(&self) -> Vec<(&'static str, &PathBuf)> {
        vec![
            (
                if self.quantized {
                    "Transformer (Q8_0)"
                } else {
                    "Transformer (BF16)"
                },
                &self.transformer,
            ),
            ("T5-XXL (Q8_0)", &self.t5_gguf),
            ("T5 tokenizer", &self.t5_tokenizer),
            ("CLIP encoder", &self.clip_weights),
            ("CLIP vocab", &self.clip_vocab),
            ("CLIP merges", &self.clip_merges),
            ("VAE", &self.vae_weights),
        ]
    }
}
