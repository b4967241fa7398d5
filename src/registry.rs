//! Catalog of the checkpoints the tool knows how to run locally.
//!
//! Each entry maps a hub repo id (and a couple of short aliases) to the
//! weight layout of its family and to the generation defaults the checkpoint
//! was tuned for. Ids that are not in the catalog can still be used: the
//! pipeline loader probes the repo first as Stable Diffusion, then as a
//! Flux finetune.

/// Families of local weight layouts the loader understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// UNet based latent diffusion with a single CLIP text encoder.
    StableDiffusion,
    /// Rectified flow MMDiT with CLIP-L, CLIP-G and T5 conditioning.
    StableDiffusion3,
    /// Flow matching transformer with T5 + CLIP conditioning.
    Flux,
}

/// Stable Diffusion checkpoint revisions with distinct configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1_5,
    V2_1,
}

/// Flux base variants. Finetunes keep the variant of their base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    /// Guidance distilled, 28 steps or more, shifted schedule.
    Dev,
    /// Timestep distilled, 4 steps, no guidance input.
    Schnell,
}

/// Where to find a quantized GGUF export of a Flux transformer.
#[derive(Debug, Clone, Copy)]
pub struct GgufSource {
    pub repo: &'static str,
    pub file: &'static str,
}

/// Weight layout of a Flux checkpoint on the hub.
///
/// Finetunes usually ship only the transformer and reuse the autoencoder,
/// text encoders and tokenizers of the base repo, so those are fetched from
/// `base_repo` while the transformer comes from the entry's own repo.
#[derive(Debug, Clone, Copy)]
pub struct FluxLayout {
    pub variant: FluxVariant,
    pub base_repo: &'static str,
    pub transformer_repo: &'static str,
    pub transformer_file: &'static str,
    pub gguf: Option<GgufSource>,
}

/// Weight layout of a Stable Diffusion 3 checkpoint.
///
/// The MMDiT transformer, both CLIP text encoders, T5-XXL and the
/// autoencoder ship as one bundled safetensors file in `weights_repo`;
/// the CLIP tokenizer vocabularies come from the diffusers layout repo
/// named by `tokenizer_repo`.
#[derive(Debug, Clone, Copy)]
pub struct Sd3Layout {
    pub tokenizer_repo: &'static str,
    pub weights_repo: &'static str,
    pub weights_file: &'static str,
}

/// Weight layout of a catalog entry.
#[derive(Debug, Clone, Copy)]
pub enum WeightLayout {
    Sd(SdVersion),
    Sd3(Sd3Layout),
    Flux(FluxLayout),
}

/// Generation settings a checkpoint was tuned for, used when the caller
/// does not override them.
#[derive(Debug, Clone, Copy)]
pub struct GenDefaults {
    pub steps: usize,
    pub guidance: f64,
    pub width: usize,
    pub height: usize,
}

/// One checkpoint the tool knows out of the box.
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub aliases: &'static [&'static str],
    pub layout: WeightLayout,
    pub defaults: GenDefaults,
}

impl CatalogEntry {
    pub fn family(&self) -> ModelFamily {
        match self.layout {
            WeightLayout::Sd(_) => ModelFamily::StableDiffusion,
            WeightLayout::Sd3(_) => ModelFamily::StableDiffusion3,
            WeightLayout::Flux(_) => ModelFamily::Flux,
        }
    }
}

pub const SD3_MEDIUM_REPO: &str = "stabilityai/stable-diffusion-3-medium-diffusers";
pub const FLUX_DEV_REPO: &str = "black-forest-labs/FLUX.1-dev";
pub const FLUX_SCHNELL_REPO: &str = "black-forest-labs/FLUX.1-schnell";

/// Checkpoints with known layouts and tuned defaults.
pub static MODEL_CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        id: "runwayml/stable-diffusion-v1-5",
        aliases: &["sd1.5", "stable-diffusion-v1-5"],
        layout: WeightLayout::Sd(SdVersion::V1_5),
        defaults: GenDefaults {
            steps: 30,
            guidance: 7.0,
            width: 512,
            height: 512,
        },
    },
    CatalogEntry {
        id: "stabilityai/stable-diffusion-2-1",
        aliases: &["sd2.1", "stable-diffusion-2-1"],
        layout: WeightLayout::Sd(SdVersion::V2_1),
        defaults: GenDefaults {
            steps: 30,
            guidance: 7.0,
            width: 768,
            height: 768,
        },
    },
    CatalogEntry {
        id: SD3_MEDIUM_REPO,
        aliases: &["sd3", "sd3-medium", "stable-diffusion-3-medium"],
        layout: WeightLayout::Sd3(Sd3Layout {
            tokenizer_repo: SD3_MEDIUM_REPO,
            weights_repo: "stabilityai/stable-diffusion-3-medium",
            weights_file: "sd3_medium_incl_clips_t5xxlfp16.safetensors",
        }),
        defaults: GenDefaults {
            steps: 28,
            guidance: 7.0,
            width: 1024,
            height: 1024,
        },
    },
    CatalogEntry {
        id: FLUX_DEV_REPO,
        aliases: &["flux-dev", "FLUX.1-dev"],
        layout: WeightLayout::Flux(FluxLayout {
            variant: FluxVariant::Dev,
            base_repo: FLUX_DEV_REPO,
            transformer_repo: FLUX_DEV_REPO,
            transformer_file: "flux1-dev.safetensors",
            gguf: Some(GgufSource {
                repo: "city96/FLUX.1-dev-gguf",
                file: "flux1-dev-Q8_0.gguf",
            }),
        }),
        defaults: GenDefaults {
            steps: 28,
            guidance: 3.5,
            width: 1024,
            height: 1024,
        },
    },
    CatalogEntry {
        id: FLUX_SCHNELL_REPO,
        aliases: &["flux-schnell", "FLUX.1-schnell"],
        layout: WeightLayout::Flux(FluxLayout {
            variant: FluxVariant::Schnell,
            base_repo: FLUX_SCHNELL_REPO,
            transformer_repo: FLUX_SCHNELL_REPO,
            transformer_file: "flux1-schnell.safetensors",
            gguf: Some(GgufSource {
                repo: "city96/FLUX.1-schnell-gguf",
                file: "flux1-schnell-Q8_0.gguf",
            }),
        }),
        defaults: GenDefaults {
            steps: 4,
            guidance: 0.0,
            width: 1024,
            height: 1024,
        },
    },
    CatalogEntry {
        id: "Shakker-Labs/AWPortrait-FL",
        aliases: &["awportrait", "AWPortrait-FL"],
        layout: WeightLayout::Flux(FluxLayout {
            variant: FluxVariant::Dev,
            base_repo: FLUX_DEV_REPO,
            transformer_repo: "Shakker-Labs/AWPortrait-FL",
            transformer_file: "AWPortrait-FL.safetensors",
            gguf: None,
        }),
        defaults: GenDefaults {
            steps: 24,
            guidance: 3.5,
            width: 768,
            height: 1024,
        },
    },
];

/// Result of looking a model id up in the catalog.
#[derive(Debug, Clone)]
pub enum ResolvedModel {
    Known(&'static CatalogEntry),
    /// Not in the catalog. The loader probes the repo with each family
    /// layout and keeps the first one that works.
    Unknown(String),
}

impl ResolvedModel {
    /// Hub repo id of the model, whichever way it resolved.
    pub fn id(&self) -> &str {
        match self {
            ResolvedModel::Known(entry) => entry.id,
            ResolvedModel::Unknown(id) => id,
        }
    }

    /// Short display name, also the stem of the default output file.
    pub fn name(&self) -> &str {
        model_name(self.id())
    }
}

/// Look up a model id or alias, case-insensitively for aliases.
pub fn resolve(name: &str) -> ResolvedModel {
    for entry in MODEL_CATALOG {
        if entry.id == name {
            return ResolvedModel::Known(entry);
        }
        if entry
            .aliases
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(name))
        {
            return ResolvedModel::Known(entry);
        }
    }
    ResolvedModel::Unknown(name.to_string())
}

/// Short name of a repo id: the part after the last `/`.
pub fn model_name(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}

/// Default output file for a model, `<model-name>.png` in the working
/// directory.
pub fn output_filename(id: &str) -> String {
    format!("{}.png", model_name(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_full_repo_id() {
        let resolved = resolve("stabilityai/stable-diffusion-2-1");
        match resolved {
            ResolvedModel::Known(entry) => {
                assert_eq!(entry.family(), ModelFamily::StableDiffusion);
                assert!(matches!(entry.layout, WeightLayout::Sd(SdVersion::V2_1)));
            }
            ResolvedModel::Unknown(_) => panic!("catalog entry not found"),
        }
    }

    #[test]
    fn resolves_alias_case_insensitively() {
        let resolved = resolve("FLUX-DEV");
        match resolved {
            ResolvedModel::Known(entry) => assert_eq!(entry.id, FLUX_DEV_REPO),
            ResolvedModel::Unknown(_) => panic!("alias not found"),
        }
    }

    #[test]
    fn unknown_id_passes_through() {
        let resolved = resolve("someone/some-finetune");
        assert_eq!(resolved.id(), "someone/some-finetune");
        assert!(matches!(resolved, ResolvedModel::Unknown(_)));
    }

    #[test]
    fn sd3_resolves_to_the_bundled_checkpoint() {
        // The diffusers repo id must resolve from the catalog: an
        // uncataloged SD3 repo has no unet/ directory for the fallback
        // loader to fetch.
        let ResolvedModel::Known(entry) = resolve(SD3_MEDIUM_REPO) else {
            panic!("catalog entry not found");
        };
        assert_eq!(entry.family(), ModelFamily::StableDiffusion3);
        let WeightLayout::Sd3(layout) = entry.layout else {
            panic!("expected sd3 layout");
        };
        assert_eq!(layout.weights_repo, "stabilityai/stable-diffusion-3-medium");
        assert_eq!(layout.weights_file, "sd3_medium_incl_clips_t5xxlfp16.safetensors");
        assert_eq!(layout.tokenizer_repo, entry.id);

        let ResolvedModel::Known(by_alias) = resolve("sd3") else {
            panic!("alias not found");
        };
        assert_eq!(by_alias.id, entry.id);
        assert_eq!(entry.defaults.steps, 28);
        assert_eq!(entry.defaults.guidance, 7.0);
    }

    #[test]
    fn finetune_reuses_base_components() {
        let ResolvedModel::Known(entry) = resolve("awportrait") else {
            panic!("alias not found");
        };
        let WeightLayout::Flux(layout) = entry.layout else {
            panic!("expected flux layout");
        };
        assert_eq!(layout.base_repo, FLUX_DEV_REPO);
        assert_eq!(layout.transformer_repo, "Shakker-Labs/AWPortrait-FL");
        assert!(layout.gguf.is_none());
    }

    #[test]
    fn schnell_defaults_skip_guidance() {
        let ResolvedModel::Known(entry) = resolve("flux-schnell") else {
            panic!("alias not found");
        };
        assert_eq!(entry.defaults.steps, 4);
        assert_eq!(entry.defaults.guidance, 0.0);
    }

    #[test]
    fn output_file_uses_short_name() {
        assert_eq!(
            output_filename("runwayml/stable-diffusion-v1-5"),
            "stable-diffusion-v1-5.png"
        );
        assert_eq!(output_filename("local-model"), "local-model.png");
    }

    #[test]
    fn catalog_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for entry in MODEL_CATALOG {
            assert!(seen.insert(entry.id), "duplicate catalog id {}", entry.id);
            for alias in entry.aliases {
                assert!(seen.insert(alias), "duplicate alias {alias}");
            }
        }
    }
}
