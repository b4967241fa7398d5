//! LoRA (Low-Rank Adaptation) weight loading.
//!
//! A LoRA file carries low-rank weight pairs that adjust a base model:
//! W' = W + (alpha/rank) * strength * (B @ A). This module loads those
//! pairs from safetensors and maps their layer keys, which vary across
//! training tools, onto the transformer's own tensor names so they can be
//! fused into the base weights at load time.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use tracing::{debug, info, warn};

/// Weight pair for a single adapted layer.
#[derive(Debug)]
pub struct LoraWeight {
    /// Transformer layer this pair applies to, e.g. `double_blocks.0.img_attn.qkv`.
    pub layer_name: String,
    /// Down projection (A), shape `[rank, in_features]`.
    pub lora_down: Tensor,
    /// Up projection (B), shape `[out_features, rank]`.
    pub lora_up: Tensor,
    /// Scaling numerator, defaults to the rank when the file has no alpha.
    pub alpha: f32,
    pub rank: usize,
}

impl LoraWeight {
    /// Multiplier applied to the weight delta: `(alpha / rank) * strength`.
    pub fn scale(&self, strength: f32) -> f64 {
        ((self.alpha / self.rank as f32) * strength) as f64
    }

    /// Full-rank weight delta `B @ A` in F32, shape `[out_features, in_features]`.
    pub fn delta(&self) -> Result<Tensor> {
        let up = self.lora_up.to_dtype(DType::F32)?;
        let down = self.lora_down.to_dtype(DType::F32)?;
        Ok(up.matmul(&down)?)
    }
}

/// All weight pairs of one LoRA file, keyed by normalized layer name.
#[derive(Debug)]
pub struct LoraAdapter {
    pub name: String,
    pub weights: HashMap<String, LoraWeight>,
}

impl LoraAdapter {
    /// Load a LoRA adapter from a safetensors file.
    ///
    /// Understands both kohya-style keys (`lora_unet_*` with `lora_down` /
    /// `lora_up`) and diffusers-style keys (`lora_A` / `lora_B`).
    pub fn load<P: AsRef<Path>>(
        path: P,
        name: String,
        device: &Device,
        dtype: DType,
    ) -> Result<Arc<Self>> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading LoRA adapter");

        let file_data = std::fs::read(path)
            .with_context(|| format!("Failed to read LoRA file: {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&file_data)
            .with_context(|| format!("Failed to parse safetensors: {}", path.display()))?;

        let mut alpha_values: HashMap<String, f32> = HashMap::new();
        let mut down_tensors: HashMap<String, Tensor> = HashMap::new();
        let mut up_tensors: HashMap<String, Tensor> = HashMap::new();

        for (key, _) in tensors.tensors() {
            if key.ends_with(".alpha") {
                let tensor = load_tensor_from_safetensors(&tensors, &key, device, dtype)?;
                // Move to CPU as F32 to read the scalar regardless of file dtype.
                let alpha = tensor
                    .to_dtype(DType::F32)?
                    .to_device(&Device::Cpu)?
                    .to_scalar::<f32>()?;
                let base_name = key.strip_suffix(".alpha").unwrap_or(&key);
                alpha_values.insert(normalize_lora_key(base_name), alpha);
            } else if key.contains(".lora_down.") || key.contains(".lora_A.") {
                let tensor = load_tensor_from_safetensors(&tensors, &key, device, dtype)?;
                let base_name = extract_lora_base_name(&key);
                down_tensors.insert(normalize_lora_key(&base_name), tensor);
            } else if key.contains(".lora_up.") || key.contains(".lora_B.") {
                let tensor = load_tensor_from_safetensors(&tensors, &key, device, dtype)?;
                let base_name = extract_lora_base_name(&key);
                up_tensors.insert(normalize_lora_key(&base_name), tensor);
            }
        }

        let mut weights = HashMap::new();
        for (layer_name, lora_down) in down_tensors {
            let Some(lora_up) = up_tensors.remove(&layer_name) else {
                warn!(layer = %layer_name, "LoRA down tensor without matching up tensor");
                continue;
            };
            let (rank, _) = lora_down
                .dims2()
                .with_context(|| format!("LoRA down tensor for {layer_name} is not a [rank, in_features] matrix"))?;
            let alpha = alpha_values.get(&layer_name).copied().unwrap_or(rank as f32);
            debug!(layer = %layer_name, rank, alpha, "Loaded LoRA weight pair");
            weights.insert(
                layer_name.clone(),
                LoraWeight {
                    layer_name,
                    lora_down,
                    lora_up,
                    alpha,
                    rank,
                },
            );
        }
        for layer_name in up_tensors.keys() {
            warn!(layer = %layer_name, "LoRA up tensor without matching down tensor");
        }

        info!(
            path = %path.display(),
            weight_pairs = weights.len(),
            "✓ LoRA adapter loaded"
        );
        Ok(Arc::new(Self { name, weights }))
    }

    pub fn weight_count(&self) -> usize {
        self.weights.len()
    }
}

/// Load a tensor from safetensors and convert to the target dtype.
fn load_tensor_from_safetensors(
    tensors: &SafeTensors,
    key: &str,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let view = tensors
        .tensor(key)
        .with_context(|| format!("Tensor not found: {key}"))?;

    let st_dtype = view.dtype();
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match st_dtype {
        safetensors::Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(floats, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let halfs: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let bhalfs: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(bhalfs, shape.as_slice(), device)?
        }
        _ => anyhow::bail!("Unsupported tensor dtype: {st_dtype:?}"),
    };

    Ok(tensor.to_dtype(dtype)?)
}

/// Strip the pair suffix from a LoRA key.
/// `lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight` ->
/// `lora_unet_double_blocks_0_img_attn_qkv`
fn extract_lora_base_name(key: &str) -> String {
    let key = key.strip_suffix(".weight").unwrap_or(key);
    for marker in [".lora_down", ".lora_up", ".lora_A", ".lora_B"] {
        if let Some(pos) = key.rfind(marker) {
            return key[..pos].to_string();
        }
    }
    key.to_string()
}

/// Segment pairs that form a single component of a transformer tensor name.
/// Needed because kohya keys flatten every `.` to `_`, which makes
/// `double_blocks.0.img_attn.qkv` indistinguishable from six segments.
const COMPOUND_SEGMENTS: &[(&str, &str)] = &[
    ("double", "blocks"),
    ("single", "blocks"),
    ("img", "attn"),
    ("txt", "attn"),
    ("img", "mlp"),
    ("txt", "mlp"),
    ("img", "mod"),
    ("txt", "mod"),
    ("img", "in"),
    ("txt", "in"),
    ("time", "in"),
    ("vector", "in"),
    ("guidance", "in"),
    ("in", "layer"),
    ("out", "layer"),
    ("final", "layer"),
];

/// Map a LoRA layer key onto the transformer's own tensor naming.
///
/// Kohya keys are fully underscore-flattened, e.g.
/// `lora_unet_double_blocks_0_img_attn_qkv` for the tensor
/// `double_blocks.0.img_attn.qkv`. Keys that already contain dots are kept
/// as-is apart from prefix stripping.
pub fn normalize_lora_key(key: &str) -> String {
    let mut stripped = key;
    for prefix in [
        "lora_unet_",
        "lora_transformer_",
        "lora_te1_",
        "lora_te2_",
        "lora_te_",
        "transformer.",
    ] {
        if let Some(rest) = stripped.strip_prefix(prefix) {
            stripped = rest;
            break;
        }
    }

    if stripped.contains('.') {
        return stripped.to_string();
    }

    let parts: Vec<&str> = stripped.split('_').collect();
    let mut segments = Vec::new();
    let mut i = 0;
    while i < parts.len() {
        if i + 1 < parts.len() && COMPOUND_SEGMENTS.contains(&(parts[i], parts[i + 1])) {
            segments.push(format!("{}_{}", parts[i], parts[i + 1]));
            i += 2;
        } else {
            segments.push(parts[i].to_string());
            i += 1;
        }
    }
    segments.join(".")
}

/// Checkpoint tensor name holding the base weight of a normalized layer.
pub fn weight_tensor_name(layer: &str) -> String {
    format!("{layer}.weight")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kohya_keys_map_to_transformer_names() {
        assert_eq!(
            normalize_lora_key("lora_unet_double_blocks_0_img_attn_qkv"),
            "double_blocks.0.img_attn.qkv"
        );
        assert_eq!(
            normalize_lora_key("lora_unet_single_blocks_17_linear1"),
            "single_blocks.17.linear1"
        );
        assert_eq!(
            normalize_lora_key("lora_unet_double_blocks_3_txt_mlp_2"),
            "double_blocks.3.txt_mlp.2"
        );
        assert_eq!(
            normalize_lora_key("lora_unet_double_blocks_7_img_mod_lin"),
            "double_blocks.7.img_mod.lin"
        );
        assert_eq!(
            normalize_lora_key("lora_unet_final_layer_linear"),
            "final_layer.linear"
        );
        assert_eq!(
            normalize_lora_key("lora_unet_time_in_in_layer"),
            "time_in.in_layer"
        );
    }

    #[test]
    fn dotted_keys_only_lose_their_prefix() {
        assert_eq!(
            normalize_lora_key("transformer.single_blocks.0.linear2"),
            "single_blocks.0.linear2"
        );
        assert_eq!(
            normalize_lora_key("double_blocks.3.img_attn.proj"),
            "double_blocks.3.img_attn.proj"
        );
    }

    #[test]
    fn base_name_extraction_handles_both_conventions() {
        assert_eq!(
            extract_lora_base_name("lora_unet_double_blocks_0_img_attn_qkv.lora_down.weight"),
            "lora_unet_double_blocks_0_img_attn_qkv"
        );
        assert_eq!(extract_lora_base_name("some_layer.lora_up.weight"), "some_layer");
        assert_eq!(extract_lora_base_name("layer.lora_A.weight"), "layer");
        assert_eq!(extract_lora_base_name("layer.lora_B.weight"), "layer");
    }

    #[test]
    fn weight_name_appends_suffix() {
        assert_eq!(
            weight_tensor_name("double_blocks.0.img_attn.qkv"),
            "double_blocks.0.img_attn.qkv.weight"
        );
    }

    #[test]
    fn scale_combines_alpha_rank_and_strength() {
        let device = Device::Cpu;
        let weight = LoraWeight {
            layer_name: "single_blocks.0.linear1".to_string(),
            lora_down: Tensor::zeros((4, 8), DType::F32, &device).unwrap(),
            lora_up: Tensor::zeros((8, 4), DType::F32, &device).unwrap(),
            alpha: 8.0,
            rank: 4,
        };
        assert_eq!(weight.scale(0.5), 1.0);
        assert_eq!(weight.scale(1.0), 2.0);
    }

    #[test]
    fn delta_is_the_up_down_product() {
        let device = Device::Cpu;
        let down = Tensor::new(&[[1f32, 2.0, 3.0]], &device).unwrap();
        let up = Tensor::new(&[[1f32], [2.0]], &device).unwrap();
        let weight = LoraWeight {
            layer_name: "t".to_string(),
            lora_down: down,
            lora_up: up,
            alpha: 1.0,
            rank: 1,
        };
        let delta = weight.delta().unwrap();
        assert_eq!(delta.dims(), &[2, 3]);
        let values: Vec<Vec<f32>> = delta.to_vec2().unwrap();
        assert_eq!(values, vec![vec![1.0, 2.0, 3.0], vec![2.0, 4.0, 6.0]]);
    }

    #[test]
    fn scalar_down_tensor_is_a_load_error() {
        use safetensors::tensor::TensorView;

        // A corrupt adapter whose down tensor is 0-dimensional.
        let down_data = 1f32.to_le_bytes();
        let up_data: Vec<u8> = [0f32; 4].iter().flat_map(|v| v.to_le_bytes()).collect();
        let tensors = vec![
            (
                "lora_unet_single_blocks_0_linear1.lora_down.weight".to_string(),
                TensorView::new(safetensors::Dtype::F32, vec![], &down_data).unwrap(),
            ),
            (
                "lora_unet_single_blocks_0_linear1.lora_up.weight".to_string(),
                TensorView::new(safetensors::Dtype::F32, vec![4, 1], &up_data).unwrap(),
            ),
        ];
        let bytes = safetensors::serialize(tensors, &None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        std::fs::write(&path, bytes).unwrap();

        let result = LoraAdapter::load(&path, "broken".to_string(), &Device::Cpu, DType::F32);
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("LoRA down tensor"), "{message}");
        assert!(message.contains("single_blocks.0.linear1"), "{message}");
    }
}
