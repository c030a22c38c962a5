//! Checkpoint conversion with a ladder of fallback strategies.
//!
//! In order: an in-process quantized conversion to GGUF (skipped when
//! quantization is disabled), an in-process bf16 -> fp16 safetensors
//! conversion, and finally an out-of-process `mlx_lm.convert` invocation.
//! The output directory is cleared before every attempt so a failed strategy
//! never leaves partial output behind.

use anyhow::{Context, Result};
use candle::quantized::{gguf_file, GgmlDType, QTensor};
use candle::{DType, Device, Tensor};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::request::{ConvertRequest, QuantParams, Quantization};
use crate::workspace::{self, Workspace};

/// GGML quantization block size; matrices whose trailing dimension is not a
/// multiple of this stay in f32.
const GGML_BLOCK_SIZE: usize = 32;

/// Support files copied verbatim from the snapshot into the output.
const SUPPORT_FILES: &[&str] = &[
    "config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "tokenizer.model",
    "special_tokens_map.json",
    "generation_config.json",
];

/// Best-effort environment check: is the external fallback converter on
/// PATH? A missing converter is only a problem when both in-process
/// strategies fail, so this just informs the operator early.
pub fn probe_external_converter() -> bool {
    Command::new("mlx_lm.convert")
        .arg("--help")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Runs the strategy ladder. Returns the label of the strategy that
/// produced the output, for reporting.
pub fn convert(request: &ConvertRequest, ws: &Workspace) -> Result<&'static str> {
    let mut failures: Vec<String> = Vec::new();

    if let Quantization::Enabled(params) = request.quantization {
        workspace::clear_dir(&ws.output_dir)?;
        match quantized_convert(&ws.source_dir, &ws.output_dir, params) {
            Ok(()) => return Ok("in-process quantized"),
            Err(err) => {
                tracing::warn!(?err, "quantized conversion failed, trying without quantization");
                failures.push(format!("quantized: {err:#}"));
            }
        }
    }

    workspace::clear_dir(&ws.output_dir)?;
    match plain_convert(&ws.source_dir, &ws.output_dir) {
        Ok(()) => return Ok("in-process fp16"),
        Err(err) => {
            tracing::warn!(?err, "in-process conversion failed, trying external converter");
            failures.push(format!("fp16: {err:#}"));
        }
    }

    workspace::clear_dir(&ws.output_dir)?;
    match external_convert(request, ws) {
        Ok(()) => return Ok("external mlx_lm.convert"),
        Err(err) => {
            failures.push(format!("external: {err:#}"));
        }
    }

    workspace::clear_dir(&ws.output_dir)?;
    anyhow::bail!("all conversion strategies failed: {}", failures.join("; "))
}

/// Resolves the checkpoint shards: either the files referenced by
/// `model.safetensors.index.json` or every `*.safetensors` in the snapshot.
fn shard_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let index = dir.join("model.safetensors.index.json");
    if index.exists() {
        #[derive(serde::Deserialize)]
        struct Index {
            weight_map: HashMap<String, String>,
        }
        let index: Index = serde_json::from_str(&fs::read_to_string(&index)?)
            .context("parsing model.safetensors.index.json")?;
        let mut names: Vec<String> = index.weight_map.into_values().collect();
        names.sort();
        names.dedup();
        return Ok(names.into_iter().map(|n| dir.join(n)).collect());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    paths.sort();
    Ok(paths)
}

fn load_all_tensors(dir: &Path) -> Result<HashMap<String, Tensor>> {
    let shards = shard_paths(dir)?;
    if shards.is_empty() {
        anyhow::bail!("no safetensors checkpoint found in {}", dir.display());
    }
    let mut tensors = HashMap::new();
    for shard in &shards {
        tracing::debug!(shard = %shard.display(), "loading shard");
        for (name, tensor) in candle::safetensors::load(shard, &Device::Cpu)? {
            tensors.insert(name, tensor);
        }
    }
    Ok(tensors)
}

fn copy_support_files(src: &Path, dst: &Path) -> Result<()> {
    for name in SUPPORT_FILES {
        let from = src.join(name);
        if from.exists() {
            fs::copy(&from, dst.join(name))
                .with_context(|| format!("copying {name} into {}", dst.display()))?;
        }
    }
    Ok(())
}

/// Records the quantization that was actually applied in the copied
/// config.json, following the MLX convention. Callers pass the real block
/// granularity, which for GGML dtypes is fixed and may differ from what
/// the operator asked for.
fn annotate_config(dst: &Path, bits: u32, group_size: u32) -> Result<()> {
    let path = dst.join("config.json");
    let mut config: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    config["quantization"] = serde_json::json!({
        "bits": bits,
        "group_size": group_size,
    });
    fs::write(&path, serde_json::to_string_pretty(&config)?)?;
    Ok(())
}

/// bf16 -> fp16 safetensors conversion; every shard is folded into a single
/// model.safetensors next to the copied tokenizer/config files.
fn plain_convert(src: &Path, dst: &Path) -> Result<()> {
    let tensors = load_all_tensors(src)?;
    let mut converted = HashMap::with_capacity(tensors.len());
    let mut changed = 0usize;
    for (name, tensor) in tensors {
        let tensor = if tensor.dtype() == DType::BF16 {
            changed += 1;
            tensor.to_dtype(DType::F16)?
        } else {
            tensor
        };
        converted.insert(name, tensor);
    }
    candle::safetensors::save(&converted, dst.join("model.safetensors"))?;
    copy_support_files(src, dst)?;
    tracing::info!(tensors = converted.len(), changed, "saved fp16 checkpoint");
    Ok(())
}

/// The subset of a Hugging Face llama-family config.json needed to emit
/// GGUF metadata.
#[derive(Debug, serde::Deserialize)]
struct HfModelConfig {
    num_attention_heads: u32,
    num_key_value_heads: Option<u32>,
    num_hidden_layers: u32,
    hidden_size: u32,
    intermediate_size: u32,
    rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    rope_theta: f64,
    #[serde(default = "default_context_length")]
    max_position_embeddings: u32,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_context_length() -> u32 {
    4096
}

/// Maps a Hugging Face llama-family tensor name onto the GGUF naming
/// scheme. Unknown names abort the quantized strategy (the plain strategy
/// still handles such checkpoints).
fn map_tensor_name(name: &str) -> Option<String> {
    match name {
        "model.embed_tokens.weight" => return Some("token_embd.weight".to_string()),
        "model.norm.weight" => return Some("output_norm.weight".to_string()),
        "lm_head.weight" => return Some("output.weight".to_string()),
        _ => {}
    }
    let rest = name.strip_prefix("model.layers.")?;
    let (layer, suffix) = rest.split_once('.')?;
    let mapped = match suffix {
        "self_attn.q_proj.weight" => "attn_q.weight",
        "self_attn.k_proj.weight" => "attn_k.weight",
        "self_attn.v_proj.weight" => "attn_v.weight",
        "self_attn.o_proj.weight" => "attn_output.weight",
        "mlp.gate_proj.weight" => "ffn_gate.weight",
        "mlp.up_proj.weight" => "ffn_up.weight",
        "mlp.down_proj.weight" => "ffn_down.weight",
        "input_layernorm.weight" => "attn_norm.weight",
        "post_attention_layernorm.weight" => "ffn_norm.weight",
        _ => return None,
    };
    Some(format!("blk.{layer}.{mapped}"))
}

fn is_quantizable(tensor: &Tensor) -> bool {
    tensor.rank() == 2 && tensor.dims()[1] % GGML_BLOCK_SIZE == 0
}

fn gguf_metadata(config: &HfModelConfig, repo_id: &str) -> Vec<(&'static str, gguf_file::Value)> {
    let head_count = config.num_attention_heads;
    let kv_count = config.num_key_value_heads.unwrap_or(head_count);
    vec![
        ("general.architecture", gguf_file::Value::String("llama".to_string())),
        ("general.name", gguf_file::Value::String(repo_id.to_string())),
        ("llama.attention.head_count", gguf_file::Value::U32(head_count)),
        ("llama.attention.head_count_kv", gguf_file::Value::U32(kv_count)),
        ("llama.block_count", gguf_file::Value::U32(config.num_hidden_layers)),
        ("llama.embedding_length", gguf_file::Value::U32(config.hidden_size)),
        ("llama.feed_forward_length", gguf_file::Value::U32(config.intermediate_size)),
        ("llama.context_length", gguf_file::Value::U32(config.max_position_embeddings)),
        (
            "llama.rope.dimension_count",
            gguf_file::Value::U32(config.hidden_size / head_count.max(1)),
        ),
        (
            "llama.attention.layer_norm_rms_epsilon",
            gguf_file::Value::F32(config.rms_norm_eps as f32),
        ),
        ("llama.rope.freq_base", gguf_file::Value::F32(config.rope_theta as f32)),
    ]
}

/// Quantizes the checkpoint into a single model.gguf. Only llama-family
/// tensor layouts are supported; anything else makes this strategy fail.
fn quantized_convert(src: &Path, dst: &Path, params: QuantParams) -> Result<()> {
    let qtype = match params.bits {
        4 => GgmlDType::Q4_0,
        8 => GgmlDType::Q8_0,
        bits => anyhow::bail!("unsupported quantization bit-width {bits}"),
    };
    // GGML dtypes quantize in fixed 32-element blocks; the requested group
    // size only applies to the external converter.
    if params.group_size as usize != GGML_BLOCK_SIZE {
        tracing::info!(
            requested = params.group_size,
            actual = GGML_BLOCK_SIZE,
            "in-process quantization uses the ggml block size"
        );
    }
    let config: HfModelConfig =
        serde_json::from_str(&fs::read_to_string(src.join("config.json"))?)
            .context("parsing config.json")?;

    let tensors = load_all_tensors(src)?;
    let mut quantized: Vec<(String, QTensor)> = Vec::with_capacity(tensors.len());
    let mut embed_tokens: Option<Tensor> = None;
    for (name, tensor) in &tensors {
        let gguf_name = map_tensor_name(name)
            .with_context(|| format!("unsupported tensor layout: {name}"))?;
        let tensor = tensor.to_dtype(DType::F32)?;
        if gguf_name == "token_embd.weight" {
            embed_tokens = Some(tensor.clone());
        }
        let qtensor = if is_quantizable(&tensor) {
            QTensor::quantize(&tensor, qtype)?
        } else {
            QTensor::quantize(&tensor, GgmlDType::F32)?
        };
        quantized.push((gguf_name, qtensor));
    }

    // Tied embeddings: duplicate token_embd as the output head when the
    // checkpoint has no lm_head.
    if !quantized.iter().any(|(n, _)| n == "output.weight") {
        let embed = embed_tokens
            .context("checkpoint has neither lm_head.weight nor model.embed_tokens.weight")?;
        let qtensor = if is_quantizable(&embed) {
            QTensor::quantize(&embed, qtype)?
        } else {
            QTensor::quantize(&embed, GgmlDType::F32)?
        };
        quantized.push(("output.weight".to_string(), qtensor));
    }

    let metadata = gguf_metadata(&config, "mlx-convert");
    let metadata_refs: Vec<(&str, &gguf_file::Value)> =
        metadata.iter().map(|(k, v)| (*k, v)).collect();
    let tensor_refs: Vec<(&str, &QTensor)> =
        quantized.iter().map(|(k, v)| (k.as_str(), v)).collect();

    let gguf_path = dst.join("model.gguf");
    let mut file = fs::File::create(&gguf_path)
        .with_context(|| format!("creating {}", gguf_path.display()))?;
    gguf_file::write(&mut file, &metadata_refs, &tensor_refs)?;

    copy_support_files(src, dst)?;
    annotate_config(dst, params.bits, GGML_BLOCK_SIZE as u32)?;
    tracing::info!(
        tensors = tensor_refs.len(),
        bits = params.bits,
        group_size = GGML_BLOCK_SIZE,
        "saved quantized checkpoint"
    );
    Ok(())
}

/// Out-of-process fallback: hand the whole conversion to mlx_lm.
fn external_convert(request: &ConvertRequest, ws: &Workspace) -> Result<()> {
    let program = "mlx_lm.convert";
    let mut cmd = Command::new(program);
    cmd.arg("--hf-path")
        .arg(&ws.source_dir)
        .arg("--mlx-path")
        .arg(&ws.output_dir);
    if let Quantization::Enabled(params) = request.quantization {
        cmd.arg("-q")
            .arg("--q-bits")
            .arg(params.bits.to_string())
            .arg("--q-group-size")
            .arg(params.group_size.to_string());
    }
    tracing::info!(?cmd, "running external converter");
    let status = cmd
        .status()
        .with_context(|| format!("failed to spawn {program}; is mlx-lm installed?"))?;
    if !status.success() {
        anyhow::bail!("{program} exited with status {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Quantization;

    fn request(quant: Quantization) -> ConvertRequest {
        ConvertRequest {
            source_repo: "org/tiny-model".to_string(),
            target_repo: "me/tiny-model-mlx".to_string(),
            username: "me".to_string(),
            quantization: quant,
        }
    }

    fn tiny_config_json() -> String {
        serde_json::json!({
            "num_attention_heads": 2,
            "num_key_value_heads": 2,
            "num_hidden_layers": 1,
            "hidden_size": 32,
            "intermediate_size": 32,
            "rms_norm_eps": 1e-5,
            "vocab_size": 8,
        })
        .to_string()
    }

    /// Writes a one-layer llama-shaped checkpoint into `dir`.
    fn write_tiny_checkpoint(dir: &Path) {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        let mat = |r, c| Tensor::zeros((r, c), DType::BF16, &dev).unwrap();
        tensors.insert("model.embed_tokens.weight".to_string(), mat(8, 32));
        for suffix in [
            "self_attn.q_proj.weight",
            "self_attn.k_proj.weight",
            "self_attn.v_proj.weight",
            "self_attn.o_proj.weight",
            "mlp.gate_proj.weight",
            "mlp.up_proj.weight",
            "mlp.down_proj.weight",
        ] {
            tensors.insert(format!("model.layers.0.{suffix}"), mat(32, 32));
        }
        for suffix in ["input_layernorm.weight", "post_attention_layernorm.weight"] {
            tensors.insert(
                format!("model.layers.0.{suffix}"),
                Tensor::zeros(32, DType::F32, &dev).unwrap(),
            );
        }
        tensors
            .insert("model.norm.weight".to_string(), Tensor::zeros(32, DType::F32, &dev).unwrap());
        candle::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
        fs::write(dir.join("config.json"), tiny_config_json()).unwrap();
        fs::write(dir.join("tokenizer_config.json"), "{}").unwrap();
    }

    #[test]
    fn tensor_name_mapping() {
        assert_eq!(map_tensor_name("model.embed_tokens.weight").unwrap(), "token_embd.weight");
        assert_eq!(map_tensor_name("lm_head.weight").unwrap(), "output.weight");
        assert_eq!(
            map_tensor_name("model.layers.3.self_attn.q_proj.weight").unwrap(),
            "blk.3.attn_q.weight"
        );
        assert_eq!(
            map_tensor_name("model.layers.12.mlp.down_proj.weight").unwrap(),
            "blk.12.ffn_down.weight"
        );
        assert!(map_tensor_name("transformer.h.0.attn.c_attn.weight").is_none());
    }

    #[test]
    fn shard_paths_prefers_the_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("model.safetensors.index.json"),
            serde_json::json!({"weight_map": {
                "a": "model-00001-of-00002.safetensors",
                "b": "model-00002-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors",
            }})
            .to_string(),
        )
        .unwrap();
        fs::write(dir.path().join("stray.safetensors"), b"").unwrap();
        let shards = shard_paths(dir.path()).unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string()
            ]
        );
    }

    #[test]
    fn plain_convert_produces_fp16_safetensors() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(src.path());
        plain_convert(src.path(), dst.path()).unwrap();

        assert!(dst.path().join("config.json").exists());
        assert!(dst.path().join("tokenizer_config.json").exists());
        let tensors =
            candle::safetensors::load(dst.path().join("model.safetensors"), &Device::Cpu).unwrap();
        assert_eq!(tensors["model.embed_tokens.weight"].dtype(), DType::F16);
        // f32 tensors are passed through untouched.
        assert_eq!(tensors["model.norm.weight"].dtype(), DType::F32);
    }

    #[test]
    fn quantized_convert_writes_gguf_with_mapped_names() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(src.path());
        quantized_convert(src.path(), dst.path(), QuantParams { bits: 4, group_size: 64 })
            .unwrap();

        let gguf_path = dst.path().join("model.gguf");
        let mut file = fs::File::open(&gguf_path).unwrap();
        let content = gguf_file::Content::read(&mut file).unwrap();
        assert!(content.tensor_infos.contains_key("blk.0.attn_q.weight"));
        assert!(content.tensor_infos.contains_key("token_embd.weight"));
        // Tied embeddings get duplicated as the output head.
        assert!(content.tensor_infos.contains_key("output.weight"));

        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dst.path().join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["quantization"]["bits"], 4);
        assert_eq!(config["quantization"]["group_size"], GGML_BLOCK_SIZE as u32);
    }

    #[test]
    fn config_records_the_applied_block_size_not_the_requested_one() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_tiny_checkpoint(src.path());
        quantized_convert(src.path(), dst.path(), QuantParams { bits: 8, group_size: 7777 })
            .unwrap();

        let mut file = fs::File::open(dst.path().join("model.gguf")).unwrap();
        let content = gguf_file::Content::read(&mut file).unwrap();
        let info = &content.tensor_infos["blk.0.attn_q.weight"];
        assert_eq!(info.ggml_dtype, GgmlDType::Q8_0);
        assert_eq!(info.ggml_dtype.block_size(), GGML_BLOCK_SIZE);

        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dst.path().join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["quantization"]["group_size"], GGML_BLOCK_SIZE as u32);
    }

    #[test]
    fn all_strategies_failing_leaves_no_output() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace {
            source_dir: root.path().join("src"),
            output_dir: root.path().join("out"),
        };
        fs::create_dir_all(&ws.source_dir).unwrap();
        fs::create_dir_all(&ws.output_dir).unwrap();
        fs::write(ws.output_dir.join("stale.bin"), b"x").unwrap();

        // Empty source: the in-process strategies fail, and mlx_lm.convert
        // is not installed in the test environment.
        let err = convert(&request(Quantization::Disabled), &ws);
        assert!(err.is_err());
        assert!(workspace::dir_is_empty(&ws.output_dir).unwrap());
    }
}
