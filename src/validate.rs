//! Post-conversion validation: load the converted checkpoint and run one
//! short generation. A failure here is reported but does not stop the
//! pipeline; the operator may still want the upload.

use anyhow::{Context, Result};
use candle::quantized::gguf_file;
use candle::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Llama, LlamaConfig, LlamaEosToks};
use candle_transformers::models::quantized_llama::ModelWeights;
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

const TEST_PROMPT: &str = "hello";
const MAX_NEW_TOKENS: usize = 30;
const TEMPERATURE: f64 = 0.7;
const SEED: u64 = 299792458;

/// Which kind of checkpoint the conversion produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    Gguf(PathBuf),
    Safetensors(Vec<PathBuf>),
}

impl Checkpoint {
    /// Looks at the output directory and decides how to load it.
    pub fn detect(dir: &Path) -> Result<Self> {
        let gguf = dir.join("model.gguf");
        if gguf.exists() {
            return Ok(Self::Gguf(gguf));
        }
        let mut shards: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        shards.sort();
        if shards.is_empty() {
            anyhow::bail!("no model.gguf or *.safetensors in {}", dir.display());
        }
        Ok(Self::Safetensors(shards))
    }
}

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

fn load_tokenizer(dir: &Path) -> Result<Tokenizer> {
    let path = dir.join("tokenizer.json");
    if !path.exists() {
        anyhow::bail!("tokenizer.json missing from {}", dir.display());
    }
    Tokenizer::from_file(&path).map_err(anyhow::Error::msg)
}

/// Runs one generation against the converted model and returns the text.
pub fn validate(dir: &Path, cpu: bool) -> Result<String> {
    let device = device(cpu)?;
    tracing::info!(?device, dir = %dir.display(), "validating converted model");
    let tokenizer = load_tokenizer(dir)?;
    match Checkpoint::detect(dir)? {
        Checkpoint::Gguf(path) => generate_quantized(&path, &tokenizer, &device),
        Checkpoint::Safetensors(shards) => generate_f16(dir, &shards, &tokenizer, &device),
    }
}

fn generate_quantized(path: &Path, tokenizer: &Tokenizer, device: &Device) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let content = gguf_file::Content::read(&mut file)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut model = ModelWeights::from_gguf(content, &mut file, device)?;

    let mut tokens = encode_prompt(tokenizer)?;
    let eos = eos_token(tokenizer);
    let mut logits_processor = LogitsProcessor::new(SEED, Some(TEMPERATURE), None);

    let prompt_len = tokens.len();
    let input = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
    let logits = model.forward(&input, 0)?;
    let mut next = logits_processor.sample(&logits.squeeze(0)?)?;
    tokens.push(next);

    for index in 0..MAX_NEW_TOKENS - 1 {
        if Some(next) == eos {
            break;
        }
        let input = Tensor::new(&[next], device)?.unsqueeze(0)?;
        let logits = model.forward(&input, prompt_len + index)?;
        next = logits_processor.sample(&logits.squeeze(0)?)?;
        tokens.push(next);
    }
    decode_new(tokenizer, &tokens, prompt_len)
}

fn generate_f16(
    dir: &Path,
    shards: &[PathBuf],
    tokenizer: &Tokenizer,
    device: &Device,
) -> Result<String> {
    let config_json = fs::read_to_string(dir.join("config.json"))?;
    let config: LlamaConfig = serde_json::from_str(&config_json)
        .context("only llama-family configs are supported for validation")?;
    let config = config.into_config(false);

    let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(shards, dtype, device)? };
    let model = Llama::load(vb, &config)?;
    let mut cache = Cache::new(true, dtype, &config, device)?;

    let mut tokens = encode_prompt(tokenizer)?;
    let eos = match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => Some(*id),
        Some(LlamaEosToks::Multiple(ids)) => ids.first().copied(),
        None => eos_token(tokenizer),
    };
    let mut logits_processor = LogitsProcessor::new(SEED, Some(TEMPERATURE), None);

    let prompt_len = tokens.len();
    let mut index_pos = 0;
    for _ in 0..MAX_NEW_TOKENS {
        let context = &tokens[index_pos..];
        let input = Tensor::new(context, device)?.unsqueeze(0)?;
        let logits = model.forward(&input, index_pos, &mut cache)?;
        let logits = logits.i((0,))?;
        index_pos += context.len();
        let next = logits_processor.sample(&logits)?;
        if Some(next) == eos {
            break;
        }
        tokens.push(next);
    }
    decode_new(tokenizer, &tokens, prompt_len)
}

fn encode_prompt(tokenizer: &Tokenizer) -> Result<Vec<u32>> {
    let encoding = tokenizer.encode(TEST_PROMPT, true).map_err(anyhow::Error::msg)?;
    let tokens = encoding.get_ids().to_vec();
    if tokens.is_empty() {
        anyhow::bail!("tokenizer produced no tokens for the test prompt");
    }
    Ok(tokens)
}

fn eos_token(tokenizer: &Tokenizer) -> Option<u32> {
    tokenizer
        .token_to_id("</s>")
        .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
}

fn decode_new(tokenizer: &Tokenizer, tokens: &[u32], prompt_len: usize) -> Result<String> {
    let text = tokenizer.decode(&tokens[prompt_len..], true).map_err(anyhow::Error::msg)?;
    Ok(text.trim().to_string())
}
