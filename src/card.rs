//! README.md model card generation: YAML front matter the Hub understands,
//! followed by a short human-readable description and usage snippet.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fs;
use std::path::Path;

use crate::request::ConvertRequest;

const DEFAULT_LICENSE: &str = "apache-2.0";

/// Reads the license from the snapshot's config/card if present; the Hub
/// stores it in config.json rarely, so fall back to a permissive default.
fn license_for(source_dir: &Path) -> String {
    let path = source_dir.join("config.json");
    if let Ok(text) = fs::read_to_string(path) {
        if let Ok(config) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(license) = config.get("license").and_then(|v| v.as_str()) {
                return license.to_string();
            }
        }
    }
    DEFAULT_LICENSE.to_string()
}

/// Renders the card. Pure on its inputs so tests can pin the output.
pub fn render(request: &ConvertRequest, license: &str, date: NaiveDate) -> String {
    let mut tags = vec!["mlx".to_string()];
    if request.quantization.params().is_some() {
        tags.push("quantized".to_string());
    }
    let tag_lines: String =
        tags.iter().map(|t| format!("- {t}\n")).collect();

    let target = request.qualified_target();
    format!(
        "---\n\
         license: {license}\n\
         base_model: {source}\n\
         tags:\n\
         {tag_lines}\
         ---\n\
         \n\
         # {target}\n\
         \n\
         This model was converted to MLX format from [`{source}`](https://huggingface.co/{source}) on {date}.\n\
         \n\
         - Quantization: {quant}\n\
         \n\
         ## Use with mlx\n\
         \n\
         ```bash\n\
         pip install mlx-lm\n\
         ```\n\
         \n\
         ```python\n\
         from mlx_lm import load, generate\n\
         \n\
         model, tokenizer = load(\"{target}\")\n\
         response = generate(model, tokenizer, prompt=\"hello\", verbose=True)\n\
         ```\n",
        source = request.source_repo,
        quant = request.quantization.summary(),
    )
}

/// Writes README.md into the output directory.
pub fn write(request: &ConvertRequest, source_dir: &Path, output_dir: &Path) -> Result<()> {
    let license = license_for(source_dir);
    let today = chrono::Local::now().date_naive();
    let card = render(request, &license, today);
    let path = output_dir.join("README.md");
    fs::write(&path, card).with_context(|| format!("writing {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote model card");
    Ok(())
}
