//! Interactive pipeline that downloads a Hugging Face checkpoint, converts
//! it for MLX (optionally quantized), smoke-tests the result, and publishes
//! it back to the Hub.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

mod card;
mod convert;
mod fetch;
mod prompt;
mod publish;
mod report;
mod request;
mod validate;
mod workspace;

use report::{PipelineReport, StageStatus};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source model on the Hub, e.g. org/model. Prompted for when omitted.
    #[arg(long)]
    hf_repo: Option<String>,

    /// Destination repo for the converted model. Prompted for when omitted.
    #[arg(long)]
    mlx_repo: Option<String>,

    /// Hugging Face username owning the destination repo.
    #[arg(long)]
    username: Option<String>,

    /// Quantization menu choice: 1 none, 2 4-bit, 3 8-bit.
    #[arg(long)]
    quant: Option<String>,

    /// Answer yes to every confirmation and skip the interactive prompts.
    #[arg(long)]
    yes: bool,

    /// Root directory for the source cache and converted output.
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Force cpu even when an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Go through the whole pipeline without writing anything to the Hub.
    #[arg(long)]
    dry_run: bool,

    /// Re-download the source snapshot even when cached.
    #[arg(long)]
    redownload: bool,

    /// Cleanup menu choice: 1 keep, 2 delete source, 3 delete both.
    #[arg(long)]
    cleanup: Option<String>,

    /// Hub token; falls back to HF_TOKEN, then an interactive prompt.
    #[arg(long)]
    token: Option<String>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve_token(args: &Args) -> Result<String> {
    if let Some(token) = &args.token {
        return Ok(token.clone());
    }
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if !token.is_empty() {
            return Ok(token);
        }
    }
    if args.dry_run {
        // Nothing leaves the machine on a dry run; no point prompting.
        return Ok(String::new());
    }
    let token = prompt::secret("Hugging Face token (write access): ")?;
    if token.is_empty() {
        anyhow::bail!("a Hub token is required to upload");
    }
    Ok(token)
}

fn run(args: Args) -> Result<ExitCode> {
    let Some(request) = request::collect(request::CollectArgs {
        source_repo: args.hf_repo.clone(),
        target_repo: args.mlx_repo.clone(),
        username: args.username.clone(),
        quant_choice: args.quant.clone(),
        assume_yes: args.yes,
    })?
    else {
        println!("Aborted.");
        return Ok(ExitCode::from(2));
    };
    let target = request.qualified_target();

    let ws = workspace::Workspace::prepare(&args.models_dir, &request)?;
    let mut report = PipelineReport::default();

    if !convert::probe_external_converter() {
        tracing::warn!(
            "mlx_lm.convert not found on PATH; the external fallback strategy is unavailable"
        );
    }

    // Stage 1: download. Converting a partial snapshot is worse than
    // stopping, so a failure here closes every downstream gate.
    match fetch::fetch_source(&request, &ws, args.redownload, args.yes) {
        Ok(()) => report.download = StageStatus::Ok,
        Err(err) => {
            tracing::error!(?err, "download failed");
            report.download = StageStatus::Failed(format!("{err:#}"));
        }
    }

    // Stage 2: conversion.
    if report.can_convert() {
        match convert::convert(&request, &ws) {
            Ok(strategy) => {
                println!("Converted via {strategy} into {}", ws.output_dir.display());
                report.conversion = StageStatus::Ok;
            }
            Err(err) => {
                tracing::error!(?err, "conversion failed");
                report.conversion = StageStatus::Failed(format!("{err:#}"));
            }
        }
    }

    let mut verify_token = None;
    if report.can_publish() {
        // Stage 3: one short generation. Not fatal; a model that loads in
        // mlx may still fail to load here.
        match validate::validate(&ws.output_dir, args.cpu) {
            Ok(text) => {
                println!("Test generation: {text}");
                report.test = StageStatus::Ok;
            }
            Err(err) => {
                tracing::warn!(?err, "test generation failed");
                report.test = StageStatus::Failed(format!("{err:#}"));
            }
        }

        // The model card rides along with the upload; failing to write it
        // only costs the README.
        if let Err(err) = card::write(&request, &ws.source_dir, &ws.output_dir) {
            tracing::warn!(?err, "could not write the model card");
        }

        // Stage 4: upload.
        let upload_result = resolve_token(&args).and_then(|token| {
            let publisher = publish::HubPublisher::new(token.clone())?;
            if !args.dry_run {
                let me = publisher.whoami()?;
                publisher.ensure_repo(&target, &me)?;
            }
            let message = format!("Add MLX converted {}", request.source_repo);
            let stats = publisher.upload_dir(&target, &ws.output_dir, &message, args.dry_run)?;
            Ok((token, stats))
        });
        match upload_result {
            Ok((token, stats)) => {
                println!(
                    "Uploaded {} files ({})",
                    stats.files,
                    workspace::human_bytes(stats.bytes)
                );
                report.upload = StageStatus::Ok;
                verify_token = Some(token);
            }
            Err(err) => {
                tracing::error!(%err, "upload failed");
                report.upload = StageStatus::Failed(format!("{err}"));
            }
        }
    }

    // Stage 5: verification.
    if report.can_verify() {
        if args.dry_run {
            report.verification = StageStatus::Skipped("dry run".to_string());
        } else if let Some(token) = &verify_token {
            match publish::verify_remote(&target, token) {
                Ok(files) => {
                    println!("Remote {target} now contains:");
                    for file in &files {
                        println!("  {file}");
                    }
                    report.verification = StageStatus::Ok;
                }
                Err(err) => {
                    tracing::error!(?err, "verification failed");
                    report.verification = StageStatus::Failed(format!("{err:#}"));
                }
            }
        }
    }

    // Stage 6: cleanup, only once the upload is known good.
    if report.can_cleanup() {
        let choice = match &args.cleanup {
            Some(choice) => workspace::CleanupChoice::from_menu(choice),
            None if args.yes => workspace::CleanupChoice::KeepBoth,
            None => {
                println!();
                println!("Local files:");
                println!("  1) keep everything");
                println!("  2) delete the source cache ({})", ws.source_dir.display());
                println!("  3) delete source and output");
                workspace::CleanupChoice::from_menu(&prompt::line("Choice [1/2/3]: ")?)
            }
        };
        match workspace::run_cleanup(&ws, choice) {
            Ok(()) => report.cleanup = StageStatus::Ok,
            Err(err) => report.cleanup = StageStatus::Failed(format!("{err:#}")),
        }
    }

    report.print(&target);
    if report.any_failed() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
