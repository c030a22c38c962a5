//! Snapshot download of the source repo into the local cache directory.
//!
//! The hf-hub client owns transfer semantics (resume, etags); this module
//! only decides whether to hit the network at all and mirrors the cached
//! files into the workspace layout.

use anyhow::{Context, Result};
use hf_hub::api::sync::ApiBuilder;
use std::fs;
use std::path::Path;

use crate::prompt;
use crate::request::ConvertRequest;
use crate::workspace::{self, Workspace};

/// What to do with the source cache directory before converting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    /// Empty cache: download everything.
    Download,
    /// Non-empty cache and the operator declined a re-download.
    ReuseCache,
    /// Non-empty cache, operator asked for a fresh copy.
    ClearAndDownload,
}

/// Pure decision function; `redownload` is the operator's answer when the
/// cache is non-empty (None means nobody was asked, which only happens for
/// an empty cache).
pub fn plan(cache_nonempty: bool, redownload: Option<bool>) -> FetchPlan {
    match (cache_nonempty, redownload) {
        (false, _) => FetchPlan::Download,
        (true, Some(true)) => FetchPlan::ClearAndDownload,
        (true, _) => FetchPlan::ReuseCache,
    }
}

/// Downloads the full source snapshot, or reuses the local cache. A failure
/// here is fatal to the pipeline: converting a partial snapshot silently is
/// worse than stopping.
pub fn fetch_source(
    request: &ConvertRequest,
    ws: &Workspace,
    force_redownload: bool,
    assume_yes: bool,
) -> Result<()> {
    let nonempty = !workspace::dir_is_empty(&ws.source_dir)?;
    let answer = if !nonempty {
        None
    } else if force_redownload {
        Some(true)
    } else if assume_yes {
        Some(false)
    } else {
        Some(prompt::yes_no(&format!(
            "{} already contains files; re-download?",
            ws.source_dir.display()
        ))?)
    };

    match plan(nonempty, answer) {
        FetchPlan::ReuseCache => {
            println!("Reusing cached snapshot in {}", ws.source_dir.display());
            return Ok(());
        }
        FetchPlan::ClearAndDownload => workspace::clear_dir(&ws.source_dir)?,
        FetchPlan::Download => {}
    }

    download_snapshot(&request.source_repo, &ws.source_dir)
}

fn download_snapshot(repo_id: &str, dest: &Path) -> Result<()> {
    let api = ApiBuilder::from_env().build()?.model(repo_id.to_string());
    let info = api
        .info()
        .with_context(|| format!("fetching the file list for {repo_id}"))?;
    tracing::info!(repo = repo_id, file_count = info.siblings.len(), "downloading snapshot");

    let mut total_bytes = 0u64;
    for sibling in &info.siblings {
        let cached = api
            .get(&sibling.rfilename)
            .with_context(|| format!("downloading {} from {repo_id}", sibling.rfilename))?;
        let target = dest.join(&sibling.rfilename);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let size = fs::copy(&cached, &target)
            .with_context(|| format!("copying {} into {}", sibling.rfilename, dest.display()))?;
        total_bytes += size;
        tracing::debug!(file = %sibling.rfilename, size, "fetched");
    }
    println!(
        "Downloaded {} files ({}) into {}",
        info.siblings.len(),
        workspace::human_bytes(total_bytes),
        dest.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_always_downloads() {
        assert_eq!(plan(false, None), FetchPlan::Download);
        assert_eq!(plan(false, Some(true)), FetchPlan::Download);
        assert_eq!(plan(false, Some(false)), FetchPlan::Download);
    }

    #[test]
    fn declined_redownload_reuses_cache_without_network() {
        assert_eq!(plan(true, Some(false)), FetchPlan::ReuseCache);
        assert_eq!(plan(true, None), FetchPlan::ReuseCache);
    }

    #[test]
    fn accepted_redownload_clears_first() {
        assert_eq!(plan(true, Some(true)), FetchPlan::ClearAndDownload);
    }
}
