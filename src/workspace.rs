//! Local directory bookkeeping: the source snapshot cache and the converted
//! output directory, both derived from the request.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::request::ConvertRequest;

pub struct Workspace {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Workspace {
    /// Creates both directories if missing. Pre-existing content is left
    /// alone; clearing only ever happens explicitly.
    pub fn prepare(root: &Path, request: &ConvertRequest) -> Result<Self> {
        let source_dir = root.join(request.source_dir_name());
        let output_dir = root.join(request.target_dir_name());
        fs::create_dir_all(&source_dir)
            .with_context(|| format!("creating {}", source_dir.display()))?;
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
        Ok(Self { source_dir, output_dir })
    }
}

pub fn dir_is_empty(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(true);
    }
    Ok(fs::read_dir(dir)?.next().is_none())
}

/// Removes the directory tree and recreates it empty.
pub fn clear_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("clearing {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("recreating {}", dir.display()))?;
    Ok(())
}

/// All regular files under `dir` with their sizes, sorted by relative path.
pub fn list_files(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir)?.to_path_buf();
        let size = entry.metadata()?.len();
        files.push((rel, size));
    }
    files.sort();
    Ok(files)
}

pub fn human_bytes(value: u64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB"];
    let mut size = value as f64;
    for unit in units {
        if size < 1024.0 || unit == "TB" {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{} B", value)
}

/// Post-verification cleanup menu: keep everything, drop the source cache,
/// or drop both directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupChoice {
    KeepBoth,
    DeleteSource,
    DeleteBoth,
}

impl CleanupChoice {
    pub fn from_menu(choice: &str) -> Self {
        match choice.trim() {
            "2" => Self::DeleteSource,
            "3" => Self::DeleteBoth,
            _ => Self::KeepBoth,
        }
    }
}

pub fn run_cleanup(ws: &Workspace, choice: CleanupChoice) -> Result<()> {
    match choice {
        CleanupChoice::KeepBoth => {
            println!("Keeping {} and {}", ws.source_dir.display(), ws.output_dir.display());
        }
        CleanupChoice::DeleteSource => {
            fs::remove_dir_all(&ws.source_dir)
                .with_context(|| format!("deleting {}", ws.source_dir.display()))?;
            println!("Deleted {}", ws.source_dir.display());
        }
        CleanupChoice::DeleteBoth => {
            fs::remove_dir_all(&ws.source_dir)
                .with_context(|| format!("deleting {}", ws.source_dir.display()))?;
            fs::remove_dir_all(&ws.output_dir)
                .with_context(|| format!("deleting {}", ws.output_dir.display()))?;
            println!("Deleted {} and {}", ws.source_dir.display(), ws.output_dir.display());
        }
    }
    Ok(())
}
