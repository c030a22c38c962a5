//! Hub publication: create the destination repo, commit the converted files,
//! then verify the remote file list. Reads go through hf-hub; the write
//! endpoints (repo creation, commits) are plain REST calls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hf_hub::api::sync::ApiBuilder;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::workspace;

const ENDPOINT: &str = "https://huggingface.co";

/// Files never worth committing to the Hub.
const EXCLUDED: &[&str] = &[".DS_Store", "Thumbs.db"];

/// The ndjson commit endpoint needs the whole payload in memory, base64
/// inflated. Cap what we are willing to send that way; bigger artifacts
/// need the LFS preupload flow.
const MAX_COMMIT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

fn within_commit_limit(bytes: u64) -> bool {
    bytes <= MAX_COMMIT_BYTES
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("creating repo {repo} failed with status {status}: {body}")]
    CreateRepo { repo: String, status: u16, body: String },
    #[error("commit to {repo} failed with status {status}: {body}")]
    Commit { repo: String, status: u16, body: String },
    #[error("nothing to upload from {0}")]
    EmptyUpload(String),
    #[error("{bytes} bytes exceeds the {limit}-byte single-commit limit")]
    TooLarge { bytes: u64, limit: u64 },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Default)]
pub struct UploadStats {
    pub files: usize,
    pub bytes: u64,
    pub skipped: usize,
}

pub struct HubPublisher {
    client: reqwest::blocking::Client,
    token: String,
}

impl HubPublisher {
    pub fn new(token: String) -> Result<Self, PublishError> {
        // Model shards are large; no request timeout.
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { client, token })
    }

    /// Resolves the authenticated account name, which also proves the token
    /// is valid before anything is written.
    pub fn whoami(&self) -> Result<String, PublishError> {
        let resp = self
            .client
            .get(format!("{ENDPOINT}/api/whoami-v2"))
            .bearer_auth(&self.token)
            .send()?;
        if !resp.status().is_success() {
            return Err(PublishError::Auth(format!("whoami returned {}", resp.status())));
        }
        let body: serde_json::Value = resp.json()?;
        body["name"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PublishError::Auth("whoami response had no name".to_string()))
    }

    /// Creates the model repo. An already-existing repo is fine.
    pub fn ensure_repo(&self, repo_id: &str, me: &str) -> Result<(), PublishError> {
        let (owner, name) = repo_id
            .split_once('/')
            .unwrap_or((me, repo_id));
        let mut payload =
            serde_json::json!({ "type": "model", "name": name, "private": false });
        if owner != me {
            payload["organization"] = serde_json::json!(owner);
        }
        let resp = self
            .client
            .post(format!("{ENDPOINT}/api/repos/create"))
            .bearer_auth(&self.token)
            .json(&payload)
            .send()?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 409 {
            tracing::info!(repo = repo_id, exists = status.as_u16() == 409, "repo ready");
            return Ok(());
        }
        Err(PublishError::CreateRepo {
            repo: repo_id.to_string(),
            status: status.as_u16(),
            body: resp.text().unwrap_or_default(),
        })
    }

    /// Commits every file under `dir` to the repo's main branch in a single
    /// ndjson commit. With `dry_run` nothing leaves the machine.
    pub fn upload_dir(
        &self,
        repo_id: &str,
        dir: &Path,
        message: &str,
        dry_run: bool,
    ) -> Result<UploadStats, PublishError> {
        let mut stats = UploadStats::default();
        let mut selected: Vec<(String, std::path::PathBuf)> = Vec::new();
        for (rel, size) in workspace::list_files(dir).map_err(PublishError::Other)? {
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if should_exclude(&rel_str) {
                println!("[skip]   {rel_str}");
                stats.skipped += 1;
                continue;
            }
            if dry_run {
                println!("[dry-run] {rel_str} ({})", workspace::human_bytes(size));
            } else {
                println!("[upload] {rel_str} ({})", workspace::human_bytes(size));
            }
            stats.files += 1;
            stats.bytes += size;
            selected.push((rel_str, rel));
        }
        if stats.files == 0 {
            return Err(PublishError::EmptyUpload(dir.display().to_string()));
        }
        if dry_run {
            return Ok(stats);
        }
        if !within_commit_limit(stats.bytes) {
            return Err(PublishError::TooLarge { bytes: stats.bytes, limit: MAX_COMMIT_BYTES });
        }

        let mut files: Vec<(String, Vec<u8>)> = Vec::with_capacity(selected.len());
        for (rel_str, rel) in selected {
            let content = fs::read(dir.join(&rel))?;
            files.push((rel_str, content));
        }
        let payload = commit_payload(message, &files);
        let resp = self
            .client
            .post(format!("{ENDPOINT}/api/models/{repo_id}/commit/main"))
            .bearer_auth(&self.token)
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PublishError::Commit {
                repo: repo_id.to_string(),
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }
        tracing::info!(repo = repo_id, files = stats.files, bytes = stats.bytes, "commit done");
        Ok(stats)
    }
}

fn should_exclude(rel: &str) -> bool {
    rel.split('/').any(|part| EXCLUDED.contains(&part) || part.starts_with('.'))
}

/// The commit body: one header line, then one base64 file line per file.
fn commit_payload(message: &str, files: &[(String, Vec<u8>)]) -> String {
    let mut lines = Vec::with_capacity(files.len() + 1);
    lines.push(
        serde_json::json!({
            "key": "header",
            "value": { "summary": message, "description": "" },
        })
        .to_string(),
    );
    for (path, content) in files {
        lines.push(
            serde_json::json!({
                "key": "file",
                "value": {
                    "path": path,
                    "content": BASE64.encode(content),
                    "encoding": "base64",
                },
            })
            .to_string(),
        );
    }
    lines.join("\n")
}

/// Lists the remote repo's files after the upload, proving the commit landed.
pub fn verify_remote(repo_id: &str, token: &str) -> anyhow::Result<Vec<String>> {
    let api = ApiBuilder::from_env()
        .with_token(Some(token.to_string()))
        .build()?
        .model(repo_id.to_string());
    let info = api.info()?;
    let mut names: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion_covers_hidden_and_junk_files() {
        assert!(should_exclude(".DS_Store"));
        assert!(should_exclude("sub/Thumbs.db"));
        assert!(should_exclude(".cache/blob"));
        assert!(!should_exclude("model.safetensors"));
        assert!(!should_exclude("sub/config.json"));
    }

    #[test]
    fn commit_payload_is_ndjson_with_header_first() {
        let files = vec![("config.json".to_string(), b"{}".to_vec())];
        let payload = commit_payload("Add model", &files);
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 2);

        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["key"], "header");
        assert_eq!(header["value"]["summary"], "Add model");

        let file: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(file["key"], "file");
        assert_eq!(file["value"]["path"], "config.json");
        assert_eq!(file["value"]["encoding"], "base64");
        assert_eq!(file["value"]["content"], BASE64.encode(b"{}"));
    }

    #[test]
    fn commit_limit_boundaries() {
        assert!(within_commit_limit(0));
        assert!(within_commit_limit(MAX_COMMIT_BYTES));
        assert!(!within_commit_limit(MAX_COMMIT_BYTES + 1));
    }

    #[test]
    fn dry_run_reads_nothing_and_counts_everything() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model.safetensors"), vec![0u8; 128]).unwrap();
        fs::write(dir.path().join("config.json"), b"{}").unwrap();
        fs::write(dir.path().join(".DS_Store"), b"junk").unwrap();

        let publisher = HubPublisher::new("token".to_string()).unwrap();
        let stats = publisher.upload_dir("me/tiny", dir.path(), "Add model", true).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 130);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn empty_dir_refuses_to_upload() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = HubPublisher::new("token".to_string()).unwrap();
        let err = publisher.upload_dir("me/tiny", dir.path(), "Add model", true);
        assert!(matches!(err, Err(PublishError::EmptyUpload(_))));
    }
}
