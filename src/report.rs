//! Final per-stage report printed when the pipeline ends, successful or not.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Ok,
    Failed(String),
    Skipped(String),
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Ok => write!(f, "ok"),
            StageStatus::Failed(reason) => write!(f, "FAILED ({reason})"),
            StageStatus::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

/// One entry per pipeline stage, in execution order. Everything starts out
/// skipped so an early abort still prints a complete report.
#[derive(Debug)]
pub struct PipelineReport {
    pub download: StageStatus,
    pub conversion: StageStatus,
    pub test: StageStatus,
    pub upload: StageStatus,
    pub verification: StageStatus,
    pub cleanup: StageStatus,
}

impl Default for PipelineReport {
    fn default() -> Self {
        let not_run = StageStatus::Skipped("not run".to_string());
        Self {
            download: not_run.clone(),
            conversion: not_run.clone(),
            test: not_run.clone(),
            upload: not_run.clone(),
            verification: not_run.clone(),
            cleanup: not_run,
        }
    }
}

impl PipelineReport {
    fn stages(&self) -> [(&'static str, &StageStatus); 6] {
        [
            ("Download", &self.download),
            ("Conversion", &self.conversion),
            ("Test generation", &self.test),
            ("Upload", &self.upload),
            ("Verification", &self.verification),
            ("Cleanup", &self.cleanup),
        ]
    }

    pub fn any_failed(&self) -> bool {
        self.stages().iter().any(|(_, s)| matches!(s, StageStatus::Failed(_)))
    }

    // Gate decisions: each stage runs only when the stage it depends on
    // actually succeeded.

    pub fn can_convert(&self) -> bool {
        self.download == StageStatus::Ok
    }

    /// Both the smoke test and publication only need the conversion.
    pub fn can_publish(&self) -> bool {
        self.conversion == StageStatus::Ok
    }

    pub fn can_verify(&self) -> bool {
        self.upload == StageStatus::Ok
    }

    pub fn can_cleanup(&self) -> bool {
        self.verification == StageStatus::Ok
    }

    pub fn print(&self, target_repo: &str) {
        println!();
        println!("==================== Summary ====================");
        for (name, status) in self.stages() {
            println!("  {name:<16} {status}");
        }
        println!("=================================================");
        if self.verification == StageStatus::Ok {
            println!();
            println!("Your model is live at https://huggingface.co/{target_repo}");
            println!("Load it with:");
            println!("  from mlx_lm import load, generate");
            println!("  model, tokenizer = load(\"{target_repo}\")");
        }
    }
}
