use anyhow::Result;

use crate::prompt;

/// Quantization parameters as offered by the interactive menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantParams {
    pub bits: u32,
    pub group_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantization {
    Disabled,
    Enabled(QuantParams),
}

impl Quantization {
    /// Maps the menu choice: "2" is 4-bit, "3" is 8-bit, anything else disables
    /// quantization.
    pub fn from_menu(choice: &str) -> Self {
        match choice.trim() {
            "2" => Self::Enabled(QuantParams { bits: 4, group_size: 64 }),
            "3" => Self::Enabled(QuantParams { bits: 8, group_size: 128 }),
            _ => Self::Disabled,
        }
    }

    pub fn params(&self) -> Option<QuantParams> {
        match self {
            Self::Disabled => None,
            Self::Enabled(params) => Some(*params),
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Disabled => "No".to_string(),
            Self::Enabled(params) => format!("Yes ({}-bit)", params.bits),
        }
    }
}

/// Everything collected from the operator before the pipeline starts.
/// Immutable once built.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub source_repo: String,
    pub target_repo: String,
    pub username: String,
    pub quantization: Quantization,
}

impl ConvertRequest {
    /// Directory name for the downloaded source snapshot.
    pub fn source_dir_name(&self) -> String {
        sanitize_repo_id(&self.source_repo)
    }

    /// Directory name for the converted output. Only the repo name (not the
    /// owner) contributes, with an `_mlx` suffix.
    pub fn target_dir_name(&self) -> String {
        let name = self.target_repo.rsplit('/').next().unwrap_or(&self.target_repo);
        format!("{}_mlx", sanitize_repo_id(name))
    }

    /// Fully-qualified destination repo id on the Hub.
    pub fn qualified_target(&self) -> String {
        if self.target_repo.contains('/') {
            self.target_repo.clone()
        } else {
            format!("{}/{}", self.username, self.target_repo)
        }
    }
}

/// Replaces every character outside `[A-Za-z0-9_-]` (path separators
/// included) with an underscore. Idempotent.
pub fn sanitize_repo_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

pub struct CollectArgs {
    pub source_repo: Option<String>,
    pub target_repo: Option<String>,
    pub username: Option<String>,
    pub quant_choice: Option<String>,
    pub assume_yes: bool,
}

/// Gathers the request, prompting for whatever the command line did not
/// provide. Returns `None` when the operator declines the confirmation.
pub fn collect(args: CollectArgs) -> Result<Option<ConvertRequest>> {
    let source_repo = match args.source_repo {
        Some(v) => v,
        None => prompt::line("Source model on the Hub (e.g. org/model): ")?,
    };
    let target_repo = match args.target_repo {
        Some(v) => v,
        None => prompt::line("Destination repo for the converted model: ")?,
    };
    let username = match args.username {
        Some(v) => v,
        None if args.assume_yes => match target_repo.split_once('/') {
            Some((owner, _)) => owner.to_string(),
            None => anyhow::bail!("--yes requires --username or an owner in the target repo id"),
        },
        None => prompt::line("Hugging Face username: ")?,
    };
    let quant_choice = match args.quant_choice {
        Some(v) => v,
        None => {
            println!("Quantization:");
            println!("  1) none (keep fp16)");
            println!("  2) 4-bit (group size 64)");
            println!("  3) 8-bit (group size 128)");
            prompt::line("Choice [1/2/3]: ")?
        }
    };
    let quantization = Quantization::from_menu(&quant_choice);

    let request =
        ConvertRequest { source_repo, target_repo, username, quantization };

    println!();
    println!("About to convert:");
    println!("  Source:       {}", request.source_repo);
    println!("  Destination:  {}", request.qualified_target());
    println!("  Quantization: {}", request.quantization.summary());
    if !args.assume_yes && !prompt::yes_no("Proceed?")? {
        return Ok(None);
    }
    Ok(Some(request))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: &str, target: &str, quant: Quantization) -> ConvertRequest {
        ConvertRequest {
            source_repo: source.to_string(),
            target_repo: target.to_string(),
            username: "me".to_string(),
            quantization: quant,
        }
    }

    #[test]
    fn sanitize_replaces_non_portable_chars() {
        assert_eq!(sanitize_repo_id("org/tiny-model"), "org_tiny-model");
        assert_eq!(sanitize_repo_id("a b.c/d"), "a_b_c_d");
        assert_eq!(sanitize_repo_id("Already_safe-1"), "Already_safe-1");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_repo_id("org/model v2 (final)");
        assert_eq!(sanitize_repo_id(&once), once);
    }

    #[test]
    fn menu_choice_two_is_4_bit() {
        assert_eq!(
            Quantization::from_menu("2"),
            Quantization::Enabled(QuantParams { bits: 4, group_size: 64 })
        );
    }

    #[test]
    fn menu_choice_three_is_8_bit() {
        assert_eq!(
            Quantization::from_menu("3"),
            Quantization::Enabled(QuantParams { bits: 8, group_size: 128 })
        );
    }

    #[test]
    fn other_menu_choices_disable_quantization() {
        for choice in ["1", "", "4", "yes", "22"] {
            assert_eq!(Quantization::from_menu(choice), Quantization::Disabled);
        }
    }

    #[test]
    fn directory_names_follow_the_request() {
        let req = request("org/tiny-model", "me/tiny-model-mlx", Quantization::Disabled);
        assert_eq!(req.source_dir_name(), "org_tiny-model");
        assert_eq!(req.target_dir_name(), "tiny-model-mlx_mlx");
    }

    #[test]
    fn qualified_target_prefixes_username_when_missing() {
        let req = request("org/m", "tiny-mlx", Quantization::Disabled);
        assert_eq!(req.qualified_target(), "me/tiny-mlx");
        let req = request("org/m", "other/tiny-mlx", Quantization::Disabled);
        assert_eq!(req.qualified_target(), "other/tiny-mlx");
    }

    #[test]
    fn quantization_summary_strings() {
        assert_eq!(Quantization::from_menu("2").summary(), "Yes (4-bit)");
        assert_eq!(Quantization::from_menu("1").summary(), "No");
    }
}
