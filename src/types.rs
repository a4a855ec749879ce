//! Type-safe vocabulary for contracts
//!
//! Roles, statuses and CLI choices are proper Rust enums instead of the
//! loose strings found in pipeline JSON, so every match is exhaustive and a
//! typo in a contract document fails at load time.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Whether an asset is consumed or produced by its task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Input,
    #[default]
    Output,
}

/// Result of the most recent existence/integrity check of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum AssetStatus {
    /// Never checked
    #[default]
    Pending,
    Ok,
    Missing,
    Corrupt,
    /// Exists or may exist, but the check itself could not complete
    Unverified,
}

impl AssetStatus {
    /// Whether the asset has been through at least one check
    pub fn is_checked(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether this status fails a run when the asset is required
    pub fn is_unresolved(self) -> bool {
        matches!(self, Self::Missing | Self::Corrupt | Self::Unverified)
    }

    /// Fixed-width tag used in per-asset listings
    pub fn tag(self) -> &'static str {
        match self {
            Self::Pending => "[PENDING]   ",
            Self::Ok => "[OK]        ",
            Self::Missing => "[MISSING]   ",
            Self::Corrupt => "[CORRUPT]   ",
            Self::Unverified => "[UNVERIFIED]",
        }
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum RunStatus {
    #[default]
    Started,
    Running,
    Complete,
    Failed,
    Incomplete,
}

impl RunStatus {
    /// Terminal statuses are only ever written by finalize
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Incomplete)
    }
}

/// Outcome the pipeline reports to `finalize --status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineOutcome {
    Complete,
    Failed,
}

/// Where finalize publishes contract documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContractScope {
    /// One document with every asset at the output root
    Run,
    /// One filtered document per asset folder
    #[default]
    Folder,
}

/// Output format of `cloud-run-env`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[derive(Display, EnumString, clap::ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum EnvFormat {
    #[default]
    Dotenv,
    Shell,
    SetEnvVars,
    Json,
}

/// Parse the loose boolean spellings shell scripts pass around
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_status_serialization_matches_display() {
        for status in AssetStatus::iter() {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
        for status in RunStatus::iter() {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::from_str("input").unwrap(), Role::Input);
        assert_eq!(Role::from_str("output").unwrap(), Role::Output);
        assert!(Role::from_str("sideways").is_err());
        assert_eq!(serde_json::to_string(&Role::Input).unwrap(), "\"input\"");
    }

    #[test]
    fn test_unresolved_statuses() {
        assert!(!AssetStatus::Ok.is_unresolved());
        assert!(!AssetStatus::Pending.is_unresolved());
        assert!(AssetStatus::Missing.is_unresolved());
        assert!(AssetStatus::Corrupt.is_unresolved());
        assert!(AssetStatus::Unverified.is_unresolved());
    }

    #[test]
    fn test_status_tags_share_width() {
        let widths: Vec<usize> = AssetStatus::iter().map(|s| s.tag().len()).collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_pipeline_outcome_is_case_insensitive() {
        assert_eq!(
            PipelineOutcome::from_str("failed").unwrap(),
            PipelineOutcome::Failed
        );
        assert_eq!(
            PipelineOutcome::from_str("COMPLETE").unwrap(),
            PipelineOutcome::Complete
        );
    }

    #[test]
    fn test_env_format_names() {
        assert_eq!(EnvFormat::SetEnvVars.to_string(), "set-env-vars");
        assert_eq!(EnvFormat::from_str("dotenv").unwrap(), EnvFormat::Dotenv);
    }

    #[test]
    fn test_parse_bool_spellings() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_all_enums_have_default() {
        assert_eq!(Role::default(), Role::Output);
        assert_eq!(AssetStatus::default(), AssetStatus::Pending);
        assert_eq!(RunStatus::default(), RunStatus::Started);
        assert_eq!(ContractScope::default(), ContractScope::Folder);
    }
}
