//! Declarative bag validation config
//!
//! A JSON file describes what a valid bag looks like for one depositor
//! profile: which files and tags must or must not be present, which tag
//! values are allowed, which fixity algorithms the manifests must cover.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Whether a file or tag must be present, may be present, or must not be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Presence {
    Required,
    #[default]
    Optional,
    Forbidden,
}

/// Expectations for one bag-relative path.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct FileSpec {
    #[serde(default)]
    pub presence: Presence,

    /// Parse this file's `Tag-Name: value` lines into the object's tag list.
    #[serde(default)]
    pub parse_as_tag_file: bool,
}

/// Expectations for one tag, matched by label across all parsed tag files.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct TagSpec {
    #[serde(default)]
    pub presence: Presence,

    /// Whether a present-but-empty value satisfies a required tag.
    #[serde(default, rename = "EmptyOK")]
    pub empty_ok: bool,

    /// When non-empty, the tag's value must match one of these,
    /// case-insensitively and ignoring surrounding whitespace.
    #[serde(default)]
    pub allowed_values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct BagValidationConfig {
    #[serde(default)]
    pub profile_name: String,

    #[serde(default, rename = "AcceptBagItVersion")]
    pub accept_bagit_version: Vec<String>,

    #[serde(default)]
    pub accept_serialization: Vec<String>,

    #[serde(default)]
    pub allow_fetch_txt: bool,

    #[serde(default)]
    pub allow_misc_top_level_files: bool,

    #[serde(default)]
    pub allow_misc_directories: bool,

    /// Subset of {md5, sha256}; the bag must carry a payload manifest for
    /// each.
    #[serde(default)]
    pub fixity_algorithms: Vec<String>,

    #[serde(default)]
    pub file_specs: HashMap<String, FileSpec>,

    #[serde(default)]
    pub tag_specs: HashMap<String, TagSpec>,
}

impl BagValidationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bag validation config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse bag validation config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for algorithm in &self.fixity_algorithms {
            if algorithm != "md5" && algorithm != "sha256" {
                anyhow::bail!(
                    "Unsupported fixity algorithm '{}' in profile '{}'",
                    algorithm,
                    self.profile_name
                );
            }
        }
        Ok(())
    }

    /// Bag-relative paths that should be parsed for tags.
    pub fn tag_files_to_parse(&self) -> Vec<&str> {
        self.file_specs
            .iter()
            .filter(|(_, spec)| spec.parse_as_tag_file)
            .map(|(path, _)| path.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "ProfileName": "default",
        "AcceptBagItVersion": ["0.97"],
        "AcceptSerialization": ["application/tar"],
        "AllowFetchTxt": false,
        "AllowMiscTopLevelFiles": true,
        "AllowMiscDirectories": true,
        "FixityAlgorithms": ["md5", "sha256"],
        "FileSpecs": {
            "bagit.txt": {"Presence": "REQUIRED", "ParseAsTagFile": true},
            "bag-info.txt": {"Presence": "REQUIRED", "ParseAsTagFile": true},
            "data/secret.key": {"Presence": "FORBIDDEN"}
        },
        "TagSpecs": {
            "Access": {"Presence": "REQUIRED", "EmptyOK": false,
                       "AllowedValues": ["Consortia", "Institution", "Restricted"]},
            "Title": {"Presence": "REQUIRED", "EmptyOK": false}
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config: BagValidationConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.profile_name, "default");
        assert_eq!(config.fixity_algorithms, vec!["md5", "sha256"]);
        assert_eq!(config.file_specs["bagit.txt"].presence, Presence::Required);
        assert!(config.file_specs["bagit.txt"].parse_as_tag_file);
        assert_eq!(
            config.file_specs["data/secret.key"].presence,
            Presence::Forbidden
        );
        assert!(!config.tag_specs["Access"].empty_ok);
        assert_eq!(config.tag_specs["Access"].allowed_values.len(), 3);

        let mut to_parse = config.tag_files_to_parse();
        to_parse.sort_unstable();
        assert_eq!(to_parse, vec!["bag-info.txt", "bagit.txt"]);
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let config = BagValidationConfig {
            fixity_algorithms: vec!["sha512".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = BagValidationConfig::load(&path).unwrap();
        assert_eq!(config.profile_name, "default");
    }
}
