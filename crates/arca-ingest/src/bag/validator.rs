//! BagIt validation against manifests and a declarative config

use crate::bag::reader::{self, file_name_is_valid};
use crate::bag::validation_config::{BagValidationConfig, Presence};
use crate::constants::{Access, ALG_MD5, ALG_SHA256};
use crate::models::{IntellectualObject, Tag, WorkSummary};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;

/// What one validation run produced: the parsed object, plus separate
/// summaries for the structural read and the rule checks.
#[derive(Debug)]
pub struct ValidationResult {
    pub parse_summary: WorkSummary,
    pub validation_summary: WorkSummary,
    pub object: IntellectualObject,
}

impl ValidationResult {
    pub fn has_errors(&self) -> bool {
        self.parse_summary.has_errors()
            || self.validation_summary.has_errors()
            || !self.object.ingest_error_message.is_empty()
    }
}

/// Validates one bag, given as either a tar file or an extracted directory.
pub struct BagValidator {
    path_to_bag: PathBuf,
    institution: String,
    config: BagValidationConfig,
}

impl BagValidator {
    pub fn new(
        path_to_bag: impl Into<PathBuf>,
        institution: impl Into<String>,
        config: BagValidationConfig,
    ) -> Result<Self> {
        let path_to_bag = path_to_bag.into();
        if !path_to_bag.exists() {
            return Err(anyhow!("Bag does not exist at {}", path_to_bag.display()));
        }
        Ok(Self {
            path_to_bag,
            institution: institution.into(),
            config,
        })
    }

    /// Read and validate the bag. Structural failures stop the run; rule
    /// violations accumulate so the depositor sees everything wrong at once.
    pub fn validate(&self) -> ValidationResult {
        let (mut object, parse_summary) = if self.path_to_bag.is_dir() {
            reader::read_bag_dir(&self.path_to_bag, &self.institution)
        } else {
            reader::untar_bag(&self.path_to_bag, &self.institution)
        };

        let mut validation_summary = WorkSummary::new();
        if parse_summary.has_errors() {
            object.ingest_error_message = parse_summary.all_errors_as_string();
            return ValidationResult {
                parse_summary,
                validation_summary,
                object,
            };
        }

        validation_summary.start();
        let manifests = self.attach_manifest_digests(&mut object, &mut validation_summary);
        self.parse_tag_files(&mut object, &mut validation_summary);
        self.apply_access_tag(&mut object);

        self.verify_file_names(&object, &mut validation_summary);
        self.verify_bagit_declaration(&object, &mut validation_summary);
        self.verify_manifest_coverage(&object, &manifests, &mut validation_summary);
        self.verify_checksums(&mut object, &mut validation_summary);
        self.verify_top_level_contents(&object, &mut validation_summary);
        self.verify_file_specs(&object, &mut validation_summary);
        self.verify_tag_specs(&object, &mut validation_summary);

        if validation_summary.has_errors() {
            // Everything caught here is a property of the bag itself; no
            // retry can fix it.
            validation_summary.retry = false;
            validation_summary.error_is_fatal = true;
            object.ingest_error_message = validation_summary.all_errors_as_string();
        }
        validation_summary.finish();

        ValidationResult {
            parse_summary,
            validation_summary,
            object,
        }
    }

    /// Parse every payload and tag manifest and copy the claimed digests
    /// onto the matching files. Returns alg -> (path -> digest) for the
    /// payload manifests, which coverage checking needs later.
    fn attach_manifest_digests(
        &self,
        object: &mut IntellectualObject,
        summary: &mut WorkSummary,
    ) -> HashMap<String, HashMap<String, String>> {
        let untarred = PathBuf::from(&object.ingest_untarred_path);
        let mut payload_claims: HashMap<String, HashMap<String, String>> = HashMap::new();

        for algorithm in [ALG_MD5, ALG_SHA256] {
            for manifest_name in [
                format!("manifest-{}.txt", algorithm),
                format!("tagmanifest-{}.txt", algorithm),
            ] {
                let manifest_path = untarred.join(&manifest_name);
                if !manifest_path.exists() {
                    continue;
                }
                let content = match std::fs::read_to_string(&manifest_path) {
                    Ok(content) => content,
                    Err(err) => {
                        summary.add_error(format!("Cannot read {}: {}", manifest_name, err));
                        continue;
                    }
                };
                for (line_number, line) in content.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let Some((digest, rel_path)) = parse_manifest_line(line) else {
                        summary.add_error(format!(
                            "Bad line {} in {}: '{}'",
                            line_number + 1,
                            manifest_name,
                            line
                        ));
                        continue;
                    };
                    if manifest_name.starts_with("manifest-") {
                        payload_claims
                            .entry(algorithm.to_string())
                            .or_default()
                            .insert(rel_path.clone(), digest.clone());
                    }
                    if let Some(gf) = object
                        .generic_files
                        .iter_mut()
                        .find(|gf| gf.original_path() == rel_path)
                    {
                        match algorithm {
                            ALG_MD5 => gf.ingest_manifest_md5 = digest,
                            _ => gf.ingest_manifest_sha256 = digest,
                        }
                    }
                }
            }
        }
        payload_claims
    }

    /// Parse `Label: value` tag files, with folded continuation lines.
    fn parse_tag_files(&self, object: &mut IntellectualObject, summary: &mut WorkSummary) {
        let untarred = PathBuf::from(&object.ingest_untarred_path);
        let mut tag_files = self
            .config
            .tag_files_to_parse()
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        tag_files.sort();

        for rel_path in tag_files {
            let path = untarred.join(&rel_path);
            if !path.exists() {
                // Presence rules are the file specs' job.
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    summary.add_error(format!("Cannot read tag file {}: {}", rel_path, err));
                    continue;
                }
            };
            for tag in parse_tags(&content, &rel_path) {
                object.ingest_tags.push(tag);
            }
        }
    }

    fn apply_access_tag(&self, object: &mut IntellectualObject) {
        let access = object
            .find_tags("Access")
            .first()
            .map(|t| t.value.trim().to_lowercase());
        match access.as_deref() {
            Some("consortia") => object.access = Access::Consortia,
            Some("institution") => object.access = Access::Institution,
            Some("restricted") => object.access = Access::Restricted,
            _ => {} // Illegal values surface through the tag specs.
        }
        let title = object
            .find_tags("Title")
            .first()
            .map(|t| t.value.trim().to_string());
        if let Some(title) = title.filter(|t| !t.is_empty()) {
            object.title = title;
        }
        let description = object
            .find_tags("Internal-Sender-Description")
            .first()
            .map(|t| t.value.trim().to_string());
        if let Some(description) = description {
            object.description = description;
        }
    }

    fn verify_file_names(&self, object: &IntellectualObject, summary: &mut WorkSummary) {
        for gf in &object.generic_files {
            if !file_name_is_valid(gf.original_path()) {
                summary.add_error(format!(
                    "File name '{}' contains characters the packaging spec does not allow.",
                    gf.original_path()
                ));
            }
        }
    }

    fn verify_bagit_declaration(&self, object: &IntellectualObject, summary: &mut WorkSummary) {
        if self.config.accept_bagit_version.is_empty() {
            return;
        }
        let declared = object
            .find_tags("BagIt-Version")
            .first()
            .map(|t| t.value.trim().to_string());
        match declared {
            None => {
                if object.find_file("bagit.txt").is_some() {
                    summary.add_error(
                        "bagit.txt is present but declares no BagIt-Version.".to_string(),
                    );
                }
            }
            Some(version) => {
                if !self
                    .config
                    .accept_bagit_version
                    .iter()
                    .any(|v| v == &version)
                {
                    summary.add_error(format!(
                        "BagIt-Version '{}' is not in the list of accepted versions ({}).",
                        version,
                        self.config.accept_bagit_version.join(", ")
                    ));
                }
            }
        }
    }

    fn verify_manifest_coverage(
        &self,
        object: &IntellectualObject,
        payload_claims: &HashMap<String, HashMap<String, String>>,
        summary: &mut WorkSummary,
    ) {
        if payload_claims.is_empty() {
            summary.add_error("Bag contains no payload manifest.".to_string());
            return;
        }

        // Every file a manifest lists must exist in the bag.
        for (algorithm, claims) in payload_claims {
            for rel_path in claims.keys() {
                if object.find_file(rel_path).is_none() {
                    summary.add_error(format!(
                        "File '{}' listed in manifest-{}.txt is missing from the bag.",
                        rel_path, algorithm
                    ));
                }
            }
        }

        // Every payload file in the bag must be listed somewhere.
        for gf in &object.generic_files {
            let rel_path = gf.original_path();
            if !rel_path.starts_with("data/") {
                continue;
            }
            let listed = payload_claims
                .values()
                .any(|claims| claims.contains_key(rel_path));
            if !listed {
                summary.add_error(format!(
                    "File '{}' is present in the bag but not listed in any payload manifest.",
                    rel_path
                ));
            }
        }
    }

    fn verify_checksums(&self, object: &mut IntellectualObject, summary: &mut WorkSummary) {
        let now = Utc::now();
        for gf in &mut object.generic_files {
            if !gf.ingest_manifest_md5.is_empty() && gf.ingest_manifest_md5 != gf.ingest_md5 {
                summary.add_error(format!(
                    "Md5 digest for '{}': manifest says '{}', file digest is '{}'",
                    gf.original_path(),
                    gf.ingest_manifest_md5,
                    gf.ingest_md5
                ));
            } else {
                gf.ingest_md5_verified_at = Some(now);
            }
            if !gf.ingest_manifest_sha256.is_empty()
                && gf.ingest_manifest_sha256 != gf.ingest_sha256
            {
                summary.add_error(format!(
                    "Sha256 digest for '{}': manifest says '{}', file digest is '{}'",
                    gf.original_path(),
                    gf.ingest_manifest_sha256,
                    gf.ingest_sha256
                ));
            } else {
                gf.ingest_sha256_verified_at = Some(now);
            }
        }
    }

    fn verify_top_level_contents(&self, object: &IntellectualObject, summary: &mut WorkSummary) {
        for gf in &object.generic_files {
            let rel_path = gf.original_path();
            if rel_path == "fetch.txt" && !self.config.allow_fetch_txt {
                summary.add_error("Bag contains fetch.txt, which this profile forbids.".to_string());
                continue;
            }
            match rel_path.split_once('/') {
                None => {
                    if !self.config.allow_misc_top_level_files
                        && !is_standard_top_level_file(rel_path)
                        && !self.config.file_specs.contains_key(rel_path)
                    {
                        summary.add_error(format!(
                            "Bag contains unexpected top-level file '{}'.",
                            rel_path
                        ));
                    }
                }
                Some((top_dir, _)) => {
                    if top_dir != "data"
                        && !self.config.allow_misc_directories
                        && !self.config.file_specs.contains_key(rel_path)
                    {
                        summary.add_error(format!(
                            "Bag contains file '{}' in unexpected directory '{}'.",
                            rel_path, top_dir
                        ));
                    }
                }
            }
        }
    }

    fn verify_file_specs(&self, object: &IntellectualObject, summary: &mut WorkSummary) {
        let mut paths: Vec<&String> = self.config.file_specs.keys().collect();
        paths.sort();
        for path in paths {
            let spec = &self.config.file_specs[path];
            let present = object.find_file(path).is_some();
            match spec.presence {
                Presence::Required if !present => {
                    summary.add_error(format!("Required file '{}' is missing.", path));
                }
                Presence::Forbidden if present => {
                    summary.add_error(format!("Bag contains forbidden file '{}'.", path));
                }
                _ => {}
            }
        }
    }

    fn verify_tag_specs(&self, object: &IntellectualObject, summary: &mut WorkSummary) {
        let mut labels: Vec<&String> = self.config.tag_specs.keys().collect();
        labels.sort();
        for label in labels {
            let spec = &self.config.tag_specs[label];
            let tags = object.find_tags(label);
            match spec.presence {
                Presence::Forbidden => {
                    if let Some(tag) = tags.first() {
                        summary.add_error(format!(
                            "Forbidden tag '{}' found in file '{}'.",
                            label, tag.source_file
                        ));
                    }
                    continue;
                }
                Presence::Required => {
                    if tags.is_empty() {
                        summary.add_error(format!("Required tag '{}' is missing.", label));
                        continue;
                    }
                    if !spec.empty_ok && tags.iter().all(|t| t.value.trim().is_empty()) {
                        summary.add_error(format!("Value for tag '{}' is missing.", label));
                    }
                }
                Presence::Optional => {}
            }
            if !tags.is_empty() && !spec.allowed_values.is_empty() {
                let mut value_ok = false;
                let mut last_value = String::new();
                for tag in &tags {
                    let tag_value = tag.value.trim().to_lowercase();
                    last_value = tag_value.clone();
                    if spec
                        .allowed_values
                        .iter()
                        .any(|allowed| allowed.trim().to_lowercase() == tag_value)
                    {
                        value_ok = true;
                    }
                }
                if !value_ok {
                    summary.add_error(format!(
                        "Tag '{}' has illegal value '{}'.",
                        label, last_value
                    ));
                }
            }
        }
    }
}

/// One manifest line: hex digest, whitespace, bag-relative path. Paths may
/// contain spaces, so only the first whitespace run splits.
fn parse_manifest_line(line: &str) -> Option<(String, String)> {
    let (digest, rest) = line.split_once(char::is_whitespace)?;
    let path = rest.trim();
    if digest.is_empty() || path.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((digest.to_lowercase(), path.to_string()))
}

/// Parse `Label: value` lines with RFC 2822 style folded continuations.
fn parse_tags(content: &str, source_file: &str) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    for line in content.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = tags.last_mut() {
                if !last.value.is_empty() {
                    last.value.push(' ');
                }
                last.value.push_str(line.trim());
            }
            continue;
        }
        if let Some((label, value)) = line.split_once(':') {
            tags.push(Tag {
                source_file: source_file.to_string(),
                label: label.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }
    tags
}

fn is_standard_top_level_file(name: &str) -> bool {
    name == "bagit.txt"
        || name == "bag-info.txt"
        || crate::constants::MANIFEST_NAME_PATTERN.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest_line() {
        assert_eq!(
            parse_manifest_line("5891b5b5  data/hello.txt"),
            Some(("5891b5b5".to_string(), "data/hello.txt".to_string()))
        );
        assert_eq!(
            parse_manifest_line("ABC123 data/with space.txt"),
            Some(("abc123".to_string(), "data/with space.txt".to_string()))
        );
        assert_eq!(parse_manifest_line("not-hex data/x"), None);
        assert_eq!(parse_manifest_line("deadbeef"), None);
    }

    #[test]
    fn test_parse_tags_with_continuation() {
        let content = "Title: A Very Long\n  Title Indeed\nAccess: Institution\nNo-colon-line\n";
        let tags = parse_tags(content, "bag-info.txt");
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].label, "Title");
        assert_eq!(tags[0].value, "A Very Long Title Indeed");
        assert_eq!(tags[1].label, "Access");
        assert_eq!(tags[1].value, "Institution");
        assert_eq!(tags[0].source_file, "bag-info.txt");
    }

    #[test]
    fn test_standard_top_level_names() {
        assert!(is_standard_top_level_file("bagit.txt"));
        assert!(is_standard_top_level_file("manifest-sha256.txt"));
        assert!(is_standard_top_level_file("tagmanifest-md5.txt"));
        assert!(!is_standard_top_level_file("random.txt"));
    }
}
