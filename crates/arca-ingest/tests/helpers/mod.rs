//! Shared fixtures: builds real BagIt tars in a temp dir.

use arca_common::checksum::compute_digests;
use arca_ingest::bag::BagValidationConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Builds a tarred bag the way a depositor would package one: a single
/// top-level directory, bagit.txt, tag files, payload manifests and data.
pub struct BagBuilder {
    bag_name: String,
    top_dir: Option<String>,
    payload: BTreeMap<String, Vec<u8>>,
    tag_files: BTreeMap<String, String>,
    digest_overrides: BTreeMap<(String, String), String>,
    omit_from_manifests: Vec<String>,
    extra_manifest_entries: Vec<(String, String, String)>,
    symlinks: Vec<(String, String)>,
}

impl BagBuilder {
    pub fn new(bag_name: &str) -> Self {
        let mut tag_files = BTreeMap::new();
        tag_files.insert(
            "bagit.txt".to_string(),
            "BagIt-Version: 0.97\nTag-File-Character-Encoding: UTF-8\n".to_string(),
        );
        tag_files.insert(
            "bag-info.txt".to_string(),
            "Title: Test Bag\nAccess: Institution\nSource-Organization: Test Inst\n".to_string(),
        );
        Self {
            bag_name: bag_name.to_string(),
            top_dir: None,
            payload: BTreeMap::new(),
            tag_files,
            digest_overrides: BTreeMap::new(),
            omit_from_manifests: Vec::new(),
            extra_manifest_entries: Vec::new(),
            symlinks: Vec::new(),
        }
    }

    pub fn with_payload(mut self, path: &str, content: &[u8]) -> Self {
        self.payload.insert(path.to_string(), content.to_vec());
        self
    }

    pub fn with_tag_file(mut self, name: &str, content: &str) -> Self {
        self.tag_files.insert(name.to_string(), content.to_string());
        self
    }

    /// Lie about a digest in the named payload manifest.
    pub fn with_digest_override(mut self, algorithm: &str, path: &str, digest: &str) -> Self {
        self.digest_overrides
            .insert((algorithm.to_string(), path.to_string()), digest.to_string());
        self
    }

    /// Leave a payload file out of every payload manifest.
    pub fn omitting_from_manifests(mut self, path: &str) -> Self {
        self.omit_from_manifests.push(path.to_string());
        self
    }

    /// Add a manifest line for a file that isn't in the bag.
    pub fn with_phantom_manifest_entry(
        mut self,
        algorithm: &str,
        path: &str,
        digest: &str,
    ) -> Self {
        self.extra_manifest_entries.push((
            algorithm.to_string(),
            path.to_string(),
            digest.to_string(),
        ));
        self
    }

    pub fn with_symlink(mut self, path: &str, target: &str) -> Self {
        self.symlinks.push((path.to_string(), target.to_string()));
        self
    }

    /// Repackage under a different top-level directory name (to break the
    /// tar-name-matches-directory rule).
    pub fn with_top_dir(mut self, top_dir: &str) -> Self {
        self.top_dir = Some(top_dir.to_string());
        self
    }

    /// Write `<dir>/<bag_name>.tar` and return its path.
    pub fn write_tar(self, dir: &Path) -> PathBuf {
        let tar_path = dir.join(format!("{}.tar", self.bag_name));
        let top_dir = self.top_dir.clone().unwrap_or_else(|| self.bag_name.clone());

        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (path, content) in &self.tag_files {
            entries.insert(path.clone(), content.as_bytes().to_vec());
        }
        for (path, content) in &self.payload {
            entries.insert(path.clone(), content.clone());
        }

        // Payload manifests cover data/; the tag manifest covers the rest.
        for algorithm in ["md5", "sha256"] {
            let mut lines = String::new();
            for (path, content) in &self.payload {
                if self.omit_from_manifests.contains(path) {
                    continue;
                }
                let digest = match self
                    .digest_overrides
                    .get(&(algorithm.to_string(), path.clone()))
                {
                    Some(fake) => fake.clone(),
                    None => digest_of(content, algorithm),
                };
                lines.push_str(&format!("{}  {}\n", digest, path));
            }
            for (alg, path, digest) in &self.extra_manifest_entries {
                if alg == algorithm {
                    lines.push_str(&format!("{}  {}\n", digest, path));
                }
            }
            entries.insert(format!("manifest-{}.txt", algorithm), lines.into_bytes());
        }

        let mut tag_lines = String::new();
        for name in self.tag_files.keys().chain(
            ["manifest-md5.txt".to_string(), "manifest-sha256.txt".to_string()].iter(),
        ) {
            if let Some(content) = entries.get(name) {
                tag_lines.push_str(&format!("{}  {}\n", digest_of(content, "sha256"), name));
            }
        }
        entries.insert("tagmanifest-sha256.txt".to_string(), tag_lines.into_bytes());

        let file = std::fs::File::create(&tar_path).expect("create tar");
        let mut builder = tar::Builder::new(file);

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_mtime(1_700_000_000);
        builder
            .append_data(&mut dir_header, format!("{}/", top_dir), std::io::empty())
            .expect("append dir");

        for (path, content) in &entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(1_700_000_000);
            builder
                .append_data(&mut header, format!("{}/{}", top_dir, path), content.as_slice())
                .expect("append entry");
        }
        for (path, target) in &self.symlinks {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_mtime(1_700_000_000);
            builder
                .append_link(&mut header, format!("{}/{}", top_dir, path), target)
                .expect("append symlink");
        }
        builder.finish().expect("finish tar");
        tar_path
    }
}

pub fn digest_of(content: &[u8], algorithm: &str) -> String {
    let digests = compute_digests(&mut &content[..]).expect("digest");
    match algorithm {
        "md5" => digests.md5,
        _ => digests.sha256,
    }
}

/// The validation profile the tests run against, close to the production
/// default: both fixity algorithms, required declaration and info files,
/// required Title and Access tags.
pub fn default_validation_config() -> BagValidationConfig {
    serde_json::from_str(
        r#"{
            "ProfileName": "test-default",
            "AcceptBagItVersion": ["0.97"],
            "AcceptSerialization": ["application/tar"],
            "AllowFetchTxt": false,
            "AllowMiscTopLevelFiles": true,
            "AllowMiscDirectories": false,
            "FixityAlgorithms": ["md5", "sha256"],
            "FileSpecs": {
                "bagit.txt": {"Presence": "REQUIRED", "ParseAsTagFile": true},
                "bag-info.txt": {"Presence": "REQUIRED", "ParseAsTagFile": true},
                "data/secret.key": {"Presence": "FORBIDDEN"}
            },
            "TagSpecs": {
                "Title": {"Presence": "REQUIRED", "EmptyOK": false},
                "Access": {"Presence": "REQUIRED", "EmptyOK": false,
                           "AllowedValues": ["Consortia", "Institution", "Restricted"]}
            }
        }"#,
    )
    .expect("test validation config")
}
