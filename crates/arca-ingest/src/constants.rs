//! Shared constants and enumerations for the ingest pipeline

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Tar files that are one part of a multipart bag carry a suffix like
/// "my_bag.b04.of12" once ".tar" has been stripped.
pub static MULTIPART_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.b\d+\.of\d+$").expect("multipart suffix regex"));

/// A valid file name within a bag: exactly one alphanumeric character, or
/// 2+ characters beginning with alphanumeric, dot or underscore, followed by
/// alphanumerics, dots, dashes, underscores and percent signs.
pub static BAG_FILE_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9])$|^([A-Za-z0-9._][A-Za-z0-9.\-_%]+)$").expect("file name regex")
});

/// Payload manifests and tag manifests: manifest-md5.txt, tagmanifest-sha256.txt
pub static MANIFEST_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(tag)?manifest-(md5|sha256)\.txt$").expect("manifest regex"));

/// Storage UUIDs as they appear as the last component of storage URLs.
pub static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("uuid regex")
});

pub const ALG_MD5: &str = "md5";
pub const ALG_SHA256: &str = "sha256";

/// Files at/above this size are spooled to a disk temp file before upload
/// instead of being buffered in memory. 50 MiB.
pub const LARGE_FILE_THRESHOLD: i64 = 50 * 1024 * 1024;

/// Multipart upload part-size ladder. Larger files get larger parts and less
/// part concurrency so memory use stays bounded.
pub const MIN_PART_SIZE: i64 = 5 * 1024 * 1024;

/// On large uploads, network errors are common; verify-and-retry this many
/// times per destination before surfacing an error.
pub const MAX_UPLOAD_ATTEMPTS: u32 = 15;

/// How many generic files go into a single batch-create call to the registry.
pub const GENERIC_FILE_BATCH_SIZE: usize = 100;

/// Cold-tier retrieval tier. Bulk is the cheap/slow option (5-12 hours),
/// which is fine because nothing downstream is waiting interactively.
pub const RETRIEVAL_TIER: &str = "Bulk";

/// Days a restored object stays in the hot tier, so repeated downstream
/// attempts don't have to re-initiate retrieval.
pub const DAYS_TO_KEEP_IN_HOT_TIER: i32 = 60;

/// Interval between availability checks once a restore has been accepted.
pub const HOURS_BETWEEN_RESTORE_CHECKS: i64 = 3;

/// Pick multipart part size and in-flight part count for an upload.
pub fn part_size_for(file_size: i64) -> (i64, usize) {
    const MIB: i64 = 1024 * 1024;
    if file_size >= 50 * 1024 * MIB {
        (1024 * MIB, 1)
    } else if file_size >= 5 * 1024 * MIB {
        (512 * MIB, 1)
    } else if file_size >= 500 * MIB {
        (128 * MIB, 2)
    } else {
        (MIN_PART_SIZE, 5)
    }
}

/// What a work item asks the pipeline to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Ingest,
    Restore,
    Delete,
    #[serde(rename = "Fixity Check")]
    FixityCheck,
    Federation,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ingest => "Ingest",
            Action::Restore => "Restore",
            Action::Delete => "Delete",
            Action::FixityCheck => "Fixity Check",
            Action::Federation => "Federation",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a work item is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Requested,
    Receive,
    Fetch,
    Unpack,
    Validate,
    Store,
    Record,
    Cleanup,
    Resolve,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Requested => "Requested",
            Stage::Receive => "Receive",
            Stage::Fetch => "Fetch",
            Stage::Unpack => "Unpack",
            Stage::Validate => "Validate",
            Stage::Store => "Store",
            Stage::Record => "Record",
            Stage::Cleanup => "Cleanup",
            Stage::Resolve => "Resolve",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work item status as recorded in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Started,
    Success,
    Failed,
    Cancelled,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "Pending",
            Status::Started => "Started",
            Status::Success => "Success",
            Status::Failed => "Failed",
            Status::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access level of an intellectual object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Consortia,
    #[default]
    Institution,
    Restricted,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Consortia => "consortia",
            Access::Institution => "institution",
            Access::Restricted => "restricted",
        }
    }
}

/// PREMIS event types used by the pipeline, following the Library of
/// Congress preservation vocabulary.
pub mod event {
    pub const INGESTION: &str = "ingest";
    pub const VALIDATION: &str = "validation";
    pub const FIXITY_GENERATION: &str = "fixity_generation";
    pub const FIXITY_CHECK: &str = "fixity_check";
    pub const IDENTIFIER_ASSIGNMENT: &str = "identifier_assignment";
    pub const ACCESS_ASSIGNMENT: &str = "access_assignment";
    pub const REPLICATION: &str = "replication";
    pub const DELETION: &str = "deletion";

    pub const ALL: &[&str] = &[
        INGESTION,
        VALIDATION,
        FIXITY_GENERATION,
        FIXITY_CHECK,
        IDENTIFIER_ASSIGNMENT,
        ACCESS_ASSIGNMENT,
        REPLICATION,
        DELETION,
    ];
}

/// Identifier kinds for identifier_assignment events.
pub const ID_TYPE_STORAGE_URL: &str = "url";
pub const ID_TYPE_BAG_AND_PATH: &str = "bag/filepath";

/// Bag-relative paths that never go to long-term storage: the BagIt
/// declaration and the manifests, which can be regenerated from the
/// registry's checksum records.
pub fn has_savable_name(bag_relative_path: &str) -> bool {
    if bag_relative_path == "bagit.txt" {
        return false;
    }
    !MANIFEST_NAME_PATTERN.is_match(bag_relative_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multipart_suffix() {
        assert!(MULTIPART_SUFFIX.is_match("my_bag.b04.of12"));
        assert!(MULTIPART_SUFFIX.is_match("x.b1.of2"));
        assert!(!MULTIPART_SUFFIX.is_match("my_bag"));
        assert!(!MULTIPART_SUFFIX.is_match("my_bag.b04of12"));
    }

    #[test]
    fn test_file_name_pattern() {
        assert!(BAG_FILE_NAME_PATTERN.is_match("a"));
        assert!(BAG_FILE_NAME_PATTERN.is_match("data.json"));
        assert!(BAG_FILE_NAME_PATTERN.is_match(".hidden"));
        assert!(BAG_FILE_NAME_PATTERN.is_match("file-name_100%.txt"));
        assert!(!BAG_FILE_NAME_PATTERN.is_match("-leading-dash"));
        assert!(!BAG_FILE_NAME_PATTERN.is_match("has space.txt"));
        assert!(!BAG_FILE_NAME_PATTERN.is_match(""));
    }

    #[test]
    fn test_manifest_name_pattern() {
        assert!(MANIFEST_NAME_PATTERN.is_match("manifest-md5.txt"));
        assert!(MANIFEST_NAME_PATTERN.is_match("manifest-sha256.txt"));
        assert!(MANIFEST_NAME_PATTERN.is_match("tagmanifest-sha256.txt"));
        assert!(!MANIFEST_NAME_PATTERN.is_match("manifest-sha512.txt"));
        assert!(!MANIFEST_NAME_PATTERN.is_match("data/manifest-md5.txt"));
    }

    #[test]
    fn test_part_size_ladder() {
        const MIB: i64 = 1024 * 1024;
        assert_eq!(part_size_for(10 * MIB), (5 * MIB, 5));
        assert_eq!(part_size_for(600 * MIB), (128 * MIB, 2));
        assert_eq!(part_size_for(6 * 1024 * MIB), (512 * MIB, 1));
        assert_eq!(part_size_for(51 * 1024 * MIB), (1024 * MIB, 1));
    }

    #[test]
    fn test_savable_names() {
        assert!(has_savable_name("data/photo.jpg"));
        assert!(has_savable_name("bag-info.txt"));
        assert!(has_savable_name("custom-tags/extra.txt"));
        assert!(!has_savable_name("bagit.txt"));
        assert!(!has_savable_name("manifest-md5.txt"));
        assert!(!has_savable_name("tagmanifest-sha256.txt"));
    }

    #[test]
    fn test_action_wire_format() {
        assert_eq!(
            serde_json::to_string(&Action::FixityCheck).unwrap(),
            "\"Fixity Check\""
        );
        assert_eq!(serde_json::to_string(&Action::Ingest).unwrap(), "\"Ingest\"");
    }
}
