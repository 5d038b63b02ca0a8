//! End-to-end bag validation against real tar files.

mod helpers;

use arca_ingest::bag::{untar_bag, BagValidator};
use arca_ingest::constants::Access;
use helpers::{default_validation_config, BagBuilder};

const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";
const HELLO_MD5: &str = "b1946ac92492d2347c6235b4d2611184";

#[test]
fn test_single_file_bag_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .write_tar(dir.path());

    let validator = BagValidator::new(&tar, "inst.edu", default_validation_config()).unwrap();
    let result = validator.validate();
    assert!(
        !result.has_errors(),
        "expected a valid bag, got: {}",
        result.validation_summary.all_errors_as_string()
    );

    let object = &result.object;
    assert_eq!(object.identifier, "inst.edu/bag");
    assert_eq!(object.bag_name, "bag");
    assert_eq!(object.payload_file_count(), 1);
    assert_eq!(object.access, Access::Institution);
    assert_eq!(object.title, "Test Bag");

    let hello = object.find_file("data/hello.txt").unwrap();
    assert_eq!(hello.identifier, "inst.edu/bag/data/hello.txt");
    assert_eq!(hello.size, 6);
    assert_eq!(hello.ingest_sha256, HELLO_SHA256);
    assert_eq!(hello.ingest_md5, HELLO_MD5);
    assert_eq!(hello.ingest_manifest_sha256, HELLO_SHA256);
    assert_eq!(hello.ingest_manifest_md5, HELLO_MD5);
    assert!(hello.ingest_sha256_verified_at.is_some());
    assert!(hello.ingest_md5_verified_at.is_some());
    assert_eq!(hello.file_format, "text/plain");

    // The tag manifest's claims land on the tag files.
    let bag_info = object.find_file("bag-info.txt").unwrap();
    assert!(!bag_info.ingest_manifest_sha256.is_empty());

    // Tags from both declared tag files are present.
    assert_eq!(object.find_tags("BagIt-Version")[0].value, "0.97");
    assert_eq!(object.find_tags("Source-Organization")[0].value, "Test Inst");

    // The bag was extracted next to the tar.
    assert!(dir.path().join("bag/data/hello.txt").is_file());
    assert!(dir.path().join("bag/manifest-sha256.txt").is_file());
}

#[test]
fn test_digest_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bad_digest = "0000000000000000000000000000000000000000000000000000000000000000";
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_digest_override("sha256", "data/hello.txt", bad_digest)
        .write_tar(dir.path());

    let validator = BagValidator::new(&tar, "inst.edu", default_validation_config()).unwrap();
    let result = validator.validate();

    assert!(result.has_errors());
    let errors = result.validation_summary.all_errors_as_string();
    assert!(
        errors.contains(&format!(
            "Sha256 digest for 'data/hello.txt': manifest says '{}', file digest is '{}'",
            bad_digest, HELLO_SHA256
        )),
        "unexpected error text: {}",
        errors
    );
    assert!(!result.validation_summary.retry);
    assert!(result.validation_summary.error_is_fatal);
    assert_eq!(result.object.ingest_error_message, errors);
}

#[test]
fn test_file_listed_in_manifest_but_missing() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_phantom_manifest_entry("sha256", "data/ghost.txt", HELLO_SHA256)
        .write_tar(dir.path());

    let result = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(result
        .validation_summary
        .all_errors_as_string()
        .contains("File 'data/ghost.txt' listed in manifest-sha256.txt is missing from the bag."));
}

#[test]
fn test_payload_file_not_in_any_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_payload("data/stray.txt", b"stray\n")
        .omitting_from_manifests("data/stray.txt")
        .write_tar(dir.path());

    let result = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(result.validation_summary.all_errors_as_string().contains(
        "File 'data/stray.txt' is present in the bag but not listed in any payload manifest."
    ));
}

#[test]
fn test_required_tag_missing() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_tag_file("bag-info.txt", "Access: Institution\n")
        .write_tar(dir.path());

    let result = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(result
        .validation_summary
        .all_errors_as_string()
        .contains("Required tag 'Title' is missing."));
}

#[test]
fn test_illegal_tag_value() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_tag_file("bag-info.txt", "Title: T\nAccess: Sometimes\n")
        .write_tar(dir.path());

    let result = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(result
        .validation_summary
        .all_errors_as_string()
        .contains("Tag 'Access' has illegal value 'sometimes'."));
}

#[test]
fn test_forbidden_file() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_payload("data/secret.key", b"sssh\n")
        .write_tar(dir.path());

    let result = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(result
        .validation_summary
        .all_errors_as_string()
        .contains("Bag contains forbidden file 'data/secret.key'."));
}

#[test]
fn test_misc_directory_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_tag_file("extras/notes.txt", "stray tag file\n")
        .write_tar(dir.path());

    let result = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(result
        .validation_summary
        .all_errors_as_string()
        .contains("unexpected directory 'extras'"));
}

#[test]
fn test_bag_name_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_top_dir("other")
        .write_tar(dir.path());

    let (_, summary) = untar_bag(&tar, "inst.edu");
    assert!(summary.has_errors());
    assert!(summary
        .all_errors_as_string()
        .contains("should untar to a folder named 'bag', but it untars to 'other'"));
}

#[test]
fn test_multipart_tar_name_strips_suffix() {
    let dir = tempfile::tempdir().unwrap();
    // The top dir stays "bag" even though the tar carries a part suffix.
    let tar_plain = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .write_tar(dir.path());
    let tar = dir.path().join("bag.b01.of02.tar");
    std::fs::rename(tar_plain, &tar).unwrap();

    let (object, summary) = untar_bag(&tar, "inst.edu");
    assert!(!summary.has_errors(), "{}", summary.all_errors_as_string());
    assert_eq!(object.bag_name, "bag");
    assert_eq!(object.identifier, "inst.edu/bag");
}

#[test]
fn test_symlinks_are_ignored_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .with_symlink("data/link.txt", "hello.txt")
        .write_tar(dir.path());

    let result = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(
        !result.has_errors(),
        "{}",
        result.validation_summary.all_errors_as_string()
    );
    assert_eq!(result.object.ingest_files_ignored, vec!["bag/data/link.txt"]);
}

#[test]
fn test_validate_extracted_directory() {
    let dir = tempfile::tempdir().unwrap();
    let tar = BagBuilder::new("bag")
        .with_payload("data/hello.txt", b"hello\n")
        .write_tar(dir.path());

    // First pass extracts to <dir>/bag; the second validates the directory.
    let first = BagValidator::new(&tar, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(!first.has_errors());

    let bag_dir = dir.path().join("bag");
    let second = BagValidator::new(&bag_dir, "inst.edu", default_validation_config())
        .unwrap()
        .validate();
    assert!(
        !second.has_errors(),
        "{}",
        second.validation_summary.all_errors_as_string()
    );
    assert_eq!(second.object.identifier, "inst.edu/bag");
    assert_eq!(
        second.object.find_file("data/hello.txt").unwrap().ingest_sha256,
        HELLO_SHA256
    );
}
