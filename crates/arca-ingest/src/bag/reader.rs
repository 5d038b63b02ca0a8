//! Streaming bag reader
//!
//! A tar upload is read exactly once, front to back. Every regular entry is
//! extracted to the staging area while its bytes stream through MD5 and
//! SHA-256; there are no second passes and no per-entry seeks. The reader
//! builds the `IntellectualObject` skeleton that the validator then checks
//! against the bag's manifests.

use crate::constants::{BAG_FILE_NAME_PATTERN, MULTIPART_SUFFIX};
use crate::models::{GenericFile, IntellectualObject, WorkSummary};
use anyhow::{anyhow, Context, Result};
use arca_common::checksum::DigestWriter;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

/// Derive the bag name from a tar path: base name minus ".tar" minus any
/// multipart suffix ("photos.b01.of04.tar" -> "photos").
pub fn bag_name_from_tar_path(tar_path: &Path) -> Result<String> {
    let base = tar_path
        .file_name()
        .ok_or_else(|| anyhow!("Tar path {} has no file name", tar_path.display()))?
        .to_string_lossy();
    let stem = base
        .strip_suffix(".tar")
        .ok_or_else(|| anyhow!("'{}' is not a .tar file", base))?;
    Ok(MULTIPART_SUFFIX.replace(stem, "").to_string())
}

/// Read a tarred bag: extract it next to the tar file, hashing every regular
/// entry on the way through, and return the resulting object plus a summary
/// of anything that went wrong.
///
/// The first rule of the packaging spec is enforced here: every entry must
/// live under a single top-level directory named after the tar file.
pub fn untar_bag(tar_path: &Path, institution: &str) -> (IntellectualObject, WorkSummary) {
    let mut summary = WorkSummary::new();
    summary.start();

    let bag_name = match bag_name_from_tar_path(tar_path) {
        Ok(name) => name,
        Err(err) => {
            summary.add_fatal_error(err.to_string());
            summary.finish();
            return (IntellectualObject::new(institution, "unknown"), summary);
        }
    };

    let untarred_parent = tar_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut object = IntellectualObject::new(institution, &bag_name);
    object.ingest_tar_file_path = tar_path.to_string_lossy().to_string();
    object.ingest_untarred_path = untarred_parent
        .join(&bag_name)
        .to_string_lossy()
        .to_string();

    let file = match File::open(tar_path) {
        Ok(f) => f,
        Err(err) => {
            summary.add_fatal_error(format!(
                "Could not open file {} for untarring: {}",
                tar_path.display(),
                err
            ));
            summary.finish();
            return (object, summary);
        }
    };

    let mut archive = tar::Archive::new(file);
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(err) => {
            summary.add_fatal_error(format!(
                "Error reading tar file: {}. Either this is not a tar file, or the file is corrupt.",
                err
            ));
            summary.finish();
            return (object, summary);
        }
    };

    for entry_result in entries {
        let mut entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                summary.add_fatal_error(format!(
                    "Error reading tar entry header: {}. Either this is not a tar file, or the file is corrupt.",
                    err
                ));
                break;
            }
        };

        let entry_path = match entry.path() {
            Ok(path) => path.to_path_buf(),
            Err(err) => {
                summary.add_fatal_error(format!("Tar entry has unreadable path: {}", err));
                break;
            }
        };

        let rel_path = match check_entry_path(&entry_path, &bag_name, tar_path) {
            Ok(rel) => rel,
            Err(err) => {
                summary.add_fatal_error(err.to_string());
                break;
            }
        };

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            let dir = untarred_parent.join(&entry_path);
            if let Err(err) = std::fs::create_dir_all(&dir) {
                summary.add_error(format!(
                    "Could not create directory '{}' while unpacking: {}",
                    dir.display(),
                    err
                ));
                break;
            }
            continue;
        }
        if !entry_type.is_file() {
            // Symlinks and specials are noted but never extracted.
            object
                .ingest_files_ignored
                .push(entry_path.to_string_lossy().to_string());
            continue;
        }

        // The top-level directory entry is optional in practice; a regular
        // file with an empty relative path can't happen past this point.
        let Some(rel_path) = rel_path else { continue };

        match extract_and_hash(&mut entry, &untarred_parent.join(&entry_path)) {
            Ok((md5, sha256, size)) => {
                let mut gf = GenericFile::new(&object.identifier, &rel_path);
                gf.size = size;
                gf.ingest_local_path = untarred_parent
                    .join(&entry_path)
                    .to_string_lossy()
                    .to_string();
                gf.ingest_md5 = md5;
                gf.ingest_sha256 = sha256;
                gf.ingest_sha256_generated_at = Some(Utc::now());
                gf.file_format = guess_mime_type(&rel_path).to_string();
                gf.file_modified = entry
                    .header()
                    .mtime()
                    .ok()
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0));
                gf.ingest_file_uid = entry.header().uid().unwrap_or(0) as i64;
                gf.ingest_file_gid = entry.header().gid().unwrap_or(0) as i64;
                gf.ingest_file_uname = entry
                    .header()
                    .username()
                    .ok()
                    .flatten()
                    .unwrap_or("")
                    .to_string();
                gf.ingest_file_gname = entry
                    .header()
                    .groupname()
                    .ok()
                    .flatten()
                    .unwrap_or("")
                    .to_string();
                object.generic_files.push(gf);
            }
            Err(err) => {
                summary.add_error(format!(
                    "Error copying '{}' from tar archive: {}",
                    entry_path.display(),
                    err
                ));
                break;
            }
        }
    }

    summary.finish();
    (object, summary)
}

/// Read an already-extracted bag directory, hashing every file. Used when a
/// crash interrupted a run after extraction, and by the standalone
/// validator when pointed at a directory.
pub fn read_bag_dir(bag_dir: &Path, institution: &str) -> (IntellectualObject, WorkSummary) {
    let mut summary = WorkSummary::new();
    summary.start();

    let bag_name = bag_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut object = IntellectualObject::new(institution, &bag_name);
    object.ingest_untarred_path = bag_dir.to_string_lossy().to_string();

    if bag_name.is_empty() {
        summary.add_fatal_error(format!("'{}' has no usable directory name", bag_dir.display()));
        summary.finish();
        return (object, summary);
    }

    if let Err(err) = walk_bag_dir(bag_dir, bag_dir, &mut object, &mut summary) {
        summary.add_fatal_error(format!("Error reading bag directory: {}", err));
    }
    summary.finish();
    (object, summary)
}

fn walk_bag_dir(
    root: &Path,
    dir: &Path,
    object: &mut IntellectualObject,
    summary: &mut WorkSummary,
) -> Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot list {}", dir.display()))?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    paths.sort();

    for path in paths {
        let metadata = std::fs::symlink_metadata(&path)?;
        let rel = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .to_string();
        if metadata.is_dir() {
            walk_bag_dir(root, &path, object, summary)?;
        } else if metadata.is_file() {
            let mut file = File::open(&path)?;
            let digests = arca_common::checksum::compute_digests(&mut file)?;
            let mut gf = GenericFile::new(&object.identifier, &rel);
            gf.size = metadata.len() as i64;
            gf.ingest_local_path = path.to_string_lossy().to_string();
            gf.ingest_md5 = digests.md5;
            gf.ingest_sha256 = digests.sha256;
            gf.ingest_sha256_generated_at = Some(Utc::now());
            gf.file_format = guess_mime_type(&rel).to_string();
            gf.file_modified = metadata
                .modified()
                .ok()
                .map(DateTime::<Utc>::from);
            object.generic_files.push(gf);
        } else {
            object.ingest_files_ignored.push(rel);
        }
    }
    Ok(())
}

/// Run a closure over the reader of one entry inside a tar file. The store
/// worker streams uploads straight out of the archive through this.
pub fn with_tar_entry<T>(
    tar_path: &Path,
    inner_path: &str,
    f: impl FnOnce(&mut dyn Read) -> io::Result<T>,
) -> Result<T> {
    let file = File::open(tar_path)
        .with_context(|| format!("Cannot open tar file {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(file);
    for entry_result in archive.entries().context("Cannot read tar entries")? {
        let mut entry = entry_result.context("Cannot read tar entry")?;
        let path = entry.path().context("Tar entry has unreadable path")?;
        if path.to_string_lossy() == inner_path {
            return f(&mut entry).with_context(|| format!("Error reading tar entry {}", inner_path));
        }
    }
    Err(anyhow!(
        "File '{}' not found in tar archive {}",
        inner_path,
        tar_path.display()
    ))
}

/// Reject entries outside the bag's single top-level directory and entries
/// that try to escape the extraction root. Returns the bag-relative path,
/// or None for the top-level directory entry itself.
fn check_entry_path(entry_path: &Path, bag_name: &str, tar_path: &Path) -> Result<Option<String>> {
    let mut components = entry_path.components();
    let top = match components.next() {
        Some(Component::Normal(name)) => name.to_string_lossy().to_string(),
        _ => {
            return Err(anyhow!(
                "Tar entry '{}' is not a plain relative path",
                entry_path.display()
            ))
        }
    };
    if top != bag_name {
        return Err(anyhow!(
            "Bag '{}' should untar to a folder named '{}', but it untars to '{}'. \
             Please repackage this bag and try again.",
            tar_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            bag_name,
            top
        ));
    }
    let rest: Vec<String> = components
        .map(|c| match c {
            Component::Normal(name) => Ok(name.to_string_lossy().to_string()),
            _ => Err(anyhow!(
                "Tar entry '{}' contains an illegal path component",
                entry_path.display()
            )),
        })
        .collect::<Result<_>>()?;
    if rest.is_empty() {
        return Ok(None);
    }
    Ok(Some(rest.join("/")))
}

/// True when every component of a bag-relative path uses only characters
/// the packaging spec allows.
pub fn file_name_is_valid(bag_relative_path: &str) -> bool {
    bag_relative_path
        .split('/')
        .all(|component| BAG_FILE_NAME_PATTERN.is_match(component))
}

fn extract_and_hash(reader: &mut impl Read, dest: &Path) -> io::Result<(String, String, i64)> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let out = File::create(dest)?;
    let mut writer = DigestWriter::new(io::BufWriter::new(out));
    let copied = io::copy(reader, &mut writer)?;
    let (digests, inner) = writer.finish();
    inner
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    Ok((digests.md5, digests.sha256, copied as i64))
}

/// Minimal extension-based MIME guess; anything unknown is binary.
pub fn guess_mime_type(path: &str) -> &'static str {
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match extension.as_str() {
        "txt" | "text" => "text/plain",
        "xml" => "application/xml",
        "json" => "application/json",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "wav" => "audio/wav",
        "zip" => "application/zip",
        "gz" | "gzip" => "application/gzip",
        "tar" => "application/x-tar",
        _ => "application/binary",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bag_name_from_tar_path() {
        assert_eq!(
            bag_name_from_tar_path(Path::new("/tmp/photos.tar")).unwrap(),
            "photos"
        );
        assert_eq!(
            bag_name_from_tar_path(Path::new("/tmp/photos.b01.of04.tar")).unwrap(),
            "photos"
        );
        assert!(bag_name_from_tar_path(Path::new("/tmp/photos.zip")).is_err());
    }

    #[test]
    fn test_check_entry_path() {
        let tar = Path::new("/tmp/bag.tar");
        assert_eq!(
            check_entry_path(Path::new("bag/data/x.txt"), "bag", tar).unwrap(),
            Some("data/x.txt".to_string())
        );
        assert_eq!(check_entry_path(Path::new("bag"), "bag", tar).unwrap(), None);
        let err = check_entry_path(Path::new("other/data/x.txt"), "bag", tar)
            .unwrap_err()
            .to_string();
        assert!(err.contains("should untar to a folder named 'bag'"));
        assert!(check_entry_path(Path::new("bag/../etc/passwd"), "bag", tar).is_err());
    }

    #[test]
    fn test_file_name_is_valid() {
        assert!(file_name_is_valid("data/photo.jpg"));
        assert!(file_name_is_valid("bag-info.txt"));
        assert!(file_name_is_valid("a"));
        assert!(!file_name_is_valid("data/bad name.jpg"));
        assert!(!file_name_is_valid("data/-dash-first"));
    }

    #[test]
    fn test_guess_mime_type() {
        assert_eq!(guess_mime_type("data/notes.txt"), "text/plain");
        assert_eq!(guess_mime_type("data/scan.tiff"), "image/tiff");
        assert_eq!(guess_mime_type("data/blob"), "application/binary");
    }
}
