//! Digest utilities for bag verification
//!
//! Payload files can run to many gigabytes, so every digest here is computed
//! in a single streaming pass. `DigestWriter` lets callers tee a stream into
//! MD5 and SHA-256 at once while writing the bytes somewhere else.

use md5::Context as Md5Context;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::Path;

/// MD5 and SHA-256 digests of one stream, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub md5: String,
    pub sha256: String,
}

/// An `io::Write` adapter that feeds every byte to MD5 and SHA-256 hashers
/// and then to an inner writer.
pub struct DigestWriter<W: Write> {
    inner: W,
    md5: Md5Context,
    sha256: Sha256,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            md5: Md5Context::new(),
            sha256: Sha256::new(),
        }
    }

    /// Finish both digests and hand back the inner writer.
    pub fn finish(self) -> (FileDigests, W) {
        let digests = FileDigests {
            md5: format!("{:x}", self.md5.compute()),
            sha256: hex::encode(self.sha256.finalize()),
        };
        (digests, self.inner)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.md5.consume(&buf[..written]);
        self.sha256.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compute MD5 and SHA-256 of any readable source in one pass.
pub fn compute_digests<R: Read>(reader: &mut R) -> io::Result<FileDigests> {
    let mut writer = DigestWriter::new(io::sink());
    io::copy(reader, &mut writer)?;
    let (digests, _) = writer.finish();
    Ok(digests)
}

/// Compute MD5 and SHA-256 of a file.
pub fn compute_file_digests(path: impl AsRef<Path>) -> io::Result<FileDigests> {
    let mut file = std::fs::File::open(path)?;
    compute_digests(&mut file)
}

/// Compute only the SHA-256 of a readable source.
pub fn compute_sha256<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Manifests are hand-typed often enough that digest comparison must be
/// case-insensitive.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_compute_digests() {
        let mut cursor = Cursor::new(b"hello\n");
        let digests = compute_digests(&mut cursor).unwrap();
        assert_eq!(digests.md5, "b1946ac92492d2347c6235b4d2611184");
        assert_eq!(
            digests.sha256,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn test_digest_writer_tees_bytes() {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"hel").unwrap();
        writer.write_all(b"lo\n").unwrap();
        let (digests, inner) = writer.finish();
        assert_eq!(inner, b"hello\n");
        assert_eq!(
            digests.sha256,
            "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
        );
    }

    #[test]
    fn test_compute_sha256_empty() {
        let mut cursor = Cursor::new(b"");
        let digest = compute_sha256(&mut cursor).unwrap();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_digests_match_case_insensitive() {
        assert!(digests_match(
            "B1946AC92492D2347C6235B4D2611184",
            "b1946ac92492d2347c6235b4d2611184"
        ));
        assert!(!digests_match("abc", "abd"));
    }
}
