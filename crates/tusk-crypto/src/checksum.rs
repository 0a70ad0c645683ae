//! Single-pass checksum pipeline for staged uploads
//!
//! Every finished upload gets all three digests attached to its node, so the
//! pipeline always computes SHA-1, MD5 and Adler-32 together even when only
//! one of them is verified. Verification follows a fixed priority: the first
//! declared digest in the order SHA-1, MD5, Adler-32 is checked and the rest
//! are trusted.

use crate::{CryptoError, Result, CHECKSUM_BUFFER_SIZE};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Digest algorithms computed for every upload, in verification priority order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// Content digest
    Sha1,
    /// Compatibility digest
    Md5,
    /// Fast digest
    Adler32,
}

impl ChecksumAlgorithm {
    /// All algorithms, highest verification priority first
    pub const PRIORITY: [ChecksumAlgorithm; 3] = [Self::Sha1, Self::Md5, Self::Adler32];

    /// Get the lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Md5 => "md5",
            Self::Adler32 => "adler32",
        }
    }

    /// Digest length in bytes
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Md5 => 16,
            Self::Adler32 => 4,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "md5" => Ok(Self::Md5),
            "adler32" | "adler-32" => Ok(Self::Adler32),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A digest the client declared for its upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedChecksum {
    pub algorithm: ChecksumAlgorithm,
    /// Hex-encoded digest, any case
    pub value: String,
}

impl ExpectedChecksum {
    /// Create a new expectation
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into(),
        }
    }

    /// Pick the single expectation to verify from per-algorithm values.
    ///
    /// Empty strings mean "not declared". Returns `None` when nothing was declared.
    pub fn select(sha1: &str, md5: &str, adler32: &str) -> Option<Self> {
        ChecksumAlgorithm::PRIORITY
            .into_iter()
            .zip([sha1, md5, adler32])
            .find(|(_, value)| !value.is_empty())
            .map(|(algorithm, value)| Self::new(algorithm, value))
    }

    /// Parse a `"<algorithm> <hex>"` pair as sent by resumable-upload clients
    pub fn parse(header: &str) -> Result<Self> {
        let (algorithm, value) = header
            .trim()
            .split_once(|c: char| c == ' ' || c == ':')
            .ok_or_else(|| CryptoError::UnsupportedAlgorithm(header.to_string()))?;
        Ok(Self::new(algorithm.parse()?, value.trim()))
    }
}

/// The three digests of a finished byte stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChecksumSet {
    sha1: Vec<u8>,
    md5: Vec<u8>,
    adler32: Vec<u8>,
}

impl ChecksumSet {
    /// Raw digest bytes for an algorithm
    pub fn digest(&self, algorithm: ChecksumAlgorithm) -> &[u8] {
        match algorithm {
            ChecksumAlgorithm::Sha1 => &self.sha1,
            ChecksumAlgorithm::Md5 => &self.md5,
            ChecksumAlgorithm::Adler32 => &self.adler32,
        }
    }

    /// Lowercase hex digest for an algorithm
    pub fn hex(&self, algorithm: ChecksumAlgorithm) -> String {
        hex::encode(self.digest(algorithm))
    }

    /// Iterate over `(algorithm, digest)` pairs in priority order
    pub fn iter(&self) -> impl Iterator<Item = (ChecksumAlgorithm, &[u8])> + '_ {
        ChecksumAlgorithm::PRIORITY
            .into_iter()
            .map(move |algorithm| (algorithm, self.digest(algorithm)))
    }

    /// Compare against a declared digest, case-insensitively
    pub fn verify(&self, expected: &ExpectedChecksum) -> Result<()> {
        let actual = self.hex(expected.algorithm);
        if !actual.eq_ignore_ascii_case(expected.value.trim()) {
            return Err(CryptoError::ChecksumMismatch {
                algorithm: expected.algorithm,
                expected: expected.value.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Running state of all three digests
pub struct ChecksumPipeline {
    sha1: Sha1,
    md5: Md5,
    adler32: adler2::Adler32,
    bytes_processed: u64,
}

impl ChecksumPipeline {
    /// Create an empty pipeline
    pub fn new() -> Self {
        Self {
            sha1: Sha1::new(),
            md5: Md5::new(),
            adler32: adler2::Adler32::new(),
            bytes_processed: 0,
        }
    }

    /// Feed the next slice of the stream into every digest
    pub fn update(&mut self, data: &[u8]) {
        self.sha1.update(data);
        self.md5.update(data);
        self.adler32.write_slice(data);
        self.bytes_processed += data.len() as u64;
    }

    /// Number of bytes seen so far
    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Finish all digests
    pub fn finalize(self) -> ChecksumSet {
        ChecksumSet {
            sha1: self.sha1.finalize().to_vec(),
            md5: self.md5.finalize().to_vec(),
            // big-endian, matching the wire representation of Adler-32
            adler32: self.adler32.checksum().to_be_bytes().to_vec(),
        }
    }
}

impl Default for ChecksumPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream a reader to its end through the pipeline
pub async fn checksum_reader<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ChecksumSet> {
    let mut pipeline = ChecksumPipeline::new();
    let mut buf = vec![0u8; CHECKSUM_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        pipeline.update(&buf[..n]);
    }
    tracing::trace!(bytes = pipeline.bytes_processed(), "checksums computed");
    Ok(pipeline.finalize())
}

/// Compute all digests of a file
pub async fn checksum_file(path: &Path) -> Result<ChecksumSet> {
    let mut file = tokio::fs::File::open(path).await?;
    checksum_reader(&mut file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sums_of(data: &[u8]) -> ChecksumSet {
        let mut pipeline = ChecksumPipeline::new();
        pipeline.update(data);
        pipeline.finalize()
    }

    #[test]
    fn test_known_digests() {
        let sums = sums_of(b"hello world");
        assert_eq!(
            sums.hex(ChecksumAlgorithm::Sha1),
            "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"
        );
        assert_eq!(
            sums.hex(ChecksumAlgorithm::Md5),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(sums.hex(ChecksumAlgorithm::Adler32), "1a0b045d");
    }

    #[test]
    fn test_empty_stream() {
        let sums = sums_of(b"");
        assert_eq!(
            sums.hex(ChecksumAlgorithm::Sha1),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(sums.hex(ChecksumAlgorithm::Adler32), "00000001");
    }

    #[test]
    fn test_incremental_matches_single_update() {
        let mut pipeline = ChecksumPipeline::new();
        pipeline.update(b"hello ");
        pipeline.update(b"world");
        assert_eq!(pipeline.bytes_processed(), 11);
        assert_eq!(pipeline.finalize(), sums_of(b"hello world"));
    }

    #[rstest]
    #[case("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed", "", "", ChecksumAlgorithm::Sha1)]
    #[case("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed", "deadbeef", "", ChecksumAlgorithm::Sha1)]
    #[case("", "5eb63bbbe01eeed093cb22bb8f5acdc3", "1a0b045d", ChecksumAlgorithm::Md5)]
    #[case("", "", "1a0b045d", ChecksumAlgorithm::Adler32)]
    fn test_select_priority(
        #[case] sha1: &str,
        #[case] md5: &str,
        #[case] adler32: &str,
        #[case] expected: ChecksumAlgorithm,
    ) {
        let selected = ExpectedChecksum::select(sha1, md5, adler32).unwrap();
        assert_eq!(selected.algorithm, expected);
    }

    #[test]
    fn test_select_nothing_declared() {
        assert!(ExpectedChecksum::select("", "", "").is_none());
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let sums = sums_of(b"hello world");
        let expected = ExpectedChecksum::new(
            ChecksumAlgorithm::Sha1,
            "2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED",
        );
        assert!(sums.verify(&expected).is_ok());
    }

    #[test]
    fn test_verify_mismatch_reports_both_values() {
        let sums = sums_of(b"hello world");
        let expected = ExpectedChecksum::new(ChecksumAlgorithm::Md5, "00000000000000000000000000000000");
        match sums.verify(&expected) {
            Err(CryptoError::ChecksumMismatch {
                algorithm,
                expected,
                actual,
            }) => {
                assert_eq!(algorithm, ChecksumAlgorithm::Md5);
                assert_eq!(expected, "00000000000000000000000000000000");
                assert_eq!(actual, "5eb63bbbe01eeed093cb22bb8f5acdc3");
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_header() {
        let parsed = ExpectedChecksum::parse("SHA1 2aae6c35c94fcfb415dbe95f408b9ce91ee846ed").unwrap();
        assert_eq!(parsed.algorithm, ChecksumAlgorithm::Sha1);

        let parsed = ExpectedChecksum::parse("adler32:1a0b045d").unwrap();
        assert_eq!(parsed.algorithm, ChecksumAlgorithm::Adler32);
        assert_eq!(parsed.value, "1a0b045d");

        assert!(ExpectedChecksum::parse("crc32 abcd").is_err());
        assert!(ExpectedChecksum::parse("nohash").is_err());
    }

    #[tokio::test]
    async fn test_checksum_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let sums = checksum_file(&path).await.unwrap();
        assert_eq!(sums, sums_of(b"hello world"));
        assert_eq!(sums.iter().count(), 3);
    }

    #[tokio::test]
    async fn test_checksum_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = checksum_file(&dir.path().join("missing")).await;
        assert!(matches!(result, Err(CryptoError::Io(_))));
    }

    proptest::proptest! {
        #[test]
        fn prop_split_point_does_not_change_digests(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..2048),
            split in 0usize..2048,
        ) {
            let split = split.min(data.len());
            let mut pipeline = ChecksumPipeline::new();
            pipeline.update(&data[..split]);
            pipeline.update(&data[split..]);
            proptest::prop_assert_eq!(pipeline.finalize(), sums_of(&data));
        }
    }
}
