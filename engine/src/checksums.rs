//! Checksum computation.
//!
//! This module provides:
//! - Multiple digest algorithms (CRC32, MD5, SHA-256, BLAKE3)
//! - Incremental hashers that can be moved between worker threads
//! - File-level checksum computation with cooperative stop
//! - `<ALGO>SUM` line formatting compatible with `sha256sum -c` and friends

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, 32-bit, used for the small-file presence check)
    Crc32,
    /// MD5 (deprecated, but included for compatibility)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crc32 => write!(f, "crc32"),
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "").as_str() {
            "crc32" => Ok(Self::Crc32),
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!(
                "Invalid hash algorithm '{other}'. Must be 'crc32', 'md5', 'sha256', or 'blake3'"
            )),
        }
    }
}

impl ChecksumAlgorithm {
    /// Name of the checksum list file kept in each session slot, e.g. `SHA256SUM`.
    pub fn sum_file_name(&self) -> String {
        format!("{}SUM", self.to_string().to_uppercase())
    }
}

/// A computed checksum value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumValue {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl ChecksumValue {
    pub fn new(algorithm: ChecksumAlgorithm, hex: String) -> Self {
        ChecksumValue { algorithm, hex }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Case-insensitive comparison against a recorded hex digest.
    pub fn matches_hex(&self, other: &str) -> bool {
        self.hex.eq_ignore_ascii_case(other)
    }

    /// Format as "algo:hex"
    pub fn to_string_with_algo(&self) -> String {
        format!("{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

/// Incremental hasher.
///
/// `Send` so the running source digest can be handed to a pool thread while
/// the reader fills the other buffer.
pub trait ChecksumHasher: Send {
    fn update(&mut self, data: &[u8]);

    fn finalize(self: Box<Self>) -> ChecksumValue;
}

struct Crc32Hasher {
    crc: u32,
}

impl Crc32Hasher {
    fn new() -> Self {
        Crc32Hasher { crc: 0xffff_ffff }
    }
}

impl ChecksumHasher for Crc32Hasher {
    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let mut crc = self.crc ^ byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 == 1 {
                    (crc >> 1) ^ 0xedb8_8320
                } else {
                    crc >> 1
                };
            }
            self.crc = crc;
        }
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        ChecksumValue::new(
            ChecksumAlgorithm::Crc32,
            format!("{:08x}", self.crc ^ 0xffff_ffff),
        )
    }
}

struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.context.compute();
        ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        use sha2::Digest;
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

struct Blake3Hasher {
    hasher: blake3::Hasher,
}

impl ChecksumHasher for Blake3Hasher {
    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> ChecksumValue {
        let digest = self.hasher.finalize();
        ChecksumValue::new(ChecksumAlgorithm::Blake3, digest.to_hex().to_string())
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Crc32 => Box::new(Crc32Hasher::new()),
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Blake3 => Box::new(Blake3Hasher {
            hasher: blake3::Hasher::new(),
        }),
    }
}

/// Compute the checksum of a whole file.
pub fn compute_file_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<ChecksumValue> {
    let never = AtomicBool::new(false);
    let value = compute_file_checksum_until(path, algorithm, 65536, &never)?;
    value.ok_or_else(|| io::Error::new(io::ErrorKind::Interrupted, "checksum interrupted"))
}

/// Compute a file checksum reading `chunk_size` bytes at a time.
///
/// `stop` is checked between chunks; `Ok(None)` means the read was abandoned.
pub fn compute_file_checksum_until(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    chunk_size: usize,
    stop: &AtomicBool,
) -> io::Result<Option<ChecksumValue>> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut hasher = create_hasher(algorithm);

    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(Some(hasher.finalize()))
}

/// One `<ALGO>SUM` line: `<hex>  <relative/path>\n`.
///
/// Backslashes are normalised to forward slashes so the list stays usable
/// with standard `*sum -c` tooling.
pub fn format_sum_line(hex: &str, relative_path: &str) -> String {
    format!("{}  {}\n", hex, relative_path.replace('\\', "/"))
}

/// Parse a `<hex>  <path>` line back into its parts.
pub fn parse_sum_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
        return None;
    }
    let (hex, rest) = line.split_once(' ')?;
    // GNU format uses a second char for the mode: ' ' (text) or '*' (binary)
    let path = rest.strip_prefix(' ').or_else(|| rest.strip_prefix('*'))?;
    Some((hex, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(algorithm: ChecksumAlgorithm, data: &[u8]) -> ChecksumValue {
        let mut hasher = create_hasher(algorithm);
        hasher.update(data);
        hasher.finalize()
    }

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Crc32.to_string(), "crc32");
        assert_eq!(ChecksumAlgorithm::Md5.to_string(), "md5");
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Blake3.to_string(), "blake3");
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("crc32".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Crc32));
        assert_eq!("MD5".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Md5));
        assert_eq!("SHA-256".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Sha256));
        assert_eq!("blake3".parse::<ChecksumAlgorithm>(), Ok(ChecksumAlgorithm::Blake3));
        assert!("invalid".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn test_sum_file_names() {
        assert_eq!(ChecksumAlgorithm::Sha256.sum_file_name(), "SHA256SUM");
        assert_eq!(ChecksumAlgorithm::Md5.sum_file_name(), "MD5SUM");
        assert_eq!(ChecksumAlgorithm::Blake3.sum_file_name(), "BLAKE3SUM");
    }

    #[test]
    fn test_crc32_known_value() {
        let checksum = digest_of(ChecksumAlgorithm::Crc32, b"hello");
        assert_eq!(checksum.algorithm(), ChecksumAlgorithm::Crc32);
        assert_eq!(checksum.hex(), "3610a686");
    }

    #[test]
    fn test_md5_hasher() {
        let checksum = digest_of(ChecksumAlgorithm::Md5, b"hello");
        assert_eq!(checksum.hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_sha256_hasher() {
        let checksum = digest_of(ChecksumAlgorithm::Sha256, b"hello");
        assert_eq!(
            checksum.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_incremental_update_matches_one_shot() {
        for algorithm in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Blake3,
        ] {
            let mut hasher = create_hasher(algorithm);
            hasher.update(b"hel");
            hasher.update(b"lo");
            assert_eq!(hasher.finalize(), digest_of(algorithm, b"hello"), "{algorithm}");
        }
    }

    #[test]
    fn test_matches_hex_ignores_case() {
        let cs = ChecksumValue::new(ChecksumAlgorithm::Sha256, "abc123".to_string());
        assert!(cs.matches_hex("ABC123"));
        assert!(!cs.matches_hex("abc124"));
        assert_eq!(cs.to_string_with_algo(), "sha256:abc123");
    }

    #[test]
    fn test_compute_file_checksum_small_chunks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("clip.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).expect("Failed to write file");

        let stop = AtomicBool::new(false);
        let chunked = compute_file_checksum_until(&path, ChecksumAlgorithm::Sha256, 7, &stop)
            .expect("checksum")
            .expect("not stopped");
        assert_eq!(chunked, digest_of(ChecksumAlgorithm::Sha256, &data));
    }

    #[test]
    fn test_compute_file_checksum_honours_stop() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("clip.bin");
        std::fs::write(&path, b"some data").expect("Failed to write file");

        let stop = AtomicBool::new(true);
        let result = compute_file_checksum_until(&path, ChecksumAlgorithm::Md5, 4, &stop)
            .expect("open should work");
        assert!(result.is_none());
    }

    #[test]
    fn test_sum_line_round_trip() {
        let line = format_sum_line("deadbeef", "CARD_A\\DCIM\\clip 01.mov");
        assert_eq!(line, "deadbeef  CARD_A/DCIM/clip 01.mov\n");
        assert_eq!(
            parse_sum_line(&line),
            Some(("deadbeef", "CARD_A/DCIM/clip 01.mov"))
        );
        assert_eq!(parse_sum_line("; comment"), None);
        assert_eq!(parse_sum_line("abc *bin.dat"), Some(("abc", "bin.dat")));
    }
}
