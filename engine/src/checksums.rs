//! Checksum computation.
//!
//! This module provides:
//! - Cryptographic checksum algorithms (MD5, SHA-256, BLAKE3)
//! - Streaming computation over any reader
//! - File-level computation through the filesystem abstraction

use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{classify_io, Result, Stage};
use crate::fs_ops::FileSystem;

const BUFFER_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (what the original relocation script used; kept for compatibility)
    Md5,
    /// SHA-256 (cryptographic, 256-bit)
    #[default]
    Sha256,
    /// BLAKE3 (modern, fast, 256-bit)
    Blake3,
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
            Self::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            other => Err(format!(
                "invalid hash algorithm '{other}'; expected md5, sha256 or blake3"
            )),
        }
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
}

impl fmt::Display for ChecksumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::default()),
            ChecksumAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha256(h) => {
                use sha2::Digest;
                h.update(data);
            }
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(self) -> ChecksumValue {
        match self {
            Hasher::Md5(ctx) => {
                ChecksumValue::new(ChecksumAlgorithm::Md5, format!("{:x}", ctx.compute()))
            }
            Hasher::Sha256(h) => {
                use sha2::Digest;
                ChecksumValue::new(ChecksumAlgorithm::Sha256, format!("{:x}", h.finalize()))
            }
            Hasher::Blake3(h) => {
                ChecksumValue::new(ChecksumAlgorithm::Blake3, h.finalize().to_hex().to_string())
            }
        }
    }
}

/// Compute a checksum over everything `reader` yields.
pub fn compute_checksum<R: Read + ?Sized>(
    reader: &mut R,
    algorithm: ChecksumAlgorithm,
) -> io::Result<ChecksumValue> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(hasher.finalize())
}

/// Compute checksum for a file
pub fn compute_file_checksum(
    fs: &dyn FileSystem,
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<ChecksumValue> {
    let mut file = fs
        .open_read(path)
        .map_err(|e| classify_io(e, path, Stage::Verify))?;
    compute_checksum(&mut file, algorithm).map_err(|e| classify_io(e, path, Stage::Verify))
}
