use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::constants::DEFAULT_CHUNK_SIZE;

/// Integrity hash negotiated in the transfer header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// BLAKE3, cryptographic
    #[default]
    Blake3,
    /// XXH3-128, fast but not collision resistant against an adversary
    Xxh3,
}

/// Running checksum fed with every chunk as it is read or written
pub enum Checksum {
    Blake3(Box<blake3::Hasher>),
    Xxh3(Box<xxhash_rust::xxh3::Xxh3>),
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Blake3 => Checksum::Blake3(Box::new(blake3::Hasher::new())),
            ChecksumAlgorithm::Xxh3 => Checksum::Xxh3(Box::default()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksum::Blake3(h) => {
                h.update(data);
            }
            Checksum::Xxh3(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize(&self) -> String {
        match self {
            Checksum::Blake3(h) => h.finalize().to_hex().to_string(),
            Checksum::Xxh3(h) => format!("{:032x}", h.digest128()),
        }
    }
}

/// Compute the checksum of a whole file
pub async fn compute_file_hash(file_path: &Path, algorithm: ChecksumAlgorithm) -> std::io::Result<String> {
    let mut file = File::open(file_path).await?;
    let mut hasher = Checksum::new(algorithm);
    let mut buffer = vec![0u8; DEFAULT_CHUNK_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}
