//! Content checksums (SHA-256, lowercase hex) over whole files or byte ranges.
//!
//! The file server stamps each FILE response with the checksum of the range it
//! is about to send; the file-server strategy hashes inline and compares.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

/// SHA-256 of `len` bytes of `path` starting at `start`. Stops early at EOF.
pub fn sha256_range(path: &Path, start: u64, len: u64) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    f.seek(SeekFrom::Start(start))
        .with_context(|| format!("seek {} to {}", path.display(), start))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(BUF_SIZE as u64) as usize;
        let n = f
            .read(&mut buf[..want])
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA-256 of a whole file.
pub fn sha256_path(path: &Path) -> Result<String> {
    sha256_range(path, 0, u64::MAX)
}

/// Incremental hasher for bytes arriving off the wire.
#[derive(Default)]
pub struct StreamHasher(Sha256);

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}
