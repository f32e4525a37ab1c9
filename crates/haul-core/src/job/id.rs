//! Deterministic job ids derived from (url, destination path).

use sha2::{Digest, Sha256};
use std::path::Path;

use super::types::JobId;

/// Derives a stable, non-negative id from `url` and `file`.
///
/// The same pair always yields the same id, so re-enqueueing a download
/// collides predictably with the existing record.
pub fn derive_job_id(url: &str, file: &Path) -> JobId {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0u8]);
    hasher.update(file.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) & i64::MAX as u64) as JobId
}
