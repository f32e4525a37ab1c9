//! `haul checksum <path>` – compute SHA-256 of a file.

use anyhow::Result;
use haul_core::checksum;
use std::path::Path;

pub async fn run_checksum(path: &Path) -> Result<()> {
    let digest = checksum::sha256_path(path)?;
    println!("{}  {}", digest, path.display());
    Ok(())
}
