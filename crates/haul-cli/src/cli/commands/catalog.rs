//! `haul catalog <addr>` – list what a content-file server offers.

use std::net::SocketAddr;

use anyhow::Result;
use haul_core::config::HaulConfig;
use haul_core::downloader::FileServerDownloader;
use haul_core::fileserver::file_server_url;

pub async fn run_catalog(cfg: &HaulConfig, addr: SocketAddr) -> Result<()> {
    let client = FileServerDownloader::new(cfg.file_server.clone(), cfg.buffer_size);
    let listing = tokio::task::spawn_blocking(move || client.catalog(&addr.to_string())).await??;
    if listing.is_empty() {
        println!("{addr} offers no files.");
        return Ok(());
    }
    println!("{:<10} {:>14} {:<24} {}", "ID", "SIZE", "NAME", "URL");
    for entry in listing {
        println!(
            "{:<10} {:>14} {:<24} {}",
            entry.id,
            entry.length,
            entry.name,
            file_server_url(addr, &entry.id)
        );
    }
    Ok(())
}
