//! `haul serve <file>...` – offer local files over the content-file protocol.

use std::path::PathBuf;

use anyhow::{Context, Result};
use haul_core::config::HaulConfig;
use haul_core::fileserver::{ContentFile, FileServer, FileServerOptions};

pub async fn run_serve(cfg: &HaulConfig, files: &[PathBuf], bind: &str) -> Result<()> {
    let mut content = Vec::with_capacity(files.len());
    for (n, path) in files.iter().enumerate() {
        let file = ContentFile::from_path((n + 1).to_string(), path)
            .with_context(|| format!("cannot serve {}", path.display()))?;
        content.push(file);
    }

    let options = FileServerOptions {
        buffer_size: cfg.buffer_size,
        ..FileServerOptions::default()
    };
    let server = FileServer::start(bind, options).with_context(|| format!("cannot bind {bind}"))?;
    println!("Serving {} file(s) on {}", content.len(), server.local_addr());
    for file in &content {
        println!("  {}  {}  {}", server.url_for(&file.id), file.length, file.path.display());
    }
    server.add_content_files(content);

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");
    server.shutdown(false);
    Ok(())
}
