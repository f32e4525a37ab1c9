//! `haul add <url> -o <path>` – queue a download.

use std::path::PathBuf;

use anyhow::Result;
use haul_core::config::HaulConfig;
use haul_core::{JobId, JobRequest, Priority};

use crate::cli::open_manager;

pub async fn run_add(
    cfg: &HaulConfig,
    url: String,
    output: PathBuf,
    id: Option<JobId>,
    group: i64,
    priority: Priority,
    headers: Vec<(String, String)>,
) -> Result<()> {
    let mut request = JobRequest::new(url, output)
        .with_group(group)
        .with_priority(priority);
    if let Some(id) = id {
        request = request.with_id(id);
    }
    for (name, value) in headers {
        request = request.with_header(name, value);
    }

    let manager = open_manager(cfg, false).await?;
    let job = manager.enqueue(request).await?;
    println!("Added job {} -> {}", job.id, job.file.display());
    manager.close();
    Ok(())
}
