//! `haul remove <id>...` – drop jobs; `--delete-files` also deletes their destinations.

use anyhow::Result;
use haul_core::config::HaulConfig;
use haul_core::JobId;

use crate::cli::open_manager;

pub async fn run_remove(cfg: &HaulConfig, ids: &[JobId], delete_files: bool) -> Result<()> {
    let manager = open_manager(cfg, false).await?;
    let removed = if delete_files {
        manager.delete_ids(ids).await?
    } else {
        manager.remove_ids(ids).await?
    };
    manager.close();

    for job in &removed {
        println!("Removed job {}", job.id);
    }
    if removed.len() < ids.len() {
        tracing::debug!(requested = ids.len(), removed = removed.len(), "some ids not found");
        println!("{} job(s) not found", ids.len() - removed.len());
    }
    Ok(())
}
