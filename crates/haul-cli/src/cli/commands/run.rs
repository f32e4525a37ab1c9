//! `haul run` – process the queue until it drains.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use haul_core::config::HaulConfig;
use haul_core::store::JobStore;
use haul_core::{DownloadListener, DownloadManager, ErrorCause, Job, Status};

use crate::cli::open_manager;

const DRAIN_POLL: Duration = Duration::from_millis(250);

/// Prints one line per finished job and a rolling progress line.
struct ConsoleListener;

impl DownloadListener for ConsoleListener {
    fn on_progress(&self, job: &Job, eta_ms: Option<u64>, bytes_per_sec: u64) {
        let done_mib = job.downloaded as f64 / 1_048_576.0;
        let total = job
            .total
            .map(|t| format!("{:.1}", t as f64 / 1_048_576.0))
            .unwrap_or_else(|| "?".to_string());
        let eta = eta_ms
            .map(|ms| format!("{}s", ms / 1000))
            .unwrap_or_else(|| "?".to_string());
        print!(
            "\r  job {}: {:.1} / {} MiB  {:.2} MiB/s  ETA {}  ",
            job.id,
            done_mib,
            total,
            bytes_per_sec as f64 / 1_048_576.0,
            eta
        );
        let _ = std::io::stdout().flush();
    }

    fn on_complete(&self, job: &Job) {
        println!("\rCompleted job {} -> {}", job.id, job.file.display());
    }

    fn on_error(&self, job: &Job, cause: ErrorCause) {
        println!("\rFailed job {}: {}", job.id, cause);
    }
}

pub async fn run_scheduler(cfg: &HaulConfig) -> Result<()> {
    let manager = open_manager(cfg, true).await?;
    manager.add_listener(Arc::new(ConsoleListener))?;

    let result = drain(&manager).await;
    manager.close();
    let finished = result?;

    if finished == 0 {
        println!("No queued jobs.");
    } else {
        tracing::info!("run finished {} job(s)", finished);
    }
    Ok(())
}

fn pending(jobs: &[Job]) -> usize {
    jobs.iter()
        .filter(|j| matches!(j.status, Status::Queued | Status::Downloading))
        .count()
}

/// Waits until nothing is queued or downloading. Returns how many jobs ended meanwhile.
async fn drain<S: JobStore>(manager: &DownloadManager<S>) -> Result<usize> {
    let initial = pending(&manager.get_downloads().await?);
    loop {
        let jobs = manager.get_downloads().await?;
        if pending(&jobs) == 0 && manager.active_download_count()? == 0 {
            return Ok(initial);
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}
