//! `haul status` – list jobs in the namespace.

use anyhow::Result;
use haul_core::config::HaulConfig;
use haul_core::store::{JobStore, SqliteStore};
use haul_core::{Job, Status};

/// Reads the store directly so a running `haul run` is left undisturbed.
pub async fn run_status(cfg: &HaulConfig, group: Option<i64>, status: Option<Status>) -> Result<()> {
    let store = SqliteStore::open_default(&cfg.namespace).await?;
    let mut jobs = match (group, status) {
        (Some(g), Some(s)) => store.get_by_group_and_status(g, s).await?,
        (Some(g), None) => store.get_by_group(g).await?,
        (None, Some(s)) => store.get_by_status(s).await?,
        (None, None) => store.get_all().await?,
    };
    jobs.sort_by_key(|j| j.created_at);

    if jobs.is_empty() {
        println!("No jobs in namespace {}.", cfg.namespace);
        return Ok(());
    }
    println!("{:<20} {:<12} {:>6} {:<14} {}", "ID", "STATE", "DONE", "SIZE", "FILE");
    for job in &jobs {
        println!("{}", format_row(job));
    }
    Ok(())
}

fn format_row(job: &Job) -> String {
    let done = job
        .progress_percent()
        .map(|p| format!("{p}%"))
        .unwrap_or_else(|| "-".to_string());
    let size = job
        .total
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    let state = match job.error {
        Some(cause) if job.status == Status::Failed => format!("failed:{cause}"),
        _ => job.status.to_string(),
    };
    format!(
        "{:<20} {:<12} {:>6} {:<14} {}",
        job.id,
        state,
        done,
        size,
        job.file.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use haul_core::{ErrorCause, JobRequest};

    #[test]
    fn row_shows_progress_and_failure_cause() {
        let mut job = Job::from_request(JobRequest::new("https://x/a", "/dl/a").with_id(42), "t");
        job.record_progress(50, Some(200));
        let row = format_row(&job);
        assert!(row.starts_with("42 "));
        assert!(row.contains("queued"));
        assert!(row.contains("25%"));
        assert!(row.ends_with("/dl/a"));

        job.status = Status::Failed;
        job.error = Some(ErrorCause::Http(404));
        assert!(format_row(&job).contains("failed:"));
    }
}
