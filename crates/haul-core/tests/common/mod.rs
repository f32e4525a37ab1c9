#![allow(dead_code)]

pub mod range_server;

use std::time::Duration;

use haul_core::store::JobStore;
use haul_core::{DownloadManager, Job, JobId, Status};

/// Polls until `id` reaches `status`, returning the record.
pub async fn wait_for_status<S: JobStore>(
    manager: &DownloadManager<S>,
    id: JobId,
    status: Status,
) -> Job {
    for _ in 0..1000 {
        if let Some(job) = manager.get_download(id).await.unwrap() {
            if job.status == status {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let last = manager.get_download(id).await.unwrap();
    panic!("job {id} never reached {status}; last seen {last:?}");
}
