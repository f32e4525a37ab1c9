//! Queue and enqueue-policy behavior seen through the public manager API.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::range_server::{self, RangeServerOptions};
use common::wait_for_status;
use haul_core::config::HaulConfig;
use haul_core::downloader::CurlDownloader;
use haul_core::store::{JobStore, MemoryStore};
use haul_core::{
    DownloadManager, EnqueueOption, Job, JobRequest, NamespaceRegistry, Status, Strategies,
};
use tempfile::tempdir;

fn config(limit: usize, auto_start: bool, options: Vec<EnqueueOption>) -> HaulConfig {
    HaulConfig {
        namespace: "lifecycle-test".into(),
        concurrency_limit: limit,
        segments: 1,
        auto_start,
        queue_poll_ms: 20,
        progress_interval_ms: 20,
        enqueue_options: options,
        ..HaulConfig::default()
    }
}

async fn open_with(store: MemoryStore, dir: &Path, mut cfg: HaulConfig) -> DownloadManager<MemoryStore> {
    cfg.temp_dir = Some(dir.join("segments"));
    let strategies = Strategies::new(Arc::new(CurlDownloader::new(cfg.http.clone(), 1)));
    DownloadManager::open(store, &cfg, &NamespaceRegistry::new(), strategies)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_limit_of_one_runs_jobs_one_at_a_time() {
    let dir = tempdir().unwrap();
    let url = range_server::start_with_options(
        vec![7u8; 32 * 1024],
        RangeServerOptions {
            chunk_delay: Some(Duration::from_millis(5)),
            ..RangeServerOptions::default()
        },
    );
    let manager = open_with(MemoryStore::new(), dir.path(), config(1, true, Vec::new())).await;

    let mut ids = Vec::new();
    for n in 0..3 {
        let file = dir.path().join(format!("{n}.bin"));
        ids.push(manager.enqueue(JobRequest::new(&url, file)).await.unwrap().id);
    }

    let mut completed = 0;
    for _ in 0..1000 {
        let jobs = manager.get_downloads().await.unwrap();
        let downloading = jobs.iter().filter(|j| j.status == Status::Downloading).count();
        assert!(downloading <= 1, "{downloading} jobs downloading at once");
        assert!(manager.active_download_count().unwrap() <= 1);
        completed = jobs.iter().filter(|j| j.status == Status::Completed).count();
        if completed == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(completed, ids.len());
}

#[tokio::test(flavor = "multi_thread")]
async fn replace_by_id_keeps_prior_progress() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    let file = dir.path().join("big.iso");
    let mut prior = Job::from_request(
        JobRequest::new("https://mirror.example/big.iso", &file).with_id(5),
        "lifecycle-test",
    );
    prior.status = Status::Paused;
    prior.record_progress(400, Some(1000));
    store.insert(&prior).await.unwrap();

    let cfg = config(1, false, vec![EnqueueOption::ReplaceOnEnqueueId]);
    let manager = open_with(store.clone(), dir.path(), cfg).await;

    let replaced = manager
        .enqueue(JobRequest::new("https://other.example/big.iso", &file).with_id(5))
        .await
        .unwrap();
    assert_eq!(replaced.status, Status::Queued);
    assert_eq!(replaced.downloaded, 400);
    assert_eq!(replaced.total, Some(1000));

    let stored = manager.get_download(5).await.unwrap().unwrap();
    assert_eq!(stored.url, "https://other.example/big.iso");
    assert_eq!(stored.downloaded, 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn without_policy_same_id_is_rejected() {
    let dir = tempdir().unwrap();
    let manager = open_with(MemoryStore::new(), dir.path(), config(1, false, Vec::new())).await;
    let request = JobRequest::new("https://x.example/a", dir.path().join("a"));
    manager.enqueue(request.clone()).await.unwrap();
    let err = manager.enqueue(request).await.unwrap_err();
    assert!(matches!(err, haul_core::HaulError::AlreadyEnqueued(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_increment_picks_a_free_file_name() {
    let dir = tempdir().unwrap();
    let taken = dir.path().join("report.pdf");
    std::fs::write(&taken, b"mine").unwrap();
    std::fs::write(dir.path().join("report (1).pdf"), b"also mine").unwrap();

    let cfg = config(1, false, vec![EnqueueOption::AutoIncrementFileName]);
    let manager = open_with(MemoryStore::new(), dir.path(), cfg).await;

    let job = manager
        .enqueue(JobRequest::new("https://x.example/report.pdf", &taken))
        .await
        .unwrap();
    assert_eq!(job.file, dir.path().join("report (2).pdf"));
    assert!(job.file.exists(), "new name is reserved on disk");
    assert_eq!(std::fs::read(&taken).unwrap(), b"mine");

    let stored = manager.get_download(job.id).await.unwrap().unwrap();
    assert_eq!(stored.file, job.file);
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_failed_keeps_other_jobs_and_files() {
    let dir = tempdir().unwrap();
    let url = range_server::start_with_options(
        Vec::new(),
        RangeServerOptions {
            fail_status: Some(500),
            ..RangeServerOptions::default()
        },
    );
    let manager = open_with(MemoryStore::new(), dir.path(), config(2, true, Vec::new())).await;

    let failing = manager
        .enqueue(JobRequest::new(&url, dir.path().join("broken.bin")))
        .await
        .unwrap();
    wait_for_status(&manager, failing.id, Status::Failed).await;

    manager.queue().pause();
    let kept_file = dir.path().join("kept.bin");
    std::fs::write(&kept_file, b"partial").unwrap();
    let queued = manager
        .enqueue(JobRequest::new("https://x.example/kept", &kept_file))
        .await
        .unwrap();

    let removed = manager.remove_all_with_status(Status::Failed).await.unwrap();
    assert_eq!(removed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![failing.id]);
    assert_eq!(removed[0].status, Status::Removed);
    assert!(manager.get_download(failing.id).await.unwrap().is_none());

    let still = manager.get_download(queued.id).await.unwrap().unwrap();
    assert_eq!(still.status, Status::Queued);
    assert!(kept_file.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_enqueue_reports_repeated_id_as_not_inserted() {
    let dir = tempdir().unwrap();
    let manager = open_with(MemoryStore::new(), dir.path(), config(1, false, Vec::new())).await;

    let a = JobRequest::new("https://x.example/a", dir.path().join("a"));
    let b = JobRequest::new("https://x.example/b", dir.path().join("b"));
    let results = manager
        .enqueue_batch(vec![a.clone(), b, a])
        .await
        .unwrap();

    let inserted: Vec<bool> = results.iter().map(|(_, ok)| *ok).collect();
    assert_eq!(inserted, vec![true, true, false]);
    assert_eq!(manager.get_downloads_with_status(Status::Queued).await.unwrap().len(), 2);

    // A second batch finds both ids taken.
    let again = manager
        .enqueue_batch(vec![JobRequest::new("https://x.example/a", dir.path().join("a"))])
        .await
        .unwrap();
    assert_eq!(again.len(), 1);
    assert!(!again[0].1);
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_enqueue_with_id_policy_keeps_first_of_repeats() {
    let dir = tempdir().unwrap();
    let cfg = config(1, false, vec![EnqueueOption::ReplaceOnEnqueueFreshId]);
    let manager = open_with(MemoryStore::new(), dir.path(), cfg).await;

    let a = JobRequest::new("https://x.example/a", dir.path().join("a")).with_group(1);
    let repeat = JobRequest::new("https://x.example/a", dir.path().join("a")).with_group(2);
    let results = manager.enqueue_batch(vec![a, repeat]).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0.group, 1);
}
