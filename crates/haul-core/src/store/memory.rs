//! In-memory job store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{sanitize_record, JobStore, StoreResult};
use crate::job::{Job, JobId, Status};

/// Job store kept in a shared map. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<BTreeMap<JobId, Job>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn filtered(&self, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut out: Vec<Job> = self.read().values().filter(|j| keep(j)).cloned().collect();
        out.sort_by_key(|j| (j.created_at, j.id));
        out
    }
}

impl JobStore for MemoryStore {
    async fn insert(&self, job: &Job) -> StoreResult<bool> {
        let mut jobs = self.write();
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn insert_batch(&self, batch: &[Job]) -> StoreResult<Vec<(Job, bool)>> {
        let mut jobs = self.write();
        let mut out = Vec::with_capacity(batch.len());
        for job in batch {
            let ok = !jobs.contains_key(&job.id);
            if ok {
                jobs.insert(job.id, job.clone());
            }
            out.push((job.clone(), ok));
        }
        Ok(out)
    }

    async fn get(&self, id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.read().get(&id).cloned())
    }

    async fn get_many(&self, ids: &[JobId]) -> StoreResult<Vec<Option<Job>>> {
        let jobs = self.read();
        Ok(ids.iter().map(|id| jobs.get(id).cloned()).collect())
    }

    async fn get_all(&self) -> StoreResult<Vec<Job>> {
        Ok(self.filtered(|_| true))
    }

    async fn get_by_file(&self, file: &Path) -> StoreResult<Option<Job>> {
        Ok(self.filtered(|j| j.file == file).into_iter().next())
    }

    async fn get_by_group(&self, group: i64) -> StoreResult<Vec<Job>> {
        Ok(self.filtered(|j| j.group == group))
    }

    async fn get_by_status(&self, status: Status) -> StoreResult<Vec<Job>> {
        Ok(self.filtered(|j| j.status == status))
    }

    async fn get_by_group_and_status(&self, group: i64, status: Status) -> StoreResult<Vec<Job>> {
        Ok(self.filtered(|j| j.group == group && j.status == status))
    }

    async fn update(&self, job: &Job) -> StoreResult<()> {
        let mut jobs = self.write();
        if let Some(slot) = jobs.get_mut(&job.id) {
            *slot = job.clone();
        }
        Ok(())
    }

    async fn update_batch(&self, batch: &[Job]) -> StoreResult<()> {
        let mut jobs = self.write();
        for job in batch {
            if let Some(slot) = jobs.get_mut(&job.id) {
                *slot = job.clone();
            }
        }
        Ok(())
    }

    async fn delete(&self, job: &Job) -> StoreResult<()> {
        self.write().remove(&job.id);
        Ok(())
    }

    async fn delete_batch(&self, batch: &[Job]) -> StoreResult<()> {
        let mut jobs = self.write();
        for job in batch {
            jobs.remove(&job.id);
        }
        Ok(())
    }

    async fn delete_all(&self) -> StoreResult<()> {
        self.write().clear();
        Ok(())
    }

    async fn modify<F>(&self, id: JobId, f: F) -> StoreResult<Option<Job>>
    where
        F: FnOnce(&mut Job) -> bool + Send,
    {
        let mut jobs = self.write();
        let Some(slot) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        let mut draft = slot.clone();
        if !f(&mut draft) {
            return Ok(None);
        }
        *slot = draft.clone();
        Ok(Some(draft))
    }

    async fn sanitize(&self, initializing: bool) -> StoreResult<u64> {
        let mut jobs = self.write();
        let mut touched = 0u64;
        for job in jobs.values_mut() {
            if sanitize_record(job, initializing) {
                touched += 1;
            }
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;

    fn job(url: &str, file: &str, group: i64) -> Job {
        Job::from_request(JobRequest::new(url, file).with_group(group), "default")
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = MemoryStore::new();
        let j = job("https://a.com/one", "/dl/one", 1);
        assert!(store.insert(&j).await.unwrap());
        assert!(!store.insert(&j).await.unwrap());
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn queries_by_file_group_and_status() {
        let store = MemoryStore::new();
        let a = job("https://a.com/one", "/dl/one", 1);
        let mut b = job("https://a.com/two", "/dl/two", 1);
        b.status = Status::Failed;
        let c = job("https://a.com/three", "/dl/three", 2);
        for j in [&a, &b, &c] {
            store.insert(j).await.unwrap();
        }
        assert_eq!(store.get_by_file(Path::new("/dl/two")).await.unwrap().map(|j| j.id), Some(b.id));
        assert_eq!(store.get_by_group(1).await.unwrap().len(), 2);
        assert_eq!(store.get_by_status(Status::Failed).await.unwrap()[0].id, b.id);
        assert!(store.get_by_group_and_status(2, Status::Failed).await.unwrap().is_empty());
        let many = store.get_many(&[c.id, 42]).await.unwrap();
        assert_eq!(many[0].as_ref().map(|j| j.id), Some(c.id));
        assert!(many[1].is_none());
    }

    #[tokio::test]
    async fn modify_applies_only_when_closure_accepts() {
        let store = MemoryStore::new();
        let j = job("https://a.com/one", "/dl/one", 0);
        store.insert(&j).await.unwrap();

        let declined = store.modify(j.id, |_| false).await.unwrap();
        assert!(declined.is_none());

        let written = store
            .modify(j.id, |r| {
                r.status = Status::Downloading;
                true
            })
            .await
            .unwrap()
            .expect("written");
        assert_eq!(written.status, Status::Downloading);
        assert_eq!(store.get(j.id).await.unwrap().unwrap().status, Status::Downloading);
        assert!(store.modify(999, |_| true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sanitize_requeues_downloading() {
        let store = MemoryStore::new();
        let mut j = job("https://a.com/one", "/dl/one", 0);
        j.status = Status::Downloading;
        store.insert(&j).await.unwrap();
        assert_eq!(store.sanitize(false).await.unwrap(), 0);
        assert_eq!(store.sanitize(true).await.unwrap(), 1);
        assert_eq!(store.get(j.id).await.unwrap().unwrap().status, Status::Queued);
    }
}
