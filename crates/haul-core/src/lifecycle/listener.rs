//! Listener registry and the notifier task that fans events out.

use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::job::{ErrorCause, Job};

/// Observer of job events. Every method defaults to a no-op.
///
/// Callbacks run on the notifier task, never on the thread that caused the event.
pub trait DownloadListener: Send + Sync {
    fn on_started(&self, _job: &Job, _downloaded: u64, _total: Option<u64>) {}
    fn on_progress(&self, _job: &Job, _eta_ms: Option<u64>, _bytes_per_sec: u64) {}
    fn on_complete(&self, _job: &Job) {}
    fn on_error(&self, _job: &Job, _cause: ErrorCause) {}
    /// A lifecycle operation (enqueue, pause, remove, ...) changed the job.
    fn on_status_changed(&self, _job: &Job) {}
}

pub type ListenerId = u64;

#[derive(Debug, Clone)]
pub(crate) enum ListenerEvent {
    Started {
        job: Job,
        downloaded: u64,
        total: Option<u64>,
    },
    Progress {
        job: Job,
        eta_ms: Option<u64>,
        bytes_per_sec: u64,
    },
    Complete(Job),
    Error(Job, ErrorCause),
    StatusChanged(Job),
}

impl ListenerEvent {
    fn dispatch(&self, listener: &dyn DownloadListener) {
        match self {
            ListenerEvent::Started {
                job,
                downloaded,
                total,
            } => listener.on_started(job, *downloaded, *total),
            ListenerEvent::Progress {
                job,
                eta_ms,
                bytes_per_sec,
            } => listener.on_progress(job, *eta_ms, *bytes_per_sec),
            ListenerEvent::Complete(job) => listener.on_complete(job),
            ListenerEvent::Error(job, cause) => listener.on_error(job, *cause),
            ListenerEvent::StatusChanged(job) => listener.on_status_changed(job),
        }
    }
}

#[derive(Default)]
struct Listeners {
    next_id: ListenerId,
    entries: Vec<(ListenerId, Arc<dyn DownloadListener>)>,
}

/// Owned by one manager; torn down with it.
#[derive(Clone)]
pub(crate) struct ListenerRegistry {
    listeners: Arc<Mutex<Listeners>>,
    events: mpsc::UnboundedSender<ListenerEvent>,
}

impl ListenerRegistry {
    /// Spawns the notifier task on `runtime`.
    pub(crate) fn spawn(runtime: &Handle) -> (Self, JoinHandle<()>) {
        let (events, mut rx) = mpsc::unbounded_channel::<ListenerEvent>();
        let listeners: Arc<Mutex<Listeners>> = Arc::default();
        let shared = Arc::clone(&listeners);
        let notifier = runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot: Vec<Arc<dyn DownloadListener>> = shared
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entries
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect();
                for listener in snapshot {
                    event.dispatch(listener.as_ref());
                }
            }
        });
        (Self { listeners, events }, notifier)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        let mut listeners = self.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.entries.len();
        listeners.entries.retain(|(l, _)| *l != id);
        listeners.entries.len() != before
    }

    pub(crate) fn clear(&self) {
        self.lock().entries.clear();
    }

    pub(crate) fn emit(&self, event: ListenerEvent) {
        // Fails only after the notifier has stopped.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobRequest;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter(Mutex<Vec<String>>);

    impl DownloadListener for Counter {
        fn on_complete(&self, job: &Job) {
            self.0.lock().unwrap().push(format!("complete {}", job.id));
        }

        fn on_status_changed(&self, job: &Job) {
            self.0.lock().unwrap().push(format!("{} {}", job.status, job.id));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_reach_registered_listeners_only() {
        let (registry, notifier) = ListenerRegistry::spawn(&Handle::current());
        let counter = Arc::new(Counter::default());
        let id = registry.add(counter.clone());
        let job = Job::from_request(JobRequest::new("https://x/a", "/dl/a").with_id(1), "t");

        registry.emit(ListenerEvent::StatusChanged(job.clone()));
        registry.emit(ListenerEvent::Complete(job.clone()));
        for _ in 0..100 {
            if counter.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*counter.0.lock().unwrap(), vec!["queued 1", "complete 1"]);

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.emit(ListenerEvent::Complete(job));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.0.lock().unwrap().len(), 2);
        notifier.abort();
    }
}
