//! Fixed-size pool of worker threads fed from one queue.

use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use super::OrchestratorClosed;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize, name: &str) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        for i in 0..size.max(1) {
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || loop {
                    let next = {
                        let rx = receiver.lock().unwrap_or_else(|e| e.into_inner());
                        rx.recv()
                    };
                    match next {
                        Ok(task) => task(),
                        // Sender dropped: the pool was shut down.
                        Err(_) => break,
                    }
                })?;
        }
        Ok(Self {
            sender: Mutex::new(Some(sender)),
        })
    }

    pub(crate) fn execute(&self, task: Task) -> Result<(), OrchestratorClosed> {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let sender = guard.as_ref().ok_or(OrchestratorClosed)?;
        sender.send(task).map_err(|_| OrchestratorClosed)
    }

    /// Stops accepting tasks. Threads exit once the queue drains; nobody joins them.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
