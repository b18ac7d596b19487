//! Delivery of user-facing callbacks on one dedicated task.
//!
//! Scan snapshots, read/write results, composite-operation completions and
//! connection observers are all posted here, so consumers never run on the
//! driver event task or on a waiting caller's task and need no
//! synchronization of their own.

use log::warn;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send>;

#[derive(Clone)]
pub(crate) struct CallbackQueue {
    jobs: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    /// Spawns the delivery task on the current tokio runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        Self { jobs: tx }
    }

    /// Enqueues a callback. Jobs run in post order.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.jobs.send(Box::new(job)).is_err() {
            warn!("callback queue is gone, dropping a callback");
        }
    }
}
