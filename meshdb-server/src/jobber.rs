//! Job scheduler: sharded FIFO queues drained by worker tasks.
//!
//! Fire-and-forget: a job is an opaque future, there is no result channel.
//! The queue is chosen by hashing the submitter-provided shard key, so work
//! from one submitter stays FIFO while different submitters spread across
//! queues. A failed push is returned to the caller; the job is simply
//! dropped and the submitter retries on its next trigger.

use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy)]
pub struct JobberConfig {
    /// Worker tasks. One worker owns one queue; surplus workers beyond the
    /// queue count are meaningless and clamped.
    pub workers: usize,
    /// Number of FIFO queues.
    pub queues: usize,
}

impl Default for JobberConfig {
    fn default() -> Self {
        Self { workers: 4, queues: 4 }
    }
}

pub struct Jobber {
    /// Emptied on shutdown; an empty list means "stopped".
    queues: Mutex<Vec<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

const QUEUE_DEPTH: usize = 256;

impl Jobber {
    pub fn new(config: JobberConfig) -> Self {
        let count = config.queues.min(config.workers).max(1);
        let mut queues = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);

        for _ in 0..count {
            let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
            queues.push(tx);
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
            }));
        }

        Self { queues: Mutex::new(queues), workers: Mutex::new(workers) }
    }

    /// Enqueue a job on the shard selected by `key`. Fails with `Failed`
    /// when the queue is full or the scheduler is shutting down; the job is
    /// dropped and ownership of the retry stays with the caller.
    pub fn push(&self, key: u64, job: Job) -> Result<()> {
        let queues = self.queues.lock();
        if queues.is_empty() {
            return Err(Error::failed("job scheduler stopped"));
        }
        let shard = (key % queues.len() as u64) as usize;
        queues[shard]
            .try_send(job)
            .map_err(|_| Error::failed("job queue full"))
    }

    /// Close all queues and wait for the workers to drain them.
    pub async fn shutdown(&self) {
        // Dropping the senders lets each worker finish its queue and exit.
        self.queues.lock().clear();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run() {
        let jobber = Jobber::new(JobberConfig { workers: 2, queues: 2 });
        let count = Arc::new(AtomicUsize::new(0));

        for i in 0..10u64 {
            let count = count.clone();
            jobber
                .push(i, Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all jobs should run");
    }

    #[tokio::test]
    async fn same_key_stays_fifo() {
        let jobber = Jobber::new(JobberConfig { workers: 4, queues: 4 });
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20usize {
            let order = order.clone();
            jobber
                .push(42, Box::pin(async move {
                    order.lock().push(i);
                }))
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while order.lock().len() < 20 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs should drain");

        let got = order.lock().clone();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }
}
