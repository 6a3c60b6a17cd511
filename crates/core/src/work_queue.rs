//! Lazily started serial work queue.
//!
//! Jobs travel over an unbounded channel whose receiver is owned by a
//! worker thread. The worker is spawned by the first submission and exits
//! as soon as the channel is empty; the next submission starts a new one.
//! Jobs run strictly in submission order, one at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sender into the running worker's channel, `None` while stopped.
type Slot = Arc<Mutex<Option<mpsc::UnboundedSender<Job>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serial queue backed by an on-demand worker thread.
#[derive(Clone)]
pub struct WorkQueue {
    name: String,
    slot: Slot,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slot: Slot::default(),
        }
    }

    /// Append a job, starting the worker if it is stopped.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        let job: Job = match slot.as_ref() {
            Some(tx) => match tx.send(Box::new(job)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => Box::new(job),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            queue: self.name.clone(),
            slot: Arc::clone(&self.slot),
            rx,
        };
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run(job));
        match spawned {
            Ok(_) => *slot = Some(tx),
            Err(e) => {
                error!(queue = %self.name, error = %e, "failed to start worker thread, job dropped");
            }
        }
    }

    /// No worker is running, so nothing is queued either.
    pub fn is_idle(&self) -> bool {
        lock(&self.slot).is_none()
    }
}

/// Receiving side, owned by the worker thread.
struct Worker {
    queue: String,
    slot: Slot,
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Worker {
    fn run(mut self, first: Job) {
        first();
        loop {
            if let Ok(job) = self.rx.try_recv() {
                job();
                continue;
            }
            // Submitters send under the slot lock, so an empty channel seen
            // while holding it stays empty once the slot is cleared.
            let mut slot = lock(&self.slot);
            match self.rx.try_recv() {
                Ok(job) => {
                    drop(slot);
                    job();
                }
                Err(_) => {
                    *slot = None;
                    trace!(queue = %self.queue, "work queue drained, worker stopping");
                    return;
                }
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        *lock(&self.slot) = None;
        let mut dropped = 0usize;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        error!(queue = %self.queue, dropped, "job panicked, worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_idle(queue: &WorkQueue) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !queue.is_idle() {
            assert!(Instant::now() < deadline, "queue never went idle");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = WorkQueue::new("test-order");
        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            queue.submit(move || {
                thread::sleep(Duration::from_millis(2));
                tx.send(i).unwrap();
            });
        }
        let seen: Vec<i32> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn worker_stops_when_idle_and_restarts() {
        let queue = WorkQueue::new("test-restart");
        assert!(queue.is_idle());

        let (tx, rx) = std::sync::mpsc::channel();
        let first = tx.clone();
        queue.submit(move || first.send("first").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "first");
        wait_idle(&queue);

        queue.submit(move || tx.send("second").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "second");
        wait_idle(&queue);
    }

    #[test]
    fn panicking_job_does_not_wedge_queue() {
        let queue = WorkQueue::new("test-panic");
        queue.submit(|| panic!("job failed"));
        wait_idle(&queue);

        let (tx, rx) = std::sync::mpsc::channel();
        queue.submit(move || tx.send("after").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "after");
        wait_idle(&queue);
    }
}
