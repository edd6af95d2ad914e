use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("{0} queue full")]
    Full(&'static str),
    #[error("{0} pool stopped")]
    Stopped(&'static str),
}

/// Fixed set of workers draining a bounded queue. Submission never waits: a full queue
/// rejects the job and counts it as dropped.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    tx: mpsc::Sender<Job>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let pool = Self {
            name,
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            completed: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let pending = pool.pending.clone();
            let idle = pool.idle.clone();
            let completed = pool.completed.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else {
                        break;
                    };
                    job.await;
                    completed.fetch_add(1, Ordering::Relaxed);
                    if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                        idle.notify_waiters();
                    }
                }
            });
        }
        pool
    }

    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PoolError::Stopped(self.name));
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(Box::pin(job)) {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.idle.notify_waiters();
                }
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match err {
                    mpsc::error::TrySendError::Full(_) => Err(PoolError::Full(self.name)),
                    mpsc::error::TrySendError::Closed(_) => Err(PoolError::Stopped(self.name)),
                }
            }
        }
    }

    /// Resolve once every accepted job has finished.
    pub async fn quiesce(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Refuse new work; jobs already queued still run.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
