//! Background content hashing.
//!
//! A fixed set of worker threads drain a [`PriorityQueue`] of hash jobs.
//! Each job streams one file through SHA-256 and reports the hex digest on a
//! oneshot channel, so async callers can await the result without blocking
//! the runtime.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::queue::{Priority, PriorityQueue};

/// Read buffer size used while hashing.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How often idle workers check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors produced by hash jobs.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File being hashed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The pool shut down before the job ran.
    #[error("hash job cancelled")]
    Cancelled,
}

impl HashError {
    /// Whether the file does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HashError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Hashes a file with SHA-256 and returns the lowercase hex digest.
pub fn hash_file(path: &Path) -> Result<String, HashError> {
    let io_err = |source| HashError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One queued hashing request.
#[derive(Debug)]
pub struct HashJob {
    path: PathBuf,
    reply: oneshot::Sender<Result<String, HashError>>,
}

impl HashJob {
    fn run(self) {
        let result = hash_file(&self.path);
        match &result {
            Ok(digest) => debug!(path = %self.path.display(), digest = %digest, "Hashed file"),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Hash job failed"),
        }
        // The requester may have given up.
        let _ = self.reply.send(result);
    }
}

/// Handle to an in-flight hash job.
#[derive(Debug)]
pub struct HashHandle(oneshot::Receiver<Result<String, HashError>>);

impl HashHandle {
    /// Waits for the digest.
    pub async fn digest(self) -> Result<String, HashError> {
        self.0.await.unwrap_or(Err(HashError::Cancelled))
    }
}

/// Fixed-size pool of hashing threads.
#[derive(Debug)]
pub struct HashPool {
    queue: Arc<PriorityQueue<HashJob>>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl HashPool {
    /// Starts `workers` threads (at least one).
    pub fn new(workers: usize) -> Self {
        let queue = Arc::new(PriorityQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let count = workers.max(1);

        let handles = (0..count)
            .filter_map(|index| {
                let queue = Arc::clone(&queue);
                let shutdown = Arc::clone(&shutdown);
                thread::Builder::new()
                    .name(format!("wolpertinger-hash-{index}"))
                    .spawn(move || worker_loop(&queue, &shutdown))
                    .map_err(|e| warn!(index, error = %e, "Failed to spawn hash worker"))
                    .ok()
            })
            .collect::<Vec<_>>();

        info!(workers = handles.len(), "Hash pool started");
        Self {
            queue,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Queues a file for hashing.
    pub fn submit(&self, path: impl Into<PathBuf>, priority: Priority) -> HashHandle {
        let (reply, rx) = oneshot::channel();
        let path = path.into();
        if self.shutdown.load(Ordering::SeqCst) {
            // Dropping the sender resolves the handle as cancelled.
            drop(reply);
        } else {
            debug!(path = %path.display(), ?priority, "Queued hash job");
            self.queue.add(HashJob { path, reply }, priority);
            // A shutdown that drained before our add would strand the job.
            if self.shutdown.load(Ordering::SeqCst) {
                self.cancel_queued();
            }
        }
        HashHandle(rx)
    }

    fn cancel_queued(&self) -> usize {
        let mut cancelled = 0usize;
        while let Some(job) = self.queue.try_take() {
            drop(job);
            cancelled += 1;
        }
        cancelled
    }

    /// Jobs waiting for a worker.
    pub fn backlog(&self) -> usize {
        self.queue.count()
    }

    /// Number of running worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .map(|workers| workers.len())
            .unwrap_or_default()
    }

    /// Stops all workers and cancels queued jobs.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("Hash worker panicked");
            }
        }

        let cancelled = self.cancel_queued();
        info!(cancelled, "Hash pool stopped");
    }
}

impl Drop for HashPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(queue: &PriorityQueue<HashJob>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(job) = queue.take_timeout(POLL_INTERVAL) {
            job.run();
        }
    }
}
