//! Crypto worker pool
//!
//! Batches are dispatched to one of N worker threads chosen by the
//! handler's path id. Every thread drains its channel in order, so two
//! batches of the same handler never run concurrently or out of order,
//! while different handlers spread across the pool.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::router::Job;
use crate::types::PathId;

/// Fixed set of worker threads
pub struct WorkerPool {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers
    pub fn new(threads: usize) -> CoreResult<Self> {
        if threads == 0 {
            return Err(CoreError::WorkerError("worker pool needs at least one thread".into()));
        }

        let mut senders = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            let handle = thread::Builder::new()
                .name(format!("onionhop-worker-{}", index))
                .spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        job();
                    }
                    debug!("Worker {} stopped", index);
                })
                .map_err(|e| CoreError::WorkerError(e.to_string()))?;
            senders.push(tx);
            handles.push(handle);
        }

        debug!("Started {} crypto workers", threads);
        Ok(Self { senders, handles })
    }

    pub fn threads(&self) -> usize {
        self.senders.len()
    }

    fn shard(&self, path_id: &PathId) -> usize {
        (path_id.shard_key() % self.senders.len() as u64) as usize
    }

    /// Queue `job` on the worker owning `path_id`
    pub fn dispatch(&self, path_id: PathId, job: Job) {
        let shard = self.shard(&path_id);
        if self.senders[shard].send(job).is_err() {
            warn!("Worker {} is gone, dropping batch for path {}", shard, path_id);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // closing the channels lets every worker finish its backlog and exit
        self.senders.clear();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

/// Where a node runs its crypto jobs
#[derive(Clone)]
pub enum WorkDispatcher {
    /// On the calling thread, immediately
    Inline,
    /// On a shared worker pool
    Pool(Arc<WorkerPool>),
}

impl WorkDispatcher {
    /// Worker pool sized by `config.worker_threads`
    pub fn from_config(config: &CoreConfig) -> CoreResult<Self> {
        Ok(WorkDispatcher::Pool(Arc::new(WorkerPool::new(config.worker_threads)?)))
    }

    pub fn dispatch(&self, path_id: PathId, job: Job) {
        match self {
            WorkDispatcher::Inline => job(),
            WorkDispatcher::Pool(pool) => pool.dispatch(path_id, job),
        }
    }
}

impl std::fmt::Debug for WorkDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkDispatcher::Inline => f.write_str("Inline"),
            WorkDispatcher::Pool(pool) => write!(f, "Pool({})", pool.threads()),
        }
    }
}
