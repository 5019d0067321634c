//! Bounded compile worker pool.
//!
//! Moves backend calls off the reactor thread. Jobs travel over a bounded
//! channel; results come back over a completion channel and the reactor is
//! woken through its mio `Waker`. Each job carries the connection id and a
//! serial so the reactor can drop results for connections that closed while
//! their compile was running.

use crate::backend::{Artifact, CompileError, SharedBackend};
use crate::protocol::ShaderKind;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use mio::Waker;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Source handed to a worker.
#[derive(Debug)]
pub struct Job {
    pub conn_id: usize,
    pub serial: u64,
    pub kind: ShaderKind,
    pub source: Vec<u8>,
}

/// Result handed back to the reactor.
#[derive(Debug)]
pub struct Completion {
    pub conn_id: usize,
    pub serial: u64,
    pub kind: ShaderKind,
    pub result: Result<Artifact, CompileError>,
}

pub struct CompilePool {
    jobs: Option<Sender<Job>>,
    completions: Receiver<Completion>,
    workers: Vec<JoinHandle<()>>,
}

impl CompilePool {
    /// Spawn `workers` threads sharing a queue of `queue_depth` pending jobs.
    pub fn new(
        workers: usize,
        queue_depth: usize,
        backend: SharedBackend,
        waker: Arc<Waker>,
    ) -> io::Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::bounded(queue_depth);
        let (done_tx, done_rx) = crossbeam_channel::unbounded();

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let backend = Arc::clone(&backend);
            let waker = Arc::clone(&waker);

            let handle = thread::Builder::new()
                .name(format!("compile-{worker_id}"))
                .spawn(move || worker_loop(worker_id, job_rx, done_tx, backend, waker))?;
            handles.push(handle);
        }

        Ok(Self {
            jobs: Some(job_tx),
            completions: done_rx,
            workers: handles,
        })
    }

    /// Queue a job without blocking. Hands the job back when the queue is full.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        let Some(jobs) = &self.jobs else {
            return Err(job);
        };
        match jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => Err(job),
        }
    }

    /// Drain finished compilations without blocking.
    pub fn completions(&self) -> impl Iterator<Item = Completion> + '_ {
        self.completions.try_iter()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for CompilePool {
    fn drop(&mut self) {
        // Closing the job channel lets idle workers exit.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    jobs: Receiver<Job>,
    done: Sender<Completion>,
    backend: SharedBackend,
    waker: Arc<Waker>,
) {
    debug!(worker = worker_id, "Compile worker started");

    // Ends once the pool drops its sender and the queue is drained.
    for job in jobs.iter() {
        let result = backend.compile(job.kind, &job.source);
        let completion = Completion {
            conn_id: job.conn_id,
            serial: job.serial,
            kind: job.kind,
            result,
        };
        if done.send(completion).is_err() {
            break;
        }
        if let Err(e) = waker.wake() {
            warn!(worker = worker_id, error = %e, "Failed to wake reactor");
        }
    }

    debug!(worker = worker_id, "Compile worker stopped");
}
