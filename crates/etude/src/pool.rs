// src/pool.rs
//! Fixed-size worker pool fed from a bounded queue.

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Locker, Semaphore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

struct Shared<T> {
    queue: Locker<VecDeque<T>>,
    // One permit per queued job, plus one per worker at shutdown.
    pending: Semaphore,
    max_requests: usize,
    shutdown: AtomicBool,
}

pub struct ThreadPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    /// Spawn `threads` workers that pass every job to `handler`.
    ///
    /// With `pin` set, worker `i` is pinned to core `i`, wrapping around
    /// when there are more workers than cores.
    pub fn new<F>(threads: usize, max_requests: usize, pin: bool, handler: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if threads == 0 {
            return Err(EtudeError::Config("worker count must be positive".into()));
        }
        if max_requests == 0 {
            return Err(EtudeError::Config("request queue must hold at least one job".into()));
        }

        let shared = Arc::new(Shared {
            queue: Locker::new(VecDeque::with_capacity(max_requests.min(4096)))?,
            pending: Semaphore::new(0)?,
            max_requests,
            shutdown: AtomicBool::new(false),
        });
        let handler = Arc::new(handler);
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };
        for i in 0..threads {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                core_ids.get(i % core_ids.len()).copied()
            };
            let shared = pool.shared.clone();
            let handler = handler.clone();

            // On spawn failure `pool` drops here and stops the workers already started.
            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    worker_loop(&shared, &*handler);
                })?;
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job`. Returns `false` when the queue is full or the pool is
    /// shutting down; the job is dropped then.
    pub fn append(&self, job: T) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = match self.shared.queue.lock() {
                Ok(queue) => queue,
                Err(e) => {
                    error!(error = %e, "job queue lock failed");
                    return false;
                }
            };
            if queue.len() >= self.shared.max_requests {
                return false;
            }
            queue.push_back(job);
        }
        match self.shared.pending.post() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "could not signal workers");
                false
            }
        }
    }

    /// Stop all workers and wait for them. Jobs still queued are dropped.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            if let Err(e) = self.shared.pending.post() {
                error!(error = %e, "could not wake worker for shutdown");
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker panicked");
            }
        }
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.clear();
        }
    }
}

impl<T: Send + 'static> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<T, F: Fn(T)>(shared: &Shared<T>, handler: &F) {
    loop {
        if let Err(e) = shared.pending.wait() {
            error!(error = %e, "worker wait failed");
            return;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        let job = match shared.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(e) => {
                error!(error = %e, "job queue lock failed");
                continue;
            }
        };
        if let Some(job) = job {
            handler(job);
        }
    }
}
