//! Named worker-thread pools.
//!
//! The `PoolRegistry` owns every pool in the process. A pool is a fixed set
//! of OS threads pulling boxed jobs from one FIFO queue, so work submitted to
//! the same pool starts in submission order. Nothing is ordered across pools.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crate::util::{lock, panic_message, read, write};
use crate::{Error, Result};

/// A unit of work queued on a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Pool {
    threads: u32,
    /// `None` once the pool is shutting down.
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Waits for the result of one submitted unit of work.
pub struct PoolHandle<T> {
    pool: String,
    rx: Receiver<std::result::Result<T, String>>,
}

impl<T> PoolHandle<T> {
    /// Block until the work has run.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPanicked` if the work panicked or was dropped unrun.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(Error::WorkerPanicked {
                pool: self.pool,
                message,
            }),
            Err(_) => Err(Error::WorkerPanicked {
                pool: self.pool,
                message: "work was dropped before it ran".to_string(),
            }),
        }
    }

    /// Non-blocking check. `Ok(None)` while the work is still queued or running.
    pub fn try_wait(&self) -> Result<Option<T>> {
        match self.rx.try_recv() {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(message)) => Err(Error::WorkerPanicked {
                pool: self.pool.clone(),
                message,
            }),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::WorkerPanicked {
                pool: self.pool.clone(),
                message: "work was dropped before it ran".to_string(),
            }),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }
}

impl<T> fmt::Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle").field("pool", &self.pool).finish()
    }
}

/// Owns every worker pool.
///
/// # Example
///
/// ```
/// use slate::orchestration::PoolRegistry;
///
/// let pools = PoolRegistry::new();
/// pools.create_pool("cpu", 4).unwrap();
/// let handle = pools.submit("cpu", || 2 + 2).unwrap();
/// assert_eq!(handle.wait().unwrap(), 4);
/// pools.shutdown_all();
/// ```
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<Pool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool and start its workers.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for zero threads, `DuplicateName` if the name is
    /// taken, `Io` if a worker thread cannot be spawned.
    pub fn create_pool(&self, name: &str, threads: u32) -> Result<()> {
        if threads == 0 {
            return Err(Error::InvalidArgument(format!(
                "pool {} needs at least one thread",
                name
            )));
        }

        let mut pools = write(&self.pools);
        if pools.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads as usize);
        for i in 0..threads {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Workers already started exit once the sender drops.
                    drop(tx);
                    return Err(Error::Io(e));
                }
            }
        }

        pools.insert(
            name.to_string(),
            Arc::new(Pool {
                threads,
                tx: Mutex::new(Some(tx)),
                workers: Mutex::new(workers),
            }),
        );
        Ok(())
    }

    fn pool(&self, name: &str) -> Result<Arc<Pool>> {
        read(&self.pools)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownPool(name.to_string()))
    }

    /// Queue a job without a completion handle.
    pub fn execute(&self, name: &str, job: Job) -> Result<()> {
        let pool = self.pool(name)?;
        let tx = lock(&pool.tx);
        match tx.as_ref() {
            Some(tx) => tx
                .send(job)
                .map_err(|_| Error::UnknownPool(name.to_string())),
            None => Err(Error::UnknownPool(name.to_string())),
        }
    }

    /// Queue `work` and return a handle for its result.
    pub fn submit<T, F>(&self, name: &str, work: F) -> Result<PoolHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.execute(
            name,
            Box::new(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                    .map_err(|payload| panic_message(payload.as_ref()));
                let _ = tx.send(outcome);
            }),
        )?;
        Ok(PoolHandle {
            pool: name.to_string(),
            rx,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.pools).contains_key(name)
    }

    pub fn thread_count(&self, name: &str) -> Result<u32> {
        Ok(self.pool(name)?.threads)
    }

    /// Jobs waiting in the pool's queue, not counting running ones.
    pub fn queued(&self, name: &str) -> Result<usize> {
        let pool = self.pool(name)?;
        let len = lock(&pool.tx).as_ref().map(|tx| tx.len()).unwrap_or(0);
        Ok(len)
    }

    /// Pool names, sorted.
    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.pools).keys().cloned().collect();
        names.sort();
        names
    }

    /// Run everything still queued, join the workers and forget the pool.
    pub fn shutdown_pool(&self, name: &str) -> Result<()> {
        let pool = write(&self.pools)
            .remove(name)
            .ok_or_else(|| Error::UnknownPool(name.to_string()))?;

        lock(&pool.tx).take();

        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = lock(&pool.workers).drain(..).collect();
        for worker in workers {
            // A worker asking to shut down its own pool cannot join itself.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
        Ok(())
    }

    pub fn shutdown_all(&self) {
        for name in self.pool_names() {
            let _ = self.shutdown_pool(&name);
        }
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.pool_names())
            .finish()
    }
}

fn worker_loop(rx: Receiver<Job>) {
    for job in rx.iter() {
        // Jobs report their own panics; this only keeps the worker alive.
        let _ = panic::catch_unwind(AssertUnwindSafe(job));
    }
}
