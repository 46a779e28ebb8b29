//! Worker threads for blocking I/O.
//!
//! Readers and writers spawn one long-lived worker each; the pool hands
//! out joinable task handles and names the threads for diagnostics.

use crate::error::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

struct PoolCore {
    spawned: AtomicUsize,
}

/// Spawns named worker threads and returns joinable handles.
///
/// Cloning is cheap; all clones share the same thread numbering.
#[derive(Clone)]
pub struct ThreadPool {
    core: Arc<PoolCore>,
}

impl ThreadPool {
    /// A fresh pool with its own thread numbering.
    pub fn new() -> Self {
        Self {
            core: Arc::new(PoolCore {
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    /// Spawn a worker running `f`. `purpose` becomes part of the thread
    /// name.
    pub fn spawn<F>(&self, purpose: &str, f: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let n = self.core.spawned.fetch_add(1, Ordering::Relaxed);
        let handle = std::thread::Builder::new()
            .name(format!("aqueduct-{purpose}-{n}"))
            .spawn(f)?;
        Ok(TaskHandle {
            handle: Some(handle),
        })
    }

    /// Number of workers spawned over the pool's lifetime.
    pub fn spawned(&self) -> usize {
        self.core.spawned.load(Ordering::Relaxed)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A joinable worker. Joins on drop if not joined explicitly.
pub struct TaskHandle {
    handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Wait for the worker to finish. Idempotent.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.join();
    }
}
