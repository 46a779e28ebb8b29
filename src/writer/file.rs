//! Threaded file writer.
//!
//! A worker thread drains the queue of leases into the file with
//! blocking writes, reporting progress per physical write. Finalize is
//! two-phase: the first call flags the intent and returns `Wait` while
//! backlog or fsync remain; the worker completes the drain, syncs if
//! requested, signals availability and the next `finalize` returns
//! `Done`.

use super::{Finalize, ProgressFn, Submit, Writer, WriterFactory};
use crate::error::{Error, Result};
use crate::fs::{BlockingFile, Disposition, OpenMode, Permissions};
use crate::pool::{BufferLease, BufferPool};
use crate::thread_pool::{TaskHandle, ThreadPool};
use crate::waitable::{Waitable, WaitableToken, Waiter};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

/// Options for [`FileWriter`] construction via its factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileWriterOptions {
    /// Sync file content to stable storage as part of finalize.
    pub fsync: bool,
    /// Permission level for newly created files.
    pub permissions: Permissions,
}

/// Streaming (0), finalize requested (1), fully finalized (2).
type FinalizeStage = u8;

struct WriterState {
    queue: VecDeque<BufferLease>,
    /// A buffer popped by the worker still occupies a queue slot until
    /// it has been fully written out.
    writing: bool,
    finalizing: FinalizeStage,
    preallocated: bool,
    error: bool,
    quit: bool,
}

impl WriterState {
    fn occupied(&self) -> usize {
        self.queue.len() + self.writing as usize
    }
}

struct WriterInner {
    name: String,
    path: PathBuf,
    max_buffers: usize,
    fsync: bool,
    progress: Option<ProgressFn>,
    waitable: Waitable,
    state: Mutex<WriterState>,
    cond: Condvar,
    /// Taken only across a single syscall, or after the worker has been
    /// joined. `None` once closed.
    file: Mutex<Option<BlockingFile>>,
}

impl WriterInner {
    /// Worker loop: drain the queue, then complete finalization.
    fn run(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.quit && !state.error {
            if state.queue.is_empty() {
                if state.finalizing == 1 {
                    state.finalizing = 2;
                    if self.fsync {
                        drop(state);
                        let synced = {
                            let file = self.file.lock().unwrap();
                            match file.as_ref() {
                                Some(file) => file.fsync().is_ok(),
                                None => false,
                            }
                        };
                        state = self.state.lock().unwrap();
                        if !synced {
                            tracing::error!("could not sync '{}' to disk", self.name);
                            state.error = true;
                        }
                    }
                    self.waitable.signal_availability();
                    break;
                }
                state = self.cond.wait(state).unwrap();
                continue;
            }

            let mut lease = state.queue.pop_front().unwrap();
            state.writing = true;
            while !lease.is_empty() {
                drop(state);
                let written = {
                    let mut file = self.file.lock().unwrap();
                    match file.as_mut() {
                        Some(file) => file.write(lease.readable()),
                        None => Err(Error::Stream(self.name.clone())),
                    }
                };
                state = self.state.lock().unwrap();
                if state.quit || state.error {
                    state.writing = false;
                    return;
                }
                match written {
                    Ok(n) if n > 0 => {
                        lease.consume(n);
                        if let Some(progress) = &self.progress {
                            progress(n as u64);
                        }
                    }
                    _ => {
                        state.error = true;
                        state.writing = false;
                        return;
                    }
                }
            }

            let was_full = state.occupied() == self.max_buffers;
            state.writing = false;
            // Returns the buffer to the pool before releasing a blocked
            // producer.
            drop(lease);
            if was_full {
                self.waitable.signal_availability();
            }
        }
    }
}

/// A writer that drains to a file on a dedicated worker thread.
///
/// Usually created through [`FileWriterFactory`]. Closing a writer that
/// never received data and was not finalized deletes the file.
pub struct FileWriter {
    inner: Arc<WriterInner>,
    task: Mutex<Option<TaskHandle>>,
}

impl FileWriter {
    /// Construct a writer over an already-opened and positioned file.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        file: BlockingFile,
        thread_pool: &ThreadPool,
        fsync: bool,
        progress: Option<ProgressFn>,
        max_buffers: usize,
    ) -> Result<Self> {
        let inner = Arc::new(WriterInner {
            name: name.into(),
            path: path.into(),
            max_buffers: max_buffers.max(1),
            fsync,
            progress,
            waitable: Waitable::new(),
            state: Mutex::new(WriterState {
                queue: VecDeque::new(),
                writing: false,
                finalizing: 0,
                preallocated: false,
                error: false,
                quit: false,
            }),
            cond: Condvar::new(),
            file: Mutex::new(Some(file)),
        });
        let task = {
            let worker = inner.clone();
            thread_pool.spawn("writer", move || worker.run())?
        };
        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    fn stop_worker(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.quit = true;
            self.inner.cond.notify_one();
        }
        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            task.join();
        }
    }
}

impl Writer for FileWriter {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn add_buffer(&self, lease: BufferLease, waiter: &Waiter) -> Result<Submit> {
        let mut state = self.inner.state.lock().unwrap();
        if state.error {
            return Err(Error::Stream(self.inner.name.clone()));
        }
        if lease.is_empty() {
            return Ok(Submit::Accepted);
        }
        state.queue.push_back(lease);
        if state.occupied() == 1 {
            self.inner.cond.notify_one();
        }
        if state.occupied() >= self.inner.max_buffers {
            self.inner.waitable.add_waiter(waiter.clone());
            Ok(Submit::Wait)
        } else {
            Ok(Submit::Accepted)
        }
    }

    fn finalize(&self, waiter: &Waiter) -> Result<Finalize> {
        let mut state = self.inner.state.lock().unwrap();
        if state.error {
            return Err(Error::Stream(self.inner.name.clone()));
        }
        if state.finalizing == 2 {
            return Ok(Finalize::Done);
        }
        state.finalizing = 1;

        if self.inner.file.lock().unwrap().is_none() {
            state.error = true;
            return Err(Error::Stream(self.inner.name.clone()));
        }
        if state.occupied() == 0 {
            if self.inner.fsync {
                // Hand the sync to the worker and wait for it.
                self.inner.cond.notify_one();
                self.inner.waitable.add_waiter(waiter.clone());
                return Ok(Finalize::Wait);
            }
            // Nothing pending; finalization completes synchronously.
            state.finalizing = 2;
            return Ok(Finalize::Done);
        }
        self.inner.waitable.add_waiter(waiter.clone());
        Ok(Finalize::Wait)
    }

    fn preallocate(&self, size: u64) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.error || state.occupied() != 0 || state.finalizing != 0 {
            return Err(Error::Precondition(format!(
                "{}: preallocate is only valid while streaming with an empty backlog",
                self.inner.name
            )));
        }

        tracing::debug!("preallocating {size} bytes for '{}'", self.inner.name);

        let mut file = self.inner.file.lock().unwrap();
        let Some(file) = file.as_mut() else {
            return Err(Error::Precondition(format!(
                "{}: writer is closed",
                self.inner.name
            )));
        };
        let old_pos = file.position()?;
        let target = old_pos
            .checked_add(size)
            .ok_or_else(|| Error::Precondition("preallocation size overflows".into()))?;
        if file.seek(SeekFrom::Start(target))? == target && file.truncate().is_err() {
            tracing::warn!("could not preallocate '{}'", self.inner.name);
        }
        if file.seek(SeekFrom::Start(old_pos))? != old_pos {
            tracing::error!(
                "could not seek back to offset {old_pos} within '{}'",
                self.inner.name
            );
            state.error = true;
            return Err(Error::Stream(self.inner.name.clone()));
        }
        state.preallocated = true;
        Ok(())
    }

    fn set_mtime(&self, t: SystemTime) -> Result<()> {
        let state = self.inner.state.lock().unwrap();
        if state.error || state.finalizing != 2 {
            return Err(Error::Precondition(format!(
                "{}: set_mtime requires a fully finalized writer",
                self.inner.name
            )));
        }
        let file = self.inner.file.lock().unwrap();
        match file.as_ref() {
            Some(file) => file.set_modified(t),
            None => Err(Error::Precondition(format!(
                "{}: writer is closed",
                self.inner.name
            ))),
        }
    }

    fn close(&self) {
        self.stop_worker();

        let (finalized, preallocated) = {
            let state = self.inner.state.lock().unwrap();
            (state.finalizing != 0, state.preallocated)
        };
        let file = self.inner.file.lock().unwrap().take();
        if let Some(mut file) = file {
            let untouched = !finalized && file.position().map_or(false, |pos| pos == 0);
            if !untouched && preallocated {
                // Writing may have stopped short of the preallocated
                // extent; cut the file at the current position.
                let _ = file.truncate();
            }
            drop(file);
            if untouched {
                tracing::debug!("deleting empty file '{}'", self.inner.name);
                let _ = std::fs::remove_file(&self.inner.path);
            }
        }

        let mut state = self.inner.state.lock().unwrap();
        self.inner.waitable.remove_waiters();
        state.queue.clear();
    }

    fn error(&self) -> bool {
        self.inner.state.lock().unwrap().error
    }

    fn token(&self) -> WaitableToken {
        self.inner.waitable.token()
    }

    fn remove_waiter(&self, waiter: &Waiter) {
        self.inner.waitable.remove_waiter(waiter);
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for [`FileWriter`].
///
/// Opening at a nonzero offset keeps existing content, seeks there and
/// truncates; offset zero opens the file empty.
pub struct FileWriterFactory {
    path: PathBuf,
    name: String,
    thread_pool: ThreadPool,
    options: FileWriterOptions,
}

impl FileWriterFactory {
    /// Factory writing to `path`. Workers come from `thread_pool`.
    pub fn new(path: impl AsRef<Path>, thread_pool: &ThreadPool, options: FileWriterOptions) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            thread_pool: thread_pool.clone(),
            options,
        }
    }
}

impl WriterFactory for FileWriterFactory {
    fn clone_boxed(&self) -> Box<dyn WriterFactory> {
        Box::new(Self {
            path: self.path.clone(),
            name: self.name.clone(),
            thread_pool: self.thread_pool.clone(),
            options: self.options,
        })
    }

    fn open(
        &self,
        _pool: &BufferPool,
        offset: u64,
        progress: Option<ProgressFn>,
        max_buffers: usize,
    ) -> Result<Box<dyn Writer>> {
        let max_buffers = if max_buffers == 0 {
            self.preferred_buffer_count()
        } else {
            max_buffers
        };
        let disposition = if offset != 0 {
            Disposition::Existing
        } else {
            Disposition::Empty
        };
        let mut file = BlockingFile::open(
            &self.path,
            OpenMode::Writing,
            disposition,
            self.options.permissions,
        )?;
        if offset != 0 {
            if file.seek(SeekFrom::Start(offset))? != offset {
                tracing::error!("could not seek to offset {offset} within '{}'", self.name);
                return Err(Error::Seek(format!(
                    "{}: could not seek to offset {offset}",
                    self.name
                )));
            }
            if file.truncate().is_err() {
                tracing::error!("could not truncate '{}' at offset {offset}", self.name);
                return Err(Error::Precondition(format!(
                    "{}: could not truncate at offset {offset}",
                    self.name
                )));
            }
        }
        let writer = FileWriter::new(
            self.name.clone(),
            self.path.clone(),
            file,
            &self.thread_pool,
            self.options.fsync,
            progress,
            max_buffers,
        )?;
        Ok(Box::new(writer))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn offsetable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }

    fn mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).ok().and_then(|m| m.modified().ok())
    }

    fn set_mtime(&self, t: SystemTime) -> Result<()> {
        let file = std::fs::File::options().write(true).open(&self.path)?;
        Ok(file.set_modified(t)?)
    }

    fn multiple_buffer_usage(&self) -> bool {
        true
    }

    fn preferred_buffer_count(&self) -> usize {
        4
    }
}
