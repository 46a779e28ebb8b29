//! Threaded file reader.
//!
//! A worker thread prefetches file content into a bounded queue of
//! leases. The worker parks when the queue is full or the pool is dry;
//! the reader registers itself as a pool waiter and pokes the worker's
//! condition variable when buffers come back.

use super::{ReadResult, Reader, ReaderFactory, StreamPos};
use crate::error::{Error, Result};
use crate::fs::{BlockingFile, Disposition, OpenMode, Permissions};
use crate::pool::{BufferLease, BufferPool};
use crate::thread_pool::{TaskHandle, ThreadPool};
use crate::waitable::{Waitable, WaitableToken, Waiter, WaiterSink};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

struct FileState {
    queue: VecDeque<BufferLease>,
    pos: StreamPos,
    quit: bool,
}

struct FileInner {
    name: String,
    pool: BufferPool,
    max_buffers: usize,
    waitable: Waitable,
    state: Mutex<FileState>,
    cond: Condvar,
    /// Taken only across a single syscall, or after the worker has been
    /// joined. Never acquired while waiting on `cond`.
    file: Mutex<BlockingFile>,
}

impl FileInner {
    /// Worker loop: prefetch into the queue until eof, error or quit.
    fn run(self: Arc<Self>) {
        let waiter = Waiter::sink(self.clone() as Arc<dyn WaiterSink>);
        let mut state = self.state.lock().unwrap();
        while !state.quit && !state.pos.error {
            if state.queue.len() == self.max_buffers {
                state = self.cond.wait(state).unwrap();
                continue;
            }
            let Some(mut lease) = self.pool.get_buffer(&waiter) else {
                state = self.cond.wait(state).unwrap();
                continue;
            };

            while lease.spare_capacity() > 0 {
                let mut to_read = lease.spare_capacity() as u64;
                if let Some(remaining) = state.pos.remaining {
                    to_read = to_read.min(remaining);
                }
                drop(state);
                let read = if to_read > 0 {
                    let mut file = self.file.lock().unwrap();
                    file.read(lease.spare(to_read as usize))
                } else {
                    Ok(0)
                };
                state = self.state.lock().unwrap();
                if state.quit || state.pos.error {
                    return;
                }
                match read {
                    Err(_) => {
                        state.pos.error = true;
                        break;
                    }
                    Ok(0) => {
                        // A short source under a size restriction is an
                        // error; an unbounded source just ended.
                        match state.pos.remaining {
                            Some(0) | None => state.pos.eof = true,
                            Some(_) => state.pos.error = true,
                        }
                        break;
                    }
                    Ok(n) => {
                        lease.advance(n);
                        if let Some(remaining) = &mut state.pos.remaining {
                            *remaining -= n as u64;
                        }
                    }
                }
            }

            if !lease.is_empty() {
                state.queue.push_back(lease);
                if state.queue.len() == 1 {
                    self.waitable.signal_availability();
                }
            }
            if state.pos.eof || state.pos.error {
                if !state.quit && state.queue.is_empty() {
                    self.waitable.signal_availability();
                }
                break;
            }
        }
    }
}

impl WaiterSink for FileInner {
    fn on_buffer_availability(&self, _from: WaitableToken) {
        // Wake the worker; it re-requests a buffer from the pool. Taking
        // the state lock closes the window between the worker's pool
        // request and its wait.
        let _state = self.state.lock().unwrap();
        self.cond.notify_one();
    }
}

/// A reader that prefetches a file on a dedicated worker thread.
///
/// Usually created through [`FileReaderFactory`]. The buffer pool and
/// thread pool must outlive the reader.
pub struct FileReader {
    inner: Arc<FileInner>,
    task: Mutex<Option<TaskHandle>>,
    thread_pool: ThreadPool,
}

impl FileReader {
    /// Construct a reader over an already-opened file, restricted to
    /// `size` bytes from `offset`.
    pub fn new(
        name: impl Into<String>,
        pool: &BufferPool,
        file: BlockingFile,
        thread_pool: &ThreadPool,
        offset: u64,
        size: Option<u64>,
        max_buffers: usize,
    ) -> Result<Self> {
        let max_size = file.size();
        let reader = Self {
            inner: Arc::new(FileInner {
                name: name.into(),
                pool: pool.clone(),
                max_buffers: max_buffers.max(1),
                waitable: Waitable::new(),
                state: Mutex::new(FileState {
                    queue: VecDeque::new(),
                    pos: StreamPos {
                        max_size,
                        ..Default::default()
                    },
                    quit: false,
                }),
                cond: Condvar::new(),
                file: Mutex::new(file),
            }),
            task: Mutex::new(None),
            thread_pool: thread_pool.clone(),
        };
        reader.seek(Some(offset), size).map_err(|e| {
            reader.inner.state.lock().unwrap().pos.error = true;
            e
        })?;
        Ok(reader)
    }

    /// Join the worker if one is running. The caller must already have
    /// requested it to quit.
    fn join_worker(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(mut task) = task {
            task.join();
        }
    }

    fn stop_worker(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.quit = true;
            self.inner.cond.notify_one();
        }
        self.join_worker();
    }
}

impl Reader for FileReader {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn seekable(&self) -> bool {
        self.inner.state.lock().unwrap().pos.max_size.is_some()
    }

    fn size(&self) -> Option<u64> {
        self.inner.state.lock().unwrap().pos.size
    }

    fn get_buffer(&self, waiter: &Waiter) -> Result<ReadResult> {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(lease) = state.queue.pop_front() {
            if state.queue.len() + 1 == self.inner.max_buffers {
                // The worker may be parked on a full queue.
                self.inner.cond.notify_one();
            }
            state.pos.get_buffer_called = true;
            return Ok(ReadResult::Data(lease));
        }
        if state.pos.error {
            return Err(Error::Stream(self.inner.name.clone()));
        }
        if state.pos.eof {
            return Ok(ReadResult::Eof);
        }
        self.inner.waitable.add_waiter(waiter.clone());
        Ok(ReadResult::Wait)
    }

    fn seek(&self, offset: Option<u64>, size: Option<u64>) -> Result<()> {
        let seek = {
            let state = self.inner.state.lock().unwrap();
            let seekable = state.pos.max_size.is_some();
            match state
                .pos
                .plan_seek(offset, size, seekable, &self.inner.name)?
            {
                None => return Ok(()),
                Some(seek) => seek,
            }
        };

        // Stop the prefetcher before touching the file or the queue.
        self.stop_worker();
        self.inner
            .pool
            .remove_waiter(&Waiter::sink(self.inner.clone() as Arc<dyn WaiterSink>));

        let eof = {
            let mut state = self.inner.state.lock().unwrap();
            state.quit = false;
            state.queue.clear();
            self.inner.waitable.remove_waiters();
            state.pos.apply_seek(&seek);
            state.pos.eof
        };

        {
            let mut file = self.inner.file.lock().unwrap();
            if file.seek(SeekFrom::Start(seek.offset))? != seek.offset {
                return Err(Error::Seek(format!(
                    "{}: could not seek to offset {}",
                    self.inner.name, seek.offset
                )));
            }
        }

        if !eof {
            let inner = self.inner.clone();
            let task = self.thread_pool.spawn("reader", move || inner.run())?;
            *self.task.lock().unwrap() = Some(task);
        }
        Ok(())
    }

    fn rewind(&self) -> Result<()> {
        let (offset, size) = {
            let state = self.inner.state.lock().unwrap();
            (state.pos.start_offset, state.pos.size)
        };
        self.seek(offset, size)
    }

    fn close(&self) {
        self.stop_worker();
        self.inner
            .pool
            .remove_waiter(&Waiter::sink(self.inner.clone() as Arc<dyn WaiterSink>));
        let mut state = self.inner.state.lock().unwrap();
        self.inner.waitable.remove_waiters();
        state.queue.clear();
    }

    fn error(&self) -> bool {
        self.inner.state.lock().unwrap().pos.error
    }

    fn token(&self) -> WaitableToken {
        self.inner.waitable.token()
    }

    fn remove_waiter(&self, waiter: &Waiter) {
        self.inner.waitable.remove_waiter(waiter);
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for [`FileReader`].
pub struct FileReaderFactory {
    path: PathBuf,
    name: String,
    thread_pool: ThreadPool,
}

impl FileReaderFactory {
    /// Factory reading from `path`. Workers come from `thread_pool`.
    pub fn new(path: impl AsRef<Path>, thread_pool: &ThreadPool) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: path.display().to_string(),
            path,
            thread_pool: thread_pool.clone(),
        }
    }
}

impl ReaderFactory for FileReaderFactory {
    fn clone_boxed(&self) -> Box<dyn ReaderFactory> {
        Box::new(Self {
            path: self.path.clone(),
            name: self.name.clone(),
            thread_pool: self.thread_pool.clone(),
        })
    }

    fn open(
        &self,
        pool: &BufferPool,
        offset: u64,
        size: Option<u64>,
        max_buffers: usize,
    ) -> Result<Box<dyn Reader>> {
        let max_buffers = if max_buffers == 0 {
            self.preferred_buffer_count()
        } else {
            max_buffers
        };
        let file = BlockingFile::open(
            &self.path,
            OpenMode::Reading,
            Disposition::Existing,
            Permissions::Inherit,
        )?;
        let reader = FileReader::new(
            self.name.clone(),
            pool,
            file,
            &self.thread_pool,
            offset,
            size,
            max_buffers,
        )?;
        Ok(Box::new(reader))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }

    fn mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).ok().and_then(|m| m.modified().ok())
    }

    fn multiple_buffer_usage(&self) -> bool {
        true
    }

    fn preferred_buffer_count(&self) -> usize {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct FlagSink {
        signaled: Mutex<bool>,
        cond: Condvar,
        hits: AtomicUsize,
    }

    impl FlagSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
                hits: AtomicUsize::new(0),
            })
        }

        fn wait(&self) {
            let mut signaled = self.signaled.lock().unwrap();
            while !*signaled {
                let (next, timeout) = self
                    .cond
                    .wait_timeout(signaled, Duration::from_secs(10))
                    .unwrap();
                signaled = next;
                assert!(!timeout.timed_out(), "no availability signal arrived");
            }
            *signaled = false;
        }
    }

    impl WaiterSink for FlagSink {
        fn on_buffer_availability(&self, _from: WaitableToken) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let mut signaled = self.signaled.lock().unwrap();
            *signaled = true;
            self.cond.notify_one();
        }
    }

    fn fixture(len: usize) -> (NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        (file, data)
    }

    fn drain(reader: &dyn Reader) -> Vec<u8> {
        let sink = FlagSink::new();
        let waiter = Waiter::sink(sink.clone());
        let mut out = Vec::new();
        loop {
            match reader.get_buffer(&waiter).unwrap() {
                ReadResult::Data(lease) => out.extend_from_slice(lease.readable()),
                ReadResult::Eof => break,
                ReadResult::Wait => sink.wait(),
            }
        }
        out
    }

    #[test]
    fn reads_whole_file_in_order() {
        let (file, data) = fixture(100_000);
        let pool = BufferPool::with_config(4, 8192, false).unwrap();
        let tpool = ThreadPool::new();

        let factory = FileReaderFactory::new(file.path(), &tpool);
        let reader = factory.open(&pool, 0, None, 0).unwrap();
        assert!(reader.seekable());
        assert_eq!(reader.size(), Some(100_000));

        assert_eq!(drain(reader.as_ref()), data);
        reader.close();
        assert_eq!(pool.free_buffers(), 4);
    }

    #[test]
    fn offset_and_size_restrict_the_range() {
        let (file, data) = fixture(1000);
        let pool = BufferPool::with_config(2, 4096, false).unwrap();
        let tpool = ThreadPool::new();

        let factory = FileReaderFactory::new(file.path(), &tpool);
        let reader = factory.open(&pool, 100, Some(200), 0).unwrap();
        assert_eq!(reader.size(), Some(200));
        assert_eq!(drain(reader.as_ref()), &data[100..300]);
    }

    #[test]
    fn rewind_replays_the_same_bytes() {
        let (file, data) = fixture(1000);
        let pool = BufferPool::with_config(2, 4096, false).unwrap();
        let tpool = ThreadPool::new();

        let reader = FileReaderFactory::new(file.path(), &tpool)
            .open(&pool, 100, Some(200), 0)
            .unwrap();
        let first = drain(reader.as_ref());
        assert_eq!(first, &data[100..300]);

        reader.rewind().unwrap();
        assert_eq!(drain(reader.as_ref()), first);
    }

    #[test]
    fn seeking_past_the_end_fails() {
        let (file, _) = fixture(1000);
        let pool = BufferPool::with_config(2, 4096, false).unwrap();
        let tpool = ThreadPool::new();

        assert!(FileReaderFactory::new(file.path(), &tpool)
            .open(&pool, 900, Some(200), 0)
            .is_err());
    }

    #[test]
    fn size_restriction_beyond_source_is_rejected_at_open() {
        let (file, _) = fixture(100);
        let pool = BufferPool::with_config(2, 4096, false).unwrap();
        let tpool = ThreadPool::new();

        let reader = FileReader::new(
            "short",
            &pool,
            BlockingFile::open(
                file.path(),
                OpenMode::Reading,
                Disposition::Existing,
                Permissions::Inherit,
            )
            .unwrap(),
            &tpool,
            0,
            Some(500),
            2,
        );
        // Opening validates against the source size.
        assert!(reader.is_err());
    }

    #[test]
    fn missing_file_fails_at_the_factory() {
        let pool = BufferPool::with_config(1, 4096, false).unwrap();
        let tpool = ThreadPool::new();
        assert!(FileReaderFactory::new("/nonexistent/aqueduct", &tpool)
            .open(&pool, 0, None, 0)
            .is_err());
    }

    #[test]
    fn queue_stays_bounded() {
        let (file, _) = fixture(200_000);
        let pool = BufferPool::with_config(8, 4096, false).unwrap();
        let tpool = ThreadPool::new();

        let reader = FileReaderFactory::new(file.path(), &tpool)
            .open(&pool, 0, None, 2)
            .unwrap();
        // Give the prefetcher time to fill its queue.
        std::thread::sleep(Duration::from_millis(50));
        // With max_buffers = 2 the worker may hold at most 2 leases.
        assert!(pool.free_buffers() >= 6);
        drop(reader);
        assert_eq!(pool.free_buffers(), 8);
    }

    #[test]
    fn factory_reports_source_attributes() {
        let (file, _) = fixture(123);
        let tpool = ThreadPool::new();
        let factory = FileReaderFactory::new(file.path(), &tpool);
        assert_eq!(factory.size(), Some(123));
        assert!(factory.mtime().is_some());
        assert!(factory.seekable());
        assert!(factory.multiple_buffer_usage());
    }
}
