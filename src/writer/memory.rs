//! Synchronous in-memory writer.
//!
//! Appends every lease into a client-shared byte vector, bounded by a
//! total size limit. There is no worker and no backpressure: every
//! `add_buffer` completes inline.

use super::{Finalize, ProgressFn, Submit, Writer, WriterFactory};
use crate::error::{Error, Result};
use crate::pool::{BufferLease, BufferPool};
use crate::waitable::{Waitable, WaitableToken, Waiter};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Writer that collects the stream into an `Arc<Mutex<Vec<u8>>>` shared
/// with the client.
///
/// Exceeding `size_limit` latches the writer failed; the target keeps
/// whatever was appended before the overflowing buffer.
pub struct BufferWriter {
    name: String,
    target: Arc<Mutex<Vec<u8>>>,
    size_limit: usize,
    progress: Option<ProgressFn>,
    waitable: Waitable,
    error: Mutex<bool>,
}

impl BufferWriter {
    /// Writer appending into `target`, refusing to grow it past
    /// `size_limit`.
    pub fn new(
        target: Arc<Mutex<Vec<u8>>>,
        name: impl Into<String>,
        size_limit: usize,
        progress: Option<ProgressFn>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            size_limit,
            progress,
            waitable: Waitable::new(),
            error: Mutex::new(false),
        }
    }
}

impl Writer for BufferWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_buffer(&self, lease: BufferLease, _waiter: &Waiter) -> Result<Submit> {
        let mut error = self.error.lock().unwrap();
        if *error {
            return Err(Error::Stream(self.name.clone()));
        }
        if lease.is_empty() {
            return Ok(Submit::Accepted);
        }

        let mut target = self.target.lock().unwrap();
        if self.size_limit - target.len() < lease.len() {
            *error = true;
            return Err(Error::Precondition(format!(
                "{}: size limit of {} bytes exceeded",
                self.name, self.size_limit
            )));
        }
        target.extend_from_slice(lease.readable());
        if let Some(progress) = &self.progress {
            progress(lease.len() as u64);
        }
        Ok(Submit::Accepted)
    }

    fn finalize(&self, _waiter: &Waiter) -> Result<Finalize> {
        if *self.error.lock().unwrap() {
            return Err(Error::Stream(self.name.clone()));
        }
        Ok(Finalize::Done)
    }

    fn preallocate(&self, size: u64) -> Result<()> {
        if size > self.size_limit as u64 {
            return Err(Error::Precondition(format!(
                "{}: preallocation beyond the size limit",
                self.name
            )));
        }
        self.target.lock().unwrap().reserve(size as usize);
        Ok(())
    }

    fn set_mtime(&self, _t: SystemTime) -> Result<()> {
        Err(Error::Precondition(format!(
            "{}: in-memory target has no mtime",
            self.name
        )))
    }

    fn close(&self) {
        self.waitable.remove_waiters();
    }

    fn error(&self) -> bool {
        *self.error.lock().unwrap()
    }

    fn token(&self) -> WaitableToken {
        self.waitable.token()
    }

    fn remove_waiter(&self, waiter: &Waiter) {
        self.waitable.remove_waiter(waiter);
    }
}

/// Factory for [`BufferWriter`]. Rejects nonzero offsets.
pub struct BufferWriterFactory {
    target: Arc<Mutex<Vec<u8>>>,
    name: String,
    size_limit: usize,
}

impl BufferWriterFactory {
    /// Factory for writers appending into `target`.
    pub fn new(target: Arc<Mutex<Vec<u8>>>, name: impl Into<String>, size_limit: usize) -> Self {
        Self {
            target,
            name: name.into(),
            size_limit,
        }
    }
}

impl WriterFactory for BufferWriterFactory {
    fn clone_boxed(&self) -> Box<dyn WriterFactory> {
        Box::new(Self {
            target: self.target.clone(),
            name: self.name.clone(),
            size_limit: self.size_limit,
        })
    }

    fn open(
        &self,
        _pool: &BufferPool,
        offset: u64,
        progress: Option<ProgressFn>,
        _max_buffers: usize,
    ) -> Result<Box<dyn Writer>> {
        if offset != 0 {
            return Err(Error::Precondition(format!(
                "{}: in-memory writers start at offset 0",
                self.name
            )));
        }
        Ok(Box::new(BufferWriter::new(
            self.target.clone(),
            self.name.clone(),
            self.size_limit,
            progress,
        )))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waitable::WaiterSink;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct IdleSink;

    impl WaiterSink for IdleSink {
        fn on_buffer_availability(&self, _from: WaitableToken) {}
    }

    fn idle_waiter() -> Waiter {
        Waiter::sink(Arc::new(IdleSink))
    }

    #[test]
    fn appends_until_the_limit() {
        let pool = BufferPool::with_config(1, 4096, false).unwrap();
        let target = Arc::new(Mutex::new(Vec::new()));
        let written = Arc::new(AtomicU64::new(0));
        let progress: ProgressFn = {
            let written = written.clone();
            Arc::new(move |n| {
                written.fetch_add(n, Ordering::SeqCst);
            })
        };
        let writer = BufferWriter::new(target.clone(), "sink", 10, Some(progress));
        let waiter = idle_waiter();

        let mut lease = pool.try_get_buffer().unwrap();
        lease.append(b"123456");
        assert!(matches!(
            writer.add_buffer(lease, &waiter).unwrap(),
            Submit::Accepted
        ));
        assert_eq!(written.load(Ordering::SeqCst), 6);

        // 6 + 5 > 10: latches the writer.
        let mut lease = pool.try_get_buffer().unwrap();
        lease.append(b"abcde");
        assert!(writer.add_buffer(lease, &waiter).is_err());
        assert!(writer.error());
        assert!(writer.finalize(&waiter).is_err());

        // Content up to the overflow is kept.
        assert_eq!(&*target.lock().unwrap(), b"123456");
        assert_eq!(pool.free_buffers(), 1);
    }

    #[test]
    fn finalize_is_immediate_and_idempotent() {
        let target = Arc::new(Mutex::new(Vec::new()));
        let writer = BufferWriter::new(target, "sink", 100, None);
        let waiter = idle_waiter();
        for _ in 0..3 {
            assert!(matches!(writer.finalize(&waiter).unwrap(), Finalize::Done));
        }
    }

    #[test]
    fn empty_lease_is_a_no_op() {
        let pool = BufferPool::with_config(1, 4096, false).unwrap();
        let target = Arc::new(Mutex::new(Vec::new()));
        let writer = BufferWriter::new(target.clone(), "sink", 4, None);

        let lease = pool.try_get_buffer().unwrap();
        assert!(matches!(
            writer.add_buffer(lease, &idle_waiter()).unwrap(),
            Submit::Accepted
        ));
        assert!(target.lock().unwrap().is_empty());
    }

    #[test]
    fn preallocate_respects_the_limit() {
        let target = Arc::new(Mutex::new(Vec::new()));
        let writer = BufferWriter::new(target.clone(), "sink", 64, None);
        writer.preallocate(64).unwrap();
        assert!(target.lock().unwrap().capacity() >= 64);
        assert!(writer.preallocate(65).is_err());
    }

    #[test]
    fn factory_rejects_offsets() {
        let pool = BufferPool::with_config(1, 4096, false).unwrap();
        let target = Arc::new(Mutex::new(Vec::new()));
        let factory = BufferWriterFactory::new(target, "sink", 100);
        assert!(factory.open(&pool, 1, None, 0).is_err());
        assert!(factory.open(&pool, 0, None, 0).is_ok());
    }
}
