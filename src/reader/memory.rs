//! Cooperative in-memory readers.
//!
//! [`MemoryReader`] serves a byte slice through the lease protocol with
//! no worker thread: each `get_buffer` call pulls one pool buffer,
//! copies the next slice into it and hands it over. The backing storage
//! is whatever the type parameter provides — a borrowed slice for
//! [`ViewReader`], owned bytes for [`StringReader`].

use super::{ReadResult, Reader, ReaderFactory, StreamPos};
use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::waitable::{Waitable, WaitableToken, Waiter, WaiterSink};
use std::sync::{Arc, Mutex};

/// Relays a pool availability signal to the reader's own waiters.
///
/// The memory readers never park a thread; when the pool was dry, the
/// party to wake is whoever is waiting on the reader.
struct ForwardSink {
    target: Arc<Waitable>,
}

impl ForwardSink {
    fn new(target: &Arc<Waitable>) -> Arc<Self> {
        Arc::new(Self {
            target: target.clone(),
        })
    }
}

impl WaiterSink for ForwardSink {
    fn on_buffer_availability(&self, _from: WaitableToken) {
        self.target.signal_availability();
    }
}

/// A reader over in-memory bytes. Always seekable, uses one pool buffer
/// at a time.
pub struct MemoryReader<D: AsRef<[u8]> + Send> {
    name: String,
    pool: BufferPool,
    waitable: Arc<Waitable>,
    forward: Arc<ForwardSink>,
    state: Mutex<StreamPos>,
    data: D,
}

/// Reader over a borrowed slice. The slice must outlive the reader; the
/// reader never copies it up front.
pub type ViewReader<'d> = MemoryReader<&'d [u8]>;

/// Reader over owned bytes.
pub type StringReader = MemoryReader<Vec<u8>>;

impl<D: AsRef<[u8]> + Send> MemoryReader<D> {
    /// Construct a reader over `data`.
    pub fn new(name: impl Into<String>, pool: &BufferPool, data: D) -> Self {
        let len = data.as_ref().len() as u64;
        let waitable = Arc::new(Waitable::new());
        Self {
            name: name.into(),
            pool: pool.clone(),
            forward: ForwardSink::new(&waitable),
            waitable,
            state: Mutex::new(StreamPos {
                size: Some(len),
                max_size: Some(len),
                remaining: Some(len),
                eof: len == 0,
                ..Default::default()
            }),
            data,
        }
    }
}

impl<D: AsRef<[u8]> + Send> Reader for MemoryReader<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        self.state.lock().unwrap().size
    }

    fn get_buffer(&self, waiter: &Waiter) -> Result<ReadResult> {
        let mut pos = self.state.lock().unwrap();
        if pos.error {
            return Err(Error::Stream(self.name.clone()));
        }
        if pos.eof {
            return Ok(ReadResult::Eof);
        }

        let Some(mut lease) = self.pool.get_buffer(&Waiter::sink(self.forward.clone())) else {
            self.waitable.add_waiter(waiter.clone());
            return Ok(ReadResult::Wait);
        };

        let data = self.data.as_ref();
        let start = pos.start_offset.unwrap_or(0);
        let size = pos.size.unwrap_or(data.len() as u64);
        let remaining = pos.remaining.unwrap_or(0);
        let consumed = size - remaining;
        let begin = (start + consumed) as usize;
        let take = (lease.capacity() as u64).min(remaining) as usize;

        lease.append(&data[begin..begin + take]);
        pos.remaining = Some(remaining - take as u64);
        if pos.remaining == Some(0) {
            pos.eof = true;
        }
        pos.get_buffer_called = true;

        Ok(ReadResult::Data(lease))
    }

    fn seek(&self, offset: Option<u64>, size: Option<u64>) -> Result<()> {
        let mut pos = self.state.lock().unwrap();
        let Some(seek) = pos.plan_seek(offset, size, true, &self.name)? else {
            return Ok(());
        };
        self.pool
            .remove_waiter(&Waiter::sink(self.forward.clone()));
        self.waitable.remove_waiters();
        pos.apply_seek(&seek);
        Ok(())
    }

    fn rewind(&self) -> Result<()> {
        let (offset, size) = {
            let pos = self.state.lock().unwrap();
            (pos.start_offset, pos.size)
        };
        self.seek(offset, size)
    }

    fn close(&self) {
        self.pool
            .remove_waiter(&Waiter::sink(self.forward.clone()));
        self.waitable.remove_waiters();
    }

    fn error(&self) -> bool {
        self.state.lock().unwrap().error
    }

    fn token(&self) -> WaitableToken {
        self.waitable.token()
    }

    fn remove_waiter(&self, waiter: &Waiter) {
        self.waitable.remove_waiter(waiter);
    }
}

impl<D: AsRef<[u8]> + Send> Drop for MemoryReader<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Factory for [`ViewReader`]-style readers.
///
/// The backing bytes are shared, not copied per reader: every reader
/// opened from this factory (or a clone of it) reads the same storage.
pub struct ViewReaderFactory {
    name: String,
    view: Arc<[u8]>,
}

impl ViewReaderFactory {
    /// Factory over shared backing bytes.
    pub fn new(name: impl Into<String>, view: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            view: view.into(),
        }
    }
}

impl ReaderFactory for ViewReaderFactory {
    fn clone_boxed(&self) -> Box<dyn ReaderFactory> {
        Box::new(Self {
            name: self.name.clone(),
            view: self.view.clone(),
        })
    }

    fn open(
        &self,
        pool: &BufferPool,
        offset: u64,
        size: Option<u64>,
        _max_buffers: usize,
    ) -> Result<Box<dyn Reader>> {
        let reader = MemoryReader::new(self.name.clone(), pool, self.view.clone());
        if offset != 0 || size.is_some() {
            reader.seek(Some(offset), size)?;
        }
        Ok(Box::new(reader))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        Some(self.view.len() as u64)
    }
}

/// Factory for [`StringReader`]. Owns the bytes; each reader gets its
/// own copy.
pub struct StringReaderFactory {
    name: String,
    data: Vec<u8>,
}

impl StringReaderFactory {
    /// Factory owning `data`.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

impl ReaderFactory for StringReaderFactory {
    fn clone_boxed(&self) -> Box<dyn ReaderFactory> {
        Box::new(Self {
            name: self.name.clone(),
            data: self.data.clone(),
        })
    }

    fn open(
        &self,
        pool: &BufferPool,
        offset: u64,
        size: Option<u64>,
        _max_buffers: usize,
    ) -> Result<Box<dyn Reader>> {
        let reader = StringReader::new(self.name.clone(), pool, self.data.clone());
        if offset != 0 || size.is_some() {
            reader.seek(Some(offset), size)?;
        }
        Ok(Box::new(reader))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn seekable(&self) -> bool {
        true
    }

    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
