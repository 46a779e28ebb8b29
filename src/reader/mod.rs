//! Readers: lazy sequences of leased buffers.
//!
//! A reader produces successive byte ranges of a source as
//! [`BufferLease`] values. `get_buffer` either returns the next chunk,
//! reports end of stream, or parks the caller as a waiter until the
//! reader signals availability. Threaded readers prefetch into a
//! bounded queue from a worker thread; in-memory readers are purely
//! cooperative.

mod file;
mod memory;

pub use file::{FileReader, FileReaderFactory};
pub use memory::{
    MemoryReader, StringReader, StringReaderFactory, ViewReader, ViewReaderFactory,
};

use crate::error::{Error, Result};
use crate::pool::{BufferLease, BufferPool};
use crate::waitable::{WaitableToken, Waiter};
use std::time::SystemTime;

/// Outcome of [`Reader::get_buffer`].
#[must_use]
pub enum ReadResult {
    /// The next chunk of the stream, in strict stream order.
    Data(BufferLease),
    /// End of stream; no further data will be produced.
    Eof,
    /// The waiter was registered. Do not call `get_buffer` again until
    /// it has been signaled.
    Wait,
}

/// The reader contract.
///
/// A freshly opened reader is readable. After an `Err` from any
/// operation the reader is latched failed (or, for a failed seek, left
/// undefined) and must be closed. The pool passed at construction must
/// outlive the reader.
pub trait Reader: Send {
    /// Descriptive name, used in log messages.
    fn name(&self) -> &str;

    /// Whether the source supports starting anywhere. Non-seekable
    /// readers can only be read front to back, once.
    fn seekable(&self) -> bool;

    /// Bytes this reader will deliver under the current range, or
    /// `None` if indeterminate.
    fn size(&self) -> Option<u64>;

    /// Last modification time of the source, if known.
    fn mtime(&self) -> Option<SystemTime> {
        None
    }

    /// Get the next buffer, register `waiter`, or report end of stream.
    fn get_buffer(&self, waiter: &Waiter) -> Result<ReadResult>;

    /// Restrict the reader to `size` bytes starting at `offset`.
    ///
    /// `None` offset means "keep the current offset"; `None` size means
    /// "to the end of the source". `seek(None, None)` keeps both. Queued
    /// buffers are dropped only when something actually changes. After
    /// an `Err` the reader is undefined and must be closed.
    fn seek(&self, offset: Option<u64>, size: Option<u64>) -> Result<()>;

    /// Start the current range over. Equivalent to seeking to the
    /// current `(offset, size)`.
    fn rewind(&self) -> Result<()>;

    /// Release buffers, withdraw from the pool, drop waiters and join
    /// any worker. Idempotent.
    fn close(&self);

    /// True once the reader has failed.
    fn error(&self) -> bool;

    /// Identity token of this reader's waitable.
    fn token(&self) -> WaitableToken;

    /// Withdraw a waiter registered by an earlier `Wait`.
    fn remove_waiter(&self, waiter: &Waiter);
}

/// Positional state shared by every reader implementation.
///
/// `None` stands in for "indeterminate": offset not yet established,
/// size unbounded, remaining unbounded.
#[derive(Debug, Default)]
pub(crate) struct StreamPos {
    pub size: Option<u64>,
    pub max_size: Option<u64>,
    pub start_offset: Option<u64>,
    pub remaining: Option<u64>,
    pub eof: bool,
    pub error: bool,
    pub get_buffer_called: bool,
}

/// A validated seek that actually changes something.
pub(crate) struct ResolvedSeek {
    pub offset: u64,
    pub size: Option<u64>,
}

impl StreamPos {
    /// Validate a seek request against the current state.
    ///
    /// Returns `Ok(None)` when nothing changes (no buffers need to be
    /// dropped), `Ok(Some(..))` with the resolved range otherwise.
    pub fn plan_seek(
        &self,
        offset: Option<u64>,
        size: Option<u64>,
        seekable: bool,
        name: &str,
    ) -> Result<Option<ResolvedSeek>> {
        if self.error {
            return Err(Error::Stream(name.into()));
        }

        // A missing offset means the current one; if the size is also
        // missing, the current size restriction is kept rather than
        // recomputed from the source end.
        let (offset, size) = match offset {
            None => {
                let current = self.start_offset.unwrap_or(0);
                let size = match size {
                    None => self.size,
                    some => some,
                };
                (current, size)
            }
            Some(explicit) => (explicit, size),
        };

        if let Some(size) = size {
            let end = offset
                .checked_add(size)
                .ok_or_else(|| Error::Seek(format!("{name}: offset + size overflows")))?;
            if let Some(max) = self.max_size {
                if end > max {
                    return Err(Error::Seek(format!(
                        "{name}: range {offset}+{size} exceeds source size {max}"
                    )));
                }
            }
        } else if let Some(max) = self.max_size {
            if offset > max {
                return Err(Error::Seek(format!(
                    "{name}: offset {offset} exceeds source size {max}"
                )));
            }
        }

        let new_size = match size {
            Some(s) => Some(s),
            None => self.max_size.map(|max| max - offset),
        };

        let change = self.get_buffer_called
            || Some(offset) != self.start_offset
            || new_size != self.size;
        if !change {
            return Ok(None);
        }

        if !seekable && (self.start_offset.is_some() || offset != 0) {
            return Err(Error::Seek(format!(
                "{name}: source is not seekable"
            )));
        }

        Ok(Some(ResolvedSeek {
            offset,
            size: new_size,
        }))
    }

    /// Install a resolved seek. The caller has already dropped queued
    /// buffers and waiter registrations.
    pub fn apply_seek(&mut self, seek: &ResolvedSeek) {
        self.start_offset = Some(seek.offset);
        self.size = seek.size;
        self.remaining = seek.size;
        self.eof = seek.size == Some(0);
        self.get_buffer_called = false;
    }
}

/// A clonable descriptor that can instantiate readers against a pool.
pub trait ReaderFactory: Send {
    /// Clone the factory.
    fn clone_boxed(&self) -> Box<dyn ReaderFactory>;

    /// Create a reader over `pool`, restricted to `size` bytes from
    /// `offset`. `max_buffers` of 0 selects
    /// [`preferred_buffer_count`](Self::preferred_buffer_count).
    ///
    /// Seekable readers can be opened at any position; non-seekable
    /// ones only at offset 0. A size restriction beyond the actual
    /// source size makes `get_buffer` eventually return an error.
    fn open(
        &self,
        pool: &BufferPool,
        offset: u64,
        size: Option<u64>,
        max_buffers: usize,
    ) -> Result<Box<dyn Reader>>;

    /// Descriptive name, also used for the readers it creates.
    fn name(&self) -> &str;

    /// Whether readers from this factory support seeking.
    fn seekable(&self) -> bool {
        false
    }

    /// Size of the source, if known without opening it.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Last modification time of the source, if known.
    fn mtime(&self) -> Option<SystemTime> {
        None
    }

    /// Minimum buffers a reader from this factory needs to make
    /// progress. Size the pool to at least the sum over all involved
    /// readers and writers.
    fn min_buffer_usage(&self) -> usize {
        1
    }

    /// Whether more than [`min_buffer_usage`](Self::min_buffer_usage)
    /// buffers help at all.
    fn multiple_buffer_usage(&self) -> bool {
        false
    }

    /// Buffer budget used when `open` is called with 0.
    fn preferred_buffer_count(&self) -> usize {
        1
    }
}

/// Value-typed carrier for a reader factory. Copies by cloning the
/// factory; a default holder is null.
#[derive(Default)]
pub struct ReaderFactoryHolder {
    inner: Option<Box<dyn ReaderFactory>>,
}

impl ReaderFactoryHolder {
    /// Wrap a factory.
    pub fn new(factory: Box<dyn ReaderFactory>) -> Self {
        Self {
            inner: Some(factory),
        }
    }

    /// True if the holder carries no factory.
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// The held factory, if any.
    pub fn get(&self) -> Option<&dyn ReaderFactory> {
        self.inner.as_deref()
    }

    /// Move the factory out, leaving a null holder.
    pub fn take(&mut self) -> Option<Box<dyn ReaderFactory>> {
        self.inner.take()
    }

    /// Name of the held factory, if any.
    pub fn name(&self) -> Option<&str> {
        self.inner.as_deref().map(|f| f.name())
    }

    /// Size reported by the held factory, if any.
    pub fn size(&self) -> Option<u64> {
        self.inner.as_deref().and_then(|f| f.size())
    }

    /// Modification time reported by the held factory, if any.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.inner.as_deref().and_then(|f| f.mtime())
    }
}

impl Clone for ReaderFactoryHolder {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.as_deref().map(|f| f.clone_boxed()),
        }
    }
}

impl From<Box<dyn ReaderFactory>> for ReaderFactoryHolder {
    fn from(factory: Box<dyn ReaderFactory>) -> Self {
        Self::new(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded() -> StreamPos {
        // As set by a 1000-byte seekable source after the initial seek.
        StreamPos {
            size: Some(1000),
            max_size: Some(1000),
            start_offset: Some(0),
            remaining: Some(1000),
            ..Default::default()
        }
    }

    #[test]
    fn seek_to_same_range_is_a_no_op() {
        let pos = bounded();
        assert!(pos.plan_seek(Some(0), None, true, "r").unwrap().is_none());
        assert!(pos
            .plan_seek(Some(0), Some(1000), true, "r")
            .unwrap()
            .is_none());
        // Keep offset, keep size.
        assert!(pos.plan_seek(None, None, true, "r").unwrap().is_none());
    }

    #[test]
    fn reading_forces_a_real_seek() {
        let mut pos = bounded();
        pos.get_buffer_called = true;
        let seek = pos.plan_seek(Some(0), None, true, "r").unwrap().unwrap();
        assert_eq!(seek.offset, 0);
        assert_eq!(seek.size, Some(1000));
    }

    #[test]
    fn none_size_means_to_end() {
        let pos = bounded();
        let seek = pos.plan_seek(Some(100), None, true, "r").unwrap().unwrap();
        assert_eq!(seek.offset, 100);
        assert_eq!(seek.size, Some(900));
    }

    #[test]
    fn none_offset_keeps_current_position() {
        let mut pos = bounded();
        pos.start_offset = Some(250);
        pos.size = Some(500);
        let seek = pos.plan_seek(None, Some(100), true, "r").unwrap().unwrap();
        assert_eq!(seek.offset, 250);
        assert_eq!(seek.size, Some(100));
    }

    #[test]
    fn range_past_end_is_rejected() {
        let pos = bounded();
        assert!(pos.plan_seek(Some(900), Some(200), true, "r").is_err());
        assert!(pos.plan_seek(Some(1001), None, true, "r").is_err());
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let mut pos = bounded();
        pos.max_size = None;
        assert!(pos.plan_seek(Some(u64::MAX), Some(2), true, "r").is_err());
    }

    #[test]
    fn non_seekable_allows_only_the_initial_pseudo_seek() {
        let pos = StreamPos::default();
        // First positioning at 0 is fine even without seek support.
        assert!(pos.plan_seek(Some(0), None, false, "r").unwrap().is_some());

        let mut started = StreamPos::default();
        started.apply_seek(&ResolvedSeek {
            offset: 0,
            size: None,
        });
        started.get_buffer_called = true;
        assert!(started.plan_seek(Some(0), None, false, "r").is_err());
        assert!(pos.plan_seek(Some(10), None, false, "r").is_err());
    }

    #[test]
    fn apply_records_range_and_eof() {
        let mut pos = bounded();
        pos.apply_seek(&ResolvedSeek {
            offset: 100,
            size: Some(0),
        });
        assert_eq!(pos.start_offset, Some(100));
        assert_eq!(pos.remaining, Some(0));
        assert!(pos.eof);
        assert!(!pos.get_buffer_called);
    }

    #[test]
    fn errored_reader_refuses_to_seek() {
        let mut pos = bounded();
        pos.error = true;
        assert!(pos.plan_seek(Some(0), None, true, "r").is_err());
    }

    #[test]
    fn holder_clones_and_nulls() {
        let holder = ReaderFactoryHolder::default();
        assert!(holder.is_null());
        assert!(holder.name().is_none());
        let copy = holder.clone();
        assert!(copy.is_null());
    }
}
