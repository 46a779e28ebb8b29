//! Writers: sinks for leased buffers.
//!
//! A writer consumes [`BufferLease`](crate::pool::BufferLease) values
//! and drains them to its target. Backpressure is expressed through the
//! same availability protocol the readers use: `add_buffer` accepts the
//! lease and tells the caller whether to wait before offering the next
//! one, and `finalize` is a two-phase drain-then-sync handshake.

mod file;
mod memory;

pub use file::{FileWriter, FileWriterFactory, FileWriterOptions};
pub use memory::{BufferWriter, BufferWriterFactory};

use crate::error::Result;
use crate::pool::{BufferLease, BufferPool};
use crate::waitable::{WaitableToken, Waiter};
use std::sync::Arc;
use std::time::SystemTime;

/// Outcome of [`Writer::add_buffer`]. The lease is consumed either way.
#[must_use]
pub enum Submit {
    /// More buffers may be offered immediately.
    Accepted,
    /// The queue is full. Do not offer another buffer until the waiter
    /// has been signaled.
    Wait,
}

/// Outcome of [`Writer::finalize`].
#[must_use]
pub enum Finalize {
    /// All data is written out (and synced, if requested). Further
    /// `finalize` calls keep returning `Done` with no side effects.
    Done,
    /// Backlog or sync is still pending; call `finalize` again after
    /// the waiter has been signaled.
    Wait,
}

/// Progress callback, invoked from the worker thread after each
/// successful physical write with the number of bytes written.
///
/// The callback must not call back into the writer; publish to atomics
/// or post an event instead.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// The writer contract.
///
/// A freshly opened writer is writable. After an `Err` from any
/// operation the writer is latched failed and can only be closed. The
/// pool that produced the leases must outlive the writer.
pub trait Writer: Send {
    /// Descriptive name, used in log messages.
    fn name(&self) -> &str;

    /// Enqueue a lease for writing. A lease with no readable bytes is a
    /// no-op returning [`Submit::Accepted`].
    fn add_buffer(&self, lease: BufferLease, waiter: &Waiter) -> Result<Submit>;

    /// Drain the backlog and complete the stream.
    fn finalize(&self, waiter: &Waiter) -> Result<Finalize>;

    /// Hint the total size to reserve storage up front. Only valid
    /// while streaming with an empty backlog.
    fn preallocate(&self, _size: u64) -> Result<()> {
        Ok(())
    }

    /// Set the target's modification time. Only valid after `finalize`
    /// returned [`Finalize::Done`].
    fn set_mtime(&self, t: SystemTime) -> Result<()>;

    /// Join the worker and release the target. Idempotent.
    fn close(&self);

    /// True once the writer has failed.
    fn error(&self) -> bool;

    /// Identity token of this writer's waitable.
    fn token(&self) -> WaitableToken;

    /// Withdraw a waiter registered by an earlier `Wait`.
    fn remove_waiter(&self, waiter: &Waiter);
}

/// A clonable descriptor that can instantiate writers against a pool.
pub trait WriterFactory: Send {
    /// Clone the factory.
    fn clone_boxed(&self) -> Box<dyn WriterFactory>;

    /// Create a writer starting at `offset`. Only offsetable writers
    /// accept a nonzero offset. `max_buffers` of 0 selects
    /// [`preferred_buffer_count`](Self::preferred_buffer_count).
    fn open(
        &self,
        pool: &BufferPool,
        offset: u64,
        progress: Option<ProgressFn>,
        max_buffers: usize,
    ) -> Result<Box<dyn Writer>>;

    /// Descriptive name, also used for the writers it creates.
    fn name(&self) -> &str;

    /// Whether writers may start at an offset other than zero.
    fn offsetable(&self) -> bool {
        false
    }

    /// Pre-existing size of the target, if any.
    fn size(&self) -> Option<u64> {
        None
    }

    /// Last modification time of the target, if known.
    fn mtime(&self) -> Option<SystemTime> {
        None
    }

    /// Set the target's modification time by name, without an open
    /// writer. A writer still open for the target may change it again
    /// on close.
    fn set_mtime(&self, _t: SystemTime) -> Result<()> {
        Err(crate::error::Error::Precondition(
            "factory cannot set mtime".into(),
        ))
    }

    /// Minimum buffers a writer from this factory needs to make
    /// progress.
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

/// Value-typed carrier for a writer factory. Copies by cloning the
/// factory; a default holder is null.
#[derive(Default)]
pub struct WriterFactoryHolder {
    inner: Option<Box<dyn WriterFactory>>,
}

impl WriterFactoryHolder {
    /// Wrap a factory.
    pub fn new(factory: Box<dyn WriterFactory>) -> Self {
        Self {
            inner: Some(factory),
        }
    }

    /// True if the holder carries no factory.
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// The held factory, if any.
    pub fn get(&self) -> Option<&dyn WriterFactory> {
        self.inner.as_deref()
    }

    /// Move the factory out, leaving a null holder.
    pub fn take(&mut self) -> Option<Box<dyn WriterFactory>> {
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

impl Clone for WriterFactoryHolder {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.as_deref().map(|f| f.clone_boxed()),
        }
    }
}

impl From<Box<dyn WriterFactory>> for WriterFactoryHolder {
    fn from(factory: Box<dyn WriterFactory>) -> Self {
        Self::new(factory)
    }
}
