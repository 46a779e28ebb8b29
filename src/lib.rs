//! # Aqueduct
//!
//! An asynchronous I/O pipeline over a fixed pool of page-aligned,
//! leased buffers.
//!
//! Readers produce [`pool::BufferLease`] values representing successive
//! byte ranges of a source; writers drain them to a sink. The pool,
//! every reader and every writer share one availability protocol
//! ([`waitable`]) that keeps the bounded-buffer network free of
//! deadlock: any operation that cannot progress parks the caller as a
//! waiter and exactly one waiter is woken per released resource.
//! Threaded readers and writers run a single blocking worker each;
//! cooperative clients are driven through typed events on an
//! [`event::EventLoop`].
//!
//! ## Features
//!
//! - **Leased buffers**: RAII leases over a guard-page-separated,
//!   page-aligned mapping; dropping a lease returns and signals
//! - **Shared-memory pools**: memfd-backed mappings whose leases can be
//!   handed to a co-operating child process as `(offset, len)` spans
//! - **Backpressure without deadlock**: bounded prefetch and drain
//!   queues tied into the availability protocol
//! - **Two-phase finalize**: drain, then optional fsync, then `Done`
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use aqueduct::prelude::*;
//!
//! let pool = BufferPool::with_config(8, 256 * 1024, false)?;
//! let threads = ThreadPool::new();
//!
//! let reader = FileReaderFactory::new("input.bin", &threads)
//!     .open(&pool, 0, None, 0)?;
//! let writer = FileWriterFactory::new("output.bin", &threads, Default::default())
//!     .open(&pool, 0, None, 0)?;
//!
//! // Pump: reader.get_buffer(&waiter) -> writer.add_buffer(lease, &waiter),
//! // waiting whenever either side says so, then finalize the writer.
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod error;
pub mod event;
pub mod fs;
pub mod ipc;
pub mod iputils;
pub mod pool;
pub mod reader;
pub mod thread_pool;
pub mod waitable;
pub mod writer;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::error::{Error, Result};
    pub use crate::event::{BufferEvent, EventHandler, EventLoop};
    pub use crate::pool::{BufferLease, BufferPool};
    pub use crate::reader::{
        FileReaderFactory, ReadResult, Reader, ReaderFactory, ReaderFactoryHolder,
    };
    pub use crate::thread_pool::ThreadPool;
    pub use crate::waitable::{Waitable, WaitableToken, Waiter, WaiterSink};
    pub use crate::writer::{
        FileWriterFactory, Finalize, Submit, Writer, WriterFactory, WriterFactoryHolder,
    };
}

pub use error::{Error, Result};
